// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host facilities the vPMU is built on top of.
//!
//! These are deliberately narrow: the vPMU only needs to touch physical MSRs
//! and to tell the host how a vCPU's accesses to a given MSR should exit. The
//! host supplies implementations of these traits when it builds an
//! [`AmdPmu`](crate::amd::AmdPmu); [`crate::sim`] supplies an in-memory one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::common::VcpuId;
use crate::msr::MsrId;
use crate::ownership::PmuOwnership;

/// How a guest access to a particular MSR is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterceptMode {
    /// The guest accesses the register directly.
    None,

    /// Writes exit to the hypervisor; reads go straight to hardware.
    Write,

    /// Both reads and writes exit to the hypervisor.
    ReadWrite,
}

/// Raw access to the physical MSRs of the CPU the caller is running on.
#[cfg_attr(test, mockall::automock)]
pub trait MsrAccess: Send + Sync {
    fn rdmsr(&self, msr: MsrId) -> u64;
    fn wrmsr(&self, msr: MsrId, value: u64);
}

/// Control over a vCPU's MSR intercept bitmap.
#[cfg_attr(test, mockall::automock)]
pub trait MsrIntercept: Send + Sync {
    fn set_intercept(&self, vcpu: VcpuId, msr: MsrId, mode: InterceptMode);
}

/// The host's allowance for per-vCPU vPMU contexts.
///
/// A backend reserves the bytes a context needs before building it, and
/// returns them when the context is destroyed.
#[cfg_attr(test, mockall::automock)]
pub trait ContextMemory: Send + Sync {
    /// Claims `bytes`, returning false if the host cannot spare them.
    fn reserve(&self, bytes: usize) -> bool;

    fn release(&self, bytes: usize);
}

/// A fixed pool of bytes handed out to vPMU contexts.
#[derive(Debug)]
pub struct MemoryBudget {
    remaining: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(bytes: usize) -> Self {
        Self { remaining: AtomicUsize::new(bytes) }
    }

    /// A budget that never runs out.
    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

impl ContextMemory for MemoryBudget {
    fn reserve(&self, bytes: usize) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                left.checked_sub(bytes)
            })
            .is_ok()
    }

    fn release(&self, bytes: usize) {
        let _ = self.remaining.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |left| Some(left.saturating_add(bytes)),
        );
    }
}

/// The set of host facilities a vPMU backend is built from.
#[derive(Clone)]
pub struct Platform {
    pub msrs: Arc<dyn MsrAccess>,
    pub intercepts: Arc<dyn MsrIntercept>,
    pub ownership: Arc<dyn PmuOwnership>,
    pub memory: Arc<dyn ContextMemory>,
}
