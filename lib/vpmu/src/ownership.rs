// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Arbitration of the physical PMU.
//!
//! A physical CPU has exactly one set of performance counters. While a guest
//! has counting enabled and its counters are exposed without intercepts, no
//! one else may program them, so the right to do so is modeled as a token
//! that at most one owner holds at a time.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::{DomainId, VcpuId};

/// An entity that can hold the PMU ownership token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmuOwner {
    /// A host-side profiler.
    Host,

    /// A guest vCPU that has enabled at least one counter.
    Guest { domain: DomainId, vcpu: VcpuId },
}

/// The acquire/release contract for the PMU ownership token.
///
/// Acquisition never blocks: failing to get the token is an answer, not an
/// error, and callers fall back to running under full intercepts.
#[cfg_attr(test, mockall::automock)]
pub trait PmuOwnership: Send + Sync {
    /// Attempts to take the token on behalf of `owner`. Returns `true` if
    /// `owner` holds the token when this returns.
    fn acquire(&self, owner: PmuOwner) -> bool;

    /// Gives up the token. Releasing a token held by someone else is a no-op.
    fn release(&self, owner: PmuOwner);
}

const FREE: u64 = 0;
const HOST: u64 = u64::MAX;

impl PmuOwner {
    fn encode(&self) -> u64 {
        match self {
            PmuOwner::Host => HOST,
            PmuOwner::Guest { domain, vcpu } => {
                ((u64::from(domain.0) << 32) | u64::from(vcpu.0)) + 1
            }
        }
    }

    fn decode(raw: u64) -> Option<Self> {
        match raw {
            FREE => None,
            HOST => Some(PmuOwner::Host),
            guest => {
                let guest = guest - 1;
                Some(PmuOwner::Guest {
                    domain: DomainId((guest >> 32) as u16),
                    vcpu: VcpuId(guest as u32),
                })
            }
        }
    }
}

/// A lock-free implementation of [`PmuOwnership`] backed by a single
/// compare-and-swap word.
#[derive(Debug, Default)]
pub struct OwnershipArbiter {
    holder: AtomicU64,
}

impl OwnershipArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current holder of the token, if any.
    pub fn holder(&self) -> Option<PmuOwner> {
        PmuOwner::decode(self.holder.load(Ordering::Acquire))
    }
}

impl PmuOwnership for OwnershipArbiter {
    fn acquire(&self, owner: PmuOwner) -> bool {
        let raw = owner.encode();
        match self.holder.compare_exchange(
            FREE,
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => current == raw,
        }
    }

    fn release(&self, owner: PmuOwner) {
        let _ = self.holder.compare_exchange(
            owner.encode(),
            FREE,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }
}
