// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory stand-in for a physical AMD PMU.
//!
//! [`SimPmu`] backs both the raw MSR access and the intercept-bitmap host
//! facilities, so a vPMU can be driven (by tests, or by the standalone trace
//! replayer) on machines where touching the real PMU is impossible.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::amd::bits::COUNTER_MASK;
use crate::amd::{classify, legacy_to_extended, MsrClass, Topology};
use crate::common::VcpuId;
use crate::hw::{
    InterceptMode, MemoryBudget, MsrAccess, MsrIntercept, Platform,
};
use crate::msr::MsrId;
use crate::ownership::PmuOwnership;

/// A simulated PMU register file plus per-vCPU intercept bitmap.
#[derive(Debug, Default)]
pub struct SimPmu {
    mirrored: bool,
    regs: Mutex<BTreeMap<MsrId, u64>>,
    intercepts: Mutex<BTreeMap<(VcpuId, MsrId), InterceptMode>>,
    accesses: AtomicU64,
}

impl SimPmu {
    /// Creates a register file. With `mirrored` set, the legacy bank aliases
    /// the first four extended-bank registers as it does on family 15h parts.
    pub fn new(mirrored: bool) -> Self {
        Self { mirrored, ..Default::default() }
    }

    /// Creates a register file shaped like the PMU of `family`.
    pub fn for_family(family: u8) -> Self {
        Self::new(Topology::select(family).is_ok_and(|t| t.is_mirrored()))
    }

    /// Bundles this register file with an ownership arbiter into the host
    /// facilities an [`AmdPmu`](crate::amd::AmdPmu) is built from. Context
    /// memory is unbounded; swap in a [`MemoryBudget`] to constrain it.
    pub fn platform(
        self: &Arc<Self>,
        ownership: Arc<dyn PmuOwnership>,
    ) -> Platform {
        Platform {
            msrs: self.clone(),
            intercepts: self.clone(),
            ownership,
            memory: Arc::new(MemoryBudget::unlimited()),
        }
    }

    fn resolve(&self, msr: MsrId) -> MsrId {
        if self.mirrored {
            legacy_to_extended(msr)
        } else {
            msr
        }
    }

    /// Reads a register without counting it as a hardware access.
    pub fn peek(&self, msr: MsrId) -> u64 {
        let msr = self.resolve(msr);
        self.regs.lock().unwrap().get(&msr).copied().unwrap_or(0)
    }

    /// Sets a register behind the vPMU's back, as the hardware itself would
    /// when a counter advances.
    pub fn poke(&self, msr: MsrId, value: u64) {
        let msr = self.resolve(msr);
        let value = match classify(msr) {
            MsrClass::Counter => value & COUNTER_MASK,
            _ => value,
        };
        self.regs.lock().unwrap().insert(msr, value);
    }

    /// The intercept currently configured for `vcpu`'s accesses to `msr`.
    /// Registers start out fully intercepted.
    pub fn intercept(&self, vcpu: VcpuId, msr: MsrId) -> InterceptMode {
        self.intercepts
            .lock()
            .unwrap()
            .get(&(vcpu, msr))
            .copied()
            .unwrap_or(InterceptMode::ReadWrite)
    }

    /// The number of RDMSR and WRMSR operations performed so far.
    pub fn accesses(&self) -> u64 {
        self.accesses.load(Ordering::Relaxed)
    }
}

impl MsrAccess for SimPmu {
    fn rdmsr(&self, msr: MsrId) -> u64 {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        self.peek(msr)
    }

    fn wrmsr(&self, msr: MsrId, value: u64) {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        self.poke(msr, value);
    }
}

impl MsrIntercept for SimPmu {
    fn set_intercept(&self, vcpu: VcpuId, msr: MsrId, mode: InterceptMode) {
        self.intercepts.lock().unwrap().insert((vcpu, msr), mode);
    }
}
