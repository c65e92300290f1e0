// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The vendor-neutral half of a vCPU's virtual PMU.
//!
//! A [`Vpmu`] carries the vCPU's lifecycle flags and, once initialised, a
//! vendor operation table ([`VpmuOps`]) that owns the shadow registers. The
//! trap dispatcher and the scheduler only ever talk to the [`Vpmu`]; it
//! decides when the vendor operations need to run.

use std::fmt;

use slog::{debug, info};
use thiserror::Error;

use crate::common::{DomainId, GuestKind, VcpuId};
use crate::msr::{MsrId, RdmsrOutcome, WrmsrOutcome};
use crate::ownership::PmuOwner;

bitflags::bitflags! {
    /// Lifecycle flags of a vCPU's PMU context. These are independent of one
    /// another; see the transition methods on [`VpmuState`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct VpmuFlags: u32 {
        /// Shadow register storage exists.
        const CONTEXT_ALLOCATED = 0x1;

        /// The shadow registers are reflected in the physical PMU.
        const CONTEXT_LOADED = 0x2;

        /// The guest has enabled a counter and this vCPU holds the PMU
        /// ownership token.
        const RUNNING = 0x4;

        /// A full save, rather than a freeze, was requested.
        const CONTEXT_SAVE = 0x8;

        /// The physical event selects were zeroed by a freeze; the next access
        /// must reload them.
        const FROZEN = 0x10;

        /// Diagnostic marker set on behalf of a passive profiling domain.
        const PASSIVE_DOMAIN_ALLOCATED = 0x20;
    }
}

#[derive(Debug, Error)]
pub enum VpmuError {
    #[error("no PMU register topology was selected at boot")]
    InvalidConfiguration,

    #[error(
        "insufficient memory for PMU, PMU feature is unavailable on \
        domain {domain} vcpu {vcpu}"
    )]
    OutOfMemory { vcpu: VcpuId, domain: DomainId },

    #[error("unsupported PMU register {0}")]
    UnsupportedRegister(MsrId),
}

/// Whether a save left behind state that a later load must restore.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The physical PMU was only stopped (or was not touched at all).
    NothingSaved,

    /// The live counters were copied into the shadow registers.
    Saved,
}

/// The identity and lifecycle flags of a vCPU's PMU.
///
/// Flags only change through the transition methods below, so every place
/// that moves the state machine is named.
#[derive(Clone, Debug)]
pub struct VpmuState {
    vcpu: VcpuId,
    domain: DomainId,
    kind: GuestKind,
    flags: VpmuFlags,
}

impl VpmuState {
    pub(crate) fn new(vcpu: VcpuId, domain: DomainId, kind: GuestKind) -> Self {
        Self { vcpu, domain, kind, flags: VpmuFlags::empty() }
    }

    pub fn vcpu(&self) -> VcpuId {
        self.vcpu
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub fn kind(&self) -> GuestKind {
        self.kind
    }

    pub fn flags(&self) -> VpmuFlags {
        self.flags
    }

    /// The identity this vCPU uses when it competes for the physical PMU.
    pub fn owner(&self) -> PmuOwner {
        PmuOwner::Guest { domain: self.domain, vcpu: self.vcpu }
    }

    pub fn is_allocated(&self) -> bool {
        self.flags.contains(VpmuFlags::CONTEXT_ALLOCATED)
    }

    pub fn is_loaded(&self) -> bool {
        self.flags.contains(VpmuFlags::CONTEXT_LOADED)
    }

    pub fn is_running(&self) -> bool {
        self.flags.contains(VpmuFlags::RUNNING)
    }

    pub fn is_frozen(&self) -> bool {
        self.flags.contains(VpmuFlags::FROZEN)
    }

    pub fn save_requested(&self) -> bool {
        self.flags.contains(VpmuFlags::CONTEXT_SAVE)
    }

    /// Whether the physical PMU must be reloaded from the shadow registers
    /// before it can service an access.
    pub fn needs_reload(&self) -> bool {
        !self.is_loaded() || self.is_frozen()
    }

    pub(crate) fn mark_allocated(&mut self) {
        self.flags.insert(VpmuFlags::CONTEXT_ALLOCATED);
    }

    /// Records that the shadow registers were just written to hardware.
    pub(crate) fn mark_loaded(&mut self) {
        self.flags.insert(VpmuFlags::CONTEXT_LOADED);
        self.flags.remove(VpmuFlags::FROZEN);
    }

    pub(crate) fn mark_unloaded(&mut self) {
        self.flags.remove(VpmuFlags::CONTEXT_LOADED);
    }

    pub(crate) fn freeze(&mut self) {
        self.flags.insert(VpmuFlags::FROZEN);
    }

    pub(crate) fn thaw(&mut self) {
        self.flags.remove(VpmuFlags::FROZEN);
    }

    pub(crate) fn start_running(&mut self) {
        self.flags.insert(VpmuFlags::RUNNING);
    }

    pub(crate) fn stop_running(&mut self) {
        self.flags.remove(VpmuFlags::RUNNING);
    }

    pub(crate) fn request_save(&mut self) {
        self.flags.insert(VpmuFlags::CONTEXT_SAVE);
    }

    pub(crate) fn clear_save_request(&mut self) {
        self.flags.remove(VpmuFlags::CONTEXT_SAVE);
    }

    pub(crate) fn mark_passive_domain(&mut self) {
        self.flags.insert(VpmuFlags::PASSIVE_DOMAIN_ALLOCATED);
    }

    pub(crate) fn clear(&mut self) {
        self.flags = VpmuFlags::empty();
    }

    /// Writes the one-line flag summary that heads a dump.
    fn describe(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "    VPMU state: {:#x} ", self.flags.bits())?;
        if !self.is_allocated() {
            return writeln!(out);
        }

        write!(out, "(")?;
        for (flag, name) in [
            (VpmuFlags::PASSIVE_DOMAIN_ALLOCATED, "PASSIVE_DOMAIN_ALLOCATED"),
            (VpmuFlags::FROZEN, "FROZEN"),
            (VpmuFlags::CONTEXT_SAVE, "SAVE"),
            (VpmuFlags::RUNNING, "RUNNING"),
            (VpmuFlags::CONTEXT_LOADED, "LOADED"),
        ] {
            if self.flags.contains(flag) {
                write!(out, "{name}, ")?;
            }
        }
        writeln!(out, "ALLOCATED)")
    }
}

/// A vendor's implementation of the vPMU operations for one vCPU.
///
/// An implementation owns the vCPU's shadow registers; the lifecycle flags
/// live in the [`VpmuState`] passed to every call.
pub trait VpmuOps: Send {
    /// Emulates a guest WRMSR of `value` to `msr`.
    fn do_wrmsr(
        &mut self,
        state: &mut VpmuState,
        msr: MsrId,
        value: u64,
    ) -> Result<(), VpmuError>;

    /// Emulates a guest RDMSR of `msr`.
    fn do_rdmsr(
        &mut self,
        state: &mut VpmuState,
        msr: MsrId,
    ) -> Result<u64, VpmuError>;

    /// Acknowledges a PMU interrupt. Returns whether it was handled.
    fn do_interrupt(&mut self, state: &mut VpmuState) -> bool;

    /// Saves or freezes the physical PMU as the vCPU is switched out.
    fn save(&mut self, state: &mut VpmuState) -> SaveOutcome;

    /// Restores the physical PMU as the vCPU is switched in.
    fn load(&mut self, state: &mut VpmuState);

    /// Tears down the vCPU's PMU state, releasing the shadow registers.
    fn destroy(self: Box<Self>, state: &mut VpmuState);

    /// Writes one line per register pair, comparing shadow and hardware.
    fn dump(&self, state: &VpmuState, out: &mut dyn fmt::Write)
        -> fmt::Result;
}

/// A vCPU's virtual PMU.
pub struct Vpmu {
    log: slog::Logger,
    state: VpmuState,
    ops: Option<Box<dyn VpmuOps>>,
}

impl Vpmu {
    pub fn new(
        log: &slog::Logger,
        vcpu: VcpuId,
        domain: DomainId,
        kind: GuestKind,
    ) -> Self {
        let log = log.new(slog::o!("vcpu" => vcpu.0, "domain" => domain.0));
        Self { log, state: VpmuState::new(vcpu, domain, kind), ops: None }
    }

    pub fn log(&self) -> &slog::Logger {
        &self.log
    }

    pub fn state(&self) -> &VpmuState {
        &self.state
    }

    /// Whether a vendor operation table is installed.
    pub fn has_context(&self) -> bool {
        self.ops.is_some()
    }

    /// Installs a vendor operation table that owns freshly allocated shadow
    /// registers.
    pub(crate) fn install(&mut self, ops: Box<dyn VpmuOps>) {
        self.ops = Some(ops);
        self.state.mark_allocated();
    }

    /// Sets the diagnostic passive-domain marker.
    pub fn set_passive_domain_allocated(&mut self) {
        self.state.mark_passive_domain();
    }

    /// Handles a trapped guest WRMSR.
    pub fn wrmsr(&mut self, msr: MsrId, value: u64) -> WrmsrOutcome {
        let Some(ops) = self.ops.as_mut() else {
            return WrmsrOutcome::NotHandled;
        };

        match ops.do_wrmsr(&mut self.state, msr, value) {
            Ok(()) => WrmsrOutcome::Handled,
            Err(e) => {
                debug!(self.log, "rejected PMU register write";
                    "msr" => %msr, "value" => value, "error" => %e);
                WrmsrOutcome::NotHandled
            }
        }
    }

    /// Handles a trapped guest RDMSR.
    pub fn rdmsr(&mut self, msr: MsrId) -> RdmsrOutcome {
        let Some(ops) = self.ops.as_mut() else {
            return RdmsrOutcome::NotHandled;
        };

        match ops.do_rdmsr(&mut self.state, msr) {
            Ok(value) => RdmsrOutcome::Handled(value),
            Err(e) => {
                debug!(self.log, "rejected PMU register read";
                    "msr" => %msr, "error" => %e);
                RdmsrOutcome::NotHandled
            }
        }
    }

    /// Handles a PMU interrupt taken while this vCPU was running.
    pub fn on_interrupt(&mut self) -> bool {
        match self.ops.as_mut() {
            Some(ops) => ops.do_interrupt(&mut self.state),
            None => false,
        }
    }

    /// Called as the vCPU is descheduled.
    ///
    /// Unless a full save was requested this only freezes the physical PMU,
    /// leaving the context nominally loaded so that a quick switch back in
    /// can resume counting without reloading the counters.
    pub fn on_switch_out(&mut self) -> SaveOutcome {
        if !(self.state.is_allocated() && self.state.is_loaded()) {
            return SaveOutcome::NothingSaved;
        }
        let Some(ops) = self.ops.as_mut() else {
            return SaveOutcome::NothingSaved;
        };

        let outcome = ops.save(&mut self.state);
        if outcome == SaveOutcome::Saved {
            self.state.mark_unloaded();
        }
        outcome
    }

    /// Performs a full save of a loaded context, e.g. because the vCPU is
    /// about to run on a different physical CPU.
    pub fn save_force(&mut self) -> SaveOutcome {
        if !self.state.is_loaded() {
            return SaveOutcome::NothingSaved;
        }
        let Some(ops) = self.ops.as_mut() else {
            return SaveOutcome::NothingSaved;
        };

        self.state.request_save();
        let outcome = ops.save(&mut self.state);
        self.state.clear_save_request();

        if outcome == SaveOutcome::Saved {
            self.state.mark_unloaded();
        }
        outcome
    }

    /// Called as the vCPU is scheduled back in.
    ///
    /// Every allocated context is restored, whether or not it holds the PMU.
    pub fn on_switch_in(&mut self) {
        if !self.state.is_allocated() {
            return;
        }

        if let Some(ops) = self.ops.as_mut() {
            ops.load(&mut self.state);
        }
    }

    /// Tears down this vCPU's PMU context.
    pub fn destroy(&mut self) {
        if let Some(ops) = self.ops.take() {
            ops.destroy(&mut self.state);
            info!(self.log, "destroyed vPMU context");
        }
        self.state.clear();
    }

    /// Writes a human-readable snapshot of this vPMU to `out`.
    pub fn write_dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.state.describe(out)?;
        match &self.ops {
            Some(ops) if self.state.is_allocated() => {
                ops.dump(&self.state, out)
            }
            _ => Ok(()),
        }
    }

    /// Returns a human-readable snapshot of this vPMU.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.write_dump(&mut out)
            .expect("formatting into a String never fails");
        out
    }
}
