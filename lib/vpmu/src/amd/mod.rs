// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The AMD vPMU backend.
//!
//! [`AmdPmu`] is built once, at boot, and decides which register topology the
//! host has. [`AmdPmu::initialise`] then gives each vCPU its own shadow
//! context and installs the operations that emulate guest accesses to the
//! event selects and counters.

use std::fmt;
use std::sync::Arc;

use slog::{debug, info, warn};

use crate::common::{VcpuId, PAGE_SIZE};
use crate::hw::Platform;
use crate::mode::VpmuMode;
use crate::msr::MsrId;
use crate::vpmu::{SaveOutcome, Vpmu, VpmuError, VpmuOps, VpmuState};

pub mod bits;
mod context;
mod intercept;
mod topology;

pub use intercept::InterceptState;
pub(crate) use topology::legacy_to_extended;
pub use topology::{
    classify, GuestRegs, MsrClass, SharedPageHeader, Slot, Topology,
    TopologyError, SHARED_PAGE_HEADER_SIZE,
};

use bits::{counter_overflowed, EventSelect};
use context::AmdContext;
use intercept::DirectAccess;

#[usdt::provider(provider = "vpmu")]
mod probes {
    fn amd_vpmu_wrmsr(vcpu: u32, msr: u32, value: u64) {}
    fn amd_vpmu_rdmsr(vcpu: u32, msr: u32, value: u64) {}
    fn amd_vpmu_unsupported(vcpu: u32, msr: u32) {}
    fn amd_vpmu_acquire(vcpu: u32, acquired: bool) {}
    fn amd_vpmu_release(vcpu: u32) {}
    fn amd_vpmu_save(vcpu: u32, saved: bool) {}
    fn amd_vpmu_load(vcpu: u32, full: bool) {}
    fn amd_vpmu_intercept(vcpu: u32, direct: bool) {}
    fn amd_vpmu_interrupt(vcpu: u32, overflowed: u64) {}
}

/// Boot-time parameters of the AMD vPMU.
#[derive(Clone, Copy, Debug)]
pub struct BootConfig {
    pub mode: VpmuMode,

    /// The family of the host CPU, as reported by CPUID.
    pub cpu_family: u8,

    /// Size of the per-vCPU page the register banks must fit into.
    pub shared_page_size: usize,
}

impl BootConfig {
    pub fn new(mode: VpmuMode, cpu_family: u8) -> Self {
        Self { mode, cpu_family, shared_page_size: PAGE_SIZE }
    }
}

/// The host-wide half of the AMD vPMU.
pub struct AmdPmu {
    log: slog::Logger,
    mode: VpmuMode,
    topology: Result<Topology, TopologyError>,
    platform: Platform,
}

impl AmdPmu {
    /// Selects the register topology for the host described by `config`.
    ///
    /// A host the vPMU cannot support is not an error here: the failure is
    /// logged and retained, and every later [`AmdPmu::initialise`] call fails.
    pub fn new(
        log: &slog::Logger,
        config: BootConfig,
        platform: Platform,
    ) -> Arc<Self> {
        let log = log.new(slog::o!("component" => "amd-vpmu"));
        let topology = Topology::select_for_page(
            config.cpu_family,
            config.shared_page_size,
        );

        match &topology {
            Ok(t) => info!(log, "selected PMU register topology";
                "family" => format!("{:#x}", t.family()),
                "counters" => t.counter_count(),
                "mirrored" => t.is_mirrored(),
            ),
            Err(e) => warn!(log, "vPMU unavailable: {e}";
                "family" => format!("{:#x}", config.cpu_family),
            ),
        }

        Arc::new(Self { log, mode: config.mode, topology, platform })
    }

    pub fn mode(&self) -> VpmuMode {
        self.mode
    }

    /// The register topology selected at boot, if the host is supported.
    pub fn topology(&self) -> Option<&Topology> {
        self.topology.as_ref().ok()
    }

    /// Why no topology was selected, if one was not.
    pub fn boot_error(&self) -> Option<TopologyError> {
        self.topology.err()
    }

    /// Gives `vpmu` a shadow context and installs the AMD operations on it.
    ///
    /// Succeeds without doing anything when virtualization is off or when
    /// `vpmu` already has a context.
    pub fn initialise(&self, vpmu: &mut Vpmu) -> Result<(), VpmuError> {
        if self.mode.is_off() || vpmu.state().is_allocated() {
            return Ok(());
        }

        let topology = match self.topology {
            Ok(t) => t,
            Err(e) => {
                debug!(vpmu.log(), "no vPMU for vcpu"; "error" => %e);
                return Err(VpmuError::InvalidConfiguration);
            }
        };

        let state = vpmu.state();
        let out_of_memory = || {
            let err = VpmuError::OutOfMemory {
                vcpu: state.vcpu(),
                domain: state.domain(),
            };
            warn!(self.log, "{err}");
            err
        };

        let bytes = context_bytes(topology.counter_count());
        if !self.platform.memory.reserve(bytes) {
            return Err(out_of_memory());
        }
        let ctx = match AmdContext::alloc(topology.counter_count()) {
            Ok(ctx) => ctx,
            Err(_) => {
                self.platform.memory.release(bytes);
                return Err(out_of_memory());
            }
        };

        let log = vpmu.log().clone();
        vpmu.install(Box::new(AmdVcpuPmu {
            log,
            topology,
            platform: self.platform.clone(),
            ctx,
            direct: DirectAccess::default(),
        }));
        Ok(())
    }
}

/// Bytes charged against the host's context memory for one vCPU with
/// `counters` counter pairs.
fn context_bytes(counters: usize) -> usize {
    std::mem::size_of::<AmdVcpuPmu>()
        + 2 * std::mem::size_of::<u64>() * counters
}

/// The AMD operations for a single vCPU.
struct AmdVcpuPmu {
    log: slog::Logger,
    topology: Topology,
    platform: Platform,
    ctx: AmdContext,
    direct: DirectAccess,
}

impl AmdVcpuPmu {
    /// Writes both shadow banks to hardware.
    fn context_load(&self) {
        let msrs = &self.platform.msrs;
        for (i, (ctrl, counter)) in self.topology.pairs().enumerate() {
            msrs.wrmsr(counter, self.ctx.counters()[i]);
            msrs.wrmsr(ctrl, self.ctx.ctrls()[i]);
        }
    }

    /// Captures the live counters into the shadow bank.
    fn context_save(&mut self) {
        let topology = self.topology;
        let msrs = self.platform.msrs.clone();
        for (shadow, counter) in
            self.ctx.counters_mut().iter_mut().zip(topology.counters())
        {
            *shadow = msrs.rdmsr(counter);
        }
    }

    /// Brings the hardware in line with the shadow banks if a freeze or an
    /// earlier save left it stale.
    fn reload_if_needed(&self, state: &mut VpmuState) {
        if state.needs_reload() {
            self.context_load();
            state.mark_loaded();
            probes::amd_vpmu_load!(|| (state.vcpu().0, true));
        }
    }

    fn enable_direct(&mut self, vcpu: VcpuId) {
        let intercepts = self.platform.intercepts.clone();
        self.direct.enable(intercepts.as_ref(), &self.topology, vcpu);
    }

    fn disable_direct(&mut self, vcpu: VcpuId) {
        let intercepts = self.platform.intercepts.clone();
        self.direct.disable(intercepts.as_ref(), &self.topology, vcpu);
    }

    /// Acquires or releases PMU ownership as a guest write to an event select
    /// enables or disables counting.
    fn track_enable(&mut self, state: &mut VpmuState, sel: EventSelect) {
        let vcpu = state.vcpu();
        let owner = state.owner();

        if sel.enable() && !state.is_running() {
            let acquired = self.platform.ownership.acquire(owner);
            probes::amd_vpmu_acquire!(|| (vcpu.0, acquired));
            if !acquired {
                debug!(
                    self.log,
                    "PMU owned elsewhere, counting under intercepts"
                );
                return;
            }

            state.start_running();
            if state.kind().is_hvm() && !self.direct.is_on() {
                self.enable_direct(vcpu);
            }
        } else if !sel.enable() && state.is_running() {
            state.stop_running();
            if self.direct.is_on() {
                self.disable_direct(vcpu);
            }
            self.platform.ownership.release(owner);
            probes::amd_vpmu_release!(|| vcpu.0);
        }
    }

    fn unsupported(&self, state: &VpmuState, msr: MsrId) -> VpmuError {
        probes::amd_vpmu_unsupported!(|| (state.vcpu().0, msr.0));
        VpmuError::UnsupportedRegister(msr)
    }
}

impl VpmuOps for AmdVcpuPmu {
    fn do_wrmsr(
        &mut self,
        state: &mut VpmuState,
        msr: MsrId,
        mut value: u64,
    ) -> Result<(), VpmuError> {
        let slot = self
            .topology
            .slot(msr)
            .ok_or_else(|| self.unsupported(state, msr))?;

        if let Slot::Control(_) = slot {
            // Keep the guest's counters from running while the hypervisor
            // executes on its behalf.
            if state.kind().is_hvm() {
                value = EventSelect(value).with_guest_only(true).0;
            }
            self.track_enable(state, EventSelect(value));
        }

        self.reload_if_needed(state);
        self.ctx.update(slot, value);
        self.platform.msrs.wrmsr(msr, value);
        probes::amd_vpmu_wrmsr!(|| (state.vcpu().0, msr.0, value));
        Ok(())
    }

    fn do_rdmsr(
        &mut self,
        state: &mut VpmuState,
        msr: MsrId,
    ) -> Result<u64, VpmuError> {
        if self.topology.slot(msr).is_none() {
            return Err(self.unsupported(state, msr));
        }

        self.reload_if_needed(state);
        let value = self.platform.msrs.rdmsr(msr);
        probes::amd_vpmu_rdmsr!(|| (state.vcpu().0, msr.0, value));
        Ok(value)
    }

    fn do_interrupt(&mut self, state: &mut VpmuState) -> bool {
        probes::amd_vpmu_interrupt!(|| {
            let overflowed = if state.is_loaded() {
                self.topology
                    .pairs()
                    .zip(self.ctx.ctrls())
                    .filter(|&((_, counter), ctrl)| {
                        EventSelect(*ctrl).enable()
                            && counter_overflowed(
                                self.platform.msrs.rdmsr(counter),
                            )
                    })
                    .count()
            } else {
                0
            };
            (state.vcpu().0, overflowed as u64)
        });
        true
    }

    fn save(&mut self, state: &mut VpmuState) -> SaveOutcome {
        let vcpu = state.vcpu();

        if !state.save_requested() {
            // Stop counting but leave the counters in place; a quick switch
            // back to this vCPU resumes them without a full reload.
            for ctrl in self.topology.ctrls() {
                self.platform.msrs.wrmsr(ctrl, 0);
            }
            state.freeze();
            probes::amd_vpmu_save!(|| (vcpu.0, false));
            return SaveOutcome::NothingSaved;
        }

        if !state.is_loaded() {
            return SaveOutcome::NothingSaved;
        }

        self.context_save();
        if !state.is_running() && self.direct.is_on() {
            self.disable_direct(vcpu);
        }
        probes::amd_vpmu_save!(|| (vcpu.0, true));
        SaveOutcome::Saved
    }

    fn load(&mut self, state: &mut VpmuState) {
        state.thaw();

        if state.is_loaded() {
            // The counters kept running across the freeze; only the event
            // selects need restoring.
            for (ctrl, &value) in self.topology.ctrls().zip(self.ctx.ctrls()) {
                self.platform.msrs.wrmsr(ctrl, value);
            }
            probes::amd_vpmu_load!(|| (state.vcpu().0, false));
            return;
        }

        self.context_load();
        state.mark_loaded();
        probes::amd_vpmu_load!(|| (state.vcpu().0, true));
    }

    fn destroy(mut self: Box<Self>, state: &mut VpmuState) {
        let vcpu = state.vcpu();
        if self.direct.is_on() {
            self.disable_direct(vcpu);
        }
        if state.is_running() {
            state.stop_running();
            self.platform.ownership.release(state.owner());
            probes::amd_vpmu_release!(|| vcpu.0);
        }
        let bytes = context_bytes(self.topology.counter_count());
        self.platform.memory.release(bytes);
    }

    fn dump(
        &self,
        _state: &VpmuState,
        out: &mut dyn fmt::Write,
    ) -> fmt::Result {
        let msrs = &self.platform.msrs;
        for (i, (ctrl, counter)) in self.topology.pairs().enumerate() {
            writeln!(
                out,
                "      {ctrl}: {:#x} ({:#x} in HW)    \
                {counter}: {:#x} ({:#x} in HW)",
                self.ctx.ctrls()[i],
                msrs.rdmsr(ctrl),
                self.ctx.counters()[i],
                msrs.rdmsr(counter),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::bits::*;
    use super::*;
    use crate::common::{DomainId, GuestKind};
    use crate::hw::{
        InterceptMode, MemoryBudget, MockContextMemory, MockMsrAccess,
    };
    use crate::msr::{RdmsrOutcome, WrmsrOutcome};
    use crate::ownership::{MockPmuOwnership, OwnershipArbiter, PmuOwner};
    use crate::sim::SimPmu;
    use crate::vpmu::VpmuFlags;

    const ENABLED: u64 = 0x43_0076;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    struct Fixture {
        sim: Arc<SimPmu>,
        arbiter: Arc<OwnershipArbiter>,
        pmu: Arc<AmdPmu>,
    }

    impl Fixture {
        fn new(family: u8) -> Self {
            Self::with_config(BootConfig::new(VpmuMode::GuestOnly, family))
        }

        fn with_config(config: BootConfig) -> Self {
            let sim = Arc::new(SimPmu::for_family(config.cpu_family));
            let arbiter = Arc::new(OwnershipArbiter::new());
            let platform = sim.platform(arbiter.clone());
            let pmu = AmdPmu::new(&test_logger(), config, platform);
            Self { sim, arbiter, pmu }
        }

        fn vcpu_of(&self, id: u32, kind: GuestKind) -> Vpmu {
            let mut vpmu =
                Vpmu::new(&test_logger(), VcpuId(id), DomainId(1), kind);
            self.pmu.initialise(&mut vpmu).unwrap();
            vpmu
        }

        fn vcpu(&self, id: u32) -> Vpmu {
            self.vcpu_of(id, GuestKind::Hvm)
        }

        fn direct(&self, id: u32) -> bool {
            let t = self.pmu.topology().unwrap();
            t.counters().all(|counter| {
                self.sim.intercept(VcpuId(id), counter) == InterceptMode::None
            }) && t.ctrls().all(|ctrl| {
                self.sim.intercept(VcpuId(id), ctrl) == InterceptMode::Write
            })
        }

        fn trapped(&self, id: u32) -> bool {
            let t = self.pmu.topology().unwrap();
            t.counters().chain(t.ctrls()).all(|msr| {
                self.sim.intercept(VcpuId(id), msr) == InterceptMode::ReadWrite
            })
        }
    }

    fn guest(id: u32) -> PmuOwner {
        PmuOwner::Guest { domain: DomainId(1), vcpu: VcpuId(id) }
    }

    #[test]
    fn boot_selects_topology() {
        let fx = Fixture::new(0x15);
        assert_eq!(fx.pmu.topology().unwrap().counter_count(), 6);
        assert_eq!(fx.pmu.boot_error(), None);

        let fx = Fixture::new(0x16);
        assert_eq!(fx.pmu.topology().unwrap().counter_count(), 4);
    }

    #[test]
    fn unsupported_family_disables_every_vcpu() {
        let fx = Fixture::new(0x17);
        assert!(fx.pmu.topology().is_none());
        assert_eq!(
            fx.pmu.boot_error(),
            Some(TopologyError::UnsupportedCpuFamily(0x17))
        );

        for id in 0..4 {
            let mut vpmu = Vpmu::new(
                &test_logger(),
                VcpuId(id),
                DomainId(1),
                GuestKind::Hvm,
            );
            assert!(matches!(
                fx.pmu.initialise(&mut vpmu),
                Err(VpmuError::InvalidConfiguration)
            ));
            assert!(!vpmu.has_context());
            assert!(!vpmu.state().is_allocated());
        }
    }

    #[test]
    fn oversized_bank_disables_every_vcpu() {
        let fx = Fixture::with_config(BootConfig {
            mode: VpmuMode::GuestOnly,
            cpu_family: 0x15,
            shared_page_size: 64,
        });
        assert!(fx.pmu.topology().is_none());
        assert!(matches!(
            fx.pmu.boot_error(),
            Some(TopologyError::RegisterBankTooLarge { page_size: 64, .. })
        ));

        for id in 0..2 {
            let mut vpmu = Vpmu::new(
                &test_logger(),
                VcpuId(id),
                DomainId(1),
                GuestKind::Hvm,
            );
            assert!(fx.pmu.initialise(&mut vpmu).is_err());
        }
    }

    #[test]
    fn mode_off_is_a_no_op() {
        let fx = Fixture::with_config(BootConfig::new(VpmuMode::Off, 0x10));
        let mut vpmu =
            Vpmu::new(&test_logger(), VcpuId(0), DomainId(1), GuestKind::Hvm);
        fx.pmu.initialise(&mut vpmu).unwrap();
        assert!(!vpmu.has_context());
        assert_eq!(
            vpmu.rdmsr(MsrId(MSR_K7_PERFCTR0)),
            RdmsrOutcome::NotHandled
        );
    }

    #[test]
    fn initialise_marks_allocated_once() {
        let fx = Fixture::new(0x10);
        let mut vpmu = fx.vcpu(0);
        assert_eq!(vpmu.state().flags(), VpmuFlags::CONTEXT_ALLOCATED);
        fx.pmu.initialise(&mut vpmu).unwrap();
        assert_eq!(vpmu.state().flags(), VpmuFlags::CONTEXT_ALLOCATED);
    }

    #[test]
    fn unsupported_registers_never_touch_hardware() {
        for family in [0x10, 0x15] {
            let fx = Fixture::new(family);
            let mut vpmu = fx.vcpu(0);
            for addr in [0x0, 0x10, 0xC001_0008, 0xC001_01FF, 0xC001_020C] {
                let msr = MsrId(addr);
                assert_eq!(vpmu.wrmsr(msr, ENABLED), WrmsrOutcome::NotHandled);
                assert_eq!(vpmu.rdmsr(msr), RdmsrOutcome::NotHandled);
            }
            assert_eq!(fx.sim.accesses(), 0);
        }
    }

    #[test]
    fn extended_bank_is_unsupported_on_four_counter_hosts() {
        let fx = Fixture::new(0x10);
        let mut vpmu = fx.vcpu(0);
        let msr = MsrId(MSR_F15H_PERF_CTL0);
        assert_eq!(vpmu.wrmsr(msr, ENABLED), WrmsrOutcome::NotHandled);
        assert_eq!(fx.sim.accesses(), 0);
    }

    #[test]
    fn unsupported_register_reports_address() {
        let fx = Fixture::new(0x10);
        let mut vpmu = fx.vcpu(0);
        let mut state = vpmu.state().clone();
        let mut ops = AmdVcpuPmu {
            log: test_logger(),
            topology: *fx.pmu.topology().unwrap(),
            platform: fx.pmu.platform.clone(),
            ctx: AmdContext::alloc(4).unwrap(),
            direct: DirectAccess::default(),
        };
        assert!(matches!(
            ops.do_wrmsr(&mut state, MsrId(0xC001_0100), 0),
            Err(VpmuError::UnsupportedRegister(MsrId(0xC001_0100)))
        ));
        vpmu.destroy();
    }

    #[test]
    fn write_then_read_matches_hardware() {
        let fx = Fixture::new(0x10);
        let mut vpmu = fx.vcpu(0);

        let ctr = MsrId(MSR_K7_PERFCTR2);
        assert_eq!(vpmu.wrmsr(ctr, 0xffff_0000_1234), WrmsrOutcome::Handled);
        assert_eq!(vpmu.rdmsr(ctr), RdmsrOutcome::Handled(0xffff_0000_1234));
        assert_eq!(fx.sim.peek(ctr), 0xffff_0000_1234);

        // Control writes gain the guest-only bit.
        let ctl = MsrId(MSR_K7_EVNTSEL1);
        let value = EventSelect(0x76).with_usr(true);
        assert_eq!(vpmu.wrmsr(ctl, value.0), WrmsrOutcome::Handled);
        let expected = value.with_guest_only(true).0;
        assert_eq!(vpmu.rdmsr(ctl), RdmsrOutcome::Handled(expected));
        assert_eq!(fx.sim.peek(ctl), expected);
        assert!(vpmu.state().is_loaded());
    }

    #[test]
    fn first_access_loads_the_whole_context() {
        let fx = Fixture::new(0x10);
        fx.sim.poke(MsrId(MSR_K7_EVNTSEL3), 0xdead);
        fx.sim.poke(MsrId(MSR_K7_PERFCTR3), 0xbeef);

        let mut vpmu = fx.vcpu(0);
        assert_eq!(
            vpmu.rdmsr(MsrId(MSR_K7_PERFCTR0)),
            RdmsrOutcome::Handled(0)
        );
        // Another vCPU's leftovers were overwritten by the zeroed shadow.
        assert_eq!(fx.sim.peek(MsrId(MSR_K7_EVNTSEL3)), 0);
        assert_eq!(fx.sim.peek(MsrId(MSR_K7_PERFCTR3)), 0);
    }

    #[test]
    fn enabling_takes_ownership_and_direct_access() {
        let fx = Fixture::new(0x15);
        let mut vpmu = fx.vcpu(0);
        assert!(fx.trapped(0));

        vpmu.wrmsr(MsrId(MSR_F15H_PERF_CTL0), ENABLED);
        assert!(vpmu.state().is_running());
        assert!(fx.direct(0));
        assert_eq!(fx.arbiter.holder(), Some(guest(0)));

        // A second enabling write changes nothing.
        vpmu.wrmsr(MsrId(MSR_F15H_PERF_CTL1), ENABLED);
        assert!(vpmu.state().is_running());
        assert_eq!(fx.arbiter.holder(), Some(guest(0)));
    }

    #[test]
    fn cooperative_save_keeps_direct_access_while_running() {
        let fx = Fixture::new(0x15);
        let mut vpmu = fx.vcpu(0);
        let ctl = MsrId(MSR_F15H_PERF_CTL2);
        let ctr = MsrId(MSR_F15H_PERF_CTR2);

        vpmu.wrmsr(ctr, 0x8000_0000_0000);
        vpmu.wrmsr(ctl, ENABLED);
        fx.sim.poke(ctr, 0x8000_0000_0400);

        assert_eq!(vpmu.save_force(), SaveOutcome::Saved);
        assert!(!vpmu.state().is_loaded());
        assert!(vpmu.state().is_running());
        assert!(fx.direct(0));
        assert!(vpmu.dump().contains("0x800000000400 (0x800000000400 in HW)"));

        // Disabling counting is what finally restores the intercepts.
        vpmu.wrmsr(ctl, 0);
        assert!(!vpmu.state().is_running());
        assert!(fx.trapped(0));
        assert_eq!(fx.arbiter.holder(), None);

        // The reload on that write restored the saved counter.
        assert_eq!(fx.sim.peek(ctr), 0x8000_0000_0400);
    }

    #[test]
    fn cooperative_save_drops_direct_access_when_idle() {
        let fx = Fixture::new(0x10);
        let mut vpmu = fx.vcpu(0);
        let mut state = vpmu.state().clone();
        let mut ops = AmdVcpuPmu {
            log: test_logger(),
            topology: *fx.pmu.topology().unwrap(),
            platform: fx.pmu.platform.clone(),
            ctx: AmdContext::alloc(4).unwrap(),
            direct: DirectAccess::default(),
        };

        ops.enable_direct(VcpuId(0));
        state.mark_loaded();
        state.request_save();
        assert_eq!(ops.save(&mut state), SaveOutcome::Saved);
        assert_eq!(ops.direct.state(), InterceptState::BitmapOff);
        assert!(fx.trapped(0));
        vpmu.destroy();
    }

    #[test]
    fn cooperative_save_of_unloaded_context_is_a_no_op() {
        let fx = Fixture::new(0x10);
        let mut vpmu = fx.vcpu(0);
        let mut state = vpmu.state().clone();
        let mut ops = AmdVcpuPmu {
            log: test_logger(),
            topology: *fx.pmu.topology().unwrap(),
            platform: fx.pmu.platform.clone(),
            ctx: AmdContext::alloc(4).unwrap(),
            direct: DirectAccess::default(),
        };

        state.request_save();
        assert_eq!(ops.save(&mut state), SaveOutcome::NothingSaved);
        assert_eq!(fx.sim.accesses(), 0);
        assert_eq!(vpmu.save_force(), SaveOutcome::NothingSaved);
        vpmu.destroy();
    }

    #[test]
    fn contended_enable_still_reaches_hardware() {
        let fx = Fixture::new(0x10);
        let mut a = fx.vcpu(0);
        let mut b = fx.vcpu(1);

        a.wrmsr(MsrId(MSR_K7_EVNTSEL0), ENABLED);
        assert!(a.state().is_running());

        let ctl = MsrId(MSR_K7_EVNTSEL1);
        assert_eq!(b.wrmsr(ctl, ENABLED), WrmsrOutcome::Handled);
        let expected = EventSelect(ENABLED).with_guest_only(true).0;
        assert_eq!(fx.sim.peek(ctl), expected);
        assert!(b.dump().contains(&format!("{ctl}: {expected:#x}")));
        assert!(!b.state().is_running());
        assert!(fx.trapped(1));
        assert_eq!(fx.arbiter.holder(), Some(guest(0)));

        // B never owned the PMU, so disabling must not release A's claim.
        b.wrmsr(ctl, 0);
        assert_eq!(fx.arbiter.holder(), Some(guest(0)));
    }

    #[test]
    fn disable_without_ownership_releases_nothing() {
        let sim = Arc::new(SimPmu::for_family(0x10));
        let mut ownership = MockPmuOwnership::new();
        ownership.expect_acquire().times(1).return_const(false);
        ownership.expect_release().times(0);

        let pmu = AmdPmu::new(
            &test_logger(),
            BootConfig::new(VpmuMode::GuestOnly, 0x10),
            sim.platform(Arc::new(ownership)),
        );
        let mut vpmu =
            Vpmu::new(&test_logger(), VcpuId(3), DomainId(2), GuestKind::Hvm);
        pmu.initialise(&mut vpmu).unwrap();

        vpmu.wrmsr(MsrId(MSR_K7_EVNTSEL0), ENABLED);
        vpmu.wrmsr(MsrId(MSR_K7_EVNTSEL0), 0);
        vpmu.destroy();
    }

    #[test]
    fn switch_out_freezes_and_next_access_reloads() {
        let fx = Fixture::new(0x10);
        let mut vpmu = fx.vcpu(0);
        let ctl = MsrId(MSR_K7_EVNTSEL2);
        let ctr = MsrId(MSR_K7_PERFCTR2);

        vpmu.wrmsr(ctr, 0x1000);
        vpmu.wrmsr(ctl, ENABLED);
        let expected = fx.sim.peek(ctl);

        assert_eq!(vpmu.on_switch_out(), SaveOutcome::NothingSaved);
        assert!(vpmu.state().is_frozen());
        assert!(vpmu.state().is_loaded());
        for ctrl in fx.pmu.topology().unwrap().ctrls() {
            assert_eq!(fx.sim.peek(ctrl), 0);
        }

        assert_eq!(vpmu.rdmsr(ctl), RdmsrOutcome::Handled(expected));
        assert!(!vpmu.state().is_frozen());
        assert_eq!(fx.sim.peek(ctr), 0x1000);
    }

    #[test]
    fn switch_in_after_freeze_leaves_counters_running() {
        let fx = Fixture::new(0x15);
        let mut vpmu = fx.vcpu(0);
        let ctl = MsrId(MSR_F15H_PERF_CTL5);
        let ctr = MsrId(MSR_F15H_PERF_CTR5);

        vpmu.wrmsr(ctl, ENABLED);
        let expected = fx.sim.peek(ctl);
        vpmu.on_switch_out();
        assert_eq!(fx.sim.peek(ctl), 0);

        // The counter moves on between the freeze and the switch back in;
        // a control-only reload must not clobber it with the stale shadow.
        fx.sim.poke(ctr, 0x777);
        vpmu.on_switch_in();
        assert!(!vpmu.state().is_frozen());
        assert_eq!(fx.sim.peek(ctl), expected);
        assert_eq!(fx.sim.peek(ctr), 0x777);
    }

    #[test]
    fn switch_in_restores_idle_vcpu() {
        let fx = Fixture::new(0x10);
        let mut vpmu = fx.vcpu(0);
        let ctl = MsrId(MSR_K7_EVNTSEL1);
        vpmu.wrmsr(ctl, EventSelect(0x76).with_usr(true).0);
        let expected = fx.sim.peek(ctl);
        assert!(!vpmu.state().is_running());

        vpmu.on_switch_out();
        assert_eq!(fx.sim.peek(ctl), 0);
        vpmu.on_switch_in();
        assert!(!vpmu.state().is_frozen());
        assert_eq!(fx.sim.peek(ctl), expected);
    }

    #[test]
    fn contended_vcpu_counts_again_after_switch_in() {
        let fx = Fixture::new(0x10);
        let mut a = fx.vcpu(0);
        let mut b = fx.vcpu(1);
        a.wrmsr(MsrId(MSR_K7_EVNTSEL0), ENABLED);

        let ctl = MsrId(MSR_K7_EVNTSEL1);
        b.wrmsr(ctl, ENABLED);
        assert!(!b.state().is_running());

        b.on_switch_out();
        assert!(b.state().is_frozen());
        b.on_switch_in();
        assert!(!b.state().is_frozen());
        assert_eq!(fx.sim.peek(ctl), 0x100_0043_0076);
        assert_eq!(fx.arbiter.holder(), Some(guest(0)));
    }

    #[test]
    fn write_after_freeze_restores_controls_first() {
        let fx = Fixture::new(0x10);
        let mut vpmu = fx.vcpu(0);
        let ctl = MsrId(MSR_K7_EVNTSEL2);
        let ctr = MsrId(MSR_K7_PERFCTR0);

        vpmu.wrmsr(MsrId(MSR_K7_PERFCTR2), 0x1000);
        vpmu.wrmsr(ctl, ENABLED);
        let expected = fx.sim.peek(ctl);
        vpmu.on_switch_out();
        assert!(vpmu.state().is_frozen());

        assert_eq!(vpmu.wrmsr(ctr, 0x55), WrmsrOutcome::Handled);
        assert!(!vpmu.state().is_frozen());
        assert_eq!(fx.sim.peek(ctr), 0x55);
        for c in fx.pmu.topology().unwrap().ctrls() {
            let want = if c == ctl { expected } else { 0 };
            assert_eq!(fx.sim.peek(c), want, "{c}");
        }
    }

    fn budgeted(bytes: usize) -> Fixture {
        let sim = Arc::new(SimPmu::for_family(0x15));
        let arbiter = Arc::new(OwnershipArbiter::new());
        let mut platform = sim.platform(arbiter.clone());
        platform.memory = Arc::new(MemoryBudget::new(bytes));
        let pmu = AmdPmu::new(
            &test_logger(),
            BootConfig::new(VpmuMode::GuestOnly, 0x15),
            platform,
        );
        Fixture { sim, arbiter, pmu }
    }

    #[test]
    fn exhausted_memory_leaves_vcpu_without_context() {
        let fx = budgeted(0);
        let mut vpmu =
            Vpmu::new(&test_logger(), VcpuId(4), DomainId(2), GuestKind::Hvm);
        assert!(matches!(
            fx.pmu.initialise(&mut vpmu),
            Err(VpmuError::OutOfMemory {
                vcpu: VcpuId(4),
                domain: DomainId(2),
            })
        ));
        assert!(!vpmu.has_context());
        assert!(!vpmu.state().is_allocated());
        assert_eq!(
            vpmu.wrmsr(MsrId(MSR_F15H_PERF_CTL0), ENABLED),
            WrmsrOutcome::NotHandled
        );
        assert_eq!(fx.sim.accesses(), 0);
    }

    #[test]
    fn destroy_returns_context_memory() {
        let fx = budgeted(context_bytes(6));
        let mut a = fx.vcpu(0);

        let mut b =
            Vpmu::new(&test_logger(), VcpuId(1), DomainId(1), GuestKind::Hvm);
        assert!(matches!(
            fx.pmu.initialise(&mut b),
            Err(VpmuError::OutOfMemory { .. })
        ));

        a.destroy();
        fx.pmu.initialise(&mut b).unwrap();
        assert!(b.state().is_allocated());
    }

    #[test]
    fn memory_is_reserved_before_allocation() {
        let sim = Arc::new(SimPmu::for_family(0x10));
        let mut memory = MockContextMemory::new();
        memory
            .expect_reserve()
            .withf(|&bytes| bytes == context_bytes(4))
            .times(1)
            .return_const(false);
        memory.expect_release().times(0);

        let mut platform = sim.platform(Arc::new(OwnershipArbiter::new()));
        platform.memory = Arc::new(memory);
        let pmu = AmdPmu::new(
            &test_logger(),
            BootConfig::new(VpmuMode::GuestOnly, 0x10),
            platform,
        );
        let mut vpmu =
            Vpmu::new(&test_logger(), VcpuId(0), DomainId(1), GuestKind::Hvm);
        assert!(pmu.initialise(&mut vpmu).is_err());
    }

    #[test]
    fn full_load_after_save() {
        let fx = Fixture::new(0x15);
        let mut vpmu = fx.vcpu(0);
        let ctr = MsrId(MSR_F15H_PERF_CTR4);

        vpmu.wrmsr(MsrId(MSR_F15H_PERF_CTL4), ENABLED);
        fx.sim.poke(ctr, 0x4242);
        assert_eq!(vpmu.save_force(), SaveOutcome::Saved);

        // Someone else programs the PMU while this vCPU is away.
        fx.sim.poke(ctr, 0);
        vpmu.on_switch_in();
        assert!(vpmu.state().is_loaded());
        assert_eq!(fx.sim.peek(ctr), 0x4242);
    }

    #[test]
    fn legacy_and_extended_names_share_a_slot() {
        let fx = Fixture::new(0x15);
        let mut vpmu = fx.vcpu(0);

        vpmu.wrmsr(MsrId(MSR_K7_PERFCTR1), 0x11);
        assert_eq!(
            vpmu.rdmsr(MsrId(MSR_F15H_PERF_CTR1)),
            RdmsrOutcome::Handled(0x11)
        );
        vpmu.wrmsr(MsrId(MSR_F15H_PERF_CTR1), 0x22);
        assert_eq!(
            vpmu.rdmsr(MsrId(MSR_K7_PERFCTR1)),
            RdmsrOutcome::Handled(0x22)
        );

        let dump = vpmu.dump();
        let line = dump
            .lines()
            .find(|l| l.contains(&format!("{}:", MsrId(MSR_F15H_PERF_CTR1))))
            .unwrap();
        assert!(line.ends_with(&format!(
            "{}: 0x22 (0x22 in HW)",
            MsrId(MSR_F15H_PERF_CTR1)
        )));
    }

    #[test]
    fn pv_guests_skip_guest_bit_and_bitmap() {
        let fx = Fixture::new(0x10);
        let mut vpmu = fx.vcpu_of(0, GuestKind::Pv);
        let ctl = MsrId(MSR_K7_EVNTSEL0);

        vpmu.wrmsr(ctl, ENABLED);
        assert_eq!(fx.sim.peek(ctl), ENABLED);
        assert!(vpmu.state().is_running());
        assert!(fx.trapped(0));

        vpmu.wrmsr(ctl, 0);
        assert!(!vpmu.state().is_running());
        assert_eq!(fx.arbiter.holder(), None);
    }

    #[test]
    fn destroy_releases_everything() {
        let fx = Fixture::new(0x15);
        let mut vpmu = fx.vcpu(0);
        vpmu.wrmsr(MsrId(MSR_F15H_PERF_CTL0), ENABLED);
        assert!(fx.direct(0));

        vpmu.destroy();
        assert!(fx.trapped(0));
        assert_eq!(fx.arbiter.holder(), None);
        assert_eq!(vpmu.state().flags(), VpmuFlags::empty());
        assert_eq!(
            vpmu.wrmsr(MsrId(MSR_F15H_PERF_CTL0), 0),
            WrmsrOutcome::NotHandled
        );

        // The freed token is available to the next vCPU.
        let mut next = fx.vcpu(1);
        next.wrmsr(MsrId(MSR_F15H_PERF_CTL0), ENABLED);
        assert!(next.state().is_running());
    }

    #[test]
    fn interrupts_are_acknowledged() {
        let fx = Fixture::new(0x10);
        let mut vpmu = fx.vcpu(0);
        assert!(vpmu.on_interrupt());
        vpmu.wrmsr(MsrId(MSR_K7_EVNTSEL0), ENABLED);
        assert!(vpmu.on_interrupt());
    }

    #[test]
    fn dump_reads_hardware() {
        let topology = Topology::select(0x10).unwrap();
        let mut msrs = MockMsrAccess::new();
        msrs.expect_rdmsr()
            .times(2 * topology.counter_count())
            .returning(|msr| u64::from(msr.0 & 0xf));

        let fx = Fixture::new(0x10);
        let mut platform = fx.pmu.platform.clone();
        platform.msrs = Arc::new(msrs);
        let ops = AmdVcpuPmu {
            log: test_logger(),
            topology,
            platform,
            ctx: AmdContext::alloc(4).unwrap(),
            direct: DirectAccess::default(),
        };

        let state = fx.vcpu(0).state().clone();
        let mut out = String::new();
        ops.dump(&state, &mut out).unwrap();
        assert_eq!(out.lines().count(), 4);
        assert_eq!(
            out.lines().next().unwrap(),
            "      0xc0010000: 0x0 (0x0 in HW)    0xc0010004: 0x0 (0x4 in HW)"
        );
    }
}
