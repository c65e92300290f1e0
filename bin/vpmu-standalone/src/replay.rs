// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Replaying a script of trapped PMU accesses and scheduler events against
//! vPMUs running on a simulated host.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use slog::{info, warn};

use vpmu::amd::BootConfig;
use vpmu::common::{DomainId, VcpuId};
use vpmu::msr::{MsrId, RdmsrOutcome, WrmsrOutcome};
use vpmu::ownership::OwnershipArbiter;
use vpmu::sim::SimPmu;
use vpmu::{AmdPmu, Vpmu};
use vpmu_config::{Config, Step};

pub struct Harness {
    log: slog::Logger,
    pmu: Arc<AmdPmu>,
    vcpus: BTreeMap<String, Vpmu>,
}

impl Harness {
    /// Boots a simulated host of the given CPU `family` and initialises a vPMU
    /// for every vCPU in `config`.
    ///
    /// A vCPU whose vPMU cannot be initialised stays in the harness; it simply
    /// has no PMU, so every register access it makes goes unhandled.
    pub fn new(log: &slog::Logger, config: &Config, family: u8) -> Self {
        let sim = Arc::new(SimPmu::for_family(family));
        let platform = sim.platform(Arc::new(OwnershipArbiter::new()));
        let boot = BootConfig {
            mode: config.main.mode,
            cpu_family: family,
            shared_page_size: config.main.shared_page_size,
        };
        let pmu = AmdPmu::new(log, boot, platform);

        let mut vcpus = BTreeMap::new();
        for (name, cfg) in config.vcpus.iter() {
            let mut vpmu = Vpmu::new(
                log,
                VcpuId(cfg.id),
                DomainId(cfg.domain),
                cfg.kind,
            );
            if let Err(e) = pmu.initialise(&mut vpmu) {
                warn!(log, "vcpu {name} runs without a PMU: {e}");
            }
            vcpus.insert(name.clone(), vpmu);
        }

        Self { log: log.new(slog::o!("component" => "replay")), pmu, vcpus }
    }

    pub fn pmu(&self) -> &AmdPmu {
        &self.pmu
    }

    pub fn vcpu(&self, name: &str) -> Option<&Vpmu> {
        self.vcpus.get(name)
    }

    fn vcpu_mut(&mut self, name: &str) -> anyhow::Result<&mut Vpmu> {
        self.vcpus
            .get_mut(name)
            .with_context(|| format!("no vcpu named {name}"))
    }

    /// Executes one step, writing any dump it produces to `out`.
    pub fn step(
        &mut self,
        step: &Step,
        out: &mut dyn Write,
    ) -> anyhow::Result<()> {
        let log = self.log.new(slog::o!("vcpu" => step.vcpu().to_string()));
        let vpmu = self.vcpu_mut(step.vcpu())?;

        match step {
            Step::Wrmsr { msr, value, .. } => {
                let msr = MsrId(*msr);
                match vpmu.wrmsr(msr, *value) {
                    WrmsrOutcome::Handled => {
                        info!(log, "wrmsr {msr} <- {value:#x}");
                    }
                    WrmsrOutcome::NotHandled => {
                        warn!(log, "wrmsr to unsupported register {msr}");
                    }
                }
            }
            Step::Rdmsr { msr, .. } => {
                let msr = MsrId(*msr);
                match vpmu.rdmsr(msr) {
                    RdmsrOutcome::Handled(value) => {
                        info!(log, "rdmsr {msr} -> {value:#x}");
                    }
                    RdmsrOutcome::NotHandled => {
                        warn!(log, "rdmsr from unsupported register {msr}");
                    }
                }
            }
            Step::SwitchOut { .. } => {
                let outcome = vpmu.on_switch_out();
                info!(log, "switched out"; "outcome" => ?outcome);
            }
            Step::SaveForce { .. } => {
                let outcome = vpmu.save_force();
                info!(log, "forced save"; "outcome" => ?outcome);
            }
            Step::SwitchIn { .. } => {
                vpmu.on_switch_in();
                info!(log, "switched in"; "flags" => ?vpmu.state().flags());
            }
            Step::Interrupt { .. } => {
                let handled = vpmu.on_interrupt();
                info!(log, "PMU interrupt"; "handled" => handled);
            }
            Step::Dump { vcpu } => {
                writeln!(out, "vcpu {vcpu}:")?;
                out.write_all(vpmu.dump().as_bytes())?;
            }
            Step::Destroy { .. } => {
                vpmu.destroy();
                info!(log, "destroyed");
            }
        }
        Ok(())
    }

    /// Dumps every vCPU to `out`.
    pub fn dump_all(&self, out: &mut dyn Write) -> anyhow::Result<()> {
        for (name, vpmu) in self.vcpus.iter() {
            writeln!(out, "vcpu {name}:")?;
            out.write_all(vpmu.dump().as_bytes())?;
        }
        Ok(())
    }

    /// Tears down every vCPU's vPMU.
    pub fn destroy_all(&mut self) {
        for vpmu in self.vcpus.values_mut() {
            vpmu.destroy();
        }
    }
}
