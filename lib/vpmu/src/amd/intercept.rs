// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Switching a vCPU between trapped and direct PMU register access.

use super::{probes, Topology};
use crate::common::VcpuId;
use crate::hw::{InterceptMode, MsrIntercept};

/// Whether a vCPU's MSR bitmap currently lets it reach the PMU directly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InterceptState {
    /// Every access to a counter or event select exits.
    #[default]
    BitmapOff,

    /// Counters are accessed directly; event-select writes still exit so the
    /// vPMU can see counting being enabled and disabled.
    BitmapOn,
}

/// The intercept controller for a single vCPU.
#[derive(Debug, Default)]
pub(super) struct DirectAccess {
    state: InterceptState,
}

impl DirectAccess {
    pub(super) fn state(&self) -> InterceptState {
        self.state
    }

    pub(super) fn is_on(&self) -> bool {
        self.state == InterceptState::BitmapOn
    }

    /// Relaxes the intercepts on `vcpu`'s PMU registers. Calling this while
    /// the bitmap is already on reapplies the same settings.
    pub(super) fn enable(
        &mut self,
        intercepts: &dyn MsrIntercept,
        topology: &Topology,
        vcpu: VcpuId,
    ) {
        for (ctrl, counter) in topology.pairs() {
            intercepts.set_intercept(vcpu, counter, InterceptMode::None);
            intercepts.set_intercept(vcpu, ctrl, InterceptMode::Write);
        }
        self.state = InterceptState::BitmapOn;
        probes::amd_vpmu_intercept!(|| (vcpu.0, true));
    }

    /// Restores full read/write intercepts on `vcpu`'s PMU registers.
    pub(super) fn disable(
        &mut self,
        intercepts: &dyn MsrIntercept,
        topology: &Topology,
        vcpu: VcpuId,
    ) {
        for (ctrl, counter) in topology.pairs() {
            intercepts.set_intercept(vcpu, counter, InterceptMode::ReadWrite);
            intercepts.set_intercept(vcpu, ctrl, InterceptMode::ReadWrite);
        }
        self.state = InterceptState::BitmapOff;
        probes::amd_vpmu_intercept!(|| (vcpu.0, false));
    }
}
