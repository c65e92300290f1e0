// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};

/// The host-wide vPMU mode.
///
/// The policy that picks a mode lives outside this crate. The vPMU only asks
/// whether it is [`VpmuMode::Off`], and only when a vCPU's context is being
/// allocated.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum VpmuMode {
    /// Guests see no PMU.
    #[default]
    Off,

    /// Each guest may profile itself.
    GuestOnly,

    /// Guests are additionally allowed to observe host activity.
    Passthrough,
}

impl VpmuMode {
    pub fn is_off(&self) -> bool {
        matches!(self, VpmuMode::Off)
    }
}
