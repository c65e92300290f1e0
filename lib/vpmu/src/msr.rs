// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// A model-specific register (MSR) number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MsrId(pub u32);

impl std::fmt::Display for MsrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The result of asking a vPMU to emulate RDMSR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RdmsrOutcome {
    /// The vPMU does not handle this register (or has no PMU context at all).
    /// The trap dispatcher decides whether the guest sees a fault.
    NotHandled,

    /// The read was handled and produced the contained value, which should be
    /// returned to the guest in edx:eax.
    Handled(u64),
}

/// The result of asking a vPMU to emulate WRMSR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WrmsrOutcome {
    /// The vPMU does not handle this register (or has no PMU context at all).
    /// The trap dispatcher decides whether the guest sees a fault.
    NotHandled,

    /// The write was handled and forwarded to hardware; no further action is
    /// needed from the caller.
    Handled,
}
