// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtualization of the AMD performance monitoring unit (PMU).
//!
//! A guest that programs the PMU does so through two banks of model-specific
//! registers: event selects (which choose what to count and whether counting
//! is enabled) and the counters themselves. This crate traps those accesses,
//! keeps a per-vCPU shadow copy of both banks, arbitrates the single physical
//! PMU between vCPUs, and swaps the hardware state in and out as vCPUs are
//! scheduled.
//!
//! The pieces fit together as follows:
//!
//! - [`amd::AmdPmu`] is built once at boot from the host's CPU family. It owns
//!   the (immutable) register topology and the handles to the host facilities
//!   the vPMU needs (raw MSR access, MSR intercept control, and the PMU
//!   ownership arbiter).
//! - Each vCPU owns a [`vpmu::Vpmu`]. Calling [`amd::AmdPmu::initialise`] on
//!   it installs the AMD operation table; from then on the trap dispatcher and
//!   the scheduler drive it through its `rdmsr`/`wrmsr` and switch-in/out entry
//!   points.

#![allow(clippy::style)]

pub extern crate usdt;

pub mod amd;
pub mod common;
pub mod hw;
pub mod mode;
pub mod msr;
pub mod ownership;
pub mod sim;
pub mod vpmu;

pub use amd::AmdPmu;
pub use mode::VpmuMode;
pub use self::vpmu::{SaveOutcome, Vpmu, VpmuError};
