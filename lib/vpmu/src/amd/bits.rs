// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MSR numbers and register layouts for the AMD core performance counters.
//! These are drawn from the AMD Architecture Programmer's Manual, volume 2,
//! section 13.2 (Publication 24593), and the BIOS and Kernel Developer's
//! Guides for families 10h through 16h.

use bitstruct::bitstruct;

/// Legacy ("K7") event-select registers. Families 10h, 12h, 14h, and 16h
/// expose exactly these four.
pub const MSR_K7_EVNTSEL0: u32 = 0xC001_0000;
pub const MSR_K7_EVNTSEL1: u32 = 0xC001_0001;
pub const MSR_K7_EVNTSEL2: u32 = 0xC001_0002;
pub const MSR_K7_EVNTSEL3: u32 = 0xC001_0003;

/// Legacy ("K7") counter registers.
pub const MSR_K7_PERFCTR0: u32 = 0xC001_0004;
pub const MSR_K7_PERFCTR1: u32 = 0xC001_0005;
pub const MSR_K7_PERFCTR2: u32 = 0xC001_0006;
pub const MSR_K7_PERFCTR3: u32 = 0xC001_0007;

/// Family 15h core performance counter extensions. Event selects and counters
/// are interleaved: event selects sit at even addresses and each is followed
/// by its counter.
pub const MSR_F15H_PERF_CTL0: u32 = 0xC001_0200;
pub const MSR_F15H_PERF_CTR0: u32 = 0xC001_0201;
pub const MSR_F15H_PERF_CTL1: u32 = 0xC001_0202;
pub const MSR_F15H_PERF_CTR1: u32 = 0xC001_0203;
pub const MSR_F15H_PERF_CTL2: u32 = 0xC001_0204;
pub const MSR_F15H_PERF_CTR2: u32 = 0xC001_0205;
pub const MSR_F15H_PERF_CTL3: u32 = 0xC001_0206;
pub const MSR_F15H_PERF_CTR3: u32 = 0xC001_0207;
pub const MSR_F15H_PERF_CTL4: u32 = 0xC001_0208;
pub const MSR_F15H_PERF_CTR4: u32 = 0xC001_0209;
pub const MSR_F15H_PERF_CTL5: u32 = 0xC001_020A;
pub const MSR_F15H_PERF_CTR5: u32 = 0xC001_020B;

pub(super) const F10H_COUNTERS: [u32; 4] =
    [MSR_K7_PERFCTR0, MSR_K7_PERFCTR1, MSR_K7_PERFCTR2, MSR_K7_PERFCTR3];

pub(super) const F10H_CTRLS: [u32; 4] =
    [MSR_K7_EVNTSEL0, MSR_K7_EVNTSEL1, MSR_K7_EVNTSEL2, MSR_K7_EVNTSEL3];

pub(super) const F15H_COUNTERS: [u32; 6] = [
    MSR_F15H_PERF_CTR0,
    MSR_F15H_PERF_CTR1,
    MSR_F15H_PERF_CTR2,
    MSR_F15H_PERF_CTR3,
    MSR_F15H_PERF_CTR4,
    MSR_F15H_PERF_CTR5,
];

pub(super) const F15H_CTRLS: [u32; 6] = [
    MSR_F15H_PERF_CTL0,
    MSR_F15H_PERF_CTL1,
    MSR_F15H_PERF_CTL2,
    MSR_F15H_PERF_CTL3,
    MSR_F15H_PERF_CTL4,
    MSR_F15H_PERF_CTL5,
];

/// Width of the hardware counters, in bits.
pub const COUNTER_WIDTH: u32 = 48;

/// Mask of the bits a counter register actually implements.
pub const COUNTER_MASK: u64 = (1 << COUNTER_WIDTH) - 1;

/// Returns whether a counter has overflowed.
///
/// Counters are armed by writing the negated sample period, so bit 47 stays
/// set until the counter wraps past zero.
pub fn counter_overflowed(counter: u64) -> bool {
    counter & (1 << (COUNTER_WIDTH - 1)) == 0
}

bitstruct! {
    /// Representation of an event-select (PERF_CTL) register.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EventSelect(pub u64) {
        /// Event select, bits 7:0.
        pub event_lo: u8 = 0..8;

        /// Unit mask.
        pub unit_mask: u8 = 8..16;

        /// Count while the processor is at CPL > 0.
        pub usr: bool = 16;

        /// Count while the processor is at CPL 0.
        pub os: bool = 17;

        /// Edge detect.
        pub edge: bool = 18;

        reserved0: bool = 19;

        /// Raise an APIC interrupt on counter overflow.
        pub int: bool = 20;

        reserved1: bool = 21;

        /// Counter enable.
        pub enable: bool = 22;

        /// Invert the counter mask comparison.
        pub inv: bool = 23;

        /// Counter mask.
        pub cnt_mask: u8 = 24..32;

        /// Event select, bits 11:8.
        pub event_hi: u8 = 32..36;

        reserved2: u8 = 36..40;

        /// Count only while the processor runs guest code.
        pub guest_only: bool = 40;

        /// Count only while the processor runs host code.
        pub host_only: bool = 41;

        reserved3: u32 = 42..64;
    }
}
