// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-family layout of the PMU register banks.

use thiserror::Error;

use super::bits::*;
use crate::msr::MsrId;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("unsupported CPU family {0:#x}")]
    UnsupportedCpuFamily(u8),

    #[error(
        "register bank ({needed} bytes) does not fit into the \
        {page_size}-byte vPMU shared page"
    )]
    RegisterBankTooLarge { needed: usize, page_size: usize },
}

/// The kind of PMU register an MSR number names, independent of which
/// topology the host uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsrClass {
    Control,
    Counter,
    Unsupported,
}

/// Classifies an MSR number as an event select, a counter, or neither.
///
/// Both the legacy bank and the family 15h extended bank are recognized here;
/// whether a recognized register actually exists on this host is a question
/// for [`Topology::slot`].
pub fn classify(msr: MsrId) -> MsrClass {
    match msr.0 {
        MSR_K7_EVNTSEL0..=MSR_K7_EVNTSEL3 => MsrClass::Control,
        MSR_K7_PERFCTR0..=MSR_K7_PERFCTR3 => MsrClass::Counter,
        addr @ MSR_F15H_PERF_CTL0..=MSR_F15H_PERF_CTR5 => {
            if addr & 1 == 1 {
                MsrClass::Counter
            } else {
                MsrClass::Control
            }
        }
        _ => MsrClass::Unsupported,
    }
}

/// Maps a legacy-bank MSR onto the extended-bank register it aliases on
/// families with mirrored addressing. Other MSRs are returned unchanged.
pub(crate) fn legacy_to_extended(msr: MsrId) -> MsrId {
    match msr.0 {
        addr @ MSR_K7_EVNTSEL0..=MSR_K7_EVNTSEL3 => {
            MsrId(MSR_F15H_PERF_CTL0 + 2 * (addr - MSR_K7_EVNTSEL0))
        }
        addr @ MSR_K7_PERFCTR0..=MSR_K7_PERFCTR3 => {
            MsrId(MSR_F15H_PERF_CTR0 + 2 * (addr - MSR_K7_PERFCTR0))
        }
        _ => msr,
    }
}

/// The position of a register within a vCPU's shadow banks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    Control(usize),
    Counter(usize),
}

/// Guest state captured at the last PMU interrupt, padded to the 64 bytes the
/// architecture area of the shared page reserves for it.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct GuestRegs {
    pub ip: u64,
    pub sp: u64,
    pub flags: u64,
    pub cs: u16,
    pub ss: u16,
    pub cpl: u8,
    pub _pad: [u8; 35],
}

/// The fixed header of the per-vCPU page the vPMU shares with the rest of the
/// hypervisor. The shadow counter and event-select banks follow it, in that
/// order, each `counter_count` 64-bit words long.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct SharedPageHeader {
    pub vcpu_id: u32,
    pub pcpu_id: u32,
    pub domain_id: u16,
    pub _pad: [u8; 6],
    pub regs: GuestRegs,
    pub pmu_flags: u32,
    pub _pad1: [u8; 4],
    /// Only the low 32 bits are used; the slot is 64 bits wide.
    pub lapic_lvtpc: u32,
    pub _pad2: [u8; 4],
    /// Byte offsets, from the start of the bank area, of the counter and
    /// event-select arrays. The rest of the 128-byte vendor area is reserved.
    pub counters: u32,
    pub ctrls: u32,
    pub _pad3: [u8; 120],
}

/// Size of the fixed header in bytes.
pub const SHARED_PAGE_HEADER_SIZE: usize = 224;

const _: () = assert!(
    std::mem::size_of::<GuestRegs>() == 64
        && std::mem::size_of::<SharedPageHeader>() == SHARED_PAGE_HEADER_SIZE
);

/// The register layout of a host's PMU.
///
/// Exactly one of these is selected at boot, from the host CPU family, and it
/// never changes afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Topology {
    family: u8,
    counters: &'static [u32],
    ctrls: &'static [u32],
    mirrored: bool,
}

impl Topology {
    /// Selects the register layout for processors of the given `family`.
    pub fn select(family: u8) -> Result<Self, TopologyError> {
        match family {
            0x15 => Ok(Self {
                family,
                counters: &F15H_COUNTERS,
                ctrls: &F15H_CTRLS,
                mirrored: true,
            }),
            0x10 | 0x12 | 0x14 | 0x16 => Ok(Self {
                family,
                counters: &F10H_COUNTERS,
                ctrls: &F10H_CTRLS,
                mirrored: false,
            }),
            _ => Err(TopologyError::UnsupportedCpuFamily(family)),
        }
    }

    /// Selects the layout for `family` and checks that its register banks fit
    /// in a shared page of `page_size` bytes.
    pub fn select_for_page(
        family: u8,
        page_size: usize,
    ) -> Result<Self, TopologyError> {
        let topology = Self::select(family)?;
        let needed = topology.shared_page_bytes();
        if needed > page_size {
            return Err(TopologyError::RegisterBankTooLarge {
                needed,
                page_size,
            });
        }

        Ok(topology)
    }

    pub fn family(&self) -> u8 {
        self.family
    }

    /// The number of counter/event-select pairs.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Whether the legacy bank aliases the first four extended registers.
    pub fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    pub fn counters(&self) -> impl Iterator<Item = MsrId> + '_ {
        self.counters.iter().map(|&addr| MsrId(addr))
    }

    pub fn ctrls(&self) -> impl Iterator<Item = MsrId> + '_ {
        self.ctrls.iter().map(|&addr| MsrId(addr))
    }

    /// Yields each (event select, counter) pair in index order.
    pub fn pairs(&self) -> impl Iterator<Item = (MsrId, MsrId)> + '_ {
        self.ctrls().zip(self.counters())
    }

    /// The number of bytes the shared page needs to hold this layout's
    /// register banks.
    pub fn shared_page_bytes(&self) -> usize {
        std::mem::size_of::<SharedPageHeader>()
            + 2 * std::mem::size_of::<u64>() * self.counter_count()
    }

    /// Returns the canonical name of `msr`: on mirrored layouts, legacy-bank
    /// registers are renamed to the extended-bank registers they alias.
    pub fn translate_legacy(&self, msr: MsrId) -> MsrId {
        if self.mirrored {
            legacy_to_extended(msr)
        } else {
            msr
        }
    }

    /// Locates the shadow slot backing `msr`, or returns `None` if this layout
    /// has no such register.
    pub fn slot(&self, msr: MsrId) -> Option<Slot> {
        let class = classify(msr);
        if class == MsrClass::Unsupported {
            return None;
        }

        let canonical = self.translate_legacy(msr).0;
        match class {
            MsrClass::Control => self
                .ctrls
                .iter()
                .position(|&addr| addr == canonical)
                .map(Slot::Control),
            MsrClass::Counter => self
                .counters
                .iter()
                .position(|&addr| addr == canonical)
                .map(Slot::Counter),
            MsrClass::Unsupported => None,
        }
    }
}
