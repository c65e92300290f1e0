// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utility functions and types for working with CPUID values.
//!
//! The vPMU only needs a narrow slice of CPUID: the vendor string in leaf 0
//! and the processor family encoded in leaf 1 eax. Everything here exists to
//! answer "which AMD family is this host?" once at boot.

pub mod bits;
pub mod host;

use bits::Leaf1Eax;

/// A CPUID leaf/subleaf pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CpuidIdent {
    pub leaf: u32,
    pub subleaf: Option<u32>,
}

impl CpuidIdent {
    pub const fn leaf(leaf: u32) -> Self {
        Self { leaf, subleaf: None }
    }

    pub const fn subleaf(leaf: u32, subleaf: u32) -> Self {
        Self { leaf, subleaf: Some(subleaf) }
    }
}

/// The register values produced by a CPUID query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuidValues {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

#[cfg(target_arch = "x86_64")]
impl From<core::arch::x86_64::CpuidResult> for CpuidValues {
    fn from(value: core::arch::x86_64::CpuidResult) -> Self {
        Self { eax: value.eax, ebx: value.ebx, ecx: value.ecx, edx: value.edx }
    }
}

/// A CPU vendor identified by the 12-byte string in CPUID leaf 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuidVendor {
    Amd,
    Intel,
}

impl TryFrom<CpuidValues> for CpuidVendor {
    type Error = &'static str;

    /// Identifies the vendor from leaf 0's ebx/edx/ecx vendor string.
    fn try_from(value: CpuidValues) -> Result<Self, Self::Error> {
        match (value.ebx, value.edx, value.ecx) {
            // "AuthenticAMD"
            (0x68747541, 0x69746e65, 0x444d4163) => Ok(Self::Amd),
            // "GenuineIntel"
            (0x756e6547, 0x49656e69, 0x6c65746e) => Ok(Self::Intel),
            _ => Err("unrecognized CPU vendor string"),
        }
    }
}

/// Computes the displayed processor family from the value of CPUID leaf 1
/// eax.
///
/// The extended family field only contributes when the base family is 0xF;
/// this is how every AMD family from 0x10 onward is encoded.
pub fn cpu_family(leaf1_eax: u32) -> u8 {
    let eax = Leaf1Eax::from_bits_retain(leaf1_eax);
    let base = eax.base_family();
    if base == 0xF {
        base.wrapping_add(eax.extended_family())
    } else {
        base
    }
}
