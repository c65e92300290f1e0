// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bitflags and constants that provide symbolic names for the various bits in
//! various CPUID leaves.
//!
//! Definitions here are taken from the AMD Architecture Programmer's Manual,
//! volume 3, appendix E (Publication 24594, revision 3.36, March 2024).

pub const STANDARD_BASE_LEAF: u32 = 0;
pub const FEATURE_LEAF: u32 = 1;

bitflags::bitflags! {
    /// Leaf 1 eax: processor family, model, and stepping identifiers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Leaf1Eax: u32 {
        const STEPPING_MASK = 0xF;
        const BASE_MODEL_MASK = 0xF << 4;
        const BASE_FAMILY_MASK = 0xF << 8;
        const EXTENDED_MODEL_MASK = 0xF << 16;
        const EXTENDED_FAMILY_MASK = 0xFF << 20;
    }
}

impl Leaf1Eax {
    pub fn base_family(&self) -> u8 {
        ((*self & Self::BASE_FAMILY_MASK).bits() >> 8) as u8
    }

    pub fn extended_family(&self) -> u8 {
        ((*self & Self::EXTENDED_FAMILY_MASK).bits() >> 20) as u8
    }
}
