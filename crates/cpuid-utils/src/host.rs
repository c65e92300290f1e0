// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::{
    bits::{FEATURE_LEAF, STANDARD_BASE_LEAF},
    cpu_family, CpuidIdent, CpuidValues, CpuidVendor,
};

#[derive(Debug, Error)]
pub enum GetHostCpuidError {
    #[error("CPUID vendor not recognized: {0}")]
    VendorNotRecognized(&'static str),

    #[error("host CPU vendor is {0:?}, not AMD")]
    NotAmd(CpuidVendor),

    #[error("host CPUID queries only work on x86-64 hosts")]
    Unsupported,
}

/// Queries the supplied CPUID leaf on the caller's machine.
#[cfg(target_arch = "x86_64")]
pub fn query(leaf: CpuidIdent) -> Result<CpuidValues, GetHostCpuidError> {
    // Safety: CPUID is available on every x86-64 processor.
    Ok(unsafe {
        core::arch::x86_64::__cpuid_count(leaf.leaf, leaf.subleaf.unwrap_or(0))
    }
    .into())
}

#[cfg(not(target_arch = "x86_64"))]
pub fn query(_leaf: CpuidIdent) -> Result<CpuidValues, GetHostCpuidError> {
    Err(GetHostCpuidError::Unsupported)
}

/// Returns the host's vendor as reported by CPUID leaf 0.
pub fn vendor() -> Result<CpuidVendor, GetHostCpuidError> {
    let std = query(CpuidIdent::leaf(STANDARD_BASE_LEAF))?;
    CpuidVendor::try_from(std).map_err(GetHostCpuidError::VendorNotRecognized)
}

/// Returns the processor family of an AMD host.
///
/// The vPMU register layout depends only on this value, so callers query it
/// once at boot and hand it to the topology selector.
pub fn amd_family() -> Result<u8, GetHostCpuidError> {
    match vendor()? {
        CpuidVendor::Amd => {}
        other => return Err(GetHostCpuidError::NotAmd(other)),
    }

    let leaf1 = query(CpuidIdent::leaf(FEATURE_LEAF))?;
    Ok(cpu_family(leaf1.eax))
}
