// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::TryReserveError;

use super::topology::Slot;

/// A vCPU's shadow copy of the PMU register banks, index-aligned with the
/// host [`Topology`](super::Topology).
///
/// Both banks are sized once, at allocation, and never resized.
#[derive(Debug)]
pub(super) struct AmdContext {
    counters: Box<[u64]>,
    ctrls: Box<[u64]>,
}

/// Allocates a zeroed bank of `len` registers, reporting allocation failure
/// instead of aborting.
fn alloc_bank(len: usize) -> Result<Box<[u64]>, TryReserveError> {
    let mut bank = Vec::new();
    bank.try_reserve_exact(len)?;
    bank.resize(len, 0);
    Ok(bank.into_boxed_slice())
}

impl AmdContext {
    pub(super) fn alloc(counter_count: usize) -> Result<Self, TryReserveError> {
        Ok(Self {
            counters: alloc_bank(counter_count)?,
            ctrls: alloc_bank(counter_count)?,
        })
    }

    pub(super) fn counters(&self) -> &[u64] {
        &self.counters
    }

    pub(super) fn ctrls(&self) -> &[u64] {
        &self.ctrls
    }

    pub(super) fn counters_mut(&mut self) -> &mut [u64] {
        &mut self.counters
    }

    /// Records `value` as the latest guest-visible contents of `slot`.
    pub(super) fn update(&mut self, slot: Slot, value: u64) {
        match slot {
            Slot::Control(i) => self.ctrls[i] = value,
            Slot::Counter(i) => self.counters[i] = value,
        }
    }
}
