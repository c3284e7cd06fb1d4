// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use crate::cpu_set::{CpuId, CpuSet};

/// Something whose cached translations processors may have to discard after a tree update.
pub trait TlbTarget: Sync {
    /// Returns the processors that may still hold stale translations.
    fn dirty(&self) -> &CpuSet;

    /// Discards the cached translations on `cpu`, which must be the calling processor, and
    /// removes it from the dirty set.
    fn flush_local(&self, cpu: CpuId);
}

/// Cross-processor translation cache shootdown, provided by the scheduler.
pub trait Shootdown {
    /// Returns once every online processor in `target.dirty()` has called `target.flush_local()`.
    /// Offline processors are skipped; they flush everything when they come back.
    fn shootdown(&self, target: &dyn TlbTarget);
}
