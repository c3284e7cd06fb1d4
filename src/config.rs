// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use drivers::iommu::{FaultEvent, RemapConfig};

const MMFR1_XNX_SHIFT: u64 = 28;
const MMFR1_XNX_MASK: u64 = 0xf;

/// Translation features chosen by the platform at boot.
#[derive(Clone, Copy, Debug)]
pub struct TranslationConfig {
    /// Split stage-2 execute permission between EL0 and EL1.
    pub xnx: bool,
    /// Remap device interrupts where every unit supports it.
    pub interrupt_remapping: bool,
    /// Use queued invalidation where supported.
    pub queued_invalidation: bool,
    /// Where remapping units signal faults.
    pub fault_event: Option<FaultEvent>,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            xnx: false,
            interrupt_remapping: true,
            queued_invalidation: true,
            fault_event: None,
        }
    }
}

impl TranslationConfig {
    /// Takes `xnx` from the XNX field of `ID_AA64MMFR1_EL1`.
    pub fn with_mmfr1(self, mmfr1: u64) -> Self {
        Self {
            xnx: (mmfr1 >> MMFR1_XNX_SHIFT) & MMFR1_XNX_MASK != 0,
            ..self
        }
    }

    /// Returns the part of the configuration the remapping driver needs.
    pub fn remap_config(&self) -> RemapConfig {
        RemapConfig {
            interrupt_remapping: self.interrupt_remapping,
            queued_invalidation: self.queued_invalidation,
            fault_event: self.fault_event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xnx_from_mmfr1() {
        let config = TranslationConfig::default();
        assert!(config.with_mmfr1(1 << 28).xnx);
        assert!(!config.with_mmfr1(0x0fff_ffff).xnx);
        assert!(!config.with_mmfr1(1 << 28).with_mmfr1(0).xnx);
    }

    #[test]
    fn remap_flags_carry_over() {
        let config = TranslationConfig {
            queued_invalidation: false,
            ..TranslationConfig::default()
        };
        let remap = config.remap_config();
        assert!(remap.interrupt_remapping);
        assert!(!remap.queued_invalidation);
        assert!(remap.fault_event.is_none());
    }
}
