// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Memory fence instructions.

#[cfg(all(any(target_arch = "aarch64", target_arch = "x86_64"), target_os = "none"))]
use core::arch::asm;

// Safety: The barrier instructions below do not access memory; their only side-effect is to
// enforce ordering of surrounding load/store instructions.

/// Orders preceding memory stores with respect to succeeding memory stores, as observed by
/// other processors and DMA-capable devices.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn dma_wmb() {
    unsafe { asm!("dsb st", options(nostack, preserves_flags)) };
}

/// Orders preceding memory stores with respect to succeeding memory stores, as observed by
/// other processors and DMA-capable devices.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn dma_wmb() {
    // Stores are not reordered with other stores on x86.
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::Release);
}

/// Orders preceding memory stores with respect to succeeding MMIO stores.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn mmio_wmb() {
    unsafe { asm!("dsb st", options(nostack, preserves_flags)) };
}

/// Orders preceding memory stores with respect to succeeding MMIO stores.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn mmio_wmb() {
    unsafe { asm!("sfence", options(nostack, preserves_flags)) };
}

// Make fence instructions a no-op for testing.
#[cfg(not(all(any(target_arch = "aarch64", target_arch = "x86_64"), target_os = "none")))]
pub fn dma_wmb() {}
#[cfg(not(all(any(target_arch = "aarch64", target_arch = "x86_64"), target_os = "none")))]
pub fn mmio_wmb() {}

/// Hint that the CPU's rate of instruction retirement should be temporarily reduced. Used in
/// every loop that polls hardware or another processor.
#[inline(always)]
pub fn pause() {
    core::hint::spin_loop();
}
