// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Architecture primitives used by the translation engine.
//!
//! Memory barriers, the spin-wait hint and data-cache cleaning for structures that are read by
//! non-coherent hardware. Every primitive is a real instruction sequence on bare-metal aarch64 and
//! x86_64 targets and collapses to a no-op (or a plain compiler hint) when built for the host, so
//! code that uses them can be unit tested.
#![no_std]

/// Provides the data-cache cleaning primitive.
pub mod cache;
/// Memory ordering fences.
pub mod fence;

pub use cache::CpuDataCache;
pub use fence::{dma_wmb, mmio_wmb, pause};
