// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Hardware drivers

#![no_std]

extern crate alloc;

// For testing use the std crate.
#[cfg(any(test, feature = "test-stubs"))]
#[macro_use]
extern crate std;

/// Provides the driver for DMA and interrupt remapping units (VT-d style IOMMUs).
pub mod iommu;
