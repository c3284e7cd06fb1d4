// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Second-stage translation bring-up
//!
//! Ties the translation engine in `s2_page_tables` and the remapping driver in `drivers` into
//! the operations the rest of the hypervisor calls: bring-up from a `TranslationConfig`,
//! per-processor online and resume hooks, creation of guest and DMA address spaces, and device
//! assignment.
#![no_std]

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

mod config;
mod error;
mod stage2;

pub use config::TranslationConfig;
pub use error::{Error, Result};
pub use stage2::Stage2;
