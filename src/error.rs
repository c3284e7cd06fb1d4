// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use drivers::iommu::IommuError;
use s2_page_tables::PageTableError;

/// Errors from bring-up, space creation and device assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    PageTable(PageTableError),
    Iommu(IommuError),
}

impl From<PageTableError> for Error {
    fn from(e: PageTableError) -> Self {
        Error::PageTable(e)
    }
}

impl From<IommuError> for Error {
    fn from(e: IommuError) -> Self {
        Error::Iommu(e)
    }
}

/// Holds results for second-stage operations.
pub type Result<T> = core::result::Result<T, Error>;
