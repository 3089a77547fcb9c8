// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::fmt;

use axerrno::{AxError, ax_err_type};
use x86_64::structures::idt::PageFaultErrorCode;

/// The kind of access that triggered a walk, used to build fault records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessKind {
    /// The access is a write.
    pub write: bool,
    /// The access is made in user mode (`CPL = 3`).
    pub user: bool,
    /// The access is an instruction fetch.
    pub fetch: bool,
}

/// Why a guest page walk failed.
///
/// `level` names the paging-structure level whose entry caused the failure,
/// from 1 (page table entry) to 4 (PML4 entry). Level 0 refers to the data page
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkError {
    /// The entry is not present.
    NotPresent {
        /// Failing level.
        level: u8,
    },
    /// The entry is present but sets reserved bits or an illegal combination.
    ReservedBits {
        /// Failing level.
        level: u8,
    },
    /// The entry references guest physical memory the host cannot map.
    BadPhysAddr {
        /// Failing level.
        level: u8,
    },
}

/// A [`Result`] type with [`WalkError`] as the error type.
pub type WalkResult<T = ()> = Result<T, WalkError>;

impl WalkError {
    /// The level the walk stopped at.
    pub const fn level(&self) -> u8 {
        match *self {
            Self::NotPresent { level }
            | Self::ReservedBits { level }
            | Self::BadPhysAddr { level } => level,
        }
    }

    /// Whether a guest page fault describes this failure.
    ///
    /// A bad physical address is a host-side problem and has no guest-visible
    /// page fault equivalent.
    pub const fn is_guest_fault(&self) -> bool {
        !matches!(self, Self::BadPhysAddr { .. })
    }

    /// Whether an EPT walk failing like this raises an EPT misconfiguration
    /// rather than an EPT violation.
    pub const fn is_ept_misconfig(&self) -> bool {
        matches!(self, Self::ReservedBits { .. })
    }

    /// The error code of the `#PF` to inject for this failure.
    ///
    /// Returns `None` for [`WalkError::BadPhysAddr`].
    pub fn page_fault_error_code(&self, access: AccessKind) -> Option<PageFaultErrorCode> {
        let mut code = match self {
            Self::NotPresent { .. } => PageFaultErrorCode::empty(),
            Self::ReservedBits { .. } => {
                PageFaultErrorCode::PROTECTION_VIOLATION | PageFaultErrorCode::MALFORMED_TABLE
            }
            Self::BadPhysAddr { .. } => return None,
        };
        if access.write {
            code |= PageFaultErrorCode::CAUSED_BY_WRITE;
        }
        if access.user {
            code |= PageFaultErrorCode::USER_MODE;
        }
        if access.fetch {
            code |= PageFaultErrorCode::INSTRUCTION_FETCH;
        }
        Some(code)
    }
}

impl fmt::Display for WalkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPresent { level } => write!(f, "entry not present at level {level}"),
            Self::ReservedBits { level } => write!(f, "reserved bits set at level {level}"),
            Self::BadPhysAddr { level } => {
                write!(f, "unmappable physical address at level {level}")
            }
        }
    }
}

impl From<WalkError> for AxError {
    fn from(err: WalkError) -> Self {
        match err {
            WalkError::NotPresent { .. } | WalkError::BadPhysAddr { .. } => {
                ax_err_type!(BadAddress)
            }
            WalkError::ReservedBits { .. } => ax_err_type!(InvalidData),
        }
    }
}
