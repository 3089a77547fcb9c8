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

//! Layout of guest-controlled EPT structures. (SDM Vol. 3C, Section 29.3)

use bit_field::BitField;
use bitflags::bitflags;
use numeric_enum_macro::numeric_enum;

use crate::GuestPhysAddr;

bitflags! {
    /// Bits of an EPT paging-structure entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptEntryFlags: u64 {
        /// Read access.
        const READ = 1 << 0;
        /// Write access.
        const WRITE = 1 << 1;
        /// Execute access (supervisor-mode execute with MBEC).
        const EXECUTE = 1 << 2;
        /// EPT memory type, leaf entries only.
        const MEM_TYPE_MASK = 0b111 << 3;
        /// Ignore guest PAT memory type, leaf entries only.
        const IGNORE_PAT = 1 << 6;
        /// Maps a 1 GiB or 2 MiB page.
        const HUGE_PAGE = 1 << 7;
        /// Accessed flag, if enabled in the EPTP.
        const ACCESSED = 1 << 8;
        /// Dirty flag of a leaf entry, if enabled in the EPTP.
        const DIRTY = 1 << 9;
        /// User-mode execute access (MBEC).
        const EXECUTE_FOR_USER = 1 << 10;
        /// Suppress #VE.
        const SUPPRESS_VE = 1 << 63;
    }
}

impl EptEntryFlags {
    /// Access rights bits; an entry with all of them clear is not present.
    pub const RWX: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);

    /// Bits 7:3 are reserved in an entry that references another table.
    pub(crate) const TABLE_RESERVED: u64 = 0b1_1111 << 3;
}

numeric_enum! {
    #[repr(u8)]
    /// EPT memory types. Values 2, 3 and 7 are reserved.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum EptMemType {
        /// Uncacheable.
        Uncached = 0,
        /// Write combining.
        WriteCombining = 1,
        /// Write through.
        WriteThrough = 4,
        /// Write protected.
        WriteProtected = 5,
        /// Write back.
        WriteBack = 6,
    }
}

impl EptMemType {
    /// Memory type field of a leaf EPT entry, `None` if it holds a reserved
    /// value.
    pub fn of_entry(raw: u64) -> Option<Self> {
        Self::try_from(raw.get_bits(3..6) as u8).ok()
    }
}

/// A decoded EPT pointer (`EPTP`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EptPointer(u64);

impl EptPointer {
    const ROOT_MASK: u64 = 0x000f_ffff_ffff_f000;

    /// Wraps a raw `EPTP` value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw register value.
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Memory type used to access the EPT paging structures.
    pub fn mem_type(&self) -> Option<EptMemType> {
        EptMemType::try_from(self.0.get_bits(0..3) as u8).ok()
    }

    /// Number of levels walked.
    pub fn walk_length(&self) -> u8 {
        self.0.get_bits(3..6) as u8 + 1
    }

    /// Whether the accessed and dirty flags of EPT entries are in use.
    pub fn ad_enabled(&self) -> bool {
        self.0.get_bit(6)
    }

    /// Guest physical address of the EPT PML4 table.
    pub fn root(&self) -> GuestPhysAddr {
        GuestPhysAddr::from((self.0 & Self::ROOT_MASK) as usize)
    }

    /// Whether a processor would accept this value on VM entry.
    ///
    /// Only 4-level walks are supported, and the paging structures must be
    /// uncacheable or write-back.
    pub fn is_valid(&self) -> bool {
        self.walk_length() == 4
            && matches!(
                self.mem_type(),
                Some(EptMemType::Uncached | EptMemType::WriteBack)
            )
    }
}

/// Effective EPT access rights of a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EptAttrs {
    /// Rights allowed by every level, a subset of [`EptEntryFlags::RWX`].
    pub access: EptEntryFlags,
    /// Memory type from the leaf entry.
    pub mem_type: EptMemType,
    /// Whether the leaf entry ignores the guest PAT.
    pub ignore_pat: bool,
}
