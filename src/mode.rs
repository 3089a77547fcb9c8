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

//! Guest paging modes and their paging-structure geometry.

use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::model_specific::EferFlags;

use crate::hal::GuestCpuState;

/// The paging mode the guest translation runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// Real mode, `CR0.PE = 0`.
    Real,
    /// Protected mode without paging.
    Protected,
    /// 32-bit paging, 2 levels.
    ThirtyTwoBit,
    /// PAE paging, 3 levels.
    Pae,
    /// 4-level paging in IA-32e mode.
    Amd64,
    /// Guest-controlled EPT of a nested guest, 4 levels.
    Ept,
}

impl PagingMode {
    /// Selects the paging mode from the guest control registers.
    pub fn from_cpu_state<C: GuestCpuState + ?Sized>(cpu: &C) -> Self {
        if cpu.nested_eptp().is_some() {
            return Self::Ept;
        }

        let cr0 = Cr0Flags::from_bits_truncate(cpu.cr0());
        let cr4 = Cr4Flags::from_bits_truncate(cpu.cr4());
        let efer = EferFlags::from_bits_truncate(cpu.efer());

        if !cr0.contains(Cr0Flags::PROTECTED_MODE_ENABLE) {
            Self::Real
        } else if !cr0.contains(Cr0Flags::PAGING) {
            Self::Protected
        } else if !cr4.contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION) {
            Self::ThirtyTwoBit
        } else if efer.contains(EferFlags::LONG_MODE_ACTIVE) {
            Self::Amd64
        } else {
            Self::Pae
        }
    }

    /// Whether addresses are translated through page tables in this mode.
    pub const fn is_paging(self) -> bool {
        !matches!(self, Self::Real | Self::Protected)
    }

    /// The paging-structure geometry of this mode, `None` without paging.
    pub fn desc(self) -> Option<&'static ModeDesc> {
        match self {
            Self::Real | Self::Protected => None,
            Self::ThirtyTwoBit => Some(&MODE_DESCS[0]),
            Self::Pae => Some(&MODE_DESCS[1]),
            Self::Amd64 => Some(&MODE_DESCS[2]),
            Self::Ept => Some(&MODE_DESCS[3]),
        }
    }
}

/// Size of the memory region mapped by a leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    /// 4 KiB page.
    Size4K = 0x1000,
    /// 2 MiB large page (PAE, 4-level, EPT).
    Size2M = 0x20_0000,
    /// 4 MiB large page (32-bit paging with `CR4.PSE`).
    Size4M = 0x40_0000,
    /// 1 GiB huge page.
    Size1G = 0x4000_0000,
}

impl PageSize {
    /// Size in bytes.
    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// Mask of the address bits that form the offset inside the page.
    pub const fn offset_mask(self) -> u64 {
        self as u64 - 1
    }

    /// Whether this is larger than a 4 KiB page.
    pub const fn is_huge(self) -> bool {
        !matches!(self, Self::Size4K)
    }
}

/// Layout of the paging-structure entries of a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFormat {
    /// 32-bit entries of non-PAE paging.
    Legacy32,
    /// 64-bit entries of PAE paging, with the special 4-entry PDPT.
    Pae,
    /// 64-bit entries of 4-level paging.
    Long,
    /// 64-bit EPT entries.
    Ept,
}

/// One level of a paging hierarchy.
#[derive(Debug)]
pub struct LevelDesc {
    /// Level number, 1 for the page table up to 4 for the PML4.
    pub level: u8,
    /// Position of the lowest address bit used to index this level.
    pub shift: u32,
    /// Number of address bits used to index this level.
    pub index_bits: u32,
    /// Page size mapped when an entry at this level sets its size bit.
    pub big_page: Option<PageSize>,
}

impl LevelDesc {
    /// Index of the entry translating `vaddr` in a table of this level.
    pub const fn index_of(&self, vaddr: u64) -> usize {
        ((vaddr >> self.shift) & ((1 << self.index_bits) - 1)) as usize
    }

    /// Bytes of address space covered by one entry of this level.
    pub const fn entry_span(&self) -> u64 {
        1 << self.shift
    }

    /// Number of entries in a table of this level.
    pub const fn entry_count(&self) -> usize {
        1 << self.index_bits
    }
}

/// Geometry of a paging mode.
#[derive(Debug)]
pub struct ModeDesc {
    /// The mode described.
    pub mode: PagingMode,
    /// Entry layout.
    pub format: EntryFormat,
    /// Size of one entry in bytes.
    pub entry_size: usize,
    /// Width of the translated address space.
    pub va_bits: u32,
    /// Bits of the root register that hold the root table address.
    pub root_mask: u64,
    /// Levels, top to bottom.
    pub levels: &'static [LevelDesc],
}

impl ModeDesc {
    /// The topmost level number.
    pub fn top_level(&self) -> u8 {
        self.levels[0].level
    }

    /// Levels whose entries may reference another table, top to bottom.
    pub fn directory_levels(&self) -> &'static [LevelDesc] {
        let levels = self.levels;
        &levels[..levels.len() - 1]
    }

    /// The page table level, whose entries always map 4 KiB pages.
    pub fn page_table_level(&self) -> &'static LevelDesc {
        let levels = self.levels;
        &levels[levels.len() - 1]
    }

    /// Whether `vaddr` can be translated at all in this mode.
    ///
    /// 4-level paging requires canonical addresses, the other modes reject
    /// anything beyond their address width.
    pub fn is_valid_vaddr(&self, vaddr: u64) -> bool {
        match self.format {
            EntryFormat::Long => {
                let top = vaddr >> (self.va_bits - 1);
                top == 0 || top == u64::MAX >> (self.va_bits - 1)
            }
            _ => vaddr >> self.va_bits == 0,
        }
    }
}

const LEGACY32_LEVELS: [LevelDesc; 2] = [
    LevelDesc {
        level: 2,
        shift: 22,
        index_bits: 10,
        big_page: Some(PageSize::Size4M),
    },
    LevelDesc {
        level: 1,
        shift: 12,
        index_bits: 10,
        big_page: None,
    },
];

const PAE_LEVELS: [LevelDesc; 3] = [
    LevelDesc {
        level: 3,
        shift: 30,
        index_bits: 2,
        big_page: None,
    },
    LevelDesc {
        level: 2,
        shift: 21,
        index_bits: 9,
        big_page: Some(PageSize::Size2M),
    },
    LevelDesc {
        level: 1,
        shift: 12,
        index_bits: 9,
        big_page: None,
    },
];

const FOUR_LEVELS: [LevelDesc; 4] = [
    LevelDesc {
        level: 4,
        shift: 39,
        index_bits: 9,
        big_page: None,
    },
    LevelDesc {
        level: 3,
        shift: 30,
        index_bits: 9,
        big_page: Some(PageSize::Size1G),
    },
    LevelDesc {
        level: 2,
        shift: 21,
        index_bits: 9,
        big_page: Some(PageSize::Size2M),
    },
    LevelDesc {
        level: 1,
        shift: 12,
        index_bits: 9,
        big_page: None,
    },
];

/// Per-mode descriptors, indexed by [`PagingMode::desc`].
static MODE_DESCS: [ModeDesc; 4] = [
    ModeDesc {
        mode: PagingMode::ThirtyTwoBit,
        format: EntryFormat::Legacy32,
        entry_size: 4,
        va_bits: 32,
        root_mask: 0xffff_f000,
        levels: &LEGACY32_LEVELS,
    },
    ModeDesc {
        mode: PagingMode::Pae,
        format: EntryFormat::Pae,
        entry_size: 8,
        va_bits: 32,
        // CR3 bits 31:5 hold the PDPT address
        root_mask: 0xffff_ffe0,
        levels: &PAE_LEVELS,
    },
    ModeDesc {
        mode: PagingMode::Amd64,
        format: EntryFormat::Long,
        entry_size: 8,
        va_bits: 48,
        root_mask: 0x000f_ffff_ffff_f000,
        levels: &FOUR_LEVELS,
    },
    ModeDesc {
        mode: PagingMode::Ept,
        format: EntryFormat::Ept,
        entry_size: 8,
        va_bits: 48,
        root_mask: 0x000f_ffff_ffff_f000,
        levels: &FOUR_LEVELS,
    },
];
