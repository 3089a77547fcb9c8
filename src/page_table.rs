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

//! Used to query and manipulate the page tables of a guest.
//!
//! One walker serves every paging mode. The differences between modes live in
//! a [`ModeDesc`] (geometry) and in the masks [`WalkParams`] computes once when
//! the guest enters the mode.

use bit_field::BitField;
use memory_addr::{MemoryAddr, PAGE_SIZE_4K};

use crate::ept::{EptAttrs, EptEntryFlags, EptMemType};
use crate::error::{WalkError, WalkResult};
use crate::flags::PageFlags;
use crate::hal::{GuestPhysMemory, PagingFeatures};
use crate::mode::{EntryFormat, LevelDesc, ModeDesc, PageSize};
use crate::{GuestPhysAddr, GuestVirtAddr, HostVirtAddr};

const PTE_P: u64 = 1 << 0;
const PTE_RW: u64 = 1 << 1;
const PTE_US: u64 = 1 << 2;
const PTE_A: u64 = 1 << 5;
const PTE_PS: u64 = 1 << 7;
const PTE_PAT: u64 = 1 << 7;
const PDE_BIG_PAT: u64 = 1 << 12;
const PTE_NX: u64 = 1 << 63;

/// Bits of an x86 entry reported as-is: P, RW, US, PWT, PCD, A, D and G.
const PTE_PLAIN_FLAGS: u64 = 0x17f;
/// Bits the access rights are merged over, level by level.
const PTE_MERGED_FLAGS: u64 = PTE_P | PTE_RW | PTE_US | PTE_A;

/// PAE page directory pointer table entries only define P, PWT, PCD and AVL.
const PAE_PDPTE_FLAGS: u64 = PTE_P | (1 << 3) | (1 << 4) | (0x7 << 9);
/// 32-bit 4 MiB pages: bit 21 must be zero.
const LEGACY32_BIG_MBZ: u64 = 1 << 21;
/// 32-bit 4 MiB pages keep physical address bits 39:32 in bits 20:13.
const LEGACY32_BIG_HIGH_SHIFT: usize = 13;
const LEGACY32_BIG_HIGH_BITS: u8 = 8;
const LEGACY32_BIG_FRAME: u64 = 0xffc0_0000;
const LEGACY32_FRAME: u64 = 0xffff_f000;

/// How an entry's size bit is interpreted at a given level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeBit {
    /// Not a size bit (PAT in page table entries, ignored without `CR4.PSE`).
    Ignored,
    /// Must be zero.
    Reserved,
    /// Set: the entry maps a page of this size.
    Selects(PageSize),
}

#[derive(Debug, Clone, Copy)]
struct LevelMasks {
    /// Must-be-zero bits of an entry referencing the next table.
    table_mbz: u64,
    /// Must-be-zero bits of an entry mapping a page.
    page_mbz: u64,
    size_bit: SizeBit,
}

impl LevelMasks {
    const UNUSED: Self = Self {
        table_mbz: 0,
        page_mbz: 0,
        size_bit: SizeBit::Ignored,
    };
}

/// Result of examining one paging-structure entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LevelStep {
    /// The entry references the table of the next level.
    Continue { next_table: GuestPhysAddr },
    /// The entry maps a page starting at `frame`.
    Leaf { frame: u64, size: PageSize },
    /// The walk stops here.
    Fail(WalkError),
}

/// A paging-structure entry visited by a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkedEntry {
    /// Level of the entry, 1 for a page table entry.
    pub level: u8,
    /// The entry as read from guest memory.
    pub raw: u64,
    /// Host address of the entry.
    pub(crate) slot: HostVirtAddr,
}

/// The outcome of a successful guest page walk.
#[derive(Debug, Clone)]
pub struct GuestWalk {
    /// The translated address.
    pub gva: GuestVirtAddr,
    /// The guest physical address `gva` translates to.
    pub gpa: GuestPhysAddr,
    /// Size of the page mapping `gva`.
    pub page_size: PageSize,
    /// Effective attributes of the translation.
    pub flags: PageFlags,
    /// Effective EPT rights, for EPT walks only.
    pub ept: Option<EptAttrs>,
    leaf_level: u8,
    entries: [Option<WalkedEntry>; 4],
}

impl GuestWalk {
    /// Identity translation used when paging is off.
    pub(crate) fn identity(gva: GuestVirtAddr) -> Self {
        Self {
            gva,
            gpa: GuestPhysAddr::from(gva.as_usize()),
            page_size: PageSize::Size4K,
            flags: PageFlags::FULL_ACCESS,
            ept: None,
            leaf_level: 0,
            entries: [None; 4],
        }
    }

    /// Level of the entry mapping the page, 0 for identity translations.
    pub fn leaf_level(&self) -> u8 {
        self.leaf_level
    }

    /// The entry visited at `level`, if the walk went through that level.
    pub fn entry(&self, level: u8) -> Option<&WalkedEntry> {
        self.entries.get(level.checked_sub(1)? as usize)?.as_ref()
    }

    /// The entry mapping the page.
    pub fn leaf(&self) -> Option<&WalkedEntry> {
        self.entry(self.leaf_level)
    }

    /// Visited entries from the top level down.
    pub fn entries(&self) -> impl Iterator<Item = &WalkedEntry> {
        self.entries.iter().rev().flatten()
    }
}

/// Running AND/OR merge of the rights granted by each level.
#[derive(Debug, Clone, Copy)]
struct Accumulator {
    /// P, RW, US and A, cleared by any level that clears them.
    allowed: u64,
    /// Set by any level that sets NX.
    nx: bool,
    /// EPT read, write, execute and accessed, AND-ed over all levels.
    ept: u64,
}

impl Accumulator {
    const fn new() -> Self {
        Self {
            allowed: PTE_MERGED_FLAGS,
            nx: false,
            ept: EptEntryFlags::RWX.union(EptEntryFlags::ACCESSED).bits(),
        }
    }
}

/// What a walk has seen so far.
#[derive(Debug, Clone, Copy)]
struct Visited {
    acc: Accumulator,
    entries: [Option<WalkedEntry>; 4],
    /// The last entry read, the leaf once the walk is done.
    last: u64,
}

impl Visited {
    const fn new() -> Self {
        Self {
            acc: Accumulator::new(),
            entries: [None; 4],
            last: 0,
        }
    }
}

/// Reserved-bit masks and feature switches of the current paging mode.
///
/// Built once when the guest enters the mode so that walks only test bits.
#[derive(Debug, Clone)]
pub(crate) struct WalkParams {
    desc: &'static ModeDesc,
    nxe: bool,
    ept_ad: bool,
    ept_execute_only: bool,
    /// Physical address bits of table pointers and 4 KiB leaves.
    frame_mask: u64,
    /// Indexed by level number minus one.
    levels: [LevelMasks; 4],
}

impl WalkParams {
    pub fn new(
        desc: &'static ModeDesc,
        features: PagingFeatures,
        nxe: bool,
        pse: bool,
        ept_ad: bool,
    ) -> Self {
        let features = features.clamped();
        let phys = features.phys_frame_mask();
        let nx_mbz = if nxe { 0 } else { PTE_NX };
        let mut levels = [LevelMasks::UNUSED; 4];
        let frame_mask;

        match desc.format {
            EntryFormat::Legacy32 => {
                frame_mask = LEGACY32_FRAME;
                // bits 20:13 beyond MAXPHYADDR must be zero
                let high_bits = (features.max_phys_bits - PagingFeatures::MIN_PHYS_BITS)
                    .min(LEGACY32_BIG_HIGH_BITS) as u32;
                let high_mbz = (0xffu64 << high_bits) & 0xff;
                levels[1] = LevelMasks {
                    table_mbz: 0,
                    page_mbz: LEGACY32_BIG_MBZ | (high_mbz << LEGACY32_BIG_HIGH_SHIFT),
                    size_bit: if pse {
                        SizeBit::Selects(PageSize::Size4M)
                    } else {
                        SizeBit::Ignored
                    },
                };
            }
            EntryFormat::Pae => {
                frame_mask = phys;
                // bits 62:MAXPHYADDR are reserved in PAE entries
                let high_mbz = !phys & 0x7fff_ffff_ffff_f000;
                levels[2] = LevelMasks {
                    table_mbz: !(phys | PAE_PDPTE_FLAGS),
                    page_mbz: 0,
                    size_bit: SizeBit::Reserved,
                };
                levels[1] = LevelMasks {
                    table_mbz: high_mbz | nx_mbz,
                    page_mbz: high_mbz | nx_mbz | big_page_low_mbz(PageSize::Size2M),
                    size_bit: SizeBit::Selects(PageSize::Size2M),
                };
                levels[0] = LevelMasks {
                    table_mbz: 0,
                    page_mbz: high_mbz | nx_mbz,
                    size_bit: SizeBit::Ignored,
                };
            }
            EntryFormat::Long => {
                frame_mask = phys;
                // bits 51:MAXPHYADDR are reserved, 62:52 are ignored
                let high_mbz = !phys & 0x000f_ffff_ffff_f000;
                let table_mbz = high_mbz | nx_mbz;
                levels[3] = LevelMasks {
                    table_mbz,
                    page_mbz: 0,
                    size_bit: SizeBit::Reserved,
                };
                levels[2] = LevelMasks {
                    table_mbz,
                    page_mbz: table_mbz | big_page_low_mbz(PageSize::Size1G),
                    size_bit: if features.gbpages {
                        SizeBit::Selects(PageSize::Size1G)
                    } else {
                        SizeBit::Reserved
                    },
                };
                levels[1] = LevelMasks {
                    table_mbz,
                    page_mbz: table_mbz | big_page_low_mbz(PageSize::Size2M),
                    size_bit: SizeBit::Selects(PageSize::Size2M),
                };
                levels[0] = LevelMasks {
                    table_mbz: 0,
                    page_mbz: table_mbz,
                    size_bit: SizeBit::Ignored,
                };
            }
            EntryFormat::Ept => {
                frame_mask = phys;
                let high_mbz = !phys & 0x000f_ffff_ffff_f000;
                let table_mbz = high_mbz | EptEntryFlags::TABLE_RESERVED;
                levels[3] = LevelMasks {
                    table_mbz,
                    page_mbz: 0,
                    size_bit: SizeBit::Reserved,
                };
                levels[2] = LevelMasks {
                    table_mbz,
                    // EPT huge pages reserve every address bit below the page size
                    page_mbz: high_mbz | big_page_low_mbz(PageSize::Size1G) | (1 << 12),
                    size_bit: if features.ept_gbpages {
                        SizeBit::Selects(PageSize::Size1G)
                    } else {
                        SizeBit::Reserved
                    },
                };
                levels[1] = LevelMasks {
                    table_mbz,
                    page_mbz: high_mbz | big_page_low_mbz(PageSize::Size2M) | (1 << 12),
                    size_bit: SizeBit::Selects(PageSize::Size2M),
                };
                levels[0] = LevelMasks {
                    table_mbz: 0,
                    page_mbz: high_mbz,
                    size_bit: SizeBit::Ignored,
                };
            }
        }

        Self {
            desc,
            nxe: nxe && matches!(desc.format, EntryFormat::Pae | EntryFormat::Long),
            ept_ad: ept_ad && desc.format == EntryFormat::Ept,
            ept_execute_only: features.ept_execute_only,
            frame_mask,
            levels,
        }
    }

    /// Geometry of the mode these parameters were built for.
    pub fn desc(&self) -> &'static ModeDesc {
        self.desc
    }

    /// Walks the guest page tables rooted at `root` to translate `gva`.
    pub fn walk<M: GuestPhysMemory + ?Sized>(
        &self,
        mem: &M,
        root: HostVirtAddr,
        gva: GuestVirtAddr,
    ) -> WalkResult<GuestWalk> {
        let vaddr = gva.as_usize() as u64;
        if !self.desc.is_valid_vaddr(vaddr) {
            let err = WalkError::NotPresent {
                level: self.desc.top_level(),
            };
            trace!("guest walk {:?}: out of range, {}", gva, err);
            return Err(err);
        }

        let mut table = root;
        let mut visited = Visited::new();

        for lvl in self.desc.directory_levels() {
            let slot = table + lvl.index_of(vaddr) * self.desc.entry_size;
            let raw = read_entry(self.desc, slot);
            walk_trace!("guest walk {:?}: L{} entry {:#x}", gva, lvl.level, raw);

            match self.step(lvl, raw) {
                LevelStep::Fail(err) => {
                    trace!("guest walk {:?}: {}", gva, err);
                    return Err(err);
                }
                LevelStep::Continue { next_table } => {
                    self.visit(&mut visited, lvl.level, raw, slot);
                    table = mem.map_phys_page(next_table).ok_or_else(|| {
                        let err = WalkError::BadPhysAddr { level: lvl.level };
                        trace!("guest walk {:?}: {:?} {}", gva, next_table, err);
                        err
                    })?;
                }
                LevelStep::Leaf { frame, size } => {
                    self.visit(&mut visited, lvl.level, raw, slot);
                    return Ok(self.finish(gva, visited, lvl.level, frame, size));
                }
            }
        }

        let lvl = self.desc.page_table_level();
        let slot = table + lvl.index_of(vaddr) * self.desc.entry_size;
        let raw = read_entry(self.desc, slot);
        walk_trace!("guest walk {:?}: L{} entry {:#x}", gva, lvl.level, raw);
        if let Err(err) = self.check_leaf(lvl.level, raw) {
            trace!("guest walk {:?}: {}", gva, err);
            return Err(err);
        }
        self.visit(&mut visited, lvl.level, raw, slot);
        let frame = self.page_frame(raw, PageSize::Size4K);
        Ok(self.finish(gva, visited, lvl.level, frame, PageSize::Size4K))
    }

    /// Applies `and_mask` then `or_mask` to every leaf entry mapping the pages
    /// of `[gva, gva + len)`.
    ///
    /// A large page is rewritten once and skipped as a whole, even if the range
    /// ends inside it. Entries rewritten before a failing walk stay modified.
    pub fn modify_range<M: GuestPhysMemory + ?Sized>(
        &self,
        mem: &M,
        root: HostVirtAddr,
        gva: GuestVirtAddr,
        len: usize,
        and_mask: PageFlags,
        or_mask: PageFlags,
    ) -> WalkResult {
        let mut pages = gva.align_offset_4k().saturating_add(len).div_ceil(PAGE_SIZE_4K);
        let mut vaddr = gva.align_down_4k();
        let pt_level = self.desc.page_table_level();

        while pages > 0 {
            let walk = self.walk(mem, root, vaddr)?;
            let Some(slot) = walk.leaf().map(|leaf| leaf.slot) else {
                break;
            };

            if walk.page_size.is_huge() {
                self.modify_entry(slot, walk.page_size, and_mask, or_mask);
                let size = walk.page_size.bytes();
                let done = (size - vaddr.align_offset(size)) / PAGE_SIZE_4K;
                if pages <= done {
                    break;
                }
                pages -= done;
                vaddr = GuestVirtAddr::from(vaddr.as_usize().wrapping_add(done * PAGE_SIZE_4K));
                continue;
            }

            // The rest of this page table is rewritten without walking again.
            let mut slot = slot;
            for _ in pt_level.index_of(vaddr.as_usize() as u64)..pt_level.entry_count() {
                self.modify_entry(slot, PageSize::Size4K, and_mask, or_mask);
                pages -= 1;
                if pages == 0 {
                    return Ok(());
                }
                vaddr = GuestVirtAddr::from(vaddr.as_usize().wrapping_add(PAGE_SIZE_4K));
                slot = slot + self.desc.entry_size;
            }
        }
        Ok(())
    }
}

// private implements
impl WalkParams {
    fn masks(&self, level: u8) -> &LevelMasks {
        &self.levels[level as usize - 1]
    }

    fn is_present(&self, raw: u64) -> bool {
        match self.desc.format {
            EntryFormat::Ept => raw & EptEntryFlags::RWX.bits() != 0,
            _ => raw & PTE_P != 0,
        }
    }

    /// Examines a directory entry: presence first, then legality, then
    /// whether it maps a page or references the next table.
    fn step(&self, lvl: &LevelDesc, raw: u64) -> LevelStep {
        let level = lvl.level;
        if !self.is_present(raw) {
            return LevelStep::Fail(WalkError::NotPresent { level });
        }

        let size = if raw & PTE_PS != 0 {
            match self.masks(level).size_bit {
                SizeBit::Ignored => None,
                SizeBit::Reserved => return LevelStep::Fail(WalkError::ReservedBits { level }),
                SizeBit::Selects(size) => Some(size),
            }
        } else {
            None
        };

        if let Err(err) = self.check_reserved(level, raw, size.is_some()) {
            return LevelStep::Fail(err);
        }

        match size {
            Some(size) => LevelStep::Leaf {
                frame: self.page_frame(raw, size),
                size,
            },
            None => LevelStep::Continue {
                next_table: GuestPhysAddr::from((raw & self.frame_mask) as usize),
            },
        }
    }

    /// Examines a page table entry, which always maps a 4 KiB page.
    fn check_leaf(&self, level: u8, raw: u64) -> WalkResult {
        if !self.is_present(raw) {
            return Err(WalkError::NotPresent { level });
        }
        self.check_reserved(level, raw, true)
    }

    fn check_reserved(&self, level: u8, raw: u64, is_leaf: bool) -> WalkResult {
        let masks = self.masks(level);
        let mbz = if is_leaf {
            masks.page_mbz
        } else {
            masks.table_mbz
        };
        if raw & mbz != 0 || !self.is_legal_ept_entry(raw, is_leaf) {
            return Err(WalkError::ReservedBits { level });
        }
        Ok(())
    }

    fn visit(&self, visited: &mut Visited, level: u8, raw: u64, slot: HostVirtAddr) {
        self.merge(&mut visited.acc, level, raw);
        visited.entries[level as usize - 1] = Some(WalkedEntry { level, raw, slot });
        visited.last = raw;
    }

    fn finish(
        &self,
        gva: GuestVirtAddr,
        visited: Visited,
        leaf_level: u8,
        frame: u64,
        size: PageSize,
    ) -> GuestWalk {
        let gpa = frame | (gva.as_usize() as u64 & size.offset_mask());
        GuestWalk {
            gva,
            gpa: GuestPhysAddr::from(gpa as usize),
            page_size: size,
            flags: self.effective_flags(&visited.acc, visited.last, size),
            ept: self.ept_attrs(&visited.acc, visited.last),
            leaf_level,
            entries: visited.entries,
        }
    }

    /// EPT misconfiguration checks beyond plain reserved bits.
    fn is_legal_ept_entry(&self, raw: u64, is_leaf: bool) -> bool {
        if self.desc.format != EntryFormat::Ept {
            return true;
        }
        let rights = EptEntryFlags::from_bits_truncate(raw) & EptEntryFlags::RWX;
        if rights.contains(EptEntryFlags::WRITE) && !rights.contains(EptEntryFlags::READ) {
            return false;
        }
        if rights == EptEntryFlags::EXECUTE && !self.ept_execute_only {
            return false;
        }
        !is_leaf || EptMemType::of_entry(raw).is_some()
    }

    fn page_frame(&self, raw: u64, size: PageSize) -> u64 {
        match (self.desc.format, size) {
            (_, PageSize::Size4K) => raw & self.frame_mask,
            (EntryFormat::Legacy32, _) => {
                let high_end = LEGACY32_BIG_HIGH_SHIFT + LEGACY32_BIG_HIGH_BITS as usize;
                let high = raw.get_bits(LEGACY32_BIG_HIGH_SHIFT..high_end);
                (raw & LEGACY32_BIG_FRAME) | (high << 32)
            }
            _ => raw & self.frame_mask & !size.offset_mask(),
        }
    }

    fn merge(&self, acc: &mut Accumulator, level: u8, raw: u64) {
        match self.desc.format {
            EntryFormat::Ept => acc.ept &= raw,
            // PAE PDPTEs carry no access rights
            EntryFormat::Pae if level == 3 => {}
            _ => {
                acc.allowed &= raw;
                acc.nx |= self.nxe && raw & PTE_NX != 0;
            }
        }
    }

    fn effective_flags(&self, acc: &Accumulator, leaf: u64, size: PageSize) -> PageFlags {
        if self.desc.format == EntryFormat::Ept {
            let ept = EptEntryFlags::from_bits_truncate(acc.ept);
            let mut flags = PageFlags::PRESENT | PageFlags::USER;
            flags.set(PageFlags::WRITE, ept.contains(EptEntryFlags::WRITE));
            flags.set(PageFlags::NO_EXECUTE, !ept.contains(EptEntryFlags::EXECUTE));
            if self.ept_ad {
                flags.set(PageFlags::ACCESSED, ept.contains(EptEntryFlags::ACCESSED));
                flags.set(PageFlags::DIRTY, leaf & EptEntryFlags::DIRTY.bits() != 0);
            }
            return flags;
        }

        let mut flags = self.entry_flags(leaf, size);
        flags.remove(PageFlags::from_bits_truncate(PTE_MERGED_FLAGS));
        flags |= PageFlags::from_bits_truncate(acc.allowed);
        flags.set(PageFlags::NO_EXECUTE, acc.nx);
        flags
    }

    fn ept_attrs(&self, acc: &Accumulator, leaf: u64) -> Option<EptAttrs> {
        if self.desc.format != EntryFormat::Ept {
            return None;
        }
        Some(EptAttrs {
            access: EptEntryFlags::from_bits_truncate(acc.ept) & EptEntryFlags::RWX,
            mem_type: EptMemType::of_entry(leaf)?,
            ignore_pat: leaf & EptEntryFlags::IGNORE_PAT.bits() != 0,
        })
    }

    /// Attributes of a single leaf entry, in 4 KiB page shape.
    fn entry_flags(&self, raw: u64, size: PageSize) -> PageFlags {
        if self.desc.format == EntryFormat::Ept {
            let ept = EptEntryFlags::from_bits_truncate(raw);
            let mut flags = PageFlags::USER;
            flags.set(PageFlags::PRESENT, ept.intersects(EptEntryFlags::RWX));
            flags.set(PageFlags::WRITE, ept.contains(EptEntryFlags::WRITE));
            flags.set(PageFlags::NO_EXECUTE, !ept.contains(EptEntryFlags::EXECUTE));
            if self.ept_ad {
                flags.set(PageFlags::ACCESSED, ept.contains(EptEntryFlags::ACCESSED));
                flags.set(PageFlags::DIRTY, ept.contains(EptEntryFlags::DIRTY));
            }
            return flags;
        }

        let mut flags = PageFlags::from_bits_truncate(raw & PTE_PLAIN_FLAGS);
        flags.set(PageFlags::PAT, raw & pat_bit(size) != 0);
        flags.set(PageFlags::NO_EXECUTE, self.nxe && raw & PTE_NX != 0);
        flags
    }

    /// Attributes callers may change with a modify operation.
    fn modifiable_flags(&self) -> PageFlags {
        match self.desc.format {
            EntryFormat::Ept if self.ept_ad => {
                PageFlags::WRITE | PageFlags::NO_EXECUTE | PageFlags::ACCESSED | PageFlags::DIRTY
            }
            EntryFormat::Ept => PageFlags::WRITE | PageFlags::NO_EXECUTE,
            _ => {
                let mut flags = PageFlags::all() - PageFlags::PRESENT;
                flags.set(PageFlags::NO_EXECUTE, self.nxe);
                flags
            }
        }
    }

    /// Encodes `flags` (already limited to the modifiable set) into entry bits,
    /// returning the encoded bits and the mask of bits they replace.
    fn encode_flags(&self, flags: PageFlags, size: PageSize) -> (u64, u64) {
        if self.desc.format == EntryFormat::Ept {
            let mut bits = EptEntryFlags::empty();
            let mut mask = EptEntryFlags::WRITE | EptEntryFlags::EXECUTE;
            bits.set(EptEntryFlags::WRITE, flags.contains(PageFlags::WRITE));
            bits.set(EptEntryFlags::EXECUTE, !flags.contains(PageFlags::NO_EXECUTE));
            if self.ept_ad {
                mask |= EptEntryFlags::ACCESSED | EptEntryFlags::DIRTY;
                bits.set(EptEntryFlags::ACCESSED, flags.contains(PageFlags::ACCESSED));
                bits.set(EptEntryFlags::DIRTY, flags.contains(PageFlags::DIRTY));
            }
            return (bits.bits(), mask.bits());
        }

        let pat = pat_bit(size);
        let mut mask = (PTE_PLAIN_FLAGS & !PTE_P) | pat;
        let mut bits = flags.bits() & PTE_PLAIN_FLAGS & !PTE_P;
        if flags.contains(PageFlags::PAT) {
            bits |= pat;
        }
        if self.nxe {
            mask |= PTE_NX;
            if flags.contains(PageFlags::NO_EXECUTE) {
                bits |= PTE_NX;
            }
        }
        (bits, mask)
    }

    /// Rewrites the attributes of the leaf entry at `slot`, leaving the frame,
    /// size, present and reserved bits alone.
    ///
    /// Entries that are not present belong to the guest and are skipped. An
    /// EPT entry is only rewritten if it stays present and legal.
    fn modify_entry(
        &self,
        slot: HostVirtAddr,
        size: PageSize,
        and_mask: PageFlags,
        or_mask: PageFlags,
    ) {
        let raw = read_entry(self.desc, slot);
        if !self.is_present(raw) || !self.is_legal_ept_entry(raw, true) {
            return;
        }

        let flags = ((self.entry_flags(raw, size) & and_mask) | or_mask) & self.modifiable_flags();
        let (bits, mask) = self.encode_flags(flags, size);
        let mut new = (raw & !mask) | bits;
        if self.desc.format == EntryFormat::Ept {
            // no write access without read access
            if new & EptEntryFlags::READ.bits() == 0 {
                new &= !EptEntryFlags::WRITE.bits();
            }
            if !self.is_present(new) || !self.is_legal_ept_entry(new, true) {
                walk_trace!("modify entry at {:?}: keeping {:#x}", slot, raw);
                return;
            }
        }

        if new != raw {
            walk_trace!("modify entry at {:?}: {:#x} -> {:#x}", slot, raw, new);
            write_entry(self.desc, slot, new);
        }
    }
}

/// Address bits below a huge page's frame that must be zero, bit 12 excluded
/// since it holds PAT.
const fn big_page_low_mbz(size: PageSize) -> u64 {
    size.offset_mask() & !0x1fff
}

const fn pat_bit(size: PageSize) -> u64 {
    if size.is_huge() { PDE_BIG_PAT } else { PTE_PAT }
}

/// Reads the paging-structure entry at `slot`.
fn read_entry(desc: &ModeDesc, slot: HostVirtAddr) -> u64 {
    // SAFETY: `slot` lies in a page returned by `GuestPhysMemory::map_phys_page`,
    // which stays readable while the walk runs. The guest may change entries
    // concurrently, hence the volatile access.
    unsafe {
        match desc.entry_size {
            4 => slot.as_ptr().cast::<u32>().read_volatile() as u64,
            _ => slot.as_ptr().cast::<u64>().read_volatile(),
        }
    }
}

fn write_entry(desc: &ModeDesc, slot: HostVirtAddr, value: u64) {
    // SAFETY: see `read_entry`.
    unsafe {
        match desc.entry_size {
            4 => slot.as_mut_ptr().cast::<u32>().write_volatile(value as u32),
            _ => slot.as_mut_ptr().cast::<u64>().write_volatile(value),
        }
    }
}
