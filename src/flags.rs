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

use bitflags::bitflags;
use page_table_entry::MappingFlags;

bitflags! {
    /// Mode-independent page attributes, laid out like a 4 KiB PAE/4-level
    /// page table entry.
    ///
    /// Large pages are reported as if they were 4 KiB pages: the size bit
    /// never appears and the large-page PAT bit is moved to [`PageFlags::PAT`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        /// The translation exists.
        const PRESENT = 1 << 0;
        /// Writes are allowed.
        const WRITE = 1 << 1;
        /// User-mode accesses are allowed.
        const USER = 1 << 2;
        /// Page-level write-through.
        const WRITE_THROUGH = 1 << 3;
        /// Page-level cache disable.
        const CACHE_DISABLE = 1 << 4;
        /// The page has been accessed.
        const ACCESSED = 1 << 5;
        /// The page has been written.
        const DIRTY = 1 << 6;
        /// Page attribute table index bit.
        const PAT = 1 << 7;
        /// Global translation.
        const GLOBAL = 1 << 8;
        /// Instruction fetches are not allowed.
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageFlags {
    /// Attributes of an identity mapping when paging is disabled.
    pub const FULL_ACCESS: Self = Self::PRESENT.union(Self::WRITE).union(Self::USER);

    /// Whether instruction fetches are allowed.
    pub const fn is_executable(&self) -> bool {
        !self.contains(Self::NO_EXECUTE)
    }
}

impl From<PageFlags> for MappingFlags {
    fn from(flags: PageFlags) -> Self {
        let mut ret = Self::empty();
        if !flags.contains(PageFlags::PRESENT) {
            return ret;
        }
        ret |= Self::READ;
        if flags.contains(PageFlags::WRITE) {
            ret |= Self::WRITE;
        }
        if flags.is_executable() {
            ret |= Self::EXECUTE;
        }
        if flags.contains(PageFlags::USER) {
            ret |= Self::USER;
        }
        if flags.contains(PageFlags::CACHE_DISABLE) {
            ret |= Self::UNCACHED;
        }
        ret
    }
}
