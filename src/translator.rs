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

use axerrno::{AxResult, ax_err, ax_err_type};
use memory_addr::{MemoryAddr, PAGE_SIZE_4K};
use x86_64::registers::control::Cr4Flags;
use x86_64::registers::model_specific::EferFlags;

use crate::ept::EptPointer;
use crate::error::{WalkError, WalkResult};
use crate::flags::PageFlags;
use crate::hal::{GuestCpuState, GuestPhysMemory};
use crate::mode::{PageSize, PagingMode};
use crate::page_table::{GuestWalk, WalkParams};
use crate::{GuestPhysAddr, GuestVirtAddr, HostVirtAddr};

/// The root table the walker currently starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RootTable {
    gpa: GuestPhysAddr,
    hva: HostVirtAddr,
}

/// Per-vCPU guest address translation state.
///
/// The paging mode and the root table are latched by [`enter`](Self::enter)
/// and used by every query until the next `enter` or [`exit`](Self::exit).
/// Guest page tables are re-read on every query.
#[derive(Debug, Clone)]
pub struct GuestTranslator {
    mode: PagingMode,
    params: Option<WalkParams>,
    root: Option<RootTable>,
}

impl Default for GuestTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestTranslator {
    /// Creates a translator for a guest starting in real mode.
    pub const fn new() -> Self {
        Self {
            mode: PagingMode::Real,
            params: None,
            root: None,
        }
    }

    /// The paging mode latched by the last [`enter`](Self::enter).
    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    /// Guest physical address of the current root table.
    pub fn root_paddr(&self) -> Option<GuestPhysAddr> {
        self.root.map(|root| root.gpa)
    }

    /// Binds the translator to the paging mode in `cpu` and to the root
    /// table given by `root`, the new `CR3` (or `EPTP` for a nested EPT guest).
    ///
    /// Nothing is mapped when `cpu` has paging disabled. If the root table
    /// cannot be mapped or the `EPTP` is malformed, the previous state is kept.
    pub fn enter<M, C>(&mut self, mem: &M, cpu: &C, root: u64) -> AxResult
    where
        M: GuestPhysMemory + ?Sized,
        C: GuestCpuState + ?Sized,
    {
        let mode = PagingMode::from_cpu_state(cpu);
        let Some(desc) = mode.desc() else {
            debug!("guest translation enters {:?}", mode);
            self.mode = mode;
            self.params = None;
            self.root = None;
            return Ok(());
        };

        let cr4 = Cr4Flags::from_bits_truncate(cpu.cr4());
        let efer = EferFlags::from_bits_truncate(cpu.efer());
        let nxe = efer.contains(EferFlags::NO_EXECUTE_ENABLE);
        let pse = cr4.contains(Cr4Flags::PAGE_SIZE_EXTENSION);

        let (root_gpa, ept_ad) = if mode == PagingMode::Ept {
            let eptp = EptPointer::new(root);
            if !eptp.is_valid() {
                warn!("rejecting guest EPTP {:#x}", root);
                return ax_err!(InvalidInput, "invalid EPTP");
            }
            (eptp.root(), eptp.ad_enabled())
        } else {
            (GuestPhysAddr::from((root & desc.root_mask) as usize), false)
        };

        let page = mem.map_phys_page(root_gpa.align_down_4k()).ok_or_else(|| {
            warn!("failed to map guest root table {:?}", root_gpa);
            ax_err_type!(BadAddress, "root table not backed by memory")
        })?;

        let params = WalkParams::new(desc, cpu.paging_features(), nxe, pse, ept_ad);
        debug!(
            "guest translation enters {:?}, root {:?} at {:?}",
            mode, root_gpa, page
        );
        self.mode = mode;
        self.params = Some(params);
        self.root = Some(RootTable {
            gpa: root_gpa,
            hva: page + root_gpa.align_offset_4k(),
        });
        Ok(())
    }

    /// Releases the root table.
    ///
    /// Queries made before the next [`enter`](Self::enter) fail with
    /// [`WalkError::BadPhysAddr`] at the top level.
    pub fn exit(&mut self) {
        if let Some(root) = self.root.take() {
            debug!("guest translation leaves {:?}, root {:?}", self.mode, root.gpa);
        }
    }

    /// Moves the cached host address of the root table by `offset` bytes
    /// after the host mapping of guest memory was rebased.
    pub fn relocate(&mut self, offset: isize) {
        if let Some(root) = self.root.as_mut() {
            let hva = root.hva.as_usize().wrapping_add_signed(offset);
            debug!("guest root table {:?} relocated to {:#x}", root.gpa, hva);
            root.hva = HostVirtAddr::from(hva);
        }
    }

    /// Walks the guest page tables for `gva`, returning every visited entry.
    ///
    /// Without paging the identity translation is returned.
    pub fn walk<M>(&self, mem: &M, gva: GuestVirtAddr) -> WalkResult<GuestWalk>
    where
        M: GuestPhysMemory + ?Sized,
    {
        let Some(params) = self.params.as_ref() else {
            return Ok(GuestWalk::identity(gva));
        };
        params.walk(mem, self.root_hva(params)?, gva)
    }

    /// Queries the mapping of `gva`.
    ///
    /// Returns the exact guest physical address, the effective attributes and
    /// the size of the page backing it.
    pub fn query<M>(
        &self,
        mem: &M,
        gva: GuestVirtAddr,
    ) -> WalkResult<(GuestPhysAddr, PageFlags, PageSize)>
    where
        M: GuestPhysMemory + ?Sized,
    {
        let walk = self.walk(mem, gva)?;
        Ok((walk.gpa, walk.flags, walk.page_size))
    }

    /// Returns the guest physical page backing `gva` and its effective
    /// attributes.
    ///
    /// The address is aligned down to 4 KiB and the attributes are those of a
    /// 4 KiB page whatever the size of the mapping.
    pub fn get_page<M>(&self, mem: &M, gva: GuestVirtAddr) -> WalkResult<(GuestPhysAddr, PageFlags)>
    where
        M: GuestPhysMemory + ?Sized,
    {
        let Some(params) = self.params.as_ref() else {
            return Ok((
                GuestPhysAddr::from(gva.as_usize()).align_down_4k(),
                PageFlags::FULL_ACCESS,
            ));
        };
        let walk = params.walk(mem, self.root_hva(params)?, gva)?;
        Ok((walk.gpa.align_down_4k(), walk.flags))
    }

    /// Changes the attributes of the pages mapping `[gva, gva + len)` to
    /// `(flags & and_mask) | or_mask`.
    ///
    /// `gva` is aligned down and the end of the range aligned up to 4 KiB.
    /// Physical addresses, page sizes and the present bit are never changed;
    /// entries that are not present are skipped. EPT entries keep at least one
    /// access right and never get write access without read access. Large
    /// pages are rewritten in place, never split. A failing walk stops
    /// the operation; pages already rewritten keep their new attributes.
    /// Without paging this does nothing.
    pub fn modify_page<M>(
        &self,
        mem: &M,
        gva: GuestVirtAddr,
        len: usize,
        and_mask: PageFlags,
        or_mask: PageFlags,
    ) -> WalkResult
    where
        M: GuestPhysMemory + ?Sized,
    {
        let Some(params) = self.params.as_ref() else {
            return Ok(());
        };
        params.modify_range(mem, self.root_hva(params)?, gva, len, and_mask, or_mask)
    }

    /// Copies guest virtual memory at `gva` into `buf`.
    ///
    /// A data page the host cannot map fails with
    /// [`WalkError::BadPhysAddr`] at level 0.
    pub fn read_virt<M>(&self, mem: &M, gva: GuestVirtAddr, buf: &mut [u8]) -> WalkResult
    where
        M: GuestPhysMemory + ?Sized,
    {
        let mut copied = 0;
        while copied < buf.len() {
            let cur = GuestVirtAddr::from(gva.as_usize().wrapping_add(copied));
            let (gpa, _flags) = self.get_page(mem, cur)?;
            let offset = cur.align_offset_4k();
            let len = (PAGE_SIZE_4K - offset).min(buf.len() - copied);
            let page = mem
                .map_phys_page(gpa)
                .ok_or(WalkError::BadPhysAddr { level: 0 })?;
            // SAFETY: `page` maps a whole 4 KiB page and `offset + len` stays
            // inside it.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    page.as_ptr().add(offset),
                    buf[copied..].as_mut_ptr(),
                    len,
                );
            }
            copied += len;
        }
        Ok(())
    }
}

// private implements
impl GuestTranslator {
    fn root_hva(&self, params: &WalkParams) -> WalkResult<HostVirtAddr> {
        self.root.map(|root| root.hva).ok_or_else(|| {
            warn!("guest walk in {:?} without a root table", self.mode);
            WalkError::BadPhysAddr {
                level: params.desc().top_level(),
            }
        })
    }
}
