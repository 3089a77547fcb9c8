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

//! Interfaces the translator needs from the rest of the hypervisor.

use crate::{GuestPhysAddr, HostVirtAddr};

/// Access to guest physical memory.
///
/// # Safety
///
/// A returned host address must stay valid for volatile reads and writes of the
/// whole 4 KiB page for as long as the guest memory region backing it is
/// mapped. The translator caches the address of the root table between
/// [`enter`](crate::GuestTranslator::enter) and
/// [`exit`](crate::GuestTranslator::exit).
pub unsafe trait GuestPhysMemory {
    /// Maps the 4 KiB guest physical page starting at `gpa` into the host
    /// address space.
    ///
    /// Returns `None` if `gpa` is not backed by host memory. Transient
    /// failures are reported the same way; retrying is up to the implementor.
    fn map_phys_page(&self, gpa: GuestPhysAddr) -> Option<HostVirtAddr>;
}

/// Guest CPU state consulted when selecting the paging mode.
pub trait GuestCpuState {
    /// Guest `CR0`.
    fn cr0(&self) -> u64;
    /// Guest `CR3`.
    fn cr3(&self) -> u64;
    /// Guest `CR4`.
    fn cr4(&self) -> u64;
    /// Guest `IA32_EFER`.
    fn efer(&self) -> u64;

    /// The EPT pointer of a nested guest, if the guest hypervisor runs its
    /// guest with EPT enabled and addresses are translated through it.
    fn nested_eptp(&self) -> Option<u64> {
        None
    }

    /// The current translation root: the nested EPTP if any, `CR3` otherwise.
    fn root_pointer(&self) -> u64 {
        self.nested_eptp().unwrap_or_else(|| self.cr3())
    }

    /// Paging features exposed to the guest.
    fn paging_features(&self) -> PagingFeatures {
        PagingFeatures::host()
    }
}

/// Processor paging features that change reserved-bit rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingFeatures {
    /// MAXPHYADDR, clamped to `32..=52`.
    pub max_phys_bits: u8,
    /// 1 GiB pages are supported (`CPUID.80000001H:EDX.Page1GB`).
    pub gbpages: bool,
    /// EPT supports execute-only translations
    /// (`IA32_VMX_EPT_VPID_CAP` bit 0).
    pub ept_execute_only: bool,
    /// EPT supports 1 GiB pages (`IA32_VMX_EPT_VPID_CAP` bit 17).
    pub ept_gbpages: bool,
}

impl Default for PagingFeatures {
    fn default() -> Self {
        Self {
            max_phys_bits: 36,
            gbpages: false,
            ept_execute_only: false,
            ept_gbpages: false,
        }
    }
}

impl PagingFeatures {
    /// Lowest MAXPHYADDR value.
    pub const MIN_PHYS_BITS: u8 = 32;
    /// Architectural MAXPHYADDR limit.
    pub const MAX_PHYS_BITS: u8 = 52;

    /// Returns the features of the processor we are running on.
    pub fn host() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
                let cpuid = raw_cpuid::CpuId::new();
                let max_phys_bits = cpuid
                    .get_processor_capacity_feature_info()
                    .map(|info| info.physical_address_bits())
                    .unwrap_or(Self::default().max_phys_bits);
                let gbpages = cpuid
                    .get_extended_processor_and_feature_identifiers()
                    .is_some_and(|ext| ext.has_1gib_pages());
                Self {
                    max_phys_bits,
                    gbpages,
                    // EPT capabilities live in a VMX MSR we cannot read here
                    ept_execute_only: false,
                    ept_gbpages: false,
                }
                .clamped()
            } else {
                Self::default()
            }
        }
    }

    /// Returns a copy with `max_phys_bits` forced into the architectural range.
    pub fn clamped(self) -> Self {
        Self {
            max_phys_bits: self
                .max_phys_bits
                .clamp(Self::MIN_PHYS_BITS, Self::MAX_PHYS_BITS),
            ..self
        }
    }

    /// Mask of the physical address bits a paging-structure entry may hold
    /// (bits 12 up to MAXPHYADDR - 1).
    pub(crate) const fn phys_frame_mask(&self) -> u64 {
        ((1u64 << self.max_phys_bits) - 1) & !0xfff
    }
}
