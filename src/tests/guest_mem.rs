//! Guest memory and CPU state used by the tests.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::cell::UnsafeCell;

use memory_addr::{MemoryAddr, PAGE_SIZE_4K};
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::model_specific::EferFlags;

use crate::{
    GuestCpuState, GuestPhysAddr, GuestPhysMemory, GuestTranslator, GuestVirtAddr, HostVirtAddr,
    PagingFeatures,
};

pub const P: u64 = 1 << 0;
pub const RW: u64 = 1 << 1;
pub const US: u64 = 1 << 2;
pub const A: u64 = 1 << 5;
pub const D: u64 = 1 << 6;
pub const PS: u64 = 1 << 7;
pub const NX: u64 = 1 << 63;

/// Flags of an intermediate entry granting everything.
pub const TABLE: u64 = P | RW | US | A;

pub const EPT_R: u64 = 1 << 0;
pub const EPT_W: u64 = 1 << 1;
pub const EPT_X: u64 = 1 << 2;
pub const EPT_RWX: u64 = EPT_R | EPT_W | EPT_X;
pub const EPT_WB: u64 = 6 << 3;
pub const EPT_A: u64 = 1 << 8;
pub const EPT_D: u64 = 1 << 9;

#[repr(C, align(4096))]
pub struct Frame(UnsafeCell<[u8; PAGE_SIZE_4K]>);

impl Frame {
    pub fn zeroed() -> Box<Self> {
        Box::new(Self(UnsafeCell::new([0; PAGE_SIZE_4K])))
    }

    pub fn host_addr(&self) -> usize {
        self.0.get() as usize
    }
}

/// Sparse guest RAM made of 4 KiB frames allocated on first write.
#[derive(Default)]
pub struct GuestRam {
    frames: BTreeMap<usize, Box<Frame>>,
}

impl GuestRam {
    pub fn new() -> Self {
        Self::default()
    }

    fn ptr(&self, gpa: usize) -> *mut u8 {
        let frame = self
            .frames
            .get(&(gpa & !0xfff))
            .unwrap_or_else(|| panic!("GPA {gpa:#x} is not backed"));
        (frame.host_addr() + (gpa & 0xfff)) as *mut u8
    }

    /// Backs the page containing `gpa` with a zeroed frame.
    pub fn back(&mut self, gpa: usize) {
        self.frames.entry(gpa & !0xfff).or_insert_with(Frame::zeroed);
    }

    pub fn host_addr(&self, gpa: usize) -> usize {
        self.ptr(gpa) as usize
    }

    pub fn write_u64(&mut self, gpa: usize, value: u64) {
        self.back(gpa);
        unsafe { self.ptr(gpa).cast::<u64>().write_volatile(value) }
    }

    pub fn write_u32(&mut self, gpa: usize, value: u32) {
        self.back(gpa);
        unsafe { self.ptr(gpa).cast::<u32>().write_volatile(value) }
    }

    pub fn write_bytes(&mut self, gpa: usize, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.back(gpa + i);
            unsafe { self.ptr(gpa + i).write_volatile(*byte) }
        }
    }

    pub fn read_u64(&self, gpa: usize) -> u64 {
        unsafe { self.ptr(gpa).cast::<u64>().read_volatile() }
    }

    pub fn read_u32(&self, gpa: usize) -> u32 {
        unsafe { self.ptr(gpa).cast::<u32>().read_volatile() }
    }

    /// Writes the 64-bit entry `index` of the table at `table`.
    pub fn set_entry(&mut self, table: usize, index: usize, value: u64) {
        self.write_u64(table + index * 8, value);
    }

    pub fn entry(&self, table: usize, index: usize) -> u64 {
        self.read_u64(table + index * 8)
    }

    /// Writes the 32-bit entry `index` of the table at `table`.
    pub fn set_entry32(&mut self, table: usize, index: usize, value: u32) {
        self.write_u32(table + index * 4, value);
    }

    pub fn entry32(&self, table: usize, index: usize) -> u32 {
        self.read_u32(table + index * 4)
    }
}

unsafe impl GuestPhysMemory for GuestRam {
    fn map_phys_page(&self, gpa: GuestPhysAddr) -> Option<HostVirtAddr> {
        self.frames
            .get(&gpa.align_down_4k().as_usize())
            .map(|frame| HostVirtAddr::from(frame.host_addr()))
    }
}

#[derive(Debug, Clone)]
pub struct TestCpu {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    pub eptp: Option<u64>,
    pub features: PagingFeatures,
}

const PAGING: u64 = Cr0Flags::PROTECTED_MODE_ENABLE.bits() | Cr0Flags::PAGING.bits();

impl TestCpu {
    pub fn real() -> Self {
        Self {
            cr0: 0,
            cr3: 0,
            cr4: 0,
            efer: 0,
            eptp: None,
            features: PagingFeatures {
                max_phys_bits: 40,
                gbpages: true,
                ept_execute_only: false,
                ept_gbpages: true,
            },
        }
    }

    pub fn protected() -> Self {
        Self {
            cr0: Cr0Flags::PROTECTED_MODE_ENABLE.bits(),
            ..Self::real()
        }
    }

    pub fn legacy32(cr3: u64, pse: bool) -> Self {
        Self {
            cr0: PAGING,
            cr3,
            cr4: if pse {
                Cr4Flags::PAGE_SIZE_EXTENSION.bits()
            } else {
                0
            },
            ..Self::real()
        }
    }

    pub fn pae(cr3: u64, nxe: bool) -> Self {
        Self {
            cr0: PAGING,
            cr3,
            cr4: Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits(),
            efer: if nxe {
                EferFlags::NO_EXECUTE_ENABLE.bits()
            } else {
                0
            },
            ..Self::real()
        }
    }

    pub fn amd64(cr3: u64, nxe: bool) -> Self {
        let pae = Self::pae(cr3, nxe);
        Self {
            efer: pae.efer
                | EferFlags::LONG_MODE_ENABLE.bits()
                | EferFlags::LONG_MODE_ACTIVE.bits(),
            ..pae
        }
    }

    pub fn ept(eptp: u64) -> Self {
        Self {
            eptp: Some(eptp),
            ..Self::amd64(0, true)
        }
    }

    pub fn with_features(self, features: PagingFeatures) -> Self {
        Self { features, ..self }
    }
}

impl GuestCpuState for TestCpu {
    fn cr0(&self) -> u64 {
        self.cr0
    }

    fn cr3(&self) -> u64 {
        self.cr3
    }

    fn cr4(&self) -> u64 {
        self.cr4
    }

    fn efer(&self) -> u64 {
        self.efer
    }

    fn nested_eptp(&self) -> Option<u64> {
        self.eptp
    }

    fn paging_features(&self) -> PagingFeatures {
        self.features
    }
}

/// A translator that entered the mode of `cpu` with its current root.
pub fn entered(ram: &GuestRam, cpu: &TestCpu) -> GuestTranslator {
    let mut translator = GuestTranslator::new();
    translator
        .enter(ram, cpu, cpu.root_pointer())
        .expect("failed to enter guest paging mode");
    translator
}

/// A 4-level virtual address from its table indices and page offset.
pub const fn va4(l4: usize, l3: usize, l2: usize, l1: usize, offset: usize) -> GuestVirtAddr {
    GuestVirtAddr::from_usize((l4 << 39) | (l3 << 30) | (l2 << 21) | (l1 << 12) | offset)
}

pub fn gva(addr: usize) -> GuestVirtAddr {
    GuestVirtAddr::from(addr)
}

pub fn gpa(addr: usize) -> GuestPhysAddr {
    GuestPhysAddr::from(addr)
}
