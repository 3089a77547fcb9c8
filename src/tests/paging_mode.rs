//! Paging mode selection and the geometry of each mode.

use super::guest_mem::*;
use crate::{EntryFormat, GuestCpuState, PageSize, PagingMode};

#[test]
fn test_mode_from_cpu_state() {
    let cases = [
        (TestCpu::real(), PagingMode::Real),
        (TestCpu::protected(), PagingMode::Protected),
        (TestCpu::legacy32(0x1000, false), PagingMode::ThirtyTwoBit),
        (TestCpu::legacy32(0x1000, true), PagingMode::ThirtyTwoBit),
        (TestCpu::pae(0x1000, true), PagingMode::Pae),
        (TestCpu::amd64(0x1000, false), PagingMode::Amd64),
        (TestCpu::ept(0x101e), PagingMode::Ept),
    ];
    for (cpu, mode) in cases {
        assert_eq!(PagingMode::from_cpu_state(&cpu), mode, "{cpu:?}");
        assert_eq!(mode.is_paging(), mode.desc().is_some());
    }
}

#[test]
fn test_paging_bit_without_protection() {
    // CR0.PG without CR0.PE cannot be loaded; treat it as real mode
    let cpu = TestCpu {
        cr0: 1 << 31,
        ..TestCpu::real()
    };
    assert_eq!(PagingMode::from_cpu_state(&cpu), PagingMode::Real);
}

#[test]
fn test_long_mode_enabled_but_inactive() {
    let cpu = TestCpu {
        efer: 1 << 8,
        ..TestCpu::pae(0x1000, false)
    };
    assert_eq!(PagingMode::from_cpu_state(&cpu), PagingMode::Pae);
}

#[test]
fn test_root_pointer() {
    let cpu = TestCpu::amd64(0x5000, true);
    assert_eq!(cpu.root_pointer(), 0x5000);
    let cpu = TestCpu::ept(0x101e);
    assert_eq!(cpu.root_pointer(), 0x101e);
}

#[test]
fn test_geometry() {
    let legacy = PagingMode::ThirtyTwoBit.desc().unwrap();
    assert_eq!(legacy.format, EntryFormat::Legacy32);
    assert_eq!(legacy.entry_size, 4);
    assert_eq!(legacy.top_level(), 2);
    assert_eq!(legacy.levels.len(), 2);
    assert_eq!(legacy.levels[0].big_page, Some(PageSize::Size4M));
    assert_eq!(legacy.levels[0].index_of(0x00a1_2345), 2);
    assert_eq!(legacy.levels[1].entry_count(), 1024);

    let pae = PagingMode::Pae.desc().unwrap();
    assert_eq!(pae.top_level(), 3);
    assert_eq!(pae.levels[0].entry_count(), 4);
    assert_eq!(pae.levels[0].entry_span(), 1 << 30);
    assert_eq!(pae.levels[1].big_page, Some(PageSize::Size2M));

    for mode in [PagingMode::Amd64, PagingMode::Ept] {
        let desc = mode.desc().unwrap();
        assert_eq!(desc.mode, mode);
        assert_eq!(desc.entry_size, 8);
        let levels: alloc::vec::Vec<u8> = desc.levels.iter().map(|lvl| lvl.level).collect();
        assert_eq!(levels, [4, 3, 2, 1]);
        assert_eq!(desc.levels[1].big_page, Some(PageSize::Size1G));
        assert_eq!(desc.levels[3].index_of(va4(1, 2, 3, 4, 5).as_usize() as u64), 4);
        assert_eq!(desc.levels[0].index_of(va4(1, 2, 3, 4, 5).as_usize() as u64), 1);
    }
}

#[test]
fn test_address_width() {
    let amd64 = PagingMode::Amd64.desc().unwrap();
    assert!(amd64.is_valid_vaddr(0x0000_7fff_ffff_ffff));
    assert!(amd64.is_valid_vaddr(0xffff_8000_0000_0000));
    assert!(!amd64.is_valid_vaddr(0x0000_8000_0000_0000));
    assert!(!amd64.is_valid_vaddr(0xfff7_8000_0000_0000));

    // guest physical addresses have no sign extension
    let ept = PagingMode::Ept.desc().unwrap();
    assert!(ept.is_valid_vaddr(0x0000_ffff_ffff_ffff));
    assert!(!ept.is_valid_vaddr(0xffff_8000_0000_0000));

    let pae = PagingMode::Pae.desc().unwrap();
    assert!(pae.is_valid_vaddr(0xffff_ffff));
    assert!(!pae.is_valid_vaddr(0x1_0000_0000));
}

#[test]
fn test_page_sizes() {
    assert_eq!(PageSize::Size4K.bytes(), 0x1000);
    assert_eq!(PageSize::Size4M.offset_mask(), 0x3f_ffff);
    assert_eq!(PageSize::Size1G.bytes(), 0x4000_0000);
    assert!(!PageSize::Size4K.is_huge());
    assert!(PageSize::Size2M.is_huge());
}

#[test]
fn test_directory_and_page_table_levels() {
    for mode in [PagingMode::ThirtyTwoBit, PagingMode::Pae, PagingMode::Amd64, PagingMode::Ept] {
        let desc = mode.desc().unwrap();
        assert_eq!(desc.page_table_level().level, 1);
        assert_eq!(desc.directory_levels().len(), desc.levels.len() - 1);
        assert!(desc.directory_levels().iter().all(|lvl| lvl.level > 1));
    }
}
