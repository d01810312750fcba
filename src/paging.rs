//! Guest virtual to guest physical translation.
//!
//! Page table entries are read through [`GuestMemory::read_physical`], so
//! table pages that are not backed yet go through the missing-page handler
//! like any other physical access. A non-present entry is a translation
//! fault and is never retried here.
use crate::error::{EmuError, Result};
use crate::mem::GuestMemory;
use bitflags::bitflags;
use tracing::trace;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NX = 1 << 63;
    }
}

/// Physical frame bits of a 64-bit table entry (MAXPHYADDR = 52).
pub const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

const LEGACY_ADDR_MASK: u64 = 0xffff_f000;
const LEGACY_LARGE_MASK: u64 = 0xffc0_0000;
const PAE_PDPT_MASK: u64 = 0xffff_ffe0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// CR0.PG clear: linear addresses are physical addresses.
    Disabled,
    /// 32-bit two-level paging. `pse` enables 4 MiB pages.
    Legacy { pse: bool },
    /// 32-bit PAE three-level paging with 2 MiB pages.
    Pae,
    /// IA-32e four-level paging.
    Long4,
    /// IA-32e five-level paging (CR4.LA57).
    Long5,
}

/// The active paging structures: a mode and the root table address (cr3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    pub mode: PagingMode,
    pub root: u64,
}

impl Paging {
    pub fn new(mode: PagingMode, root: u64) -> Self {
        Self { mode, root }
    }

    /// Four-level long mode paging rooted at `cr3`.
    pub fn long(cr3: u64) -> Self {
        Self::new(PagingMode::Long4, cr3)
    }

    pub fn disabled() -> Self {
        Self::new(PagingMode::Disabled, 0)
    }

    pub fn translate(&self, mem: &GuestMemory, gva: u64) -> Result<u64> {
        let gpa = match self.mode {
            PagingMode::Disabled => Ok(gva),
            PagingMode::Legacy { pse } => walk_legacy(mem, self.root, gva as u32 as u64, pse),
            PagingMode::Pae => walk_pae(mem, self.root, gva as u32 as u64),
            PagingMode::Long4 => {
                check_canonical(gva, 48)?;
                walk_long(mem, gva, self.root & PTE_ADDR_MASK, 4)
            }
            PagingMode::Long5 => {
                check_canonical(gva, 57)?;
                walk_long(mem, gva, self.root & PTE_ADDR_MASK, 5)
            }
        };

        match &gpa {
            Ok(gpa) => trace!(
                gva = format_args!("{gva:#x}"),
                gpa = format_args!("{gpa:#x}"),
                "translated"
            ),
            Err(e) => trace!(gva = format_args!("{gva:#x}"), error = %e, "translation failed"),
        }
        gpa
    }
}

fn check_canonical(gva: u64, bits: u32) -> Result<()> {
    let shift = 64 - bits;
    if (((gva << shift) as i64) >> shift) as u64 == gva {
        Ok(())
    } else {
        Err(EmuError::NonCanonical(gva))
    }
}

/// Walk 8-byte-entry tables with 9 index bits per level, starting at
/// `level` (5 = PML5, 4 = PML4, 3 = PDPT, 2 = PD, 1 = PT).
fn walk_long(mem: &GuestMemory, gva: u64, mut table: u64, mut level: u8) -> Result<u64> {
    loop {
        let shift = 12 + 9 * (level as u32 - 1);
        let index = (gva >> shift) & 0x1ff;
        let entry = mem.read_phys_u64(table + index * 8)?;
        let flags = PteFlags::from_bits_retain(entry);

        if !flags.contains(PteFlags::PRESENT) {
            return Err(EmuError::TranslationFault { gva, level });
        }

        let frame = entry & PTE_ADDR_MASK;
        if level == 1 {
            return Ok(frame | (gva & 0xfff));
        }

        if flags.contains(PteFlags::HUGE) {
            // PS is only meaningful in a PDPTE (1 GiB) or PDE (2 MiB).
            if level > 3 {
                return Err(EmuError::TranslationFault { gva, level });
            }
            let size_mask = (1u64 << shift) - 1;
            return Ok((frame & !size_mask) | (gva & size_mask));
        }

        table = frame;
        level -= 1;
    }
}

fn walk_pae(mem: &GuestMemory, cr3: u64, gva: u64) -> Result<u64> {
    let index = (gva >> 30) & 0x3;
    let pdpte = mem.read_phys_u64((cr3 & PAE_PDPT_MASK) + index * 8)?;
    if pdpte & PteFlags::PRESENT.bits() == 0 {
        return Err(EmuError::TranslationFault { gva, level: 3 });
    }
    walk_long(mem, gva, pdpte & PTE_ADDR_MASK, 2)
}

fn walk_legacy(mem: &GuestMemory, cr3: u64, gva: u64, pse: bool) -> Result<u64> {
    let pd = cr3 & LEGACY_ADDR_MASK;
    let pde = mem.read_phys_u32(pd + ((gva >> 22) & 0x3ff) * 4)? as u64;
    if pde & PteFlags::PRESENT.bits() == 0 {
        return Err(EmuError::TranslationFault { gva, level: 2 });
    }

    if pse && pde & PteFlags::HUGE.bits() != 0 {
        return Ok((pde & LEGACY_LARGE_MASK) | (gva & 0x3f_ffff));
    }

    let pt = pde & LEGACY_ADDR_MASK;
    let pte = mem.read_phys_u32(pt + ((gva >> 12) & 0x3ff) * 4)? as u64;
    if pte & PteFlags::PRESENT.bits() == 0 {
        return Err(EmuError::TranslationFault { gva, level: 1 });
    }

    Ok((pte & LEGACY_ADDR_MASK) | (gva & 0xfff))
}
