//! The ELF file header part.

use anyhow::{bail, Result};
use object::elf;
use object::endian::{U16, U32, U64};
use object::pod::bytes_of;
use object::Endianness;

use crate::blueprint::Blueprint;
use crate::part::{PartId, PartKind};

/// Size of the ELF64 file header.
pub const EHDR_SIZE: usize = 64;

// Byte offsets of the header fields that get patched after the
// structure stage.
const E_TYPE: usize = 16;
const E_MACHINE: usize = 18;
const E_ENTRY: usize = 24;
const E_PHOFF: usize = 32;
const E_SHOFF: usize = 40;
const E_PHENTSIZE: usize = 54;
const E_PHNUM: usize = 56;
const E_SHENTSIZE: usize = 58;
const E_SHNUM: usize = 60;
const E_SHSTRNDX: usize = 62;

fn u16(value: u16) -> U16<Endianness> {
    U16::new(Endianness::Little, value)
}

fn u32(value: u32) -> U32<Endianness> {
    U32::new(Endianness::Little, value)
}

fn u64(value: u64) -> U64<Endianness> {
    U64::new(Endianness::Little, value)
}

pub(crate) fn structure(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let header = elf::FileHeader64::<Endianness> {
        e_ident: elf::Ident {
            magic: elf::ELFMAG,
            class: elf::ELFCLASS64,
            data: elf::ELFDATA2LSB,
            version: elf::EV_CURRENT,
            os_abi: elf::ELFOSABI_NONE,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: u16(0),
        e_machine: u16(0),
        e_version: u32(elf::EV_CURRENT as u32),
        e_entry: u64(0),
        e_phoff: u64(0),
        e_shoff: u64(0),
        e_flags: u32(0),
        e_ehsize: u16(EHDR_SIZE as u16),
        e_phentsize: u16(0),
        e_phnum: u16(0),
        e_shentsize: u16(0),
        e_shnum: u16(0),
        e_shstrndx: u16(0),
    };
    let part = bp.part_mut(id);
    part.set_flags(elf::PF_R);
    part.contents_mut().append(bytes_of(&header));
    Ok(())
}

pub(crate) fn initialize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let elf_type = bp.file_kind().elf_type();
    let part = bp.part_mut(id);
    part.contents_mut().put_u16(E_TYPE, elf_type);
    part.set_done(true);
    Ok(())
}

/// Fills in the header table locations from wherever the tables ended
/// up. A removed table leaves its fields zero, so a stripped file
/// reports no section headers at all.
pub(crate) fn finalize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let phdrs = bp.first_part(PartKind::ProgramHeaders).map(|p| {
        let part = bp.part(p);
        (part.offset(), part.count(), part.entsize())
    });
    let shdrs = bp.first_part(PartKind::SectionHeaders).map(|p| {
        let part = bp.part(p);
        (part.offset(), part.count(), part.entsize())
    });
    let contents = bp.part_mut(id).contents_mut();
    if let Some((offset, count, entsize)) = phdrs {
        contents.put_u64(E_PHOFF, offset);
        contents.put_u16(E_PHNUM, count as u16);
        contents.put_u16(E_PHENTSIZE, entsize as u16);
    }
    if let Some((offset, count, entsize)) = shdrs {
        contents.put_u64(E_SHOFF, offset);
        contents.put_u16(E_SHNUM, count as u16);
        contents.put_u16(E_SHENTSIZE, entsize as u16);
    }
    if contents.read_u16(E_MACHINE) == 0 {
        contents.put_u16(E_MACHINE, elf::EM_X86_64);
    }
    bp.part_mut(id).set_done(true);
    Ok(())
}

/// Records where the section header table found its name table.
pub(crate) fn set_section_name_index(bp: &mut Blueprint, index: u16) {
    if let Some(id) = bp.first_part(PartKind::FileHeader) {
        bp.part_mut(id).contents_mut().put_u16(E_SHSTRNDX, index);
    }
}

impl Blueprint {
    /// Sets the address execution starts at. Only meaningful once the
    /// layout stage has assigned addresses.
    pub fn set_entry_point(&mut self, entry: u64) -> Result<()> {
        let Some(id) = self.first_part(PartKind::FileHeader) else {
            bail!("blueprint has no file header");
        };
        self.part_mut(id).contents_mut().put_u64(E_ENTRY, entry);
        Ok(())
    }
}
