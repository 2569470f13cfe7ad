//! The program header table part.
//!
//! The table always describes two load segments: one read-execute
//! segment covering the file's read-only parts and one read-write
//! segment covering the writable parts. Files with a dynamic section
//! get a third entry pointing the loader at it.

use anyhow::Result;
use object::elf;
use object::endian::{U32, U64};
use object::pod::bytes_of;
use object::Endianness;

use crate::blueprint::Blueprint;
use crate::part::PartId;

pub(crate) const PHDR_ENTSIZE: u64 = 56;

// Byte offsets of the entry fields patched at the finalize stage.
const P_OFFSET: usize = 8;
const P_VADDR: usize = 16;
const P_PADDR: usize = 24;
const P_FILESZ: usize = 32;
const P_MEMSZ: usize = 40;

fn u32(value: u32) -> U32<Endianness> {
    U32::new(Endianness::Little, value)
}

fn u64(value: u64) -> U64<Endianness> {
    U64::new(Endianness::Little, value)
}

pub(crate) fn structure(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let part = bp.part_mut(id);
    part.set_flags(elf::PF_R);
    part.set_entsize(PHDR_ENTSIZE);
    Ok(())
}

pub(crate) fn populate(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let has_dynamic = bp.find_section_part(elf::SHT_DYNAMIC).is_some();
    let count: u64 = if has_dynamic { 3 } else { 2 };
    let part = bp.part_mut(id);
    part.set_count(count);
    part.contents_mut().resize((count * PHDR_ENTSIZE) as usize);

    let entry = |p_type: u32, p_flags: u32, p_align: u64| elf::ProgramHeader64::<Endianness> {
        p_type: u32(p_type),
        p_flags: u32(p_flags),
        p_offset: u64(0),
        p_vaddr: u64(0),
        p_paddr: u64(0),
        p_filesz: u64(0),
        p_memsz: u64(0),
        p_align: u64(p_align),
    };
    let text = entry(elf::PT_LOAD, elf::PF_R | elf::PF_X, 0x1000);
    part.contents_mut().overwrite(0, bytes_of(&text));
    let data = entry(elf::PT_LOAD, elf::PF_R | elf::PF_W, 0x1000);
    part.contents_mut()
        .overwrite(PHDR_ENTSIZE as usize, bytes_of(&data));
    if has_dynamic {
        let dynamic = entry(elf::PT_DYNAMIC, elf::PF_R | elf::PF_W, 8);
        part.contents_mut()
            .overwrite(2 * PHDR_ENTSIZE as usize, bytes_of(&dynamic));
    }
    part.set_done(true);
    Ok(())
}

/// Derives each segment's coverage from where the loaded parts ended
/// up: the lowest offset of any covered part and the extent up to the
/// end of the highest.
pub(crate) fn finalize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let mut text_seg = None::<(u64, u64, u64)>; // offset, vaddr, end
    let mut data_seg = None::<(u64, u64, u64)>;
    for pid in bp.part_ids() {
        let part = bp.part(pid);
        if part.is_removed() || part.flags() & elf::PF_R == 0 {
            continue;
        }
        let seg = if part.flags() & elf::PF_W != 0 {
            &mut data_seg
        } else {
            &mut text_seg
        };
        let end = part.offset() + part.len();
        match seg {
            None => *seg = Some((part.offset(), part.addr(), end)),
            Some(covered) => {
                if covered.0 > part.offset() {
                    covered.0 = part.offset();
                    covered.1 = part.addr();
                }
                if covered.2 < end {
                    covered.2 = end;
                }
            }
        }
    }
    let dynamic = bp.find_section_part(elf::SHT_DYNAMIC).map(|d| {
        let part = bp.part(d);
        (part.offset(), part.addr(), part.len())
    });

    let count = bp.part(id).count();
    let contents = bp.part_mut(id).contents_mut();
    let mut fill = |entry: u64, offset: u64, vaddr: u64, size: u64| {
        let base = (entry * PHDR_ENTSIZE) as usize;
        contents.put_u64(base + P_OFFSET, offset);
        contents.put_u64(base + P_VADDR, vaddr);
        contents.put_u64(base + P_PADDR, vaddr);
        contents.put_u64(base + P_FILESZ, size);
        contents.put_u64(base + P_MEMSZ, size);
    };
    if let Some((offset, vaddr, end)) = text_seg {
        fill(0, offset, vaddr, end - offset);
    }
    if let Some((offset, vaddr, end)) = data_seg {
        fill(1, offset, vaddr, end - offset);
    }
    if count > 2 {
        if let Some((offset, vaddr, size)) = dynamic {
            fill(2, offset, vaddr, size);
        }
    }
    bp.part_mut(id).set_done(true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::FileKind;
    use crate::part::PartKind;

    #[test]
    fn two_load_segments_cover_the_file() {
        let mut bp = Blueprint::new(FileKind::Executable);
        bp.add_part(PartKind::FileHeader);
        let phdrs = bp.add_part(PartKind::ProgramHeaders);
        let text = bp.add_part(PartKind::Text);
        let data = bp.add_part(PartKind::Data);
        bp.structure().unwrap();
        bp.initialize().unwrap();
        bp.part_mut(text).contents_mut().resize(0x30);
        bp.part_mut(data).contents_mut().resize(0x20);
        bp.populate().unwrap();
        bp.layout().unwrap();
        bp.finalize().unwrap();

        let contents = bp.part(phdrs).contents();
        assert_eq!(bp.part(phdrs).count(), 2);
        // read-execute segment spans the header through .text
        assert_eq!(contents.read_u32(0), elf::PT_LOAD);
        assert_eq!(contents.read_u32(4), elf::PF_R | elf::PF_X);
        assert_eq!(contents.read_u64(P_OFFSET), 0);
        assert_eq!(contents.read_u64(P_VADDR), 0x400000);
        let text_end = bp.part(text).offset() + 0x30;
        assert_eq!(contents.read_u64(P_FILESZ), text_end);
        assert_eq!(contents.read_u64(P_MEMSZ), text_end);
        // read-write segment covers .data alone
        let base = PHDR_ENTSIZE as usize;
        assert_eq!(contents.read_u32(base + 4), elf::PF_R | elf::PF_W);
        assert_eq!(contents.read_u64(base + P_OFFSET), bp.part(data).offset());
        assert_eq!(contents.read_u64(base + P_VADDR), bp.part(data).addr());
        assert_eq!(contents.read_u64(base + P_FILESZ), 0x20);
    }

    #[test]
    fn a_dynamic_section_adds_a_third_entry() {
        let mut bp = Blueprint::new(FileKind::SharedObject);
        bp.add_part(PartKind::FileHeader);
        let phdrs = bp.add_part(PartKind::ProgramHeaders);
        let text = bp.add_part(PartKind::Text);
        let dynamic = bp.add_part(PartKind::Dynamic);
        bp.structure().unwrap();
        bp.initialize().unwrap();
        bp.part_mut(text).contents_mut().resize(8);
        bp.populate().unwrap();
        bp.layout().unwrap();
        bp.finalize().unwrap();

        let contents = bp.part(phdrs).contents();
        assert_eq!(bp.part(phdrs).count(), 3);
        let base = 2 * PHDR_ENTSIZE as usize;
        assert_eq!(contents.read_u32(base), elf::PT_DYNAMIC);
        assert_eq!(contents.read_u64(base + 48), 8); // p_align
        assert_eq!(contents.read_u64(base + P_OFFSET), bp.part(dynamic).offset());
        assert_eq!(contents.read_u64(base + P_VADDR), bp.part(dynamic).addr());
        assert_eq!(contents.read_u64(base + P_FILESZ), 96);
    }

    #[test]
    fn removed_parts_do_not_stretch_a_segment() {
        let mut bp = Blueprint::new(FileKind::Executable);
        bp.add_part(PartKind::FileHeader);
        let phdrs = bp.add_part(PartKind::ProgramHeaders);
        let text = bp.add_part(PartKind::Text);
        let data = bp.add_part(PartKind::Data);
        let extra = bp.add_part(PartKind::Data);
        bp.structure().unwrap();
        bp.initialize().unwrap();
        bp.part_mut(text).contents_mut().resize(0x10);
        bp.part_mut(data).contents_mut().resize(0x10);
        bp.part_mut(extra).contents_mut().resize(0x1000);
        bp.remove_part(extra).unwrap();
        bp.populate().unwrap();
        bp.layout().unwrap();
        bp.finalize().unwrap();

        let contents = bp.part(phdrs).contents();
        let base = PHDR_ENTSIZE as usize;
        assert_eq!(contents.read_u64(base + P_FILESZ), 0x10);
    }
}
