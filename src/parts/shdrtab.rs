//! The section header table part.
//!
//! Waits for every section part to settle, then mirrors their names,
//! types, sizes, and placements into header entries. Entry zero is
//! the reserved null header.

use anyhow::Result;
use object::elf;

use crate::blueprint::Blueprint;
use crate::part::PartId;
use crate::parts::ehdr;

pub(crate) const SHDR_ENTSIZE: u64 = 64;

// Byte offsets of the fields within one header entry.
const SH_NAME: usize = 0;
const SH_TYPE: usize = 4;
const SH_FLAGS: usize = 8;
const SH_ADDR: usize = 16;
const SH_OFFSET: usize = 24;
const SH_SIZE: usize = 32;
const SH_LINK: usize = 40;
const SH_INFO: usize = 44;
const SH_ADDRALIGN: usize = 48;
const SH_ENTSIZE: usize = 56;

pub(crate) fn structure(bp: &mut Blueprint, id: PartId) -> Result<()> {
    bp.part_mut(id).set_entsize(SHDR_ENTSIZE);
    Ok(())
}

/// Sizes the table once every section part has settled its form.
pub(crate) fn initialize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    for pid in bp.part_ids() {
        let part = bp.part(pid);
        if part.is_section() && !part.done() {
            return Ok(());
        }
    }
    let count = 1 + bp.section_count();
    let part = bp.part_mut(id);
    part.set_count(count);
    part.contents_mut().resize((count * SHDR_ENTSIZE) as usize);
    part.set_done(true);
    Ok(())
}

/// Registers every section's name in the name table and tells the
/// file header which section that table is. Sections removed since
/// the initialize stage drop out of the count here.
pub(crate) fn populate(bp: &mut Blueprint, id: PartId) -> Result<()> {
    if let Some(strings) = bp.part(id).link() {
        let mut index = 1u64;
        let mut name_table_index = 0u16;
        let mut names = Vec::new();
        for pid in bp.part_ids() {
            let part = bp.part(pid);
            if !part.is_section() {
                continue;
            }
            if let Some(name) = part.name() {
                names.push((index, name.to_string()));
            }
            if pid == strings {
                name_table_index = index as u16;
            }
            index += 1;
        }
        for (entry, name) in names {
            let offset = bp.add_string(strings, &name)?;
            bp.part_mut(id)
                .contents_mut()
                .put_u32((entry * SHDR_ENTSIZE) as usize + SH_NAME, offset);
        }
        ehdr::set_section_name_index(bp, name_table_index);
        bp.part_mut(id).set_link(None);
        if bp.part(id).count() != index {
            bp.part_mut(id).set_count(index);
            bp.part_mut(id)
                .contents_mut()
                .resize((index * SHDR_ENTSIZE) as usize);
        }
    }
    bp.part_mut(id).set_done(true);
    Ok(())
}

pub(crate) fn finalize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    for pid in bp.part_ids() {
        let part = bp.part(pid);
        if part.is_section() && !part.done() {
            return Ok(());
        }
    }
    struct Entry {
        sh_type: u32,
        flags: u64,
        addr: u64,
        offset: u64,
        size: u64,
        link: u32,
        info: u32,
        addralign: u64,
        entsize: u64,
    }
    let mut entries = Vec::new();
    for pid in bp.part_ids() {
        let part = bp.part(pid);
        if !part.is_section() {
            continue;
        }
        let (flags, addralign) = if part.flags() != 0 {
            let mut flags = elf::SHF_ALLOC as u64;
            let mut addralign = 8;
            if part.flags() & elf::PF_W != 0 {
                flags |= elf::SHF_WRITE as u64;
            }
            if part.flags() & elf::PF_X != 0 {
                flags |= elf::SHF_EXECINSTR as u64;
                addralign = 16;
            }
            (flags, addralign)
        } else if part.entsize() != 0 {
            (0, 8)
        } else {
            (0, 0)
        };
        entries.push(Entry {
            sh_type: part.kind().section_type().unwrap_or(0),
            flags,
            addr: part.addr(),
            offset: part.offset(),
            size: part.len(),
            link: part.link().map_or(0, |l| bp.section_index_of(l)),
            info: part.info(),
            addralign,
            entsize: part.entsize(),
        });
    }
    let contents = bp.part_mut(id).contents_mut();
    for (n, entry) in entries.iter().enumerate() {
        let base = (n + 1) * SHDR_ENTSIZE as usize;
        contents.put_u32(base + SH_TYPE, entry.sh_type);
        contents.put_u64(base + SH_FLAGS, entry.flags);
        contents.put_u64(base + SH_ADDR, entry.addr);
        contents.put_u64(base + SH_OFFSET, entry.offset);
        contents.put_u64(base + SH_SIZE, entry.size);
        if entry.link != 0 {
            contents.put_u32(base + SH_LINK, entry.link);
        }
        if entry.info != 0 {
            contents.put_u32(base + SH_INFO, entry.info);
        }
        contents.put_u64(base + SH_ADDRALIGN, entry.addralign);
        contents.put_u64(base + SH_ENTSIZE, entry.entsize);
    }
    bp.part_mut(id).set_done(true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::FileKind;
    use crate::part::PartKind;

    fn build() -> (Blueprint, PartId) {
        let mut bp = Blueprint::new(FileKind::Relocatable);
        bp.add_part(PartKind::FileHeader);
        bp.add_part(PartKind::Text);
        let shstrtab = bp.add_part(PartKind::SectionNameTable);
        let shdrs = bp.add_part(PartKind::SectionHeaders);
        bp.link_section_names(shdrs, shstrtab).unwrap();
        bp.structure().unwrap();
        bp.initialize().unwrap();
        bp.populate().unwrap();
        bp.layout().unwrap();
        bp.finalize().unwrap();
        (bp, shdrs)
    }

    #[test]
    fn the_null_entry_stays_blank() {
        let (bp, shdrs) = build();
        assert_eq!(bp.part(shdrs).count(), 3);
        assert_eq!(&bp.part(shdrs).contents().bytes()[..64], &[0; 64]);
    }

    #[test]
    fn entries_mirror_their_parts() {
        let (bp, shdrs) = build();
        let contents = bp.part(shdrs).contents();
        // entry 1 is .text
        assert_eq!(contents.read_u32(64 + SH_TYPE), elf::SHT_PROGBITS);
        assert_eq!(
            contents.read_u64(64 + SH_FLAGS),
            (elf::SHF_ALLOC | elf::SHF_EXECINSTR) as u64
        );
        assert_eq!(contents.read_u64(64 + SH_ADDRALIGN), 16);
        // entry 2 is .shstrtab, unloaded and unaligned
        assert_eq!(contents.read_u32(128 + SH_TYPE), elf::SHT_STRTAB);
        assert_eq!(contents.read_u64(128 + SH_FLAGS), 0);
        assert_eq!(contents.read_u64(128 + SH_ADDRALIGN), 0);
        assert_eq!(contents.read_u64(128 + SH_OFFSET), bp.part(PartId(2)).offset());
        assert_eq!(contents.read_u64(128 + SH_SIZE), bp.part(PartId(2)).len());
    }

    #[test]
    fn section_names_land_in_the_name_table() {
        let (bp, shdrs) = build();
        let contents = bp.part(shdrs).contents();
        let names = bp.part(PartId(2)).contents();
        let text_name = contents.read_u32(64 + SH_NAME) as usize;
        assert_eq!(names.cstr_at(text_name), b".text");
        let shstrtab_name = contents.read_u32(128 + SH_NAME) as usize;
        assert_eq!(names.cstr_at(shstrtab_name), b".shstrtab");
    }

    #[test]
    fn the_header_learns_the_name_table_index() {
        let (bp, _) = build();
        let header = bp.part(PartId(0)).contents();
        assert_eq!(header.read_u16(62), 2); // e_shstrndx
        assert_eq!(header.read_u16(60), 3); // e_shnum
    }

    #[test]
    fn late_removals_shrink_the_table() {
        let mut bp = Blueprint::new(FileKind::Relocatable);
        bp.add_part(PartKind::FileHeader);
        let text = bp.add_part(PartKind::Text);
        let comment = bp.add_part(PartKind::Progbits);
        let shstrtab = bp.add_part(PartKind::SectionNameTable);
        let shdrs = bp.add_part(PartKind::SectionHeaders);
        bp.link_section_names(shdrs, shstrtab).unwrap();
        bp.structure().unwrap();
        bp.initialize().unwrap();
        assert_eq!(bp.part(shdrs).count(), 4);
        bp.remove_part(comment).unwrap();
        bp.populate().unwrap();
        assert_eq!(bp.part(shdrs).count(), 3);
        let _ = text;
    }
}
