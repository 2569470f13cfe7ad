//! The `.dynamic` section part.
//!
//! Carries the entries the dynamic loader needs to find the hash
//! table, the dynamic symbols, and their strings. The values are
//! filled in from the linked parts once addresses exist.

use anyhow::{bail, Result};
use object::elf;
use object::endian::U64;
use object::pod::bytes_of;
use object::Endianness;

use crate::blueprint::Blueprint;
use crate::part::{PartId, PartKind};

pub(crate) const DYN_ENTSIZE: u64 = 16;

const TAGS: [u32; 6] = [
    elf::DT_HASH,
    elf::DT_SYMTAB,
    elf::DT_SYMENT,
    elf::DT_STRTAB,
    elf::DT_STRSZ,
    elf::DT_NULL,
];

fn u64(value: u64) -> U64<Endianness> {
    U64::new(Endianness::Little, value)
}

pub(crate) fn structure(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let part = bp.part_mut(id);
    part.set_name(".dynamic");
    part.set_flags(elf::PF_R | elf::PF_W);
    part.set_entsize(DYN_ENTSIZE);
    Ok(())
}

pub(crate) fn initialize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let part = bp.part_mut(id);
    part.set_count(TAGS.len() as u64);
    for tag in TAGS {
        let entry = elf::Dyn64::<Endianness> {
            d_tag: u64(tag as u64),
            d_val: u64(0),
        };
        part.contents_mut().append(bytes_of(&entry));
    }
    part.set_done(true);
    Ok(())
}

/// Chases the hash table's links to find the tables the entries
/// describe.
pub(crate) fn finalize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    if let Some(hash) = bp.find_section_part(elf::SHT_HASH) {
        let addr = bp.part(hash).addr();
        bp.set_dynamic_value(id, elf::DT_HASH, addr)?;
        if let Some(symbols) = bp.part(hash).link() {
            let addr = bp.part(symbols).addr();
            let entsize = bp.part(symbols).entsize();
            bp.set_dynamic_value(id, elf::DT_SYMTAB, addr)?;
            bp.set_dynamic_value(id, elf::DT_SYMENT, entsize)?;
            if let Some(strings) = bp.part(symbols).link() {
                let addr = bp.part(strings).addr();
                let size = bp.part(strings).len();
                bp.set_dynamic_value(id, elf::DT_STRTAB, addr)?;
                bp.set_dynamic_value(id, elf::DT_STRSZ, size)?;
            }
        }
    }
    bp.part_mut(id).set_done(true);
    Ok(())
}

impl Blueprint {
    /// Sets the value of the entry with the given tag in a dynamic
    /// section part.
    pub fn set_dynamic_value(&mut self, id: PartId, tag: u32, value: u64) -> Result<()> {
        if self.part(id).kind() != PartKind::Dynamic {
            bail!("not a dynamic section");
        }
        let count = self.part(id).count() as usize;
        let contents = self.part_mut(id).contents_mut();
        for n in 0..count.saturating_sub(1) {
            if contents.read_u64(n * DYN_ENTSIZE as usize) == tag as u64 {
                contents.put_u64(n * DYN_ENTSIZE as usize + 8, value);
                return Ok(());
            }
        }
        bail!("dynamic section has no tag {tag} entry");
    }
}
