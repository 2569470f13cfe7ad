//! String table parts.
//!
//! A string table is a bag of NUL-terminated strings. Offset zero is
//! always the empty string.

use anyhow::{bail, Result};
use object::elf;

use crate::blueprint::{Blueprint, Stage};
use crate::part::{PartId, PartKind};

pub(crate) fn structure(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let part = bp.part_mut(id);
    match part.kind() {
        PartKind::StringTable => part.set_name(".strtab"),
        PartKind::DynamicStringTable => {
            part.set_name(".dynstr");
            part.set_flags(elf::PF_R);
        }
        PartKind::SectionNameTable => part.set_name(".shstrtab"),
        _ => {}
    }
    part.contents_mut().push(0);
    Ok(())
}

impl Blueprint {
    /// Adds a string to a string table part and returns its offset.
    /// The empty string is always at offset zero, and a string equal
    /// to the table's most recent addition reuses that one's offset.
    pub fn add_string(&mut self, id: PartId, string: &str) -> Result<u32> {
        if !self.part(id).kind().is_string_table() {
            bail!("not a string table");
        }
        if self.stage() >= Stage::Populated {
            bail!("cannot add to a string table after the populate stage");
        }
        if string.is_empty() {
            return Ok(0);
        }
        let contents = self.part_mut(id).contents_mut();
        let bytes = string.as_bytes();
        let terminated = bytes.len() + 1;
        if contents.len() > terminated {
            let tail = contents.len() - terminated;
            if &contents.bytes()[tail..tail + bytes.len()] == bytes
                && contents.bytes()[contents.len() - 1] == 0
            {
                return Ok(tail as u32);
            }
        }
        let offset = contents.len() as u32;
        contents.append(bytes);
        contents.push(0);
        Ok(offset)
    }
}
