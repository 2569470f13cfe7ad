//! Relocation table parts, with and without addends.
//!
//! Entries can name their symbol by a provisional [`SymbolIndex`];
//! the finalize stage rewrites those once the symbol table's local
//! count is frozen.

use anyhow::{bail, Result};
use object::elf;
use object::endian::{I64, U64};
use object::pod::bytes_of;
use object::Endianness;

use crate::blueprint::{Blueprint, Stage};
use crate::part::{PartId, PartKind};
use crate::parts::symtab::{SymbolIndex, SymbolPlace};

pub const REL_ENTSIZE: u64 = 16;
pub const RELA_ENTSIZE: u64 = 24;

fn u64(value: u64) -> U64<Endianness> {
    U64::new(Endianness::Little, value)
}

fn i64(value: i64) -> I64<Endianness> {
    I64::new(Endianness::Little, value)
}

pub(crate) fn structure(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let part = bp.part_mut(id);
    match part.kind() {
        PartKind::RelTable => {
            part.set_name(".rel");
            part.set_entsize(REL_ENTSIZE);
        }
        PartKind::RelaTable => {
            part.set_name(".rela");
            part.set_entsize(RELA_ENTSIZE);
        }
        _ => {}
    }
    Ok(())
}

/// Resolves the target section: the table is named after it, and the
/// `info` field becomes its section header index.
pub(crate) fn initialize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let target = PartId(bp.part(id).info() as usize);
    let valid = target.index() < bp.part_count()
        && !bp.part(target).is_removed()
        && bp.part(target).kind().section_type() == Some(elf::SHT_PROGBITS);
    if !valid {
        bail!("relocation table has no valid target section");
    }
    if let Some(target_name) = bp.part(target).name().map(str::to_string) {
        let mut name = bp.part(id).name().unwrap_or("").to_string();
        name.push_str(&target_name);
        bp.part_mut(id).set_name(&name);
    }
    let section_index = bp.section_index_of(target);
    bp.part_mut(id).set_info(section_index);
    bp.part_mut(id).set_done(true);
    Ok(())
}

/// Rewrites provisional symbol indices into final ones.
pub(crate) fn finalize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let Some(symbols) = bp.part(id).link() else {
        bail!("relocation table has no symbol table set");
    };
    if !bp.part(symbols).done() {
        return Ok(());
    }
    let locals = bp.part(symbols).info();
    let entsize = bp.part(id).entsize() as usize;
    let count = bp.part(id).count() as usize;
    let contents = bp.part_mut(id).contents_mut();
    for n in 0..count {
        let at = n * entsize + 8;
        let info = contents.read_u64(at);
        let symbol = (info >> 32) as u32 as i32;
        if symbol < 0 {
            let index = (locals as i32 - symbol - 1) as u32;
            contents.put_u64(at, ((index as u64) << 32) | (info & 0xffff_ffff));
        }
    }
    bp.part_mut(id).set_done(true);
    Ok(())
}

impl Blueprint {
    /// Appends an entry to a relocation table and returns its index.
    pub fn add_relocation(
        &mut self,
        id: PartId,
        offset: u64,
        symbol: SymbolIndex,
        relocation_type: u32,
    ) -> Result<u64> {
        if !self.part(id).kind().is_relocation_table() {
            bail!("not a relocation table");
        }
        if self.stage() >= Stage::Populated {
            bail!("cannot add to a relocation table after the populate stage");
        }
        let info = ((symbol.to_raw() as u32 as u64) << 32) | relocation_type as u64;
        let kind = self.part(id).kind();
        let part = self.part_mut(id);
        if kind == PartKind::RelTable {
            let entry = elf::Rel64::<Endianness> {
                r_offset: u64(offset),
                r_info: u64(info),
            };
            part.contents_mut().append(bytes_of(&entry));
        } else {
            let entry = elf::Rela64::<Endianness> {
                r_offset: u64(offset),
                r_info: u64(info),
                r_addend: i64(0),
            };
            part.contents_mut().append(bytes_of(&entry));
        }
        let index = part.count();
        part.set_count(index + 1);
        Ok(index)
    }

    /// Appends an entry that refers to a symbol by name, adding the
    /// symbol first if the table's symbol table does not have it yet.
    #[allow(clippy::too_many_arguments)]
    pub fn add_relocation_for_symbol(
        &mut self,
        id: PartId,
        offset: u64,
        relocation_type: u32,
        name: &str,
        bind: u8,
        symbol_type: u8,
        place: SymbolPlace,
    ) -> Result<u64> {
        if !self.part(id).kind().is_relocation_table() {
            bail!("not a relocation table");
        }
        let Some(symbols) = self.part(id).link() else {
            bail!("relocation table has no symbol table set");
        };
        let known = if name.is_empty() {
            None
        } else {
            self.lookup_symbol(symbols, name)?
        };
        let symbol = match known {
            Some(index) => index,
            None => self.add_symbol(symbols, name, bind, symbol_type, place)?,
        };
        self.add_relocation(id, offset, symbol, relocation_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::FileKind;

    fn build() -> (Blueprint, PartId, PartId) {
        let mut bp = Blueprint::new(FileKind::Relocatable);
        bp.add_part(PartKind::FileHeader);
        let text = bp.add_part(PartKind::Text);
        let rel = bp.add_part(PartKind::RelTable);
        let symtab = bp.add_part(PartKind::SymbolTable);
        let strtab = bp.add_part(PartKind::StringTable);
        bp.link_relocation_section(rel, text).unwrap();
        bp.link_relocation_symbols(rel, symtab).unwrap();
        bp.link_symbol_names(symtab, strtab).unwrap();
        bp.structure().unwrap();
        bp.initialize().unwrap();
        (bp, rel, symtab)
    }

    #[test]
    fn the_table_is_named_after_its_target() {
        let (bp, rel, _) = build();
        assert_eq!(bp.part(rel).name(), Some(".rel.text"));
        // .text is section 1
        assert_eq!(bp.part(rel).info(), 1);
    }

    #[test]
    fn a_missing_target_is_rejected() {
        let mut bp = Blueprint::new(FileKind::Relocatable);
        bp.add_part(PartKind::FileHeader);
        bp.add_part(PartKind::RelTable);
        bp.structure().unwrap();
        let err = bp.initialize().unwrap_err();
        assert_eq!(err.to_string(), "relocation table has no valid target section");
    }

    #[test]
    fn deferred_symbols_resolve_at_finalize() {
        let (mut bp, rel, symtab) = build();
        // one local keeps the globals shifting
        let index = bp
            .add_relocation_for_symbol(
                rel,
                9,
                elf::R_X86_64_64,
                "cells",
                elf::STB_GLOBAL,
                elf::STT_OBJECT,
                SymbolPlace::Undefined,
            )
            .unwrap();
        assert_eq!(index, 0);
        bp.add_symbol(symtab, "src", elf::STB_LOCAL, elf::STT_FILE, SymbolPlace::Absolute)
            .unwrap();
        let raw = bp.part(rel).contents().read_u64(8);
        assert_eq!(raw >> 32, 0xffff_ffff); // deferred slot 1, stored negative
        assert_eq!(raw as u32, elf::R_X86_64_64);
        bp.populate().unwrap();
        bp.layout().unwrap();
        bp.finalize().unwrap();
        let resolved = bp.part(rel).contents().read_u64(8);
        // locals are null + src, so the global lands at index 2
        assert_eq!(resolved >> 32, 2);
        assert_eq!(bp.part(rel).contents().read_u64(0), 9);
    }

    #[test]
    fn known_symbols_are_not_added_twice() {
        let (mut bp, rel, symtab) = build();
        bp.add_symbol(symtab, "f", elf::STB_GLOBAL, elf::STT_FUNC, SymbolPlace::Undefined)
            .unwrap();
        let before = bp.part(symtab).count();
        bp.add_relocation_for_symbol(
            rel,
            2,
            elf::R_X86_64_64,
            "f",
            elf::STB_GLOBAL,
            elf::STT_FUNC,
            SymbolPlace::Undefined,
        )
        .unwrap();
        assert_eq!(bp.part(symtab).count(), before);
    }
}
