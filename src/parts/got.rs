//! The global offset table part.
//!
//! The table opens with three reserved entries; the first holds the
//! address of the dynamic section once layout has run. Its own
//! address is exported through the dynamic symbol table.

use anyhow::Result;
use object::elf;

use crate::blueprint::Blueprint;
use crate::part::PartId;
use crate::parts::symtab::SymbolPlace;

/// Symbol name under which the table's address is exported.
pub const GOT_SYMBOL: &str = "_GLOBAL_OFFSET_TABLE_";

const GOT_ENTSIZE: u64 = 8;
const RESERVED_ENTRIES: u64 = 3;

pub(crate) fn structure(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let part = bp.part_mut(id);
    part.set_name(".got");
    part.set_flags(elf::PF_R | elf::PF_W);
    part.set_entsize(GOT_ENTSIZE);
    Ok(())
}

pub(crate) fn initialize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let part = bp.part_mut(id);
    part.set_count(RESERVED_ENTRIES);
    part.contents_mut()
        .resize((RESERVED_ENTRIES * GOT_ENTSIZE) as usize);
    if let Some(dynsym) = bp.find_section_part(elf::SHT_DYNSYM) {
        bp.add_symbol(
            dynsym,
            GOT_SYMBOL,
            elf::STB_GLOBAL,
            elf::STT_OBJECT,
            SymbolPlace::Absolute,
        )?;
    }
    bp.part_mut(id).set_done(true);
    Ok(())
}

pub(crate) fn finalize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let addr = bp.part(id).addr();
    let mut dynamic_addr = None;
    let mut symbol_tables = Vec::new();
    for pid in bp.part_ids() {
        let part = bp.part(pid);
        if part.is_removed() {
            continue;
        }
        match part.kind().section_type() {
            Some(elf::SHT_DYNAMIC) => dynamic_addr = Some(part.addr()),
            Some(elf::SHT_DYNSYM) => symbol_tables.push(pid),
            _ => {}
        }
    }
    if let Some(dynamic_addr) = dynamic_addr {
        bp.part_mut(id).contents_mut().put_u64(0, dynamic_addr);
    }
    for table in symbol_tables {
        bp.set_symbol_value(table, GOT_SYMBOL, addr)?;
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
    fn reserves_three_entries_and_exports_its_address() {
        let mut bp = Blueprint::new(FileKind::SharedObject);
        let dynsym = bp.add_part(PartKind::DynamicSymbolTable);
        let dynstr = bp.add_part(PartKind::DynamicStringTable);
        let text = bp.add_part(PartKind::Text);
        let got = bp.add_part(PartKind::GlobalOffsetTable);
        let dynamic = bp.add_part(PartKind::Dynamic);
        bp.link_symbol_names(dynsym, dynstr).unwrap();
        bp.structure().unwrap();
        bp.initialize().unwrap();
        bp.part_mut(text).contents_mut().resize(16);
        bp.populate().unwrap();
        bp.layout().unwrap();
        bp.finalize().unwrap();

        assert_eq!(bp.part(got).len(), 24);
        // entry 0 points at the dynamic section
        assert_eq!(
            bp.part(got).contents().read_u64(0),
            bp.part(dynamic).addr()
        );
        // the exported symbol carries the table's own address
        let index = bp.lookup_symbol(dynsym, GOT_SYMBOL).unwrap().unwrap();
        let locals = bp.part(dynsym).info();
        let at = index.resolve(locals) as usize * 24 + 8;
        assert_eq!(bp.part(dynsym).contents().read_u64(at), bp.part(got).addr());
        assert_ne!(bp.part(got).addr(), 0);
    }
}
