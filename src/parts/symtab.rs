//! Symbol table parts.
//!
//! Entry zero is reserved. Local symbols are kept ahead of global
//! symbols, so adding a local shifts every global up by one; the
//! [`SymbolIndex`] type keeps references valid across that shuffle.

use anyhow::{bail, Result};
use object::elf;
use object::endian::{U16, U32, U64};
use object::pod::bytes_of;
use object::Endianness;

use crate::blueprint::{Blueprint, Stage};
use crate::part::{PartId, PartKind};

/// Size of one symbol table entry.
pub const SYM_ENTSIZE: u64 = 24;

const ST_SHNDX: usize = 6;
const ST_VALUE: usize = 8;

const DYNAMIC_SYMBOL: &str = "_DYNAMIC";

/// Where a symbol landed in its table. A local symbol's index is
/// final as soon as it is added. A global symbol sorts after all the
/// locals, so its index keeps shifting until the table's sizes are
/// frozen; until then it is identified by its position among the
/// globals.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SymbolIndex {
    Resolved(u32),
    Deferred(u32),
}

impl SymbolIndex {
    /// The final table index, given the table's local entry count.
    pub fn resolve(self, locals: u32) -> u32 {
        match self {
            SymbolIndex::Resolved(index) => index,
            SymbolIndex::Deferred(nth) => locals + nth - 1,
        }
    }

    /// Raw value stored in relocation entries until the finalize
    /// stage resolves it; deferred indices are encoded negative.
    pub(crate) fn to_raw(self) -> i32 {
        match self {
            SymbolIndex::Resolved(index) => index as i32,
            SymbolIndex::Deferred(nth) => -(nth as i32),
        }
    }
}

/// What a symbol's value is relative to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SymbolPlace {
    /// Defined elsewhere.
    Undefined,
    /// An absolute value, not adjusted by loading.
    Absolute,
    /// Defined within a part of this blueprint. Translated to the
    /// part's section index at the finalize stage.
    Part(PartId),
}

impl SymbolPlace {
    fn shndx(self) -> u16 {
        match self {
            SymbolPlace::Undefined => 0,
            SymbolPlace::Absolute => elf::SHN_ABS,
            SymbolPlace::Part(id) => id.index() as u16,
        }
    }
}

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
    let part = bp.part_mut(id);
    match part.kind() {
        PartKind::SymbolTable => part.set_name(".symtab"),
        PartKind::DynamicSymbolTable => {
            part.set_name(".dynsym");
            part.set_flags(elf::PF_R);
        }
        _ => {}
    }
    part.set_entsize(SYM_ENTSIZE);
    part.set_count(1);
    part.set_info(1);
    part.contents_mut().resize(SYM_ENTSIZE as usize);
    Ok(())
}

/// A dynamic symbol table exports `_DYNAMIC` when the file has a
/// dynamic section.
pub(crate) fn initialize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    if bp.find_section_part(elf::SHT_DYNAMIC).is_some() {
        bp.add_symbol(
            id,
            DYNAMIC_SYMBOL,
            elf::STB_GLOBAL,
            elf::STT_OBJECT,
            SymbolPlace::Absolute,
        )?;
    }
    bp.part_mut(id).set_done(true);
    Ok(())
}

/// Gives `_DYNAMIC` its address and translates part identifiers in
/// the `st_shndx` fields into section header indices.
pub(crate) fn finalize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    if bp.part(id).kind() == PartKind::DynamicSymbolTable {
        if let Some(dynamic) = bp.find_section_part(elf::SHT_DYNAMIC) {
            let addr = bp.part(dynamic).addr();
            bp.set_symbol_value(id, DYNAMIC_SYMBOL, addr)?;
        }
    }
    let part_count = bp.part_count();
    let count = bp.part(id).count() as usize;
    let mut translated = Vec::new();
    for n in 0..count {
        let at = n * SYM_ENTSIZE as usize + ST_SHNDX;
        let shndx = bp.part(id).contents().read_u16(at) as usize;
        if shndx > 0 && shndx < part_count {
            translated.push((at, bp.section_index_of(PartId(shndx)) as u16));
        }
    }
    let contents = bp.part_mut(id).contents_mut();
    for (at, index) in translated {
        contents.put_u16(at, index);
    }
    bp.part_mut(id).set_done(true);
    Ok(())
}

impl Blueprint {
    /// Adds a symbol to a symbol table part. The name goes into the
    /// table's string table.
    pub fn add_symbol(
        &mut self,
        id: PartId,
        name: &str,
        bind: u8,
        symbol_type: u8,
        place: SymbolPlace,
    ) -> Result<SymbolIndex> {
        if !self.part(id).kind().is_symbol_table() {
            bail!("not a symbol table");
        }
        if self.stage() >= Stage::Populated {
            bail!("cannot add to a symbol table after the populate stage");
        }
        let strings = match self.part(id).link() {
            Some(link) if self.part(link).kind().is_string_table() => link,
            _ => bail!("symbol table has no string table"),
        };
        let name_offset = self.add_string(strings, name)?;
        let entry = elf::Sym64::<Endianness> {
            st_name: u32(name_offset),
            st_info: (bind << 4) | (symbol_type & 0x0f),
            st_other: 0,
            st_shndx: u16(place.shndx()),
            st_value: u64(0),
            st_size: u64(0),
        };
        let part = self.part_mut(id);
        let locals = part.info();
        let count = part.count() as u32;
        part.set_count(count as u64 + 1);
        if bind == elf::STB_LOCAL {
            part.contents_mut()
                .insert(locals as usize * SYM_ENTSIZE as usize, bytes_of(&entry));
            part.set_info(locals + 1);
            Ok(SymbolIndex::Resolved(locals))
        } else {
            part.contents_mut().append(bytes_of(&entry));
            Ok(SymbolIndex::Deferred(count + 1 - locals))
        }
    }

    /// Finds a symbol by name. `Ok(None)` means the table has no such
    /// symbol (or no string table to look names up in).
    pub fn lookup_symbol(&self, id: PartId, name: &str) -> Result<Option<SymbolIndex>> {
        if !self.part(id).kind().is_symbol_table() {
            bail!("not a symbol table");
        }
        let Some(strings) = self.part(id).link() else {
            return Ok(None);
        };
        let part = self.part(id);
        let names = self.part(strings).contents();
        let locals = part.info();
        for n in 1..part.count() as u32 {
            let name_offset = part.contents().read_u32(n as usize * SYM_ENTSIZE as usize);
            if names.cstr_at(name_offset as usize) == name.as_bytes() {
                return Ok(Some(if n >= locals {
                    SymbolIndex::Deferred(n + 1 - locals)
                } else {
                    SymbolIndex::Resolved(n)
                }));
            }
        }
        Ok(None)
    }

    /// Sets the value of the first symbol with the given name.
    /// Returns whether the table had one.
    pub fn set_symbol_value(&mut self, id: PartId, name: &str, value: u64) -> Result<bool> {
        if !self.part(id).kind().is_symbol_table() {
            bail!("not a symbol table");
        }
        let Some(strings) = self.part(id).link() else {
            bail!("symbol table has no string table");
        };
        let mut slot = None;
        {
            let part = self.part(id);
            let names = self.part(strings).contents();
            for n in 1..part.count() as usize {
                let name_offset = part.contents().read_u32(n * SYM_ENTSIZE as usize);
                if names.cstr_at(name_offset as usize) == name.as_bytes() {
                    slot = Some(n);
                    break;
                }
            }
        }
        let Some(n) = slot else {
            return Ok(false);
        };
        self.part_mut(id)
            .contents_mut()
            .put_u64(n * SYM_ENTSIZE as usize + ST_VALUE, value);
        Ok(true)
    }
}
