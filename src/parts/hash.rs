//! The `.hash` symbol lookup table part.
//!
//! Layout is two header words (bucket count and chain count) followed
//! by the buckets and one chain slot per symbol. Lookup hashes the
//! name into a bucket and walks the chain from there.

use anyhow::{bail, Result};
use object::elf;

use crate::blueprint::Blueprint;
use crate::part::PartId;
use crate::parts::symtab::SYM_ENTSIZE;

const HASH_ENTSIZE: u64 = 4;

/// Bucket counts suited to symbol tables of increasing size.
const BUCKET_SIZES: [u32; 17] = [
    1, 1, 3, 17, 37, 67, 97, 131, 197, 263, 521, 1031, 2053, 4099, 8209, 16411, 32771,
];

/// Smallest bucket count that can hold `symbols` without crowding.
fn bucket_count(symbols: u32) -> u32 {
    for &n in &BUCKET_SIZES {
        if n >= symbols {
            return n;
        }
    }
    BUCKET_SIZES[BUCKET_SIZES.len() - 1]
}

/// The hash function fixed by the ELF specification.
fn elf_hash(name: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &byte in name {
        hash = (hash << 4).wrapping_add(byte as u32);
        hash = (hash ^ ((hash & 0xf000_0000) >> 24)) & 0x0fff_ffff;
    }
    hash
}

pub(crate) fn structure(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let part = bp.part_mut(id);
    part.set_name(".hash");
    part.set_flags(elf::PF_R);
    part.set_entsize(HASH_ENTSIZE);
    Ok(())
}

/// Sizes the table once the symbol table's entry count is frozen.
pub(crate) fn populate(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let Some(symbols) = bp.part(id).link() else {
        bail!("hash table has no symbol table set");
    };
    if !bp.part(symbols).done() {
        return Ok(());
    }
    let symbol_count = bp.part(symbols).count() as u32;
    let buckets = bucket_count(symbol_count);
    let count = symbol_count as u64 + buckets as u64 + 2;
    let part = bp.part_mut(id);
    part.set_count(count);
    part.contents_mut().resize((count * HASH_ENTSIZE) as usize);
    part.contents_mut().put_u32(0, buckets);
    part.contents_mut().put_u32(4, symbol_count);
    part.set_done(true);
    Ok(())
}

/// Hashes every symbol name into the buckets, appending collisions to
/// the end of their chain.
pub(crate) fn finalize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let Some(symbols) = bp.part(id).link() else {
        bail!("hash table has no symbol table set");
    };
    if !bp.part(symbols).done() {
        return Ok(());
    }
    let Some(strings) = bp.part(symbols).link() else {
        bail!("symbol table has no string table");
    };
    let symbol_count = bp.part(symbols).count() as usize;
    let buckets = bp.part(id).contents().read_u32(0) as usize;

    let mut hashes = Vec::with_capacity(symbol_count.saturating_sub(1));
    {
        let table = bp.part(symbols).contents();
        let names = bp.part(strings).contents();
        for n in 1..symbol_count {
            let name_offset = table.read_u32(n * SYM_ENTSIZE as usize) as usize;
            hashes.push(elf_hash(names.cstr_at(name_offset)));
        }
    }
    let words = bp.part_mut(id).contents_mut();
    for (n, hash) in hashes.iter().enumerate() {
        let index = n as u32 + 1;
        let mut slot = 2 + (hash % buckets as u32) as usize;
        loop {
            let chained = words.read_u32(slot * 4);
            if chained == 0 {
                break;
            }
            slot = 2 + buckets + chained as usize;
        }
        words.put_u32(slot * 4, index);
    }
    bp.part_mut(id).set_done(true);
    Ok(())
}
