//! Per-kind behavior of the blueprint parts.
//!
//! Each submodule owns one family of parts: its defaults at the
//! structure stage, its work at the initialize, populate, and
//! finalize stages, and the operations callers use to feed it.
//! The `wants_*` tables say which kinds have work to do at each
//! converging stage; everything else starts those stages done.

pub mod dynamic;
pub mod ehdr;
pub mod got;
pub mod hash;
pub mod phdrtab;
pub mod progbits;
pub mod reltab;
pub mod shdrtab;
pub mod strtab;
pub mod symtab;

use anyhow::Result;

use crate::blueprint::Blueprint;
use crate::part::{PartId, PartKind};

pub(crate) fn structure(bp: &mut Blueprint, id: PartId) -> Result<()> {
    match bp.part(id).kind() {
        PartKind::FileHeader => ehdr::structure(bp, id),
        PartKind::ProgramHeaders => phdrtab::structure(bp, id),
        PartKind::SectionHeaders => shdrtab::structure(bp, id),
        PartKind::StringTable | PartKind::DynamicStringTable | PartKind::SectionNameTable => {
            strtab::structure(bp, id)
        }
        PartKind::SymbolTable | PartKind::DynamicSymbolTable => symtab::structure(bp, id),
        PartKind::RelTable | PartKind::RelaTable => reltab::structure(bp, id),
        PartKind::GlobalOffsetTable => got::structure(bp, id),
        PartKind::HashTable => hash::structure(bp, id),
        PartKind::Dynamic => dynamic::structure(bp, id),
        PartKind::Progbits | PartKind::Text | PartKind::Data | PartKind::ReadOnlyData => {
            progbits::structure(bp, id)
        }
    }
}

pub(crate) fn wants_initialize(kind: PartKind) -> bool {
    matches!(
        kind,
        PartKind::FileHeader
            | PartKind::SectionHeaders
            | PartKind::DynamicSymbolTable
            | PartKind::RelTable
            | PartKind::RelaTable
            | PartKind::GlobalOffsetTable
            | PartKind::Dynamic
    )
}

pub(crate) fn initialize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    match bp.part(id).kind() {
        PartKind::FileHeader => ehdr::initialize(bp, id),
        PartKind::SectionHeaders => shdrtab::initialize(bp, id),
        PartKind::DynamicSymbolTable => symtab::initialize(bp, id),
        PartKind::RelTable | PartKind::RelaTable => reltab::initialize(bp, id),
        PartKind::GlobalOffsetTable => got::initialize(bp, id),
        PartKind::Dynamic => dynamic::initialize(bp, id),
        _ => Ok(()),
    }
}

pub(crate) fn wants_populate(kind: PartKind) -> bool {
    matches!(
        kind,
        PartKind::ProgramHeaders | PartKind::SectionHeaders | PartKind::HashTable
    )
}

pub(crate) fn populate(bp: &mut Blueprint, id: PartId) -> Result<()> {
    match bp.part(id).kind() {
        PartKind::ProgramHeaders => phdrtab::populate(bp, id),
        PartKind::SectionHeaders => shdrtab::populate(bp, id),
        PartKind::HashTable => hash::populate(bp, id),
        _ => Ok(()),
    }
}

pub(crate) fn wants_finalize(kind: PartKind) -> bool {
    matches!(
        kind,
        PartKind::FileHeader
            | PartKind::ProgramHeaders
            | PartKind::SectionHeaders
            | PartKind::SymbolTable
            | PartKind::DynamicSymbolTable
            | PartKind::HashTable
            | PartKind::RelTable
            | PartKind::RelaTable
            | PartKind::GlobalOffsetTable
            | PartKind::Dynamic
    )
}

pub(crate) fn finalize(bp: &mut Blueprint, id: PartId) -> Result<()> {
    match bp.part(id).kind() {
        PartKind::FileHeader => ehdr::finalize(bp, id),
        PartKind::ProgramHeaders => phdrtab::finalize(bp, id),
        PartKind::SectionHeaders => shdrtab::finalize(bp, id),
        PartKind::SymbolTable | PartKind::DynamicSymbolTable => symtab::finalize(bp, id),
        PartKind::HashTable => hash::finalize(bp, id),
        PartKind::RelTable | PartKind::RelaTable => reltab::finalize(bp, id),
        PartKind::GlobalOffsetTable => got::finalize(bp, id),
        PartKind::Dynamic => dynamic::finalize(bp, id),
        _ => Ok(()),
    }
}
