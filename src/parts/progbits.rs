//! Free-form progbits parts: code, data, and annotation sections.
//!
//! These parts have no stage behavior beyond their defaults; the
//! caller supplies their contents between the initialize and
//! populate stages.

use anyhow::Result;
use object::elf;

use crate::blueprint::Blueprint;
use crate::part::{PartId, PartKind};

pub(crate) fn structure(bp: &mut Blueprint, id: PartId) -> Result<()> {
    let part = bp.part_mut(id);
    match part.kind() {
        PartKind::Text => {
            part.set_name(".text");
            part.set_flags(elf::PF_R | elf::PF_X);
        }
        PartKind::Data => {
            part.set_name(".data");
            part.set_flags(elf::PF_R | elf::PF_W);
        }
        PartKind::ReadOnlyData => {
            part.set_name(".rodata");
            part.set_flags(elf::PF_R);
        }
        // generic parts start nameless and unloaded
        _ => {}
    }
    Ok(())
}
