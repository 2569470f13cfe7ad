//! Staged construction of an ELF file from its parts.
//!
//! A [`Blueprint`] holds the part list for one output file and drives
//! the five build stages. The caller assembles the list, connects the
//! parts, and runs the stages in order, feeding in its own contents
//! between them:
//! 1. `structure`: every part takes on its kind's shape and defaults.
//! 2. `initialize`: parts that depend on which other parts exist
//!    settle their form.
//! 3. `populate`: parts derive their automatic contents; every size
//!    is final afterwards.
//! 4. `layout`: every part gets its file offset and, when loaded,
//!    its memory address.
//! 5. `finalize`: cross-part values (offsets, addresses, indices)
//!    are resolved and written back.
//!
//! The initialize, populate, and finalize stages sweep the part list
//! repeatedly: a part whose dependencies are not done yet simply
//! stays unfinished until a later sweep picks it up. A sweep that
//! completes nothing means the parts are deadlocked, which is
//! reported as an error rather than looping forever.

use anyhow::{bail, Result};
use tracing::debug;

use crate::part::{Part, PartId, PartKind};
use crate::parts;
use crate::utils::align_up;

/// File image kinds a blueprint can describe.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileKind {
    Relocatable,
    Executable,
    SharedObject,
}

impl FileKind {
    /// Value for the `e_type` field of the file header.
    pub fn elf_type(self) -> u16 {
        match self {
            FileKind::Relocatable => object::elf::ET_REL,
            FileKind::Executable => object::elf::ET_EXEC,
            FileKind::SharedObject => object::elf::ET_DYN,
        }
    }
}

/// The build stages, in the order they must run.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Stage {
    New,
    Structured,
    Initialized,
    Populated,
    Measured,
    Finalized,
}

/// Parts are padded to this alignment within the file.
const FILE_ALIGN: u64 = 8;

/// Writable parts start on their own page.
const PAGE_SIZE: u64 = 0x1000;

/// Load address of the first byte of an executable image.
const BASE_ADDR: u64 = 0x400000;

#[derive(Debug)]
pub struct Blueprint {
    kind: FileKind,
    parts: Vec<Part>,
    stage: Stage,
}

impl Blueprint {
    pub fn new(kind: FileKind) -> Self {
        Self {
            kind,
            parts: Vec::new(),
            stage: Stage::New,
        }
    }

    pub fn file_kind(&self) -> FileKind {
        self.kind
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Appends a part to the part list. The file's parts appear in
    /// the image in the order they were added.
    pub fn add_part(&mut self, kind: PartKind) -> PartId {
        self.parts.push(Part::new(kind));
        PartId(self.parts.len() - 1)
    }

    pub fn part(&self, id: PartId) -> &Part {
        &self.parts[id.0]
    }

    pub fn part_mut(&mut self, id: PartId) -> &mut Part {
        &mut self.parts[id.0]
    }

    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter()
    }

    /// Identifiers of every part, in list order. The iterator does
    /// not borrow the blueprint, so parts can be mutated while it is
    /// walked.
    pub fn part_ids(&self) -> impl Iterator<Item = PartId> {
        (0..self.parts.len()).map(PartId)
    }

    pub(crate) fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Takes a part out of the file. The part keeps its slot in the
    /// list but contributes nothing to the image, and every stage
    /// and search skips it. Parts can only be removed while their
    /// sizes are still in flux.
    pub fn remove_part(&mut self, id: PartId) -> Result<()> {
        if self.stage >= Stage::Populated {
            bail!("parts cannot be removed after the populate stage");
        }
        self.parts[id.0].set_removed(true);
        Ok(())
    }

    /// First part of the given kind still present in the file.
    pub(crate) fn first_part(&self, kind: PartKind) -> Option<PartId> {
        self.parts
            .iter()
            .position(|p| !p.is_removed() && p.kind() == kind)
            .map(PartId)
    }

    /// First section part with the given ELF section type.
    pub(crate) fn find_section_part(&self, section_type: u32) -> Option<PartId> {
        self.parts
            .iter()
            .position(|p| p.is_section() && p.kind().section_type() == Some(section_type))
            .map(PartId)
    }

    /// Index the part will have in the section header table: one for
    /// the leading null entry plus one per section part before it.
    pub(crate) fn section_index_of(&self, id: PartId) -> u32 {
        let mut index = 1;
        for part in &self.parts[..id.0] {
            if part.is_section() {
                index += 1;
            }
        }
        index
    }

    pub(crate) fn section_count(&self) -> u64 {
        self.parts.iter().filter(|p| p.is_section()).count() as u64
    }

    /// Names the section header table's string table. Must be called
    /// between the structure and initialize stages.
    pub fn link_section_names(&mut self, headers: PartId, strings: PartId) -> Result<()> {
        self.connect(headers, strings)
    }

    /// Names the string table a symbol table keeps its names in.
    pub fn link_symbol_names(&mut self, symbols: PartId, strings: PartId) -> Result<()> {
        self.connect(symbols, strings)
    }

    /// Names the symbol table a hash table indexes.
    pub fn link_hash_symbols(&mut self, hash: PartId, symbols: PartId) -> Result<()> {
        self.connect(hash, symbols)
    }

    /// Names the symbol table a relocation table's entries refer to.
    pub fn link_relocation_symbols(&mut self, relocations: PartId, symbols: PartId) -> Result<()> {
        self.connect(relocations, symbols)
    }

    /// Names the section a relocation table applies to.
    pub fn link_relocation_section(&mut self, relocations: PartId, section: PartId) -> Result<()> {
        if self.stage >= Stage::Initialized {
            bail!("parts must be connected before the initialize stage");
        }
        self.parts[relocations.0].set_info(section.0 as u32);
        Ok(())
    }

    fn connect(&mut self, from: PartId, to: PartId) -> Result<()> {
        if self.stage >= Stage::Initialized {
            bail!("parts must be connected before the initialize stage");
        }
        self.parts[from.0].set_link(Some(to));
        Ok(())
    }

    /// Runs the structure stage: every part takes on its defaults.
    pub fn structure(&mut self) -> Result<()> {
        if self.stage != Stage::New {
            bail!("the structure stage has already run");
        }
        if self.parts.is_empty() {
            bail!("empty blueprint");
        }
        for id in self.part_ids() {
            if !self.parts[id.0].is_removed() {
                parts::structure(self, id)?;
            }
            self.parts[id.0].set_done(true);
        }
        self.stage = Stage::Structured;
        Ok(())
    }

    /// Runs the initialize stage.
    pub fn initialize(&mut self) -> Result<()> {
        if self.stage != Stage::Structured {
            bail!("the initialize stage must follow the structure stage");
        }
        self.converge("initialize", parts::wants_initialize, parts::initialize)?;
        self.stage = Stage::Initialized;
        Ok(())
    }

    /// Runs the populate stage. All part sizes are final afterwards.
    pub fn populate(&mut self) -> Result<()> {
        if self.stage != Stage::Initialized {
            bail!("the populate stage must follow the initialize stage");
        }
        self.converge("populate", parts::wants_populate, parts::populate)?;
        self.stage = Stage::Populated;
        Ok(())
    }

    /// Runs the layout stage: assigns every part its file offset and,
    /// for loaded parts of executable and shared files, its address.
    ///
    /// Offsets ascend in part-list order. Read-only parts are mapped
    /// at their file offset; writable parts follow on the next page
    /// boundary after the read-only image ends. Executables have the
    /// whole image shifted up to the base load address.
    pub fn layout(&mut self) -> Result<()> {
        if self.stage != Stage::Populated {
            bail!("the layout stage must follow the populate stage");
        }
        let mut offset = 0;
        for part in &mut self.parts {
            if part.is_removed() {
                continue;
            }
            part.set_offset(offset);
            offset = align_up(offset + part.len(), FILE_ALIGN);
        }

        if self.kind != FileKind::Relocatable {
            let mut read_only_end = 0;
            for part in &mut self.parts {
                if part.is_removed() || part.flags() == 0 {
                    continue;
                }
                part.set_addr(part.offset());
                if part.flags() & object::elf::PF_W == 0 {
                    read_only_end = read_only_end.max(part.addr() + part.len());
                }
            }
            let writable_base = align_up(read_only_end, PAGE_SIZE);
            for part in &mut self.parts {
                if part.is_removed() || part.flags() & object::elf::PF_W == 0 {
                    continue;
                }
                part.set_addr(part.addr() + writable_base);
            }
            if self.kind == FileKind::Executable {
                for part in &mut self.parts {
                    if part.is_removed() || part.flags() == 0 {
                        continue;
                    }
                    part.set_addr(part.addr() + BASE_ADDR);
                }
            }
        }
        self.stage = Stage::Measured;
        Ok(())
    }

    /// Runs the finalize stage. The image is complete afterwards.
    pub fn finalize(&mut self) -> Result<()> {
        if self.stage != Stage::Measured {
            bail!("the finalize stage must follow the layout stage");
        }
        self.converge("finalize", parts::wants_finalize, parts::finalize)?;
        self.stage = Stage::Finalized;
        Ok(())
    }

    /// Sweeps the part list until every part has run its stage work.
    /// Parts with nothing to do at this stage start out done; a part
    /// whose work ran but left it unfinished is waiting on another
    /// part and gets retried next sweep.
    fn converge(
        &mut self,
        name: &str,
        wants: fn(PartKind) -> bool,
        run: fn(&mut Blueprint, PartId) -> Result<()>,
    ) -> Result<()> {
        for part in &mut self.parts {
            let idle = part.is_removed() || !wants(part.kind());
            part.set_done(idle);
        }
        let mut waiting = self.parts.len();
        let mut sweeps = 0;
        while waiting > 0 {
            let before = waiting;
            waiting = 0;
            for id in self.part_ids() {
                if self.parts[id.0].done() {
                    continue;
                }
                run(self, id)?;
                if !self.parts[id.0].done() {
                    waiting += 1;
                }
            }
            sweeps += 1;
            if waiting >= before {
                bail!("mutually dependent parts in the {name} stage");
            }
        }
        debug!("{name} stage settled after {sweeps} sweep(s)");
        Ok(())
    }
}
