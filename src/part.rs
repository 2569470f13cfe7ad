//! The elements of a blueprint's part list.

use object::elf;

use crate::buffer::Buffer;

/// Identifies one part within a blueprint's part list. Parts keep
/// their identifier for the life of the blueprint, even after being
/// removed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PartId(pub(crate) usize);

impl PartId {
    /// Position of the part in the blueprint's part list.
    pub fn index(self) -> usize {
        self.0
    }
}

/// The role a part plays in the output file. The kind decides the
/// part's defaults and its behavior at every build stage.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PartKind {
    /// The ELF file header.
    FileHeader,
    /// The program header table.
    ProgramHeaders,
    /// The section header table.
    SectionHeaders,
    /// A `.strtab` string table.
    StringTable,
    /// A `.dynstr` string table, loaded with the file.
    DynamicStringTable,
    /// The `.shstrtab` table holding section names.
    SectionNameTable,
    /// A `.symtab` symbol table.
    SymbolTable,
    /// A `.dynsym` symbol table, loaded with the file.
    DynamicSymbolTable,
    /// A table of relocations without addends.
    RelTable,
    /// A table of relocations with addends.
    RelaTable,
    /// The global offset table.
    GlobalOffsetTable,
    /// A `.hash` symbol lookup table.
    HashTable,
    /// The `.dynamic` section.
    Dynamic,
    /// A free-form progbits section with no preset name or flags.
    Progbits,
    /// A `.text` section, readable and executable.
    Text,
    /// A `.data` section, readable and writable.
    Data,
    /// A `.rodata` section, read-only.
    ReadOnlyData,
}

impl PartKind {
    /// The ELF section type for parts that appear in the section
    /// header table. The header and table-of-header parts have none.
    pub fn section_type(self) -> Option<u32> {
        match self {
            PartKind::FileHeader | PartKind::ProgramHeaders | PartKind::SectionHeaders => None,
            PartKind::StringTable | PartKind::DynamicStringTable | PartKind::SectionNameTable => {
                Some(elf::SHT_STRTAB)
            }
            PartKind::SymbolTable => Some(elf::SHT_SYMTAB),
            PartKind::DynamicSymbolTable => Some(elf::SHT_DYNSYM),
            PartKind::RelTable => Some(elf::SHT_REL),
            PartKind::RelaTable => Some(elf::SHT_RELA),
            PartKind::HashTable => Some(elf::SHT_HASH),
            PartKind::Dynamic => Some(elf::SHT_DYNAMIC),
            PartKind::GlobalOffsetTable
            | PartKind::Progbits
            | PartKind::Text
            | PartKind::Data
            | PartKind::ReadOnlyData => Some(elf::SHT_PROGBITS),
        }
    }

    pub(crate) fn is_string_table(self) -> bool {
        matches!(
            self,
            PartKind::StringTable | PartKind::DynamicStringTable | PartKind::SectionNameTable
        )
    }

    pub(crate) fn is_symbol_table(self) -> bool {
        matches!(self, PartKind::SymbolTable | PartKind::DynamicSymbolTable)
    }

    pub(crate) fn is_relocation_table(self) -> bool {
        matches!(self, PartKind::RelTable | PartKind::RelaTable)
    }
}

/// One part of an output file: a typed slice of the file image with
/// its own contents, its place in the layout, and links to the parts
/// it depends on.
#[derive(Debug)]
pub struct Part {
    kind: PartKind,
    removed: bool,
    /// `PF_*` permission bits. Zero for parts that are not loaded
    /// into memory.
    flags: u32,
    /// Size of one entry, for table parts.
    entsize: u64,
    /// Number of entries, for table parts.
    count: u64,
    contents: Buffer,
    name: Option<String>,
    /// File offset, valid once the layout stage has run.
    offset: u64,
    /// Memory address, valid once the layout stage has run. Stays
    /// zero for unloaded parts and relocatable files.
    addr: u64,
    /// The part this one takes auxiliary data from: the string table
    /// of a symbol table, the symbol table of a hash or relocation
    /// table, the name table of the section header table.
    link: Option<PartId>,
    info: u32,
    /// Set when the part has finished the stage currently running.
    done: bool,
}

impl Part {
    pub(crate) fn new(kind: PartKind) -> Self {
        Self {
            kind,
            removed: false,
            flags: 0,
            entsize: 0,
            count: 0,
            contents: Buffer::new(),
            name: None,
            offset: 0,
            addr: 0,
            link: None,
            info: 0,
            done: false,
        }
    }

    pub fn kind(&self) -> PartKind {
        self.kind
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// True for parts that get an entry in the section header table.
    pub fn is_section(&self) -> bool {
        !self.removed && self.kind.section_type().is_some()
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn entsize(&self) -> u64 {
        self.entsize
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn link(&self) -> Option<PartId> {
        self.link
    }

    pub fn info(&self) -> u32 {
        self.info
    }

    /// Size of the part's contents in bytes.
    pub fn len(&self) -> u64 {
        self.contents.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    pub fn contents(&self) -> &Buffer {
        &self.contents
    }

    pub fn contents_mut(&mut self) -> &mut Buffer {
        &mut self.contents
    }

    pub(crate) fn set_removed(&mut self, removed: bool) {
        self.removed = removed;
    }

    pub(crate) fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub(crate) fn set_entsize(&mut self, entsize: u64) {
        self.entsize = entsize;
    }

    pub(crate) fn set_count(&mut self, count: u64) {
        self.count = count;
    }

    pub(crate) fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub(crate) fn set_addr(&mut self, addr: u64) {
        self.addr = addr;
    }

    pub(crate) fn set_link(&mut self, link: Option<PartId>) {
        self.link = link;
    }

    pub(crate) fn set_info(&mut self, info: u32) {
        self.info = info;
    }

    pub(crate) fn done(&self) -> bool {
        self.done
    }

    pub(crate) fn set_done(&mut self, done: bool) {
        self.done = done;
    }
}
