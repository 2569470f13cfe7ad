//! Brainfuck compilation into a finished blueprint.
//!
//! The compiler owns the source decoding pipeline (plain or packed
//! bytes, run-length collapsing, the cell-zeroing idiom) and the
//! shape of each output file: which parts it carries, the symbols
//! and relocations its code model needs, and the address fixups that
//! run once the layout is known.

use anyhow::Result;
use object::elf;
use tracing::debug;

use crate::blueprint::{Blueprint, FileKind};
use crate::codegen::{self, Assembler, CodeModel};
use crate::part::{PartId, PartKind};
use crate::parts::got::GOT_SYMBOL;
use crate::parts::symtab::{SymbolIndex, SymbolPlace};

/// Size of the cell array compiled programs work on.
pub const CELL_ARRAY_SIZE: usize = 0x8000;

/// Annotation recorded in the `.comment` section of unstripped
/// outputs.
const COMMENT: &str = concat!("\0smelt ", env!("CARGO_PKG_VERSION"), "\0");

/// Everything the compiler needs to know about one compilation.
pub struct Compiler {
    pub kind: FileKind,
    pub model: CodeModel,
    /// Name the compiled code is exported under.
    pub function: String,
    /// Source filename recorded in unstripped relocatable outputs.
    pub source_name: String,
    /// Omit the annotation section and the source filename symbol,
    /// and for executables the section headers too.
    pub strip: bool,
    /// Treat the input as packed source.
    pub compressed: bool,
}

/// The parts of one output file the compiler feeds directly. Parts
/// that only some file kinds carry are optional.
struct PartSet {
    text: PartId,
    data: PartId,
    comment: PartId,
    shstrtab: PartId,
    shdrtab: PartId,
    rel: Option<PartId>,
    got: Option<PartId>,
    symtab: Option<PartId>,
    strtab: Option<PartId>,
    dynsym: Option<PartId>,
    dynstr: Option<PartId>,
    hash: Option<PartId>,
}

impl Compiler {
    /// Compiles `source` into a finished blueprint, ready to be
    /// written out.
    pub fn compile(&self, source: &[u8]) -> Result<Blueprint> {
        debug!(kind = ?self.kind, model = ?self.model, "compiling {} source bytes", source.len());
        let (mut blueprint, parts) = self.assemble();
        blueprint.structure()?;
        self.connect(&mut blueprint, &parts)?;
        blueprint.initialize()?;
        self.fill(&mut blueprint, &parts, source)?;
        blueprint.populate()?;
        blueprint.layout()?;
        self.fix_addresses(&mut blueprint, &parts)?;
        blueprint.finalize()?;
        Ok(blueprint)
    }

    /// Lays down the part list for the output file kind.
    fn assemble(&self) -> (Blueprint, PartSet) {
        let mut bp = Blueprint::new(self.kind);
        bp.add_part(PartKind::FileHeader);
        match self.kind {
            FileKind::Relocatable => {
                let text = bp.add_part(PartKind::Text);
                let rel = bp.add_part(PartKind::RelTable);
                let data = bp.add_part(PartKind::Data);
                let shstrtab = bp.add_part(PartKind::SectionNameTable);
                let comment = bp.add_part(PartKind::Progbits);
                let symtab = bp.add_part(PartKind::SymbolTable);
                let strtab = bp.add_part(PartKind::StringTable);
                let shdrtab = bp.add_part(PartKind::SectionHeaders);
                let set = PartSet {
                    text,
                    data,
                    comment,
                    shstrtab,
                    shdrtab,
                    rel: Some(rel),
                    got: None,
                    symtab: Some(symtab),
                    strtab: Some(strtab),
                    dynsym: None,
                    dynstr: None,
                    hash: None,
                };
                (bp, set)
            }
            FileKind::Executable => {
                bp.add_part(PartKind::ProgramHeaders);
                let text = bp.add_part(PartKind::Text);
                let data = bp.add_part(PartKind::Data);
                let shstrtab = bp.add_part(PartKind::SectionNameTable);
                let comment = bp.add_part(PartKind::Progbits);
                let shdrtab = bp.add_part(PartKind::SectionHeaders);
                let set = PartSet {
                    text,
                    data,
                    comment,
                    shstrtab,
                    shdrtab,
                    rel: None,
                    got: None,
                    symtab: None,
                    strtab: None,
                    dynsym: None,
                    dynstr: None,
                    hash: None,
                };
                (bp, set)
            }
            FileKind::SharedObject => {
                bp.add_part(PartKind::ProgramHeaders);
                let hash = bp.add_part(PartKind::HashTable);
                let dynsym = bp.add_part(PartKind::DynamicSymbolTable);
                let dynstr = bp.add_part(PartKind::DynamicStringTable);
                let text = bp.add_part(PartKind::Text);
                let got = bp.add_part(PartKind::GlobalOffsetTable);
                bp.add_part(PartKind::Dynamic);
                let data = bp.add_part(PartKind::Data);
                let shstrtab = bp.add_part(PartKind::SectionNameTable);
                let comment = bp.add_part(PartKind::Progbits);
                let shdrtab = bp.add_part(PartKind::SectionHeaders);
                let set = PartSet {
                    text,
                    data,
                    comment,
                    shstrtab,
                    shdrtab,
                    rel: None,
                    got: Some(got),
                    symtab: None,
                    strtab: None,
                    dynsym: Some(dynsym),
                    dynstr: Some(dynstr),
                    hash: Some(hash),
                };
                (bp, set)
            }
        }
    }

    fn connect(&self, bp: &mut Blueprint, parts: &PartSet) -> Result<()> {
        if let (Some(hash), Some(dynsym)) = (parts.hash, parts.dynsym) {
            bp.link_hash_symbols(hash, dynsym)?;
        }
        if let (Some(dynsym), Some(dynstr)) = (parts.dynsym, parts.dynstr) {
            bp.link_symbol_names(dynsym, dynstr)?;
        }
        if let (Some(symtab), Some(strtab)) = (parts.symtab, parts.strtab) {
            bp.link_symbol_names(symtab, strtab)?;
        }
        if let Some(rel) = parts.rel {
            bp.link_relocation_section(rel, parts.text)?;
            if let Some(symtab) = parts.symtab {
                bp.link_relocation_symbols(rel, symtab)?;
            }
        }
        bp.link_section_names(parts.shdrtab, parts.shstrtab)?;
        Ok(())
    }

    /// Gives every caller-fed part its contents: the annotation, the
    /// source filename symbol, the compiled code, and the cell array.
    fn fill(&self, bp: &mut Blueprint, parts: &PartSet, source: &[u8]) -> Result<()> {
        if self.strip {
            bp.remove_part(parts.comment)?;
            if self.kind == FileKind::Executable {
                bp.remove_part(parts.shdrtab)?;
                bp.remove_part(parts.shstrtab)?;
            }
        } else {
            let comment = bp.part_mut(parts.comment);
            comment.set_name(".comment");
            comment.contents_mut().append(COMMENT.as_bytes());
            if let Some(symtab) = parts.symtab {
                bp.add_symbol(
                    symtab,
                    &self.source_name,
                    elf::STB_LOCAL,
                    elf::STT_FILE,
                    SymbolPlace::Absolute,
                )?;
            }
        }

        let mut stream = CommandStream::new(self.model);
        if self.compressed {
            stream.feed_packed(source)?;
        } else {
            stream.feed_plain(source)?;
        }
        let code = stream.finish()?.finish(self.model)?;
        debug!("compiled code is {} bytes", code.len());
        *bp.part_mut(parts.text).contents_mut() = code;

        if self.model == CodeModel::BufferFunction {
            bp.remove_part(parts.data)?;
        } else {
            bp.part_mut(parts.data).contents_mut().resize(CELL_ARRAY_SIZE);
        }
        self.add_relocations(bp, parts)
    }

    /// Declares the exported function and the data relocations each
    /// code model needs.
    fn add_relocations(&self, bp: &mut Blueprint, parts: &PartSet) -> Result<()> {
        if self.kind == FileKind::SharedObject {
            if let Some(dynsym) = parts.dynsym {
                bp.add_symbol(
                    dynsym,
                    &self.function,
                    elf::STB_GLOBAL,
                    elf::STT_FUNC,
                    SymbolPlace::Part(parts.text),
                )?;
            }
        }
        if self.kind != FileKind::Relocatable {
            return Ok(());
        }
        if let Some(symtab) = parts.symtab {
            bp.add_symbol(
                symtab,
                &self.function,
                elf::STB_GLOBAL,
                elf::STT_FUNC,
                SymbolPlace::Part(parts.text),
            )?;
        }
        match self.model {
            CodeModel::Standalone => {
                if let Some(rel) = parts.rel {
                    bp.add_relocation_for_symbol(
                        rel,
                        codegen::STANDALONE_CELLS_AT,
                        elf::R_X86_64_64,
                        "",
                        elf::STB_LOCAL,
                        elf::STT_OBJECT,
                        SymbolPlace::Part(parts.data),
                    )?;
                }
            }
            CodeModel::Function => {
                if let Some(rel) = parts.rel {
                    bp.add_relocation_for_symbol(
                        rel,
                        codegen::FUNCTION_CELLS_AT,
                        elf::R_X86_64_64,
                        "",
                        elf::STB_LOCAL,
                        elf::STT_OBJECT,
                        SymbolPlace::Part(parts.data),
                    )?;
                }
            }
            CodeModel::SharedFunction => {
                if let (Some(rel), Some(symtab)) = (parts.rel, parts.symtab) {
                    let got = bp
                        .lookup_symbol(symtab, GOT_SYMBOL)?
                        .unwrap_or(SymbolIndex::Resolved(0));
                    bp.add_relocation(
                        rel,
                        codegen::SHARED_GOTPC_AT,
                        got,
                        elf::R_X86_64_GOTPC64,
                    )?;
                    bp.add_relocation_for_symbol(
                        rel,
                        codegen::SHARED_CELLS_GOTOFF_AT,
                        elf::R_X86_64_GOTOFF64,
                        "",
                        elf::STB_LOCAL,
                        elf::STT_OBJECT,
                        SymbolPlace::Part(parts.data),
                    )?;
                }
            }
            CodeModel::BufferFunction => {
                if let Some(rel) = parts.rel {
                    bp.remove_part(rel)?;
                }
            }
        }
        Ok(())
    }

    /// Patches the prolog fields that depend on final addresses and
    /// publishes the entry point or function value.
    fn fix_addresses(&self, bp: &mut Blueprint, parts: &PartSet) -> Result<()> {
        if self.model == CodeModel::SharedFunction {
            let value = if self.kind == FileKind::Relocatable {
                // in an object file both fields hold displacements
                // for the linker's relocations to adjust
                codegen::SHARED_GOTPC_AT - codegen::SHARED_RETADDR_AT
            } else {
                let got = parts.got.map_or(0, |id| bp.part(id).addr());
                let anchor = bp.part(parts.text).addr() + codegen::SHARED_RETADDR_AT;
                got.wrapping_sub(anchor)
            };
            bp.part_mut(parts.text)
                .contents_mut()
                .put_u64(codegen::SHARED_GOTPC_AT as usize, value);
        }

        let cells_at = match self.model {
            CodeModel::Standalone => Some(codegen::STANDALONE_CELLS_AT),
            CodeModel::Function => Some(codegen::FUNCTION_CELLS_AT),
            CodeModel::SharedFunction => Some(codegen::SHARED_CELLS_GOTOFF_AT),
            CodeModel::BufferFunction => None,
        };
        if let Some(at) = cells_at {
            let value = if self.kind == FileKind::Relocatable {
                0
            } else {
                match self.model {
                    CodeModel::Standalone => bp.part(parts.data).addr(),
                    CodeModel::SharedFunction => {
                        let got = parts.got.map_or(0, |id| bp.part(id).addr());
                        bp.part(parts.data).addr().wrapping_sub(got)
                    }
                    _ => 0,
                }
            };
            bp.part_mut(parts.text)
                .contents_mut()
                .put_u64(at as usize, value);
        }

        match self.kind {
            FileKind::Relocatable => {
                if let Some(symtab) = parts.symtab {
                    bp.set_symbol_value(symtab, &self.function, 0)?;
                }
            }
            FileKind::SharedObject => {
                if let Some(dynsym) = parts.dynsym {
                    let addr = bp.part(parts.text).addr();
                    bp.set_symbol_value(dynsym, &self.function, addr)?;
                }
            }
            FileKind::Executable => {
                let addr = bp.part(parts.text).addr();
                bp.set_entry_point(addr)?;
            }
        }
        Ok(())
    }
}

const ZERO_IDIOM: &[u8; 3] = b"[-]";

/// Decodes source bytes into assembler calls, collapsing runs of the
/// same command and recognizing the `[-]` cell-zeroing idiom.
struct CommandStream {
    asm: Assembler,
    /// A run of identical commands not yet emitted.
    pending: Option<(u8, u32)>,
    /// How much of the zeroing idiom the latest commands match.
    matched: usize,
}

impl CommandStream {
    fn new(model: CodeModel) -> Self {
        let mut asm = Assembler::new();
        asm.emit_prolog(model);
        Self {
            asm,
            pending: None,
            matched: 0,
        }
    }

    fn feed_plain(&mut self, source: &[u8]) -> Result<()> {
        for &byte in source {
            if matches!(byte, b'+' | b'-' | b'<' | b'>' | b'[' | b']' | b'.' | b',') {
                self.push(byte, 1)?;
            }
        }
        Ok(())
    }

    /// Packed source stores commands as three-bit codes: a pair per
    /// byte, a triple of the four core commands, or a run of two to
    /// nine (or seventeen) repeats.
    fn feed_packed(&mut self, source: &[u8]) -> Result<()> {
        const CMDS: [u8; 8] = *b"+-<>[],.";
        for &byte in source {
            let b = byte as usize;
            match byte & 0xc0 {
                0x00 => {
                    self.push(CMDS[(b >> 3) & 7], 1)?;
                    if (b >> 3) & 7 != b & 7 {
                        self.push(CMDS[b & 7], 1)?;
                    }
                }
                0x80 => {
                    self.push(CMDS[(b >> 4) & 3], 1)?;
                    self.push(CMDS[(b >> 2) & 3], 1)?;
                    self.push(CMDS[b & 3], 1)?;
                }
                0x40 => self.push(CMDS[b & 7], 2 + ((byte as u32 >> 3) & 7))?,
                _ => self.push(CMDS[b & 3], 2 + ((byte as u32 >> 2) & 15))?,
            }
        }
        Ok(())
    }

    /// Runs a command through the idiom matcher.
    fn push(&mut self, cmd: u8, count: u32) -> Result<()> {
        if count == 1 && cmd == ZERO_IDIOM[self.matched] {
            self.matched += 1;
            if self.matched == ZERO_IDIOM.len() {
                self.matched = 0;
                return self.collapse(b'Z', 1);
            }
            return Ok(());
        }
        self.replay()?;
        self.collapse(cmd, count)
    }

    /// A broken idiom match emits the commands it held back.
    fn replay(&mut self) -> Result<()> {
        let matched = self.matched;
        self.matched = 0;
        for &cmd in &ZERO_IDIOM[..matched] {
            self.collapse(cmd, 1)?;
        }
        Ok(())
    }

    /// Merges the command into the pending run or flushes the run and
    /// starts a new one. Runs cap below 128 so counts fit the
    /// immediate byte of the folded instructions.
    fn collapse(&mut self, cmd: u8, count: u32) -> Result<()> {
        if let Some((pending, run)) = self.pending {
            if pending == cmd && run + count < 0x80 {
                self.pending = Some((pending, run + count));
                return Ok(());
            }
            self.translate(pending, run)?;
        }
        self.pending = Some((cmd, count));
        Ok(())
    }

    fn translate(&mut self, cmd: u8, count: u32) -> Result<()> {
        let count = count as u8;
        match cmd {
            b'+' => self.asm.add(count),
            b'-' => self.asm.sub(count),
            b'>' => self.asm.right(count),
            b'<' => self.asm.left(count),
            b'.' => self.asm.write(count),
            b',' => self.asm.read(count),
            b'[' => self.asm.open_loop(count)?,
            b']' => self.asm.close_loop(count)?,
            // consecutive zeroings collapse into one
            b'Z' => self.asm.clear(),
            _ => {}
        }
        Ok(())
    }

    /// Flushes everything held back and hands over the assembler.
    fn finish(mut self) -> Result<Assembler> {
        self.replay()?;
        if let Some((pending, run)) = self.pending.take() {
            self.translate(pending, run)?;
        }
        Ok(self.asm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_for(source: &[u8]) -> Vec<u8> {
        let mut stream = CommandStream::new(CodeModel::Standalone);
        stream.feed_plain(source).unwrap();
        let asm = stream.finish().unwrap();
        // skip the 15-byte standalone prolog
        asm.finish(CodeModel::Standalone).unwrap().bytes()[15..].to_vec()
    }

    #[test]
    fn comments_are_ignored() {
        assert_eq!(code_for(b"add one + to the cell"), code_for(b"+"));
    }

    #[test]
    fn runs_collapse_into_counted_instructions() {
        let epilog_len = 9;
        let code = code_for(b"+++++");
        assert_eq!(code[..code.len() - epilog_len], [0x80, 0x06, 0x05]);
        // a run of 127 fits one instruction, the 128th starts another
        let long = code_for(&[b'+'; 128]);
        assert_eq!(
            long[..long.len() - epilog_len],
            [0x80, 0x06, 0x7f, 0xfe, 0x06]
        );
    }

    #[test]
    fn the_zeroing_idiom_is_a_single_store() {
        let epilog_len = 9;
        let code = code_for(b"[-]");
        assert_eq!(code[..code.len() - epilog_len], [0x88, 0x36]);
        // twice in a row still zeroes just once
        let twice = code_for(b"[-][-]");
        assert_eq!(twice[..twice.len() - epilog_len], [0x88, 0x36]);
    }

    #[test]
    fn a_broken_idiom_replays_its_prefix() {
        let epilog_len = 9;
        let code = code_for(b"[-+]");
        let body = &code[..code.len() - epilog_len];
        assert_eq!(
            body,
            [
                0xe9, 0x04, 0x00, 0x00, 0x00, // [
                0xfe, 0x0e, // -
                0xfe, 0x06, // +
                0x3a, 0x36, 0x75, 0xf8, // ]
            ]
        );
    }

    #[test]
    fn an_idiom_match_does_not_restart_inside_itself() {
        // the second [ lands after the broken match and is taken
        // plain, so no zeroing store is emitted
        let code = code_for(b"[[-]]");
        assert!(!code.windows(2).any(|w| w == [0x88, 0x36]));
    }

    #[test]
    fn packed_source_matches_its_plain_spelling() {
        let plain = {
            let mut stream = CommandStream::new(CodeModel::Standalone);
            stream.feed_plain(b"+-<>[],.").unwrap();
            stream.finish().unwrap().finish(CodeModel::Standalone).unwrap()
        };
        let packed = {
            let mut stream = CommandStream::new(CodeModel::Standalone);
            // pairs: (0,1) (2,3) (4,5), then (6,7)
            stream.feed_packed(&[0x01, 0x13, 0x25, 0x37]).unwrap();
            stream.finish().unwrap().finish(CodeModel::Standalone).unwrap()
        };
        assert_eq!(plain.bytes(), packed.bytes());
    }

    #[test]
    fn packed_runs_and_triples_decode() {
        let plain = {
            let mut stream = CommandStream::new(CodeModel::Function);
            stream.feed_plain(b"+++++>>><<+-<").unwrap();
            stream.finish().unwrap().finish(CodeModel::Function).unwrap()
        };
        let packed = {
            let mut stream = CommandStream::new(CodeModel::Function);
            // runs of five + and three >, a run of two <, and the
            // triple + - <
            stream.feed_packed(&[0x58, 0x4b, 0xc2, 0x86]).unwrap();
            stream.finish().unwrap().finish(CodeModel::Function).unwrap()
        };
        assert_eq!(plain.bytes(), packed.bytes());
    }

    #[test]
    fn a_singleton_pair_encodes_one_command() {
        // both halves name the same command: only one is taken
        let packed = {
            let mut stream = CommandStream::new(CodeModel::Function);
            stream.feed_packed(&[0x00]).unwrap();
            stream.finish().unwrap().finish(CodeModel::Function).unwrap()
        };
        let plain = {
            let mut stream = CommandStream::new(CodeModel::Function);
            stream.feed_plain(b"+").unwrap();
            stream.finish().unwrap().finish(CodeModel::Function).unwrap()
        };
        assert_eq!(plain.bytes(), packed.bytes());
    }

    #[test]
    fn unmatched_brackets_surface_as_errors() {
        // a stray ] stays pending until the stream flushes it
        let mut stream = CommandStream::new(CodeModel::Standalone);
        stream.feed_plain(b"+]").unwrap();
        assert_eq!(stream.finish().unwrap_err().to_string(), "unmatched ]");

        let mut stream = CommandStream::new(CodeModel::Standalone);
        stream.feed_plain(b"[+").unwrap();
        let err = stream
            .finish()
            .unwrap()
            .finish(CodeModel::Standalone)
            .unwrap_err();
        assert_eq!(err.to_string(), "unmatched [");
    }
}
