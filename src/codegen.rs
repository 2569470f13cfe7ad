//! x86-64 code emission for the compiled program.
//!
//! The compiled program has a fixed register model: rsi holds the
//! cell pointer, edx holds the constant 1 for the read and write
//! system calls (which also keeps dh as a handy zero), and cell
//! arithmetic happens directly in memory. The body of the program is
//! identical in every code model; only the prolog and epilog differ.

use anyhow::{bail, Result};

use crate::buffer::Buffer;

/// How the produced code expects to be entered.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CodeModel {
    /// A standalone program entered at `_start`, exiting through the
    /// `exit` system call.
    Standalone,
    /// A function called from statically linked code, with its own
    /// cell array.
    Function,
    /// A function in position-independent code, locating its cell
    /// array through the global offset table.
    SharedFunction,
    /// A function taking the cell array as its first argument.
    BufferFunction,
}

// Byte offsets of the prolog fields that are patched or relocated
// once the layout is known.

/// In [`CodeModel::Standalone`]: the cell array address.
pub const STANDALONE_CELLS_AT: u64 = 2;
/// In [`CodeModel::Function`]: the cell array address.
pub const FUNCTION_CELLS_AT: u64 = 9;
/// In [`CodeModel::SharedFunction`]: where the return address of the
/// opening call lands, the anchor for the GOT displacement.
pub const SHARED_RETADDR_AT: u64 = 12;
/// In [`CodeModel::SharedFunction`]: displacement from the anchor to
/// the global offset table.
pub const SHARED_GOTPC_AT: u64 = 15;
/// In [`CodeModel::SharedFunction`]: offset of the cell array
/// relative to the global offset table.
pub const SHARED_CELLS_GOTOFF_AT: u64 = 28;

/// Deepest bracket nesting the emitter accepts.
pub const MAX_LOOP_DEPTH: usize = 256;

/// Emits the program one command at a time. Loops may nest up to
/// [`MAX_LOOP_DEPTH`] deep; the stack itself grows as needed.
#[derive(Debug)]
pub struct Assembler {
    code: Buffer,
    loops: Vec<u64>,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            code: Buffer::new(),
            loops: Vec::new(),
        }
    }

    /// Bytes emitted so far.
    pub fn len(&self) -> u64 {
        self.code.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Emits the entry code for the given model and the shared setup
    /// that follows it.
    pub fn emit_prolog(&mut self, model: CodeModel) {
        match model {
            CodeModel::Standalone => {
                // mov rsi, imm64 (cell array address, patched later)
                self.code.append(&[0x48, 0xbe]);
                self.code.append(&[0; 8]);
            }
            CodeModel::Function => {
                self.emit_frame();
                // mov rsi, imm64 (cell array address, relocated)
                self.code.append(&[0x48, 0xbe]);
                self.code.append(&[0; 8]);
                self.emit_cell_clear();
            }
            CodeModel::SharedFunction => {
                self.emit_frame();
                // call $+0 / pop rsi: the return address anchors the
                // position-independent address arithmetic
                self.code.append(&[0xe8, 0x00, 0x00, 0x00, 0x00]);
                self.code.push(0x5e);
                // mov rax, imm64 (displacement to the GOT)
                self.code.append(&[0x48, 0xb8]);
                self.code.append(&[0; 8]);
                // add rsi, rax
                self.code.append(&[0x48, 0x01, 0xc6]);
                // mov rax, imm64 (cell array offset from the GOT)
                self.code.append(&[0x48, 0xb8]);
                self.code.append(&[0; 8]);
                // add rsi, rax
                self.code.append(&[0x48, 0x01, 0xc6]);
                self.emit_cell_clear();
            }
            CodeModel::BufferFunction => {
                self.emit_frame();
                // mov rsi, rdi
                self.code.append(&[0x48, 0x89, 0xfe]);
            }
        }
        // mov edx, 1
        self.code.append(&[0xba, 0x01, 0x00, 0x00, 0x00]);
        self.loops.clear();
    }

    /// push rbp; mov rbp, rsp; push rsi; push rdi; push rdx
    fn emit_frame(&mut self) {
        self.code
            .append(&[0x55, 0x48, 0x89, 0xe5, 0x56, 0x57, 0x52]);
    }

    /// mov rdi, rsi; mov ecx, 0x8000; xor eax, eax; rep stosb
    fn emit_cell_clear(&mut self) {
        self.code.append(&[
            0x48, 0x89, 0xf7, 0xb9, 0x00, 0x80, 0x00, 0x00, 0x31, 0xc0, 0xf3, 0xaa,
        ]);
    }

    pub fn add(&mut self, count: u8) {
        if count == 1 {
            // inc byte [rsi]
            self.code.append(&[0xfe, 0x06]);
        } else {
            // add byte [rsi], count
            self.code.append(&[0x80, 0x06, count]);
        }
    }

    pub fn sub(&mut self, count: u8) {
        if count == 1 {
            // dec byte [rsi]
            self.code.append(&[0xfe, 0x0e]);
        } else {
            // sub byte [rsi], count
            self.code.append(&[0x80, 0x2e, count]);
        }
    }

    pub fn right(&mut self, count: u8) {
        if count == 1 {
            // inc rsi
            self.code.append(&[0x48, 0xff, 0xc6]);
        } else {
            // add rsi, count
            self.code.append(&[0x48, 0x83, 0xc6, count]);
        }
    }

    pub fn left(&mut self, count: u8) {
        if count == 1 {
            // dec rsi
            self.code.append(&[0x48, 0xff, 0xce]);
        } else {
            // sub rsi, count
            self.code.append(&[0x48, 0x83, 0xee, count]);
        }
    }

    pub fn read(&mut self, count: u8) {
        for _ in 0..count {
            // xor eax, eax; mov edi, eax; syscall
            self.code.append(&[0x31, 0xc0, 0x89, 0xc7, 0x0f, 0x05]);
        }
    }

    pub fn write(&mut self, count: u8) {
        for _ in 0..count {
            // mov eax, edx; mov edi, eax; syscall
            self.code.append(&[0x89, 0xd0, 0x89, 0xc7, 0x0f, 0x05]);
        }
    }

    /// mov byte [rsi], dh (dh is always zero)
    pub fn clear(&mut self) {
        self.code.append(&[0x88, 0x36]);
    }

    /// Opens `count` loops. Each one is a forward jump to its closing
    /// test; the displacement is patched when the loop closes.
    pub fn open_loop(&mut self, count: u8) -> Result<()> {
        if self.loops.len() + count as usize > MAX_LOOP_DEPTH {
            bail!("too many levels of nested loops");
        }
        for _ in 0..count {
            // jmp near (patched at the matching bracket)
            self.code.append(&[0xe9, 0x00, 0x00, 0x00, 0x00]);
            self.loops.push(self.code.len() as u64);
        }
        Ok(())
    }

    /// Closes `count` loops: patches the opening jump to land on the
    /// closing test and emits the test, a compare against zero and a
    /// conditional jump back to the loop body.
    pub fn close_loop(&mut self, count: u8) -> Result<()> {
        for _ in 0..count {
            let Some(body) = self.loops.pop() else {
                bail!("unmatched ]");
            };
            let body_len = (self.code.len() as u64 - body) as i32;
            self.code.put_u32(body as usize - 4, body_len as u32);
            if body_len + 4 <= 0x80 {
                // cmp dh, [rsi]; jnz short
                self.code.append(&[0x3a, 0x36, 0x75]);
                self.code.push((-(body_len + 4)) as u8);
            } else {
                // cmp dh, [rsi]; jnz near
                self.code.append(&[0x3a, 0x36, 0x0f, 0x85]);
                self.code.append(&(-(body_len + 8)).to_le_bytes());
            }
        }
        Ok(())
    }

    /// Emits the exit code and hands back the finished text. Fails if
    /// any loop is still open.
    pub fn finish(mut self, model: CodeModel) -> Result<Buffer> {
        if !self.loops.is_empty() {
            bail!("unmatched [");
        }
        if model == CodeModel::Standalone {
            // mov eax, 60; xor edi, edi; syscall
            self.code
                .append(&[0xb8, 0x3c, 0x00, 0x00, 0x00, 0x31, 0xff, 0x0f, 0x05]);
        } else {
            // pop rdx; pop rdi; pop rsi; pop rbp; ret
            self.code.append(&[0x5a, 0x5f, 0x5e, 0x5d, 0xc3]);
        }
        Ok(self.code)
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prolog_shapes() {
        let mut asm = Assembler::new();
        asm.emit_prolog(CodeModel::Standalone);
        assert_eq!(
            asm.code.bytes(),
            [
                0x48, 0xbe, 0, 0, 0, 0, 0, 0, 0, 0, // mov rsi, cells
                0xba, 0x01, 0x00, 0x00, 0x00, // mov edx, 1
            ]
        );
        assert_eq!(STANDALONE_CELLS_AT, 2);

        let mut asm = Assembler::new();
        asm.emit_prolog(CodeModel::Function);
        assert_eq!(asm.len(), 7 + 10 + 12 + 5);
        assert_eq!(asm.code.bytes()[FUNCTION_CELLS_AT as usize - 2], 0x48);
        assert_eq!(asm.code.bytes()[FUNCTION_CELLS_AT as usize - 1], 0xbe);

        let mut asm = Assembler::new();
        asm.emit_prolog(CodeModel::SharedFunction);
        assert_eq!(asm.len(), 51 + 5);
        // the opening call returns to the pop rsi at the anchor
        assert_eq!(asm.code.bytes()[SHARED_RETADDR_AT as usize], 0x5e);
        assert_eq!(asm.code.bytes()[SHARED_GOTPC_AT as usize - 2], 0x48);
        assert_eq!(asm.code.bytes()[SHARED_CELLS_GOTOFF_AT as usize - 2], 0x48);

        let mut asm = Assembler::new();
        asm.emit_prolog(CodeModel::BufferFunction);
        assert_eq!(
            asm.code.bytes(),
            [
                0x55, 0x48, 0x89, 0xe5, 0x56, 0x57, 0x52, // frame
                0x48, 0x89, 0xfe, // mov rsi, rdi
                0xba, 0x01, 0x00, 0x00, 0x00, // mov edx, 1
            ]
        );
    }

    #[test]
    fn single_commands_use_the_short_forms() {
        let mut asm = Assembler::new();
        asm.add(1);
        asm.sub(1);
        asm.right(1);
        asm.left(1);
        assert_eq!(
            asm.code.bytes(),
            [
                0xfe, 0x06, // inc byte [rsi]
                0xfe, 0x0e, // dec byte [rsi]
                0x48, 0xff, 0xc6, // inc rsi
                0x48, 0xff, 0xce, // dec rsi
            ]
        );
    }

    #[test]
    fn repeated_commands_fold_into_immediates() {
        let mut asm = Assembler::new();
        asm.add(5);
        asm.left(3);
        assert_eq!(
            asm.code.bytes(),
            [
                0x80, 0x06, 0x05, // add byte [rsi], 5
                0x48, 0x83, 0xee, 0x03, // sub rsi, 3
            ]
        );
    }

    #[test]
    fn io_commands_repeat_their_syscalls() {
        let mut asm = Assembler::new();
        asm.write(2);
        asm.read(1);
        assert_eq!(
            asm.code.bytes(),
            [
                0x89, 0xd0, 0x89, 0xc7, 0x0f, 0x05, // write
                0x89, 0xd0, 0x89, 0xc7, 0x0f, 0x05, // write
                0x31, 0xc0, 0x89, 0xc7, 0x0f, 0x05, // read
            ]
        );
    }

    #[test]
    fn an_empty_loop_jumps_to_its_test() {
        let mut asm = Assembler::new();
        asm.open_loop(1).unwrap();
        asm.close_loop(1).unwrap();
        assert_eq!(
            asm.code.bytes(),
            [
                0xe9, 0x00, 0x00, 0x00, 0x00, // jmp to the test
                0x3a, 0x36, 0x75, 0xfc, // cmp dh, [rsi]; jnz -4
            ]
        );
    }

    #[test]
    fn loop_displacements_are_patched() {
        let mut asm = Assembler::new();
        asm.open_loop(1).unwrap();
        asm.sub(1);
        asm.close_loop(1).unwrap();
        // jmp skips the 2-byte body; jnz hops back over body + test
        assert_eq!(
            asm.code.bytes(),
            [
                0xe9, 0x02, 0x00, 0x00, 0x00, // jmp +2
                0xfe, 0x0e, // dec byte [rsi]
                0x3a, 0x36, 0x75, 0xfa, // cmp dh, [rsi]; jnz -6
            ]
        );
    }

    #[test]
    fn a_body_of_124_bytes_still_takes_the_short_branch() {
        let mut asm = Assembler::new();
        asm.open_loop(1).unwrap();
        for _ in 0..62 {
            asm.add(1); // 2 bytes each
        }
        asm.close_loop(1).unwrap();
        let code = asm.code.bytes();
        assert_eq!(&code[1..5], &124u32.to_le_bytes());
        assert_eq!(&code[code.len() - 4..], &[0x3a, 0x36, 0x75, 0x80]); // jnz -128
    }

    #[test]
    fn a_body_of_125_bytes_needs_the_near_branch() {
        let mut asm = Assembler::new();
        asm.open_loop(1).unwrap();
        for _ in 0..61 {
            asm.add(1);
        }
        asm.right(1); // 122 + 3 = 125 bytes
        asm.close_loop(1).unwrap();
        let code = asm.code.bytes();
        assert_eq!(&code[1..5], &125u32.to_le_bytes());
        let tail = &code[code.len() - 8..];
        assert_eq!(&tail[..4], &[0x3a, 0x36, 0x0f, 0x85]);
        assert_eq!(&tail[4..], &(-133i32).to_le_bytes()); // jnz -(125 + 8)
    }

    #[test]
    fn bracket_mismatches_are_reported() {
        let mut asm = Assembler::new();
        assert_eq!(asm.close_loop(1).unwrap_err().to_string(), "unmatched ]");
        let mut asm = Assembler::new();
        asm.open_loop(1).unwrap();
        assert_eq!(
            asm.finish(CodeModel::Standalone).unwrap_err().to_string(),
            "unmatched ["
        );
    }

    #[test]
    fn nesting_deeper_than_the_limit_is_rejected() {
        let mut asm = Assembler::new();
        asm.open_loop(127).unwrap();
        asm.open_loop(127).unwrap();
        asm.open_loop(2).unwrap();
        let err = asm.open_loop(1).unwrap_err();
        assert_eq!(err.to_string(), "too many levels of nested loops");
        // the stack is untouched by the failed open
        asm.close_loop(127).unwrap();
        asm.close_loop(127).unwrap();
        asm.close_loop(2).unwrap();
        assert!(asm.finish(CodeModel::Function).is_ok());
    }

    #[test]
    fn epilogs_differ_by_model() {
        let mut asm = Assembler::new();
        asm.emit_prolog(CodeModel::Standalone);
        let code = asm.finish(CodeModel::Standalone).unwrap();
        assert_eq!(
            &code.bytes()[code.len() - 9..],
            [0xb8, 0x3c, 0x00, 0x00, 0x00, 0x31, 0xff, 0x0f, 0x05]
        );

        let mut asm = Assembler::new();
        asm.emit_prolog(CodeModel::Function);
        let code = asm.finish(CodeModel::Function).unwrap();
        assert_eq!(&code.bytes()[code.len() - 5..], [0x5a, 0x5f, 0x5e, 0x5d, 0xc3]);
    }
}
