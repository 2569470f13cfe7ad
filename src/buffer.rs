//! Raw contents of a single file part.

/// A growable byte buffer with little-endian accessors, backing the
/// contents of one part of an output file.
///
/// Offsets passed to the patching and reading methods must lie inside
/// the current contents; going past the end is a programming error
/// and panics.
#[derive(Default, Clone, Debug)]
pub struct Buffer {
    bytes: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Appends bytes at the end of the buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn push(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    /// Grows (or shrinks) the buffer to `len` bytes, zero-filling any
    /// new space.
    pub fn resize(&mut self, len: usize) {
        self.bytes.resize(len, 0);
    }

    /// Splices bytes into the buffer at `offset`, shifting everything
    /// after it.
    pub fn insert(&mut self, offset: usize, bytes: &[u8]) {
        self.bytes.splice(offset..offset, bytes.iter().copied());
    }

    /// Replaces bytes in place at `offset`.
    pub fn overwrite(&mut self, offset: usize, bytes: &[u8]) {
        self.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        let mut out = [0; 2];
        out.copy_from_slice(&self.bytes[offset..offset + 2]);
        u16::from_le_bytes(out)
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut out = [0; 4];
        out.copy_from_slice(&self.bytes[offset..offset + 4]);
        u32::from_le_bytes(out)
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut out = [0; 8];
        out.copy_from_slice(&self.bytes[offset..offset + 8]);
        u64::from_le_bytes(out)
    }

    pub fn put_u16(&mut self, offset: usize, value: u16) {
        self.overwrite(offset, &value.to_le_bytes());
    }

    pub fn put_u32(&mut self, offset: usize, value: u32) {
        self.overwrite(offset, &value.to_le_bytes());
    }

    pub fn put_u64(&mut self, offset: usize, value: u64) {
        self.overwrite(offset, &value.to_le_bytes());
    }

    /// The NUL-terminated string starting at `offset`, without its
    /// terminator. Runs to the end of the buffer if no NUL follows.
    pub fn cstr_at(&self, offset: usize) -> &[u8] {
        let tail = &self.bytes[offset..];
        match tail.iter().position(|&b| b == 0) {
            Some(end) => &tail[..end],
            None => tail,
        }
    }
}
