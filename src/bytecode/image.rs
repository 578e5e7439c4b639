//! The in-memory bytecode image and its on-disk binary format.
//!
//! Little-endian layout:
//!
//! ```txt
//! magic: 5 bytes = "\x7fVIUA"
//! kind:  1 byte in {EXECUTABLE=0x01, LINKABLE=0x02}
//! meta_info:   NUL-terminated (key, value) pairs, terminated by extra NUL
//! ext_fn_sigs: length-prefixed array of NUL-terminated names
//! ext_bl_sigs: length-prefixed array of NUL-terminated names
//! jump_table:  length-prefixed array of 64-bit offsets
//! fn_table:    length-prefixed array of (name, 64-bit address)
//! bl_table:    length-prefixed array of (name, 64-bit address)
//! bytecode:    length-prefixed byte array
//! ```

use std::fs;
use std::io::Write;
use std::path::Path;

use thiserror::Error;

use crate::common::Map;

pub const MAGIC: &[u8; 5] = b"\x7fVIUA";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ImageKind {
    Executable = 0x01,
    Linkable = 0x02,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic number")]
    BadMagic,
    #[error("bad binary kind: 0x{0:02x}")]
    BadKind(u8),
    #[error("malformed image: {0}")]
    Malformed(String),
}

/// A loaded module: symbol tables plus the bytecode blob they index.
#[derive(Clone, Debug)]
pub struct Image {
    kind: ImageKind,
    meta: Map<String, String>,
    external_fn_signatures: Vec<String>,
    external_block_signatures: Vec<String>,
    jump_table: Vec<u64>,
    functions: Map<String, u64>,
    blocks: Map<String, u64>,
    bytecode: Vec<u8>,
}

impl Image {
    pub fn new(kind: ImageKind) -> Image {
        Image {
            kind,
            meta: Map::new(),
            external_fn_signatures: Vec::new(),
            external_block_signatures: Vec::new(),
            jump_table: Vec::new(),
            functions: Map::new(),
            blocks: Map::new(),
            bytecode: Vec::new(),
        }
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn set_bytecode(&mut self, bytecode: Vec<u8>) {
        self.bytecode = bytecode;
    }

    pub fn meta(&self) -> &Map<String, String> {
        &self.meta
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.meta.insert(key.into(), value.into());
    }

    pub fn functions(&self) -> &Map<String, u64> {
        &self.functions
    }

    pub fn blocks(&self) -> &Map<String, u64> {
        &self.blocks
    }

    pub fn jump_table(&self) -> &[u64] {
        &self.jump_table
    }

    pub fn external_fn_signatures(&self) -> &[String] {
        &self.external_fn_signatures
    }

    pub fn external_block_signatures(&self) -> &[String] {
        &self.external_block_signatures
    }

    pub fn add_function(&mut self, name: impl Into<String>, address: u64) {
        self.functions.insert(name.into(), address);
    }

    pub fn add_block(&mut self, name: impl Into<String>, address: u64) {
        self.blocks.insert(name.into(), address);
    }

    pub fn add_jump(&mut self, offset: u64) {
        self.jump_table.push(offset);
    }

    pub fn add_external_fn_signature(&mut self, name: impl Into<String>) {
        self.external_fn_signatures.push(name.into());
    }

    pub fn add_external_block_signature(&mut self, name: impl Into<String>) {
        self.external_block_signatures.push(name.into());
    }

    /// Function sizes, derived by subtracting consecutive entry addresses
    /// sorted by address; the last function runs to the end of the
    /// bytecode.
    pub fn function_sizes(&self) -> Map<String, u64> {
        let mut by_address: Vec<(&String, u64)> =
            self.functions.iter().map(|(name, addr)| (name, *addr)).collect();
        by_address.sort_by_key(|(_, addr)| *addr);

        let mut sizes = Map::new();
        for (i, (name, addr)) in by_address.iter().enumerate() {
            let end = by_address
                .get(i + 1)
                .map(|(_, next)| *next)
                .unwrap_or(self.bytecode.len() as u64);
            sizes.insert((*name).clone(), end - addr);
        }
        sizes
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(self.kind as u8);

        for (key, value) in &self.meta {
            write_str(&mut out, key);
            write_str(&mut out, value);
        }
        out.push(0);

        write_count(&mut out, self.external_fn_signatures.len());
        for name in &self.external_fn_signatures {
            write_str(&mut out, name);
        }
        write_count(&mut out, self.external_block_signatures.len());
        for name in &self.external_block_signatures {
            write_str(&mut out, name);
        }

        write_count(&mut out, self.jump_table.len());
        for offset in &self.jump_table {
            out.extend_from_slice(&offset.to_le_bytes());
        }

        write_count(&mut out, self.functions.len());
        for (name, address) in &self.functions {
            write_str(&mut out, name);
            out.extend_from_slice(&address.to_le_bytes());
        }
        write_count(&mut out, self.blocks.len());
        for (name, address) in &self.blocks {
            write_str(&mut out, name);
            out.extend_from_slice(&address.to_le_bytes());
        }

        write_count(&mut out, self.bytecode.len());
        out.extend_from_slice(&self.bytecode);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Image, LoadError> {
        let mut r = Reader { bytes, pos: 0 };

        if r.take(MAGIC.len())? != MAGIC {
            return Err(LoadError::BadMagic);
        }
        let kind = match r.byte()? {
            0x01 => ImageKind::Executable,
            0x02 => ImageKind::Linkable,
            other => return Err(LoadError::BadKind(other)),
        };

        let mut image = Image::new(kind);
        loop {
            if r.peek()? == 0 {
                r.byte()?;
                break;
            }
            let key = r.string()?;
            let value = r.string()?;
            image.meta.insert(key, value);
        }

        for _ in 0..r.count()? {
            let name = r.string()?;
            image.external_fn_signatures.push(name);
        }
        for _ in 0..r.count()? {
            let name = r.string()?;
            image.external_block_signatures.push(name);
        }
        for _ in 0..r.count()? {
            image.jump_table.push(r.u64()?);
        }
        for _ in 0..r.count()? {
            let name = r.string()?;
            let address = r.u64()?;
            image.functions.insert(name, address);
        }
        for _ in 0..r.count()? {
            let name = r.string()?;
            let address = r.u64()?;
            image.blocks.insert(name, address);
        }
        let length = r.count()?;
        image.bytecode = r.take(length)?.to_vec();
        Ok(image)
    }

    pub fn store_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let mut file = fs::File::create(path)?;
        file.write_all(&self.to_bytes())
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Image, LoadError> {
        let bytes = fs::read(path)?;
        Image::from_bytes(&bytes)
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn write_count(out: &mut Vec<u8>, n: usize) {
    out.extend_from_slice(&(n as u64).to_le_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        if self.pos + n > self.bytes.len() {
            return Err(LoadError::Malformed(format!(
                "unexpected end of image at byte {}",
                self.pos
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn peek(&self) -> Result<u8, LoadError> {
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or_else(|| LoadError::Malformed("unexpected end of image".into()))
    }

    fn u64(&mut self) -> Result<u64, LoadError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn count(&mut self) -> Result<usize, LoadError> {
        Ok(self.u64()? as usize)
    }

    fn string(&mut self) -> Result<String, LoadError> {
        let rest = &self.bytes[self.pos..];
        let nul = rest
            .iter()
            .position(|byte| *byte == 0)
            .ok_or_else(|| LoadError::Malformed("unterminated string".into()))?;
        let s = String::from_utf8(rest[..nul].to_vec())
            .map_err(|_| LoadError::Malformed("string is not UTF-8".into()))?;
        self.pos += nul + 1;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Image {
        let mut image = Image::new(ImageKind::Executable);
        image.set_meta("assembler", "viua-emit");
        image.add_external_fn_signature("printer::print/1");
        image.add_function("main/0", 0);
        image.add_function("helper/1", 24);
        image.add_block("main/0::catch", 40);
        image.add_jump(8);
        image.set_bytecode(vec![7; 48]);
        image
    }

    #[test]
    fn round_trip_preserves_tables_and_bytes() {
        let image = sample();
        let loaded = Image::from_bytes(&image.to_bytes()).unwrap();
        assert_eq!(loaded.kind(), ImageKind::Executable);
        assert_eq!(loaded.functions(), image.functions());
        assert_eq!(loaded.blocks(), image.blocks());
        assert_eq!(loaded.jump_table(), image.jump_table());
        assert_eq!(loaded.meta(), image.meta());
        assert_eq!(
            loaded.external_fn_signatures(),
            image.external_fn_signatures()
        );
        assert_eq!(loaded.bytecode(), image.bytecode());
    }

    #[test]
    fn function_sizes_subtract_consecutive_addresses() {
        let sizes = sample().function_sizes();
        assert_eq!(sizes["main/0"], 24);
        assert_eq!(sizes["helper/1"], 24);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = sample().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(Image::from_bytes(&bytes), Err(LoadError::BadMagic)));
    }
}
