//! Typed-operand decoding over a moving byte cursor.
//!
//! Every operand starts with a prefix byte packing the access mode (low
//! three bits) and the register-set selector (next two bits); register
//! operands follow with a 32-bit little-endian index.  Atoms and text
//! literals are NUL-terminated payloads behind a `Literal` prefix, which
//! is what lets `call`-family instructions distinguish a function name
//! from a `*register` callable.  Timeouts are 32-bit raw milliseconds
//! where zero means an infinite wait and any positive n means (n−1) ms.
//!
//! The decoder never allocates values; it only returns numeric
//! identifiers and slices, reading operands in left-to-right program
//! order.

use derive_more::Display;

use crate::fault::Fault;
use crate::registers::RsSel;
use super::ops::Opcode;

/// Operand access mode, packed into the prefix byte.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, derive_more::TryFrom)]
#[try_from(repr)]
#[repr(u8)]
pub enum Access {
    /// The numbered register itself.
    #[display("direct")]
    Direct = 0,
    /// The register named by the Integer held in the numbered register.
    #[display("register-reference")]
    RegisterReference = 1,
    /// The value behind the Pointer held in the numbered register.
    #[display("pointer-dereference")]
    PointerDereference = 2,
    /// No register at all: discard the result.
    #[display("void")]
    Void = 3,
    /// A NUL-terminated payload follows instead of an index.
    #[display("literal")]
    Literal = 4,
}

const ACCESS_BITS: u8 = 0b0000_0111;
const RS_SHIFT: u8 = 3;
const RS_BITS: u8 = 0b0001_1000;

pub fn pack_prefix(access: Access, rs: RsSel) -> u8 {
    (access as u8) | ((rs as u8) << RS_SHIFT)
}

/// A decoded register operand: index, register-set selector and access
/// mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RegisterOperand {
    pub index: u32,
    pub rs: RsSel,
    pub access: Access,
}

/// Wait limit for `join` and `receive`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum Timeout {
    #[display("infinity")]
    Infinite,
    #[display("{_0}ms")]
    Ms(u32),
}

impl Timeout {
    pub fn encode(self) -> u32 {
        match self {
            Timeout::Infinite => 0,
            Timeout::Ms(ms) => ms + 1,
        }
    }

    pub fn decode(raw: u32) -> Timeout {
        match raw {
            0 => Timeout::Infinite,
            n => Timeout::Ms(n - 1),
        }
    }
}

pub struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8], pos: usize) -> Decoder<'a> {
        Decoder { bytes, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn truncated(&self, what: &str) -> Fault {
        Fault::InvalidInstruction(format!("truncated {} at byte {}", what, self.pos))
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], Fault> {
        if self.pos + n > self.bytes.len() {
            return Err(self.truncated(what));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_byte(&mut self, what: &str) -> Result<u8, Fault> {
        Ok(self.take(1, what)?[0])
    }

    pub fn fetch_opcode(&mut self) -> Result<Opcode, Fault> {
        let at = self.pos;
        let byte = self.take_byte("opcode")?;
        Opcode::try_from(byte)
            .map_err(|_| Fault::InvalidInstruction(format!("unknown opcode 0x{:02x} at byte {}", byte, at)))
    }

    fn fetch_prefix(&mut self) -> Result<(Access, RsSel), Fault> {
        let at = self.pos;
        let byte = self.take_byte("operand prefix")?;
        let access = Access::try_from(byte & ACCESS_BITS).map_err(|_| {
            Fault::InvalidInstruction(format!("bad access mode 0x{:02x} at byte {}", byte, at))
        })?;
        let rs = RsSel::from_u8((byte & RS_BITS) >> RS_SHIFT).ok_or_else(|| {
            Fault::InvalidInstruction(format!("bad register set 0x{:02x} at byte {}", byte, at))
        })?;
        Ok((access, rs))
    }

    /// Peek whether the next operand is void, without advancing.
    pub fn is_void(&self) -> bool {
        self.bytes
            .get(self.pos)
            .map(|byte| byte & ACCESS_BITS == Access::Void as u8)
            .unwrap_or(false)
    }

    /// Peek whether the next operand is a literal payload.
    pub fn is_literal(&self) -> bool {
        self.bytes
            .get(self.pos)
            .map(|byte| byte & ACCESS_BITS == Access::Literal as u8)
            .unwrap_or(false)
    }

    /// Consume a void operand (prefix byte only, no payload).
    pub fn fetch_void(&mut self) -> Result<(), Fault> {
        let (access, _) = self.fetch_prefix()?;
        if access == Access::Void {
            Ok(())
        } else {
            Err(Fault::InvalidInstruction(format!(
                "expected void operand, found {}",
                access
            )))
        }
    }

    pub fn fetch_register_index(&mut self) -> Result<RegisterOperand, Fault> {
        let (access, rs) = self.fetch_prefix()?;
        match access {
            Access::Direct | Access::RegisterReference | Access::PointerDereference => {
                let index = u32::from_le_bytes(self.take(4, "register index")?.try_into().unwrap());
                Ok(RegisterOperand { index, rs, access })
            }
            other => Err(Fault::InvalidInstruction(format!(
                "expected register operand, found {}",
                other
            ))),
        }
    }

    /// A register operand or void.
    pub fn fetch_target(&mut self) -> Result<Option<RegisterOperand>, Fault> {
        if self.is_void() {
            self.fetch_void()?;
            Ok(None)
        } else {
            self.fetch_register_index().map(Some)
        }
    }

    /// NUL-terminated UTF-8 payload behind a `Literal` prefix.
    pub fn fetch_atom(&mut self) -> Result<&'a str, Fault> {
        let (access, _) = self.fetch_prefix()?;
        if access != Access::Literal {
            return Err(Fault::InvalidInstruction(format!(
                "expected literal operand, found {}",
                access
            )));
        }
        let rest = &self.bytes[self.pos..];
        let nul = rest
            .iter()
            .position(|byte| *byte == 0)
            .ok_or_else(|| self.truncated("atom"))?;
        let text = std::str::from_utf8(&rest[..nul])
            .map_err(|_| Fault::InvalidInstruction(format!("atom at byte {} is not UTF-8", self.pos)))?;
        self.pos += nul + 1;
        Ok(text)
    }

    pub fn fetch_primitive_uint(&mut self) -> Result<u32, Fault> {
        Ok(u32::from_le_bytes(self.take(4, "uint")?.try_into().unwrap()))
    }

    pub fn fetch_primitive_int(&mut self) -> Result<i64, Fault> {
        Ok(i64::from_le_bytes(self.take(8, "int")?.try_into().unwrap()))
    }

    pub fn fetch_primitive_float(&mut self) -> Result<f64, Fault> {
        Ok(f64::from_le_bytes(self.take(8, "float")?.try_into().unwrap()))
    }

    pub fn fetch_timeout(&mut self) -> Result<Timeout, Fault> {
        let raw = u32::from_le_bytes(self.take(4, "timeout")?.try_into().unwrap());
        Ok(Timeout::decode(raw))
    }

    /// Length-prefixed byte array holding a packed bit string.
    pub fn fetch_bitstring(&mut self) -> Result<&'a [u8], Fault> {
        let length = u64::from_le_bytes(self.take(8, "bitstring length")?.try_into().unwrap());
        self.take(length as usize, "bitstring")
    }

    /// Absolute jump target within the current module.
    pub fn fetch_address(&mut self) -> Result<usize, Fault> {
        Ok(u64::from_le_bytes(self.take(8, "address")?.try_into().unwrap()) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_packing_round_trips() {
        for (access, rs) in [
            (Access::Direct, RsSel::Current),
            (Access::RegisterReference, RsSel::Local),
            (Access::PointerDereference, RsSel::Static),
            (Access::Void, RsSel::Global),
        ] {
            let byte = pack_prefix(access, rs);
            let mut decoder = Decoder::new(std::slice::from_ref(&byte), 0);
            if access == Access::Void {
                assert!(decoder.is_void());
            } else {
                let bytes = [byte, 7, 0, 0, 0];
                let mut decoder = Decoder::new(&bytes, 0);
                let operand = decoder.fetch_register_index().unwrap();
                assert_eq!(operand.access, access);
                assert_eq!(operand.rs, rs);
                assert_eq!(operand.index, 7);
                continue;
            }
            decoder.fetch_void().unwrap();
        }
    }

    #[test]
    fn timeouts_decode_with_the_infinity_convention() {
        assert_eq!(Timeout::decode(0), Timeout::Infinite);
        assert_eq!(Timeout::decode(1), Timeout::Ms(0));
        assert_eq!(Timeout::decode(501), Timeout::Ms(500));
        assert_eq!(Timeout::Ms(500).encode(), 501);
        assert_eq!(Timeout::Infinite.encode(), 0);
    }

    #[test]
    fn atoms_are_nul_terminated_literals() {
        let mut bytes = vec![pack_prefix(Access::Literal, RsSel::Current)];
        bytes.extend_from_slice(b"main/0\0");
        let mut decoder = Decoder::new(&bytes, 0);
        assert!(decoder.is_literal());
        assert_eq!(decoder.fetch_atom().unwrap(), "main/0");
        assert_eq!(decoder.position(), bytes.len());
    }

    #[test]
    fn truncated_operands_are_decode_errors() {
        let bytes = [pack_prefix(Access::Direct, RsSel::Local), 1, 2];
        let mut decoder = Decoder::new(&bytes, 0);
        assert!(matches!(
            decoder.fetch_register_index(),
            Err(Fault::InvalidInstruction(_))
        ));
    }
}
