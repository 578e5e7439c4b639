//! The polymorphic value model shared by all register contents.
//!
//! A value is owned by exactly one slot at any moment, except when
//! accessed through a [Pointer][Value::Pointer] (weak, validated on
//! dereference) or a [Reference][Value::Reference] (counted shared
//! ownership).  Every operation that writes to a slot with existing
//! content first destroys that content.

use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::common::Id;
use crate::fault::Fault;
use crate::process::{Pid, ProcessShared};
use crate::registers::RegisterSet;

/// Shared cell backing `Reference` values and pointer targets.
pub type Cell = Arc<Mutex<Value>>;
/// Weak handle to a shared cell, held by `Pointer` values.
pub type CellRef = Weak<Mutex<Value>>;

pub fn cell(value: Value) -> Cell {
    Arc::new(Mutex::new(value))
}

#[derive(Clone)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Byte(u8),
    Bits(Bits),
    /// Immutable UTF-8 text, indexed by code point.
    Text(String),
    /// Legacy mutable byte string.
    String(Vec<u8>),
    Atom(Id),
    Vector(Vec<Value>),
    /// Insertion-ordered mapping from atom to owned value.
    Struct(IndexMap<Id, Value>),
    Closure(Closure),
    Function(Id),
    Process(ProcessHandle),
    Pointer(CellRef),
    Reference(Cell),
    Exception(Exception),
    Object(Object),
    /// Class under construction; finalised into the kernel registry by
    /// the `register` instruction.
    Prototype(Prototype),
}

#[derive(Clone)]
pub struct Closure {
    pub function: Id,
    pub captures: RegisterSet,
}

#[derive(Clone)]
pub struct ProcessHandle {
    pub pid: Pid,
    pub link: Weak<ProcessShared>,
}

#[derive(Clone)]
pub struct Exception {
    pub tag: Id,
    pub message: String,
    pub payload: Option<Box<Value>>,
}

impl Exception {
    pub fn new(tag: Id, message: impl Into<String>) -> Exception {
        Exception {
            tag,
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_payload(tag: Id, message: impl Into<String>, payload: Value) -> Exception {
        Exception {
            tag,
            message: message.into(),
            payload: Some(Box::new(payload)),
        }
    }
}

#[derive(Clone)]
pub struct Object {
    pub class: Id,
    pub attributes: IndexMap<Id, Value>,
}

#[derive(Clone)]
pub struct Prototype {
    pub name: Id,
    pub ancestors: Vec<Id>,
    /// Method name to function name, attached with the `attach`
    /// instruction.
    pub methods: crate::common::Map<Id, Id>,
}

impl Prototype {
    pub fn new(name: Id) -> Prototype {
        Prototype {
            name,
            ancestors: Vec::new(),
            methods: crate::common::Map::new(),
        }
    }
}

impl Value {
    /// Name used for dynamic type checks and catcher matching.
    pub fn type_name(&self) -> String {
        match self {
            Value::Integer(_) => "Integer".into(),
            Value::Float(_) => "Float".into(),
            Value::Boolean(_) => "Boolean".into(),
            Value::Byte(_) => "Byte".into(),
            Value::Bits(_) => "Bits".into(),
            Value::Text(_) => "Text".into(),
            Value::String(_) => "String".into(),
            Value::Atom(_) => "Atom".into(),
            Value::Vector(_) => "Vector".into(),
            Value::Struct(_) => "Struct".into(),
            Value::Closure(_) => "Closure".into(),
            Value::Function(_) => "Function".into(),
            Value::Process(_) => "Process".into(),
            Value::Pointer(_) => "Pointer".into(),
            Value::Reference(cell) => cell.lock().type_name(),
            Value::Exception(e) => e.tag.to_string(),
            Value::Object(o) => o.class.to_string(),
            Value::Prototype(_) => "Prototype".into(),
        }
    }

    /// Human-readable form: text without quotes, numbers as printed.
    pub fn str(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::String(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Atom(a) => a.to_string(),
            Value::Exception(e) => e.message.clone(),
            Value::Reference(cell) => cell.lock().str(),
            other => other.repr(),
        }
    }

    /// Unambiguous form used by tests and diagnostics.
    pub fn repr(&self) -> String {
        match self {
            Value::Integer(n) => n.to_string(),
            Value::Float(x) => x.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Byte(b) => format!("0x{:02x}", b),
            Value::Bits(bits) => bits.to_string(),
            Value::Text(s) => format!("{:?}", s),
            Value::String(b) => format!("{:?}", String::from_utf8_lossy(b)),
            Value::Atom(a) => format!("'{}'", a),
            Value::Vector(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Struct(fields) => {
                let inner: Vec<String> = fields
                    .iter()
                    .map(|(k, v)| format!("'{}': {}", k, v.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Closure(c) => format!("Closure: {}", c.function),
            Value::Function(f) => format!("Function: {}", f),
            Value::Process(p) => format!("Process: {}", p.pid),
            Value::Pointer(target) => {
                if target.strong_count() > 0 {
                    "Pointer".into()
                } else {
                    "Pointer (expired)".into()
                }
            }
            Value::Reference(cell) => cell.lock().repr(),
            Value::Exception(e) => format!("{}: {}", e.tag, e.message),
            Value::Object(o) => {
                let inner: Vec<String> = o
                    .attributes
                    .iter()
                    .map(|(k, v)| format!("'{}': {}", k, v.repr()))
                    .collect();
                format!("{}{{{}}}", o.class, inner.join(", "))
            }
            Value::Prototype(p) => format!("Prototype for {}", p.name),
        }
    }

    /// Truth value used by `if` and boolean instructions.
    pub fn boolean(&self) -> bool {
        match self {
            Value::Integer(n) => *n != 0,
            Value::Float(x) => *x != 0.0,
            Value::Boolean(b) => *b,
            Value::Byte(b) => *b != 0,
            Value::Text(s) => !s.is_empty(),
            Value::String(b) => !b.is_empty(),
            Value::Pointer(target) => target.strong_count() > 0,
            Value::Reference(cell) => cell.lock().boolean(),
            _ => true,
        }
    }

    /// Deep clone.  Pointer copies are shallow weak references and
    /// Reference copies share the pointee.
    pub fn copy(&self) -> Value {
        self.clone()
    }

    /// Deep copy for crossing a process boundary: severs `Reference`
    /// sharing and expires `Pointer`s, so no aliasing survives the send.
    pub fn isolate(&self) -> Value {
        match self {
            Value::Reference(cell) => cell.lock().isolate(),
            Value::Pointer(_) => Value::Pointer(Weak::new()),
            Value::Vector(items) => Value::Vector(items.iter().map(Value::isolate).collect()),
            Value::Struct(fields) => Value::Struct(
                fields
                    .iter()
                    .map(|(k, v)| (*k, v.isolate()))
                    .collect(),
            ),
            Value::Closure(c) => Value::Closure(Closure {
                function: c.function,
                captures: c.captures.isolate(),
            }),
            Value::Exception(e) => Value::Exception(Exception {
                tag: e.tag,
                message: e.message.clone(),
                payload: e.payload.as_ref().map(|p| Box::new(p.isolate())),
            }),
            Value::Object(o) => Value::Object(Object {
                class: o.class,
                attributes: o
                    .attributes
                    .iter()
                    .map(|(k, v)| (*k, v.isolate()))
                    .collect(),
            }),
            other => other.clone(),
        }
    }

    fn type_error(&self, expected: &'static str) -> Fault {
        Fault::Type {
            expected,
            got: self.type_name(),
        }
    }

    pub fn as_integer(&self) -> Result<i64, Fault> {
        match self {
            Value::Integer(n) => Ok(*n),
            Value::Reference(cell) => cell.lock().as_integer(),
            other => Err(other.type_error("Integer")),
        }
    }

    pub fn as_float(&self) -> Result<f64, Fault> {
        match self {
            Value::Float(x) => Ok(*x),
            Value::Reference(cell) => cell.lock().as_float(),
            other => Err(other.type_error("Float")),
        }
    }

    pub fn as_text(&self) -> Result<String, Fault> {
        match self {
            Value::Text(s) => Ok(s.clone()),
            Value::Reference(cell) => cell.lock().as_text(),
            other => Err(other.type_error("Text")),
        }
    }

    pub fn as_atom(&self) -> Result<Id, Fault> {
        match self {
            Value::Atom(a) => Ok(*a),
            Value::Reference(cell) => cell.lock().as_atom(),
            other => Err(other.type_error("Atom")),
        }
    }

    pub fn as_bits(&self) -> Result<Bits, Fault> {
        match self {
            Value::Bits(b) => Ok(b.clone()),
            Value::Reference(cell) => cell.lock().as_bits(),
            other => Err(other.type_error("Bits")),
        }
    }

    pub fn as_process(&self) -> Result<ProcessHandle, Fault> {
        match self {
            Value::Process(p) => Ok(p.clone()),
            Value::Reference(cell) => cell.lock().as_process(),
            other => Err(other.type_error("Process")),
        }
    }

    /// Shallow equality over scalar variants; `Integer` and `Float`
    /// compare numerically across each other.
    pub fn equals(&self, other: &Value) -> Result<bool, Fault> {
        match (self, other) {
            (Value::Reference(cell), b) => cell.lock().equals(b),
            (a, Value::Reference(cell)) => a.equals(&cell.lock()),
            (Value::Integer(a), Value::Integer(b)) => Ok(a == b),
            (Value::Float(a), Value::Float(b)) => Ok(a == b),
            (Value::Integer(a), Value::Float(b)) => Ok((*a as f64) == *b),
            (Value::Float(a), Value::Integer(b)) => Ok(*a == (*b as f64)),
            (Value::Boolean(a), Value::Boolean(b)) => Ok(a == b),
            (Value::Byte(a), Value::Byte(b)) => Ok(a == b),
            (Value::Text(a), Value::Text(b)) => Ok(a == b),
            (Value::String(a), Value::String(b)) => Ok(a == b),
            (Value::Atom(a), Value::Atom(b)) => Ok(a == b),
            (a, _) => Err(a.type_error("comparable value")),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repr())
    }
}

/// Arbitrary-length bit string.  Bit 0 is the least significant bit;
/// the textual form prints most significant first.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Bits {
    bits: Vec<bool>,
}

impl Bits {
    pub fn zeroed(width: usize) -> Bits {
        Bits {
            bits: vec![false; width],
        }
    }

    /// Interpret bytes little-endian: byte 0 carries bits 0..8.
    pub fn from_bytes(bytes: &[u8]) -> Bits {
        let mut bits = Vec::with_capacity(bytes.len() * 8);
        for byte in bytes {
            for i in 0..8 {
                bits.push(byte & (1 << i) != 0);
            }
        }
        Bits { bits }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.bits.len().div_ceil(8)];
        for (i, bit) in self.bits.iter().enumerate() {
            if *bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        bytes
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<bool> {
        self.bits.get(index).copied()
    }

    pub fn set(&mut self, index: usize, bit: bool) -> Result<(), Fault> {
        match self.bits.get_mut(index) {
            Some(slot) => {
                *slot = bit;
                Ok(())
            }
            None => Err(Fault::OutOfRange(format!(
                "bit index out of range: {} >= {}",
                index,
                self.bits.len()
            ))),
        }
    }

    fn zip_with(&self, other: &Bits, f: impl Fn(bool, bool) -> bool) -> Bits {
        // Result width follows the left-hand operand; the right-hand side
        // is zero-extended or truncated to fit.
        let bits = (0..self.bits.len())
            .map(|i| f(self.bits[i], other.get(i).unwrap_or(false)))
            .collect();
        Bits { bits }
    }

    pub fn and(&self, other: &Bits) -> Bits {
        self.zip_with(other, |a, b| a && b)
    }

    pub fn or(&self, other: &Bits) -> Bits {
        self.zip_with(other, |a, b| a || b)
    }

    pub fn xor(&self, other: &Bits) -> Bits {
        self.zip_with(other, |a, b| a != b)
    }

    pub fn not(&self) -> Bits {
        Bits {
            bits: self.bits.iter().map(|b| !b).collect(),
        }
    }

    /// Logical shift towards the most significant end, zero fill.
    pub fn shl(&self, by: usize) -> Bits {
        let width = self.bits.len();
        let mut bits = vec![false; width];
        for i in 0..width.saturating_sub(by) {
            bits[i + by] = self.bits[i];
        }
        Bits { bits }
    }

    /// Logical shift towards the least significant end, zero fill.
    pub fn shr(&self, by: usize) -> Bits {
        let width = self.bits.len();
        let mut bits = vec![false; width];
        for i in by..width {
            bits[i - by] = self.bits[i];
        }
        Bits { bits }
    }

    /// Arithmetic right shift: vacated positions take the sign bit.
    pub fn ashr(&self, by: usize) -> Bits {
        let width = self.bits.len();
        let sign = self.bits.last().copied().unwrap_or(false);
        let mut bits = vec![sign; width];
        for i in by..width {
            bits[i - by] = self.bits[i];
        }
        Bits { bits }
    }

    pub fn rol(&self, by: usize) -> Bits {
        let width = self.bits.len();
        if width == 0 {
            return self.clone();
        }
        let by = by % width;
        let bits = (0..width)
            .map(|i| self.bits[(i + width - by) % width])
            .collect();
        Bits { bits }
    }

    pub fn ror(&self, by: usize) -> Bits {
        let width = self.bits.len();
        if width == 0 {
            return self.clone();
        }
        let by = by % width;
        let bits = (0..width).map(|i| self.bits[(i + by) % width]).collect();
        Bits { bits }
    }
}

impl fmt::Display for Bits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0b")?;
        for bit in self.bits.iter().rev() {
            write!(f, "{}", if *bit { '1' } else { '0' })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::id;

    #[test]
    fn copy_is_distinct_but_equal_by_repr() {
        let original = Value::Vector(vec![
            Value::Integer(42),
            Value::Text("answer".into()),
            Value::Atom(id("deep")),
        ]);
        let copied = original.copy();
        assert_eq!(original.repr(), copied.repr());
        // Mutating the copy must not show through to the original.
        if let (Value::Vector(orig), Value::Vector(mut copy)) = (original, copied) {
            copy.push(Value::Integer(1));
            assert_eq!(orig.len(), 3);
            assert_eq!(copy.len(), 4);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn pointer_copies_are_shallow_weak() {
        let target = cell(Value::Integer(7));
        let pointer = Value::Pointer(Arc::downgrade(&target));
        let copied = pointer.copy();
        assert!(copied.boolean());
        drop(target);
        assert!(!copied.boolean());
        assert_eq!(copied.repr(), "Pointer (expired)");
    }

    #[test]
    fn reference_reads_are_transparent() {
        let shared = Value::Reference(cell(Value::Integer(9)));
        assert_eq!(shared.as_integer().unwrap(), 9);
        assert_eq!(shared.type_name(), "Integer");
        assert_eq!(shared.repr(), "9");
    }

    #[test]
    fn isolate_severs_reference_sharing() {
        let shared = cell(Value::Integer(1));
        let value = Value::Vector(vec![Value::Reference(shared.clone())]);
        let isolated = value.isolate();
        *shared.lock() = Value::Integer(2);
        assert_eq!(isolated.repr(), "[1]");
    }

    #[test]
    fn bits_round_trip_and_shifts() {
        assert_eq!(Bits::zeroed(8).to_bytes(), vec![0]);
        let bits = Bits::from_bytes(&[0b0000_0101]);
        assert_eq!(bits.to_bytes(), vec![0b0000_0101]);
        assert_eq!(bits.shl(1).to_bytes(), vec![0b0000_1010]);
        assert_eq!(bits.shr(1).to_bytes(), vec![0b0000_0010]);
        assert_eq!(bits.rol(8).to_bytes(), vec![0b0000_0101]);
        let negative = Bits::from_bytes(&[0b1000_0000]);
        assert_eq!(negative.ashr(1).to_bytes(), vec![0b1100_0000]);
    }

    #[test]
    fn struct_repr_preserves_insertion_order() {
        let mut fields = IndexMap::new();
        fields.insert(id("zulu"), Value::Integer(1));
        fields.insert(id("alpha"), Value::Integer(2));
        assert_eq!(Value::Struct(fields).repr(), "{'zulu': 1, 'alpha': 2}");
    }
}
