//! Indexed register containers with per-slot ownership flags.
//!
//! A register set is a fixed-size vector of slots, each carrying an
//! optional owned [Value] plus a mask of flags.  Accesses are bounds
//! checked and reads from empty slots are errors.

use bitflags::bitflags;

use crate::fault::Fault;
use crate::value::Value;

bitflags! {
    /// Per-slot flag mask.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Mask: u8 {
        /// Slot content was passed by move and not yet claimed.
        const MOVED = 1 << 0;
        /// Slot aliases another slot through a shared cell.
        const REFERENCE = 1 << 1;
        /// Slot survives mass-erase operations.
        const KEEP = 1 << 2;
    }
}

/// Which register set an operand selects.
#[derive(Clone, Copy, PartialEq, Eq, Debug, derive_more::Display)]
pub enum RsSel {
    #[display("current")]
    Current,
    #[display("local")]
    Local,
    #[display("static")]
    Static,
    #[display("global")]
    Global,
}

impl RsSel {
    pub fn from_u8(raw: u8) -> Option<RsSel> {
        match raw {
            0 => Some(RsSel::Current),
            1 => Some(RsSel::Local),
            2 => Some(RsSel::Static),
            3 => Some(RsSel::Global),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct RegisterSet {
    slots: Vec<Option<Value>>,
    masks: Vec<Mask>,
}

impl RegisterSet {
    pub fn new(size: usize) -> RegisterSet {
        RegisterSet {
            slots: vec![None; size],
            masks: vec![Mask::empty(); size],
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    fn check(&self, index: usize) -> Result<(), Fault> {
        if index < self.slots.len() {
            Ok(())
        } else {
            Err(Fault::OutOfRange(format!(
                "register access out of bounds: {} >= {}",
                index,
                self.slots.len()
            )))
        }
    }

    /// Install a value, destroying any existing content and clearing the
    /// slot's flags.
    pub fn set(&mut self, index: usize, value: Value) -> Result<(), Fault> {
        self.check(index)?;
        self.slots[index] = Some(value);
        self.masks[index] = Mask::empty();
        Ok(())
    }

    /// Read a slot; empty slots are an error.
    pub fn get(&self, index: usize) -> Result<&Value, Fault> {
        self.check(index)?;
        self.slots[index]
            .as_ref()
            .ok_or(Fault::NullRead(index))
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut Value, Fault> {
        self.check(index)?;
        self.slots[index]
            .as_mut()
            .ok_or(Fault::NullRead(index))
    }

    /// Bounds-checked read that tolerates empty slots.
    pub fn at(&self, index: usize) -> Result<Option<&Value>, Fault> {
        self.check(index)?;
        Ok(self.slots[index].as_ref())
    }

    /// Move a value out, leaving the slot empty.
    pub fn pop(&mut self, index: usize) -> Result<Value, Fault> {
        self.check(index)?;
        self.masks[index] = Mask::empty();
        self.slots[index].take().ok_or(Fault::NullRead(index))
    }

    /// Move a value out if present.
    pub fn take(&mut self, index: usize) -> Result<Option<Value>, Fault> {
        self.check(index)?;
        self.masks[index] = Mask::empty();
        Ok(self.slots[index].take())
    }

    /// Install possibly-absent content, clearing the slot's flags.
    /// Counterpart of [take](Self::take) for cross-set exchanges.
    pub fn put(&mut self, index: usize, value: Option<Value>) -> Result<(), Fault> {
        self.check(index)?;
        self.slots[index] = value;
        self.masks[index] = Mask::empty();
        Ok(())
    }

    /// Transfer ownership between slots; the source is empty after.
    pub fn move_register(&mut self, source: usize, target: usize) -> Result<(), Fault> {
        self.check(source)?;
        self.check(target)?;
        if self.slots[source].is_none() {
            return Err(Fault::NullRead(source));
        }
        self.slots[target] = self.slots[source].take();
        self.masks[target] = self.masks[source];
        self.masks[source] = Mask::empty();
        Ok(())
    }

    /// Exchange contents and flags of two slots.
    pub fn swap(&mut self, a: usize, b: usize) -> Result<(), Fault> {
        self.check(a)?;
        self.check(b)?;
        self.slots.swap(a, b);
        self.masks.swap(a, b);
        Ok(())
    }

    /// Destroy a slot's content.
    pub fn free(&mut self, index: usize) -> Result<(), Fault> {
        self.check(index)?;
        if self.slots[index].is_none() {
            return Err(Fault::NullRead(index));
        }
        self.slots[index] = None;
        self.masks[index] = Mask::empty();
        Ok(())
    }

    pub fn is_empty_at(&self, index: usize) -> Result<bool, Fault> {
        self.check(index)?;
        Ok(self.slots[index].is_none())
    }

    pub fn flag(&mut self, index: usize, mask: Mask) -> Result<(), Fault> {
        self.check(index)?;
        self.masks[index] |= mask;
        Ok(())
    }

    pub fn unflag(&mut self, index: usize, mask: Mask) -> Result<(), Fault> {
        self.check(index)?;
        self.masks[index] &= !mask;
        Ok(())
    }

    pub fn is_flagged(&self, index: usize, mask: Mask) -> Result<bool, Fault> {
        self.check(index)?;
        Ok(self.masks[index].contains(mask))
    }

    /// Deep copy for crossing a process boundary; see [Value::isolate].
    pub fn isolate(&self) -> RegisterSet {
        RegisterSet {
            slots: self
                .slots
                .iter()
                .map(|slot| slot.as_ref().map(Value::isolate))
                .collect(),
            masks: self.masks.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_then_set_restores_the_slot() {
        let mut registers = RegisterSet::new(4);
        registers.set(2, Value::Integer(44)).unwrap();
        let before = registers.get(2).unwrap().repr();
        let popped = registers.pop(2).unwrap();
        assert!(registers.is_empty_at(2).unwrap());
        registers.set(2, popped).unwrap();
        assert_eq!(registers.get(2).unwrap().repr(), before);
    }

    #[test]
    fn reads_from_empty_slots_are_errors() {
        let registers = RegisterSet::new(2);
        assert!(matches!(registers.get(0), Err(Fault::NullRead(0))));
        assert!(matches!(registers.get(7), Err(Fault::OutOfRange(_))));
    }

    #[test]
    fn move_empties_the_source_and_carries_flags() {
        let mut registers = RegisterSet::new(3);
        registers.set(0, Value::Integer(1)).unwrap();
        registers.flag(0, Mask::MOVED).unwrap();
        registers.move_register(0, 1).unwrap();
        assert!(registers.is_empty_at(0).unwrap());
        assert!(registers.is_flagged(1, Mask::MOVED).unwrap());
        assert!(!registers.is_flagged(0, Mask::MOVED).unwrap());
        registers.unflag(1, Mask::MOVED).unwrap();
        assert!(!registers.is_flagged(1, Mask::MOVED).unwrap());
    }

    #[test]
    fn swap_exchanges_contents_and_flags() {
        let mut registers = RegisterSet::new(2);
        registers.set(0, Value::Integer(1)).unwrap();
        registers.flag(0, Mask::KEEP).unwrap();
        registers.set(1, Value::Integer(2)).unwrap();
        registers.swap(0, 1).unwrap();
        assert_eq!(registers.get(0).unwrap().as_integer().unwrap(), 2);
        assert!(registers.is_flagged(1, Mask::KEEP).unwrap());
    }

    #[test]
    fn set_clears_the_moved_flag() {
        let mut registers = RegisterSet::new(1);
        registers.set(0, Value::Integer(1)).unwrap();
        registers.flag(0, Mask::MOVED).unwrap();
        registers.set(0, Value::Integer(2)).unwrap();
        assert!(!registers.is_flagged(0, Mask::MOVED).unwrap());
    }
}
