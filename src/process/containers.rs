//! Vector and struct instructions.

use indexmap::IndexMap;

use crate::bytecode::Decoder;
use crate::fault::{Fault, Trap};
use crate::value::Value;

use super::Process;

pub(super) fn op_vector(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let start = dec.fetch_register_index()?;
    let count = dec.fetch_primitive_uint()? as usize;

    // pack N consecutive registers; each source slot becomes empty
    let mut items = Vec::with_capacity(count);
    if count > 0 {
        let start = proc.resolve(start)?;
        if start.deref {
            return Err(Fault::Exception("cannot pack through a pointer dereference".into()).into());
        }
        for i in 0..count {
            let value = proc.registers_mut(start.rs)?.pop(start.index + i)?;
            items.push(value);
        }
    }
    proc.place(target, Value::Vector(items))?;
    Ok(dec.position())
}

/// Normalise a possibly-negative position into a vector of `length`
/// elements; -1 is the last element.
fn normalise(position: i64, length: usize, for_insert: bool) -> Result<usize, Fault> {
    let limit = if for_insert { length as i64 } else { length as i64 - 1 };
    let index = if position < 0 {
        length as i64 + position + if for_insert { 1 } else { 0 }
    } else {
        position
    };
    if index < 0 || index > limit {
        return Err(Fault::OutOfRange(format!(
            "vector index out of range: {} (length {})",
            position, length
        )));
    }
    Ok(index as usize)
}

pub(super) fn op_vinsert(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let vector = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let position = dec.fetch_target()?;
    let value = proc.pop_value(source)?;
    let position = match position {
        Some(operand) => Some(proc.fetch_int(operand)?),
        None => None,
    };

    proc.mutate(vector, |slot| match slot {
        Value::Vector(items) => {
            let index = normalise(position.unwrap_or(0), items.len(), true)?;
            items.insert(index, value);
            Ok(())
        }
        other => Err(Fault::Type {
            expected: "Vector",
            got: other.type_name(),
        }
        .into()),
    })?;
    Ok(dec.position())
}

pub(super) fn op_vpush(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let vector = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let value = proc.pop_value(source)?;
    proc.mutate(vector, |slot| match slot {
        Value::Vector(items) => {
            items.push(value);
            Ok(())
        }
        other => Err(Fault::Type {
            expected: "Vector",
            got: other.type_name(),
        }
        .into()),
    })?;
    Ok(dec.position())
}

pub(super) fn op_vpop(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_target()?;
    let vector = dec.fetch_register_index()?;
    let position = dec.fetch_target()?;
    let position = match position {
        Some(operand) => Some(proc.fetch_int(operand)?),
        None => None,
    };

    let value = proc.mutate(vector, |slot| match slot {
        Value::Vector(items) => {
            if items.is_empty() {
                return Err(Fault::OutOfRange("pop from an empty vector".into()).into());
            }
            let index = normalise(position.unwrap_or(-1), items.len(), false)?;
            Ok(items.remove(index))
        }
        other => Err(Fault::Type {
            expected: "Vector",
            got: other.type_name(),
        }
        .into()),
    })?;
    proc.place_opt(target, value)?;
    Ok(dec.position())
}

pub(super) fn op_vat(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let vector = dec.fetch_register_index()?;
    let position = dec.fetch_register_index()?;
    let position = proc.fetch_int(position)?;

    let resolved = proc.resolve(vector)?;
    let value = proc.with_value(&resolved, |slot| match slot {
        Value::Vector(items) => {
            let index = normalise(position, items.len(), false)?;
            Ok(items[index].copy())
        }
        other => Err(Fault::Type {
            expected: "Vector",
            got: other.type_name(),
        }
        .into()),
    })?;
    proc.place(target, value)?;
    Ok(dec.position())
}

pub(super) fn op_vlen(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let vector = dec.fetch_register_index()?;
    let resolved = proc.resolve(vector)?;
    let length = proc.with_value(&resolved, |slot| match slot {
        Value::Vector(items) => Ok(items.len() as i64),
        other => Err(Fault::Type {
            expected: "Vector",
            got: other.type_name(),
        }
        .into()),
    })?;
    proc.place(target, Value::Integer(length))?;
    Ok(dec.position())
}

pub(super) fn op_struct(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    proc.place(target, Value::Struct(IndexMap::new()))?;
    Ok(dec.position())
}

pub(super) fn op_structinsert(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let st = dec.fetch_register_index()?;
    let key = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let key = proc.fetch_atom_value(key)?;
    let value = proc.pop_value(source)?;

    proc.mutate(st, |slot| match slot {
        Value::Struct(fields) => {
            fields.insert(key, value);
            Ok(())
        }
        other => Err(Fault::Type {
            expected: "Struct",
            got: other.type_name(),
        }
        .into()),
    })?;
    Ok(dec.position())
}

pub(super) fn op_structremove(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_target()?;
    let st = dec.fetch_register_index()?;
    let key = dec.fetch_register_index()?;
    let key = proc.fetch_atom_value(key)?;

    let value = proc.mutate(st, |slot| match slot {
        Value::Struct(fields) => fields
            .shift_remove(&key)
            .ok_or_else(|| Fault::Exception(format!("struct has no key: '{}'", key)).into()),
        other => Err(Fault::Type {
            expected: "Struct",
            got: other.type_name(),
        }
        .into()),
    })?;
    proc.place_opt(target, value)?;
    Ok(dec.position())
}

pub(super) fn op_structkeys(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let st = dec.fetch_register_index()?;
    let resolved = proc.resolve(st)?;
    let keys = proc.with_value(&resolved, |slot| match slot {
        Value::Struct(fields) => Ok(fields.keys().map(|k| Value::Atom(*k)).collect::<Vec<_>>()),
        other => Err(Fault::Type {
            expected: "Struct",
            got: other.type_name(),
        }
        .into()),
    })?;
    proc.place(target, Value::Vector(keys))?;
    Ok(dec.position())
}
