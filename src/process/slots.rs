//! Ownership moves and slot lifecycle instructions.

use std::sync::Arc;

use crate::bytecode::Decoder;
use crate::fault::{Fault, Trap};
use crate::registers::{Mask, RsSel};
use crate::value::{cell, Value};

use super::Process;

pub(super) fn op_move(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let value = proc.pop_value(source)?;
    proc.place(target, value)?;
    Ok(dec.position())
}

pub(super) fn op_copy(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let value = proc.fetch_value(source)?;
    proc.place(target, value)?;
    Ok(dec.position())
}

/// Take a non-owning pointer.  The source slot is promoted to a shared
/// cell so the pointer tracks the value across register moves and
/// expires when it is destroyed.
pub(super) fn op_ptr(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let resolved = proc.resolve(source)?;
    if resolved.deref {
        return Err(Fault::Exception("cannot take a pointer to a pointer dereference".into()).into());
    }

    let registers = proc.registers_mut(resolved.rs)?;
    let slot = registers.get_mut(resolved.index)?;
    let shared = match slot {
        Value::Reference(existing) => existing.clone(),
        other => {
            let owned = std::mem::replace(other, Value::Boolean(false));
            let shared = cell(owned);
            *other = Value::Reference(shared.clone());
            shared
        }
    };
    registers.flag(resolved.index, Mask::REFERENCE)?;

    proc.place(target, Value::Pointer(Arc::downgrade(&shared)))?;
    Ok(dec.position())
}

pub(super) fn op_swap(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let a = dec.fetch_register_index()?;
    let b = dec.fetch_register_index()?;
    let a = proc.resolve(a)?;
    let b = proc.resolve(b)?;
    if a.deref || b.deref {
        return Err(Fault::Exception("cannot swap through a pointer dereference".into()).into());
    }

    if a.rs == b.rs {
        proc.registers_mut(a.rs)?.swap(a.index, b.index)?;
    } else {
        let first = proc.registers_mut(a.rs)?.take(a.index)?;
        let second = proc.registers_mut(b.rs)?.take(b.index)?;
        proc.registers_mut(a.rs)?.put(a.index, second)?;
        proc.registers_mut(b.rs)?.put(b.index, first)?;
    }
    Ok(dec.position())
}

pub(super) fn op_delete(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let resolved = proc.resolve(target)?;
    proc.registers_mut(resolved.rs)?.free(resolved.index)?;
    Ok(dec.position())
}

pub(super) fn op_isnull(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let resolved = proc.resolve(source)?;
    let empty = proc.registers(resolved.rs)?.is_empty_at(resolved.index)?;
    proc.place(target, Value::Boolean(empty))?;
    Ok(dec.position())
}

/// Switch the current-register-set selector.  Switching to the
/// still-unspecified temporary set is an error.
pub(super) fn op_ress(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let selector = dec.fetch_primitive_uint()?;
    match selector {
        0 => {} // current: keep whatever is selected
        1 => proc.set_current_sel(RsSel::Local),
        2 => {
            proc.ensure_static_registers()?;
            proc.set_current_sel(RsSel::Static);
        }
        3 => proc.set_current_sel(RsSel::Global),
        _ => {
            return Err(Fault::Exception(
                "illegal register set id in ress instruction".into(),
            )
            .into())
        }
    }
    Ok(dec.position())
}
