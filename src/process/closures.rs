//! Closures and bare function references.
//!
//! `capture` promotes the source register to a shared cell and stores a
//! reference to it in the closure's capture set, so writes through the
//! reference persist across closure calls.

use crate::bytecode::Decoder;
use crate::common::id;
use crate::fault::{Fault, Trap};
use crate::registers::{Mask, RegisterSet};
use crate::value::{cell, Closure, Value};

use super::Process;

pub(super) fn op_closure(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let function = id(dec.fetch_atom()?);
    if !proc.kernel().is_native_function(function) {
        return Err(Fault::UndefinedSymbol(function.to_string()).into());
    }

    // the capture set mirrors the enclosing frame's locals
    let size = proc.registers(crate::registers::RsSel::Local)?.size();
    proc.place(
        target,
        Value::Closure(Closure {
            function,
            captures: RegisterSet::new(size),
        }),
    )?;
    Ok(dec.position())
}

pub(super) fn op_capture(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let closure = dec.fetch_register_index()?;
    let index = dec.fetch_primitive_uint()? as usize;
    let source = dec.fetch_register_index()?;

    let resolved = proc.resolve(source)?;
    if resolved.deref {
        return Err(Fault::Exception("cannot capture a pointer dereference".into()).into());
    }

    // promote the source slot to a shared cell
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

    proc.mutate(closure, |value| match value {
        Value::Closure(c) => {
            c.captures.set(index, Value::Reference(shared))?;
            c.captures.flag(index, Mask::REFERENCE)?;
            Ok(())
        }
        other => Err(Fault::Type {
            expected: "Closure",
            got: other.type_name(),
        }
        .into()),
    })?;
    Ok(dec.position())
}

pub(super) fn op_capturecopy(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let closure = dec.fetch_register_index()?;
    let index = dec.fetch_primitive_uint()? as usize;
    let source = dec.fetch_register_index()?;
    let value = proc.fetch_value(source)?;
    proc.mutate(closure, |slot| match slot {
        Value::Closure(c) => {
            c.captures.set(index, value)?;
            Ok(())
        }
        other => Err(Fault::Type {
            expected: "Closure",
            got: other.type_name(),
        }
        .into()),
    })?;
    Ok(dec.position())
}

pub(super) fn op_capturemove(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let closure = dec.fetch_register_index()?;
    let index = dec.fetch_primitive_uint()? as usize;
    let source = dec.fetch_register_index()?;
    let value = proc.pop_value(source)?;
    proc.mutate(closure, |slot| match slot {
        Value::Closure(c) => {
            c.captures.set(index, value)?;
            Ok(())
        }
        other => Err(Fault::Type {
            expected: "Closure",
            got: other.type_name(),
        }
        .into()),
    })?;
    Ok(dec.position())
}

pub(super) fn op_function(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let name = id(dec.fetch_atom()?);
    let kernel = proc.kernel();
    if !kernel.is_native_function(name) && !kernel.is_foreign_function(name) {
        return Err(Fault::UndefinedSymbol(name.to_string()).into());
    }
    proc.place(target, Value::Function(name))?;
    Ok(dec.position())
}
