//! Frame construction, parameter passing, calls and returns.

use crate::bytecode::Decoder;
use crate::common::{id, Id};
use crate::fault::{Fault, Trap};
use crate::registers::{Mask, RegisterSet, RsSel};
use crate::value::Value;

use super::frame::ResolvedReg;
use super::{FfiCall, Process};

pub(super) fn op_frame(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let arguments = dec.fetch_primitive_uint()? as usize;
    let registers = dec.fetch_primitive_uint()? as usize;
    proc.stack_mut().prepare_frame(arguments, registers)?;
    Ok(dec.position())
}

pub(super) fn op_param(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let slot = dec.fetch_register_index()?.index as usize;
    let source = dec.fetch_register_index()?;
    let value = proc.fetch_value(source)?;

    let frame = proc
        .stack_mut()
        .frame_new
        .as_mut()
        .ok_or_else(|| Fault::Exception("parameter pass without a frame".into()))?;
    if slot >= frame.arguments.size() {
        return Err(Fault::Exception(
            "parameter register index out of bounds (greater than arguments set size) \
             while adding parameter"
                .into(),
        )
        .into());
    }
    frame.arguments.set(slot, value)?;
    Ok(dec.position())
}

pub(super) fn op_pamv(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let slot = dec.fetch_register_index()?.index as usize;
    let source = dec.fetch_register_index()?;
    let value = proc.pop_value(source)?;

    let frame = proc
        .stack_mut()
        .frame_new
        .as_mut()
        .ok_or_else(|| Fault::Exception("parameter pass without a frame".into()))?;
    if slot >= frame.arguments.size() {
        return Err(Fault::Exception(
            "parameter register index out of bounds (greater than arguments set size) \
             while adding parameter"
                .into(),
        )
        .into());
    }
    frame.arguments.set(slot, value)?;
    frame.arguments.flag(slot, Mask::MOVED)?;
    Ok(dec.position())
}

pub(super) fn op_arg(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_target()?;
    let slot = dec.fetch_register_index()?.index as usize;

    let frame = proc
        .stack_mut()
        .frames
        .last_mut()
        .ok_or_else(|| Fault::Exception("no frame on stack".into()))?;
    if slot >= frame.arguments.size() {
        return Err(Fault::Exception(format!(
            "invalid read: read from argument register out of bounds: {}",
            slot
        ))
        .into());
    }

    // pass-by-move arguments are claimed, pass-by-copy ones copied
    let value = if frame.arguments.is_flagged(slot, Mask::MOVED)? {
        frame.arguments.pop(slot)?
    } else {
        frame.arguments.get(slot)?.copy()
    };
    proc.place_opt(target, value)?;
    Ok(dec.position())
}

pub(super) fn op_argc(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let count = proc
        .stack()
        .frames
        .last()
        .ok_or_else(|| Fault::Exception("no frame on stack".into()))?
        .arguments
        .size();
    proc.place(target, Value::Integer(count as i64))?;
    Ok(dec.position())
}

/// A resolved call target: the function name plus, for closures, the
/// capture set adopted as frame locals.
pub(super) struct CallTarget {
    pub name: Id,
    pub captures: Option<RegisterSet>,
}

pub(super) fn fetch_callable(proc: &mut Process, dec: &mut Decoder) -> Result<CallTarget, Trap> {
    if dec.is_literal() {
        return Ok(CallTarget {
            name: id(dec.fetch_atom()?),
            captures: None,
        });
    }
    let operand = dec.fetch_register_index()?;
    match proc.fetch_value(operand)? {
        Value::Function(name) => Ok(CallTarget {
            name,
            captures: None,
        }),
        Value::Closure(closure) => Ok(CallTarget {
            name: closure.function,
            captures: Some(closure.captures),
        }),
        other => Err(Fault::Type {
            expected: "Function or Closure",
            got: other.type_name(),
        }
        .into()),
    }
}

pub(super) fn op_call(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_target()?;
    let return_target = proc.resolve_return_target(target)?;
    let callable = fetch_callable(proc, dec)?;
    let return_address = dec.position();

    let kernel = proc.kernel().clone();
    if kernel.is_native_function(callable.name) {
        call_native(proc, callable, return_address, return_target)
    } else if kernel.is_foreign_function(callable.name) || kernel.is_foreign_method(callable.name) {
        call_foreign(proc, callable.name, return_address, return_target)
    } else {
        Err(Fault::UndefinedSymbol(callable.name.to_string()).into())
    }
}

pub(super) fn call_native(
    proc: &mut Process,
    callable: CallTarget,
    return_address: usize,
    return_target: Option<ResolvedReg>,
) -> Result<usize, Trap> {
    let (image, entry) = proc
        .kernel()
        .function_entry(callable.name)
        .ok_or_else(|| Fault::UndefinedSymbol(callable.name.to_string()))?;

    let mut frame = proc.stack_mut().take_prepared().ok_or_else(|| {
        Fault::Exception(
            "function call without a frame: use `frame 0' in source code \
             if the function takes no parameters"
                .into(),
        )
    })?;
    frame.function_name = callable.name;
    frame.return_address = Some(return_address);
    frame.return_target = return_target;
    if let Some(captures) = callable.captures {
        frame.local_register_set = captures;
    }

    proc.stack_mut().push_frame(frame)?;
    proc.set_current_sel(RsSel::Local);
    proc.stack_mut().jump_base = image;
    Ok(entry)
}

/// Suspend and hand the prepared frame to the FFI scheduler; the
/// process is requeued with the result already in place.
pub(super) fn call_foreign(
    proc: &mut Process,
    name: Id,
    return_address: usize,
    return_target: Option<ResolvedReg>,
) -> Result<usize, Trap> {
    let mut frame = proc.stack_mut().take_prepared().ok_or_else(|| {
        Fault::Exception(
            "external function call without a frame: use `frame 0' in source code \
             if the function takes no parameters"
                .into(),
        )
    })?;
    frame.function_name = name;

    proc.shared().set_suspended(true);
    proc.pending_ffi = Some(FfiCall {
        function: name,
        frame,
        return_target,
    });
    Ok(return_address)
}

pub(super) fn op_tailcall(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let callable = fetch_callable(proc, dec)?;
    if !proc.kernel().is_native_function(callable.name) {
        return Err(Fault::Exception(format!(
            "tail call to non-native function: {}",
            callable.name
        ))
        .into());
    }
    let (image, entry) = proc
        .kernel()
        .function_entry(callable.name)
        .ok_or_else(|| Fault::UndefinedSymbol(callable.name.to_string()))?;

    let prepared = proc.stack_mut().take_prepared().ok_or_else(|| {
        Fault::Exception(
            "function call without a frame: use `frame 0' in source code \
             if the function takes no parameters"
                .into(),
        )
    })?;

    // the current frame is exiting: its deferred calls run now
    let deferred = {
        let top = proc
            .stack_mut()
            .frames
            .last_mut()
            .ok_or_else(|| Fault::Exception("no frame on stack".into()))?;
        std::mem::take(&mut top.deferred)
    };
    for pending in deferred.into_iter().rev() {
        proc.execute_deferred_frame(pending);
    }

    // simulated push-and-pop: the exiting frame's slot is reused
    let top = proc
        .stack_mut()
        .frames
        .last_mut()
        .ok_or_else(|| Fault::Exception("no frame on stack".into()))?;
    top.function_name = callable.name;
    top.arguments = prepared.arguments;
    top.local_register_set = match callable.captures {
        Some(captures) => captures,
        None => prepared.local_register_set,
    };

    proc.set_current_sel(RsSel::Local);
    proc.stack_mut().jump_base = image;
    Ok(entry)
}

pub(super) fn op_defer(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let callable = fetch_callable(proc, dec)?;
    if !proc.kernel().is_native_function(callable.name) {
        return Err(Fault::Exception(format!(
            "deferred call to non-native function: {}",
            callable.name
        ))
        .into());
    }

    let mut frame = proc
        .stack_mut()
        .take_prepared()
        .ok_or_else(|| Fault::Exception("deferred call without a frame".into()))?;
    frame.function_name = callable.name;
    if let Some(captures) = callable.captures {
        frame.local_register_set = captures;
    }

    proc.stack_mut()
        .frames
        .last_mut()
        .ok_or_else(|| Fault::Exception("no frame on stack".into()))?
        .deferred
        .push(frame);
    Ok(dec.position())
}

pub(super) fn op_return(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    if proc.stack().frames.is_empty() {
        return Err(Fault::Exception("no frame on stack: no call to return from".into()).into());
    }

    let top = proc.stack().frames.last().unwrap();
    let return_address = top.return_address;
    let return_target = top.return_target;

    // register 0 of the returning frame is reserved for return values
    let returned = if return_target.is_some() {
        let registers = proc.registers_mut(RsSel::Current)?;
        match registers.take(0)? {
            Some(value) => Some(value),
            None => {
                return Err(Fault::Exception(
                    "return value requested by frame but function did not set return register"
                        .into(),
                )
                .into())
            }
        }
    } else {
        None
    };

    proc.pop_frame_running_deferred(true)?;

    if !proc.stack().frames.is_empty() {
        if let (Some(target), Some(value)) = (return_target, returned) {
            proc.place_resolved(&target, value)?;
        }
        let caller = proc.stack().frames.last().unwrap().function_name;
        if let Some((image, _)) = proc.kernel().function_entry(caller) {
            proc.stack_mut().jump_base = image;
        }
    }

    Ok(return_address.unwrap_or(dec.position()))
}
