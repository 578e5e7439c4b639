//! Module linking, class registration and dynamic dispatch.

use indexmap::IndexMap;

use crate::bytecode::Decoder;
use crate::common::id;
use crate::fault::{Fault, Trap};
use crate::value::{Object, Prototype, Value};

use super::calls::{call_native, CallTarget};
use super::Process;

pub(super) fn op_import(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let module = dec.fetch_atom()?.to_string();
    proc.kernel().import(&module)?;
    Ok(dec.position())
}

pub(super) fn op_class(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let name = id(dec.fetch_atom()?);
    proc.place(target, Value::Prototype(Prototype::new(name)))?;
    Ok(dec.position())
}

pub(super) fn op_derive(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let ancestor = id(dec.fetch_atom()?);
    proc.mutate(target, |value| match value {
        Value::Prototype(proto) => {
            proto.ancestors.push(ancestor);
            Ok(())
        }
        other => Err(Fault::Type {
            expected: "Prototype",
            got: other.type_name(),
        }
        .into()),
    })?;
    Ok(dec.position())
}

pub(super) fn op_attach(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let function = id(dec.fetch_atom()?);
    let method = id(dec.fetch_atom()?);

    let kernel = proc.kernel();
    if !kernel.is_native_function(function)
        && !kernel.is_foreign_function(function)
        && !kernel.is_foreign_method(function)
    {
        return Err(Fault::UndefinedSymbol(function.to_string()).into());
    }

    proc.mutate(target, |value| match value {
        Value::Prototype(proto) => {
            proto.methods.insert(method, function);
            Ok(())
        }
        other => Err(Fault::Type {
            expected: "Prototype",
            got: other.type_name(),
        }
        .into()),
    })?;
    Ok(dec.position())
}

/// Finalise a prototype into the kernel registry; the inheritance chain
/// is linearised at registration time.
pub(super) fn op_register(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    match proc.pop_value(target)? {
        Value::Prototype(proto) => {
            proc.kernel().register_class(proto)?;
            Ok(dec.position())
        }
        other => Err(Fault::Type {
            expected: "Prototype",
            got: other.type_name(),
        }
        .into()),
    }
}

pub(super) fn op_new(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let class = id(dec.fetch_atom()?);
    if !proc.kernel().is_class(class) {
        return Err(Fault::Exception(format!(
            "cannot create instance of unregistered type: {}",
            class
        ))
        .into());
    }
    proc.place(
        target,
        Value::Object(Object {
            class,
            attributes: IndexMap::new(),
        }),
    )?;
    Ok(dec.position())
}

/// Dynamic dispatch: resolve the method on the class of argument 0 of
/// the prepared frame, then call the resolved function.
pub(super) fn op_msg(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_target()?;
    let return_target = proc.resolve_return_target(target)?;
    let method = id(dec.fetch_atom()?);
    let return_address = dec.position();

    let receiver_type = {
        let frame = proc
            .stack()
            .frame_new
            .as_ref()
            .ok_or_else(|| Fault::Exception("message dispatch without a frame".into()))?;
        if frame.arguments.size() == 0 {
            return Err(Fault::Exception(
                "message dispatch requires a receiver as the first argument".into(),
            )
            .into());
        }
        frame.arguments.get(0)?.type_name()
    };

    let function = proc
        .kernel()
        .resolve_method(&receiver_type, method)
        .ok_or_else(|| {
            Fault::UndefinedSymbol(format!("{} does not respond to {}", receiver_type, method))
        })?;

    let kernel = proc.kernel().clone();
    if kernel.is_native_function(function) {
        call_native(
            proc,
            CallTarget {
                name: function,
                captures: None,
            },
            return_address,
            return_target,
        )
    } else if kernel.is_foreign_function(function) || kernel.is_foreign_method(function) {
        super::calls::call_foreign(proc, function, return_address, return_target)
    } else {
        Err(Fault::UndefinedSymbol(function.to_string()).into())
    }
}

pub(super) fn op_insert(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let object = dec.fetch_register_index()?;
    let key = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let key = proc.fetch_atom_value(key)?;
    let value = proc.pop_value(source)?;

    proc.mutate(object, |slot| match slot {
        Value::Object(object) => {
            object.attributes.insert(key, value);
            Ok(())
        }
        other => Err(Fault::Type {
            expected: "Object",
            got: other.type_name(),
        }
        .into()),
    })?;
    Ok(dec.position())
}

pub(super) fn op_remove(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_target()?;
    let object = dec.fetch_register_index()?;
    let key = dec.fetch_register_index()?;
    let key = proc.fetch_atom_value(key)?;

    let value = proc.mutate(object, |slot| match slot {
        Value::Object(object) => object
            .attributes
            .shift_remove(&key)
            .ok_or_else(|| Fault::Exception(format!("attribute not found: '{}'", key)).into()),
        other => Err(Fault::Type {
            expected: "Object",
            got: other.type_name(),
        }
        .into()),
    })?;
    proc.place_opt(target, value)?;
    Ok(dec.position())
}
