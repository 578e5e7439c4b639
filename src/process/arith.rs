//! Literal loads, arithmetic, comparisons and boolean logic.
//!
//! Overflow and divide-by-zero policy is encoded in the opcode variant:
//! the `wrap*` family wraps modulo 2^64, `checked*` signals an
//! ArithmeticError, `saturating*` clamps to the type's extrema.  The
//! unsigned families interpret the i64 register content as raw u64
//! bits.

use crate::bytecode::{Decoder, Opcode};
use crate::fault::{Fault, Trap};
use crate::value::Value;

use super::Process;

enum Number {
    Integer(i64),
    Float(f64),
}

fn fetch_number(proc: &mut Process, dec: &mut Decoder) -> Result<Number, Trap> {
    let operand = dec.fetch_register_index()?;
    let resolved = proc.resolve(operand)?;
    proc.with_value(&resolved, |value| match value {
        Value::Integer(n) => Ok(Number::Integer(*n)),
        Value::Float(x) => Ok(Number::Float(*x)),
        other => Err(Fault::Type {
            expected: "Integer or Float",
            got: other.type_name(),
        }
        .into()),
    })
}

pub(super) fn op_izero(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    proc.place(target, Value::Integer(0))?;
    Ok(dec.position())
}

pub(super) fn op_integer(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let value = dec.fetch_primitive_int()?;
    proc.place(target, Value::Integer(value))?;
    Ok(dec.position())
}

pub(super) fn op_float(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let value = dec.fetch_primitive_float()?;
    proc.place(target, Value::Float(value))?;
    Ok(dec.position())
}

fn bump(value: &mut Value, delta: i64) -> Result<(), Trap> {
    match value {
        Value::Integer(n) => {
            *n = n.wrapping_add(delta);
            Ok(())
        }
        Value::Reference(cell) => bump(&mut cell.clone().lock(), delta),
        other => Err(Fault::Type {
            expected: "Integer",
            got: other.type_name(),
        }
        .into()),
    }
}

pub(super) fn op_iinc(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    proc.mutate(target, |value| bump(value, 1))?;
    Ok(dec.position())
}

pub(super) fn op_idec(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    proc.mutate(target, |value| bump(value, -1))?;
    Ok(dec.position())
}

fn signed_div(lhs: i64, rhs: i64) -> Result<i64, Fault> {
    if rhs == 0 {
        return Err(Fault::Arithmetic("division by zero".into()));
    }
    Ok(lhs.wrapping_div(rhs))
}

/// Plain and `wrap*` arithmetic.  Plain instructions accept Integer or
/// Float operands; integer math wraps.
pub(super) fn op_arith(proc: &mut Process, dec: &mut Decoder, op: Opcode) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let lhs = fetch_number(proc, dec)?;
    let rhs = fetch_number(proc, dec)?;

    let result = match (lhs, rhs) {
        (Number::Integer(a), Number::Integer(b)) => Value::Integer(match op {
            Opcode::Add | Opcode::Wrapadd => a.wrapping_add(b),
            Opcode::Sub | Opcode::Wrapsub => a.wrapping_sub(b),
            Opcode::Mul | Opcode::Wrapmul => a.wrapping_mul(b),
            Opcode::Div | Opcode::Wrapdiv => signed_div(a, b)?,
            _ => unreachable!("not an arithmetic opcode: {}", op),
        }),
        (lhs, rhs) => {
            if matches!(op, Opcode::Wrapadd | Opcode::Wrapsub | Opcode::Wrapmul | Opcode::Wrapdiv) {
                return Err(Fault::Type {
                    expected: "Integer",
                    got: "Float".into(),
                }
                .into());
            }
            let a = match lhs {
                Number::Integer(n) => n as f64,
                Number::Float(x) => x,
            };
            let b = match rhs {
                Number::Integer(n) => n as f64,
                Number::Float(x) => x,
            };
            Value::Float(match op {
                Opcode::Add => a + b,
                Opcode::Sub => a - b,
                Opcode::Mul => a * b,
                Opcode::Div => a / b,
                _ => unreachable!("not an arithmetic opcode: {}", op),
            })
        }
    };
    proc.place(target, result)?;
    Ok(dec.position())
}

fn fetch_int_pair(proc: &mut Process, dec: &mut Decoder) -> Result<(i64, i64), Trap> {
    let lhs = dec.fetch_register_index()?;
    let rhs = dec.fetch_register_index()?;
    Ok((proc.fetch_int(lhs)?, proc.fetch_int(rhs)?))
}

pub(super) fn op_checked_signed(
    proc: &mut Process,
    dec: &mut Decoder,
    op: Opcode,
) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let (a, b) = fetch_int_pair(proc, dec)?;
    let result = match op {
        Opcode::Checkedsadd => a.checked_add(b),
        Opcode::Checkedssub => a.checked_sub(b),
        Opcode::Checkedsmul => a.checked_mul(b),
        Opcode::Checkedsdiv => {
            if b == 0 {
                return Err(Fault::Arithmetic("division by zero".into()).into());
            }
            a.checked_div(b)
        }
        _ => unreachable!("not a checked signed opcode: {}", op),
    }
    .ok_or_else(|| Fault::Arithmetic("signed integer overflow".into()))?;
    proc.place(target, Value::Integer(result))?;
    Ok(dec.position())
}

pub(super) fn op_checked_unsigned(
    proc: &mut Process,
    dec: &mut Decoder,
    op: Opcode,
) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let (a, b) = fetch_int_pair(proc, dec)?;
    let (a, b) = (a as u64, b as u64);
    let result = match op {
        Opcode::Checkeduadd => a.checked_add(b),
        Opcode::Checkedusub => a.checked_sub(b),
        Opcode::Checkedumul => a.checked_mul(b),
        Opcode::Checkedudiv => {
            if b == 0 {
                return Err(Fault::Arithmetic("division by zero".into()).into());
            }
            a.checked_div(b)
        }
        _ => unreachable!("not a checked unsigned opcode: {}", op),
    }
    .ok_or_else(|| Fault::Arithmetic("unsigned integer overflow".into()))?;
    proc.place(target, Value::Integer(result as i64))?;
    Ok(dec.position())
}

pub(super) fn op_saturating_signed(
    proc: &mut Process,
    dec: &mut Decoder,
    op: Opcode,
) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let (a, b) = fetch_int_pair(proc, dec)?;
    let result = match op {
        Opcode::Saturatingsadd => a.saturating_add(b),
        Opcode::Saturatingssub => a.saturating_sub(b),
        Opcode::Saturatingsmul => a.saturating_mul(b),
        Opcode::Saturatingsdiv => {
            if b == 0 {
                return Err(Fault::Arithmetic("division by zero".into()).into());
            }
            a.saturating_div(b)
        }
        _ => unreachable!("not a saturating signed opcode: {}", op),
    };
    proc.place(target, Value::Integer(result))?;
    Ok(dec.position())
}

pub(super) fn op_saturating_unsigned(
    proc: &mut Process,
    dec: &mut Decoder,
    op: Opcode,
) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let (a, b) = fetch_int_pair(proc, dec)?;
    let (a, b) = (a as u64, b as u64);
    let result = match op {
        Opcode::Saturatinguadd => a.saturating_add(b),
        Opcode::Saturatingusub => a.saturating_sub(b),
        Opcode::Saturatingumul => a.saturating_mul(b),
        Opcode::Saturatingudiv => {
            if b == 0 {
                return Err(Fault::Arithmetic("division by zero".into()).into());
            }
            a.saturating_div(b)
        }
        _ => unreachable!("not a saturating unsigned opcode: {}", op),
    };
    proc.place(target, Value::Integer(result as i64))?;
    Ok(dec.position())
}

pub(super) fn op_compare(proc: &mut Process, dec: &mut Decoder, op: Opcode) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let lhs = fetch_number(proc, dec)?;
    let rhs = fetch_number(proc, dec)?;

    let ordering = match (lhs, rhs) {
        (Number::Integer(a), Number::Integer(b)) => a.cmp(&b),
        (lhs, rhs) => {
            let a = match lhs {
                Number::Integer(n) => n as f64,
                Number::Float(x) => x,
            };
            let b = match rhs {
                Number::Integer(n) => n as f64,
                Number::Float(x) => x,
            };
            a.partial_cmp(&b)
                .ok_or_else(|| Fault::Arithmetic("comparison with NaN".into()))?
        }
    };

    let result = match op {
        Opcode::Lt => ordering.is_lt(),
        Opcode::Lte => ordering.is_le(),
        Opcode::Gt => ordering.is_gt(),
        Opcode::Gte => ordering.is_ge(),
        _ => unreachable!("not a comparison opcode: {}", op),
    };
    proc.place(target, Value::Boolean(result))?;
    Ok(dec.position())
}

pub(super) fn op_eq(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let lhs = dec.fetch_register_index()?;
    let rhs = dec.fetch_register_index()?;
    let a = proc.fetch_value(lhs)?;
    let b = proc.fetch_value(rhs)?;
    let equal = a.equals(&b)?;
    proc.place(target, Value::Boolean(equal))?;
    Ok(dec.position())
}

pub(super) fn op_not(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let truth = proc.fetch_bool(source)?;
    proc.place(target, Value::Boolean(!truth))?;
    Ok(dec.position())
}

pub(super) fn op_and(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let lhs = dec.fetch_register_index()?;
    let rhs = dec.fetch_register_index()?;
    let a = proc.fetch_value(lhs)?;
    let result = if a.boolean() { proc.fetch_value(rhs)? } else { a };
    proc.place(target, result)?;
    Ok(dec.position())
}

pub(super) fn op_or(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let lhs = dec.fetch_register_index()?;
    let rhs = dec.fetch_register_index()?;
    let a = proc.fetch_value(lhs)?;
    let result = if a.boolean() { a } else { proc.fetch_value(rhs)? };
    proc.place(target, result)?;
    Ok(dec.position())
}
