//! Text, legacy string and atom instructions.
//!
//! Text indices are code-point positions; out-of-range access raises
//! OutOfRange.

use crate::bytecode::Decoder;
use crate::common::id;
use crate::fault::{Fault, Trap};
use crate::value::Value;

use super::Process;

pub(super) fn op_string(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let literal = dec.fetch_atom()?;
    proc.place(target, Value::String(literal.as_bytes().to_vec()))?;
    Ok(dec.position())
}

/// `text` loads a literal, or stringifies a register.
pub(super) fn op_text(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let value = if dec.is_literal() {
        Value::Text(dec.fetch_atom()?.to_string())
    } else {
        let source = dec.fetch_register_index()?;
        Value::Text(proc.fetch_value(source)?.str())
    };
    proc.place(target, value)?;
    Ok(dec.position())
}

pub(super) fn op_texteq(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let lhs = dec.fetch_register_index()?;
    let rhs = dec.fetch_register_index()?;
    let a = proc.fetch_text(lhs)?;
    let b = proc.fetch_text(rhs)?;
    proc.place(target, Value::Boolean(a == b))?;
    Ok(dec.position())
}

fn codepoint_index(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let operand = dec.fetch_register_index()?;
    let index = proc.fetch_int(operand)?;
    usize::try_from(index)
        .map_err(|_| Fault::OutOfRange(format!("negative text index: {}", index)).into())
}

pub(super) fn op_textat(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let text = proc.fetch_text(source)?;
    let index = codepoint_index(proc, dec)?;
    let ch = text.chars().nth(index).ok_or_else(|| {
        Fault::OutOfRange(format!(
            "text index out of range: {} >= {}",
            index,
            text.chars().count()
        ))
    })?;
    proc.place(target, Value::Text(ch.to_string()))?;
    Ok(dec.position())
}

pub(super) fn op_textsub(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let text = proc.fetch_text(source)?;
    let begin = codepoint_index(proc, dec)?;
    let end = codepoint_index(proc, dec)?;

    let length = text.chars().count();
    if begin > end || end > length {
        return Err(Fault::OutOfRange(format!(
            "substring range out of range: {}..{} of {}",
            begin, end, length
        ))
        .into());
    }
    let sub: String = text.chars().skip(begin).take(end - begin).collect();
    proc.place(target, Value::Text(sub))?;
    Ok(dec.position())
}

pub(super) fn op_textlength(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let text = proc.fetch_text(source)?;
    proc.place(target, Value::Integer(text.chars().count() as i64))?;
    Ok(dec.position())
}

pub(super) fn op_textcommonprefix(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let lhs = dec.fetch_register_index()?;
    let rhs = dec.fetch_register_index()?;
    let a = proc.fetch_text(lhs)?;
    let b = proc.fetch_text(rhs)?;
    let common = a
        .chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .count();
    proc.place(target, Value::Integer(common as i64))?;
    Ok(dec.position())
}

pub(super) fn op_textcommonsuffix(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let lhs = dec.fetch_register_index()?;
    let rhs = dec.fetch_register_index()?;
    let a = proc.fetch_text(lhs)?;
    let b = proc.fetch_text(rhs)?;
    let common = a
        .chars()
        .rev()
        .zip(b.chars().rev())
        .take_while(|(x, y)| x == y)
        .count();
    proc.place(target, Value::Integer(common as i64))?;
    Ok(dec.position())
}

pub(super) fn op_textconcat(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let lhs = dec.fetch_register_index()?;
    let rhs = dec.fetch_register_index()?;
    let mut a = proc.fetch_text(lhs)?;
    let b = proc.fetch_text(rhs)?;
    a.push_str(&b);
    proc.place(target, Value::Text(a))?;
    Ok(dec.position())
}

pub(super) fn op_atom(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let name = dec.fetch_atom()?;
    proc.place(target, Value::Atom(id(name)))?;
    Ok(dec.position())
}

pub(super) fn op_atomeq(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let lhs = dec.fetch_register_index()?;
    let rhs = dec.fetch_register_index()?;
    let a = proc.fetch_atom_value(lhs)?;
    let b = proc.fetch_atom_value(rhs)?;
    proc.place(target, Value::Boolean(a == b))?;
    Ok(dec.position())
}
