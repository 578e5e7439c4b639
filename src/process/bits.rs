//! Bit-string instructions.

use crate::bytecode::{Decoder, Opcode};
use crate::fault::{Fault, Trap};
use crate::value::{Bits, Value};

use super::Process;

pub(super) fn op_bits(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let bytes = dec.fetch_bitstring()?;
    let bits = Bits::from_bytes(bytes);
    proc.place(target, Value::Bits(bits))?;
    Ok(dec.position())
}

pub(super) fn op_bit_binop(proc: &mut Process, dec: &mut Decoder, op: Opcode) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let lhs = dec.fetch_register_index()?;
    let rhs = dec.fetch_register_index()?;
    let a = proc.fetch_bits(lhs)?;
    let b = proc.fetch_bits(rhs)?;
    let result = match op {
        Opcode::Bitand => a.and(&b),
        Opcode::Bitor => a.or(&b),
        Opcode::Bitxor => a.xor(&b),
        _ => unreachable!("not a bit binop: {}", op),
    };
    proc.place(target, Value::Bits(result))?;
    Ok(dec.position())
}

pub(super) fn op_bitnot(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let bits = proc.fetch_bits(source)?;
    proc.place(target, Value::Bits(bits.not()))?;
    Ok(dec.position())
}

fn bit_index(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let operand = dec.fetch_register_index()?;
    let index = proc.fetch_int(operand)?;
    usize::try_from(index)
        .map_err(|_| Fault::OutOfRange(format!("negative bit index: {}", index)).into())
}

pub(super) fn op_bitat(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let bits = proc.fetch_bits(source)?;
    let index = bit_index(proc, dec)?;
    let bit = bits.get(index).ok_or_else(|| {
        Fault::OutOfRange(format!("bit index out of range: {} >= {}", index, bits.len()))
    })?;
    proc.place(target, Value::Boolean(bit))?;
    Ok(dec.position())
}

pub(super) fn op_bitset(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let index = bit_index(proc, dec)?;
    let value_operand = dec.fetch_register_index()?;
    let bit = proc.fetch_bool(value_operand)?;
    proc.mutate(target, |value| match value {
        Value::Bits(bits) => {
            bits.set(index, bit)?;
            Ok(())
        }
        other => Err(Fault::Type {
            expected: "Bits",
            got: other.type_name(),
        }
        .into()),
    })?;
    Ok(dec.position())
}

pub(super) fn op_shift(proc: &mut Process, dec: &mut Decoder, op: Opcode) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let bits = proc.fetch_bits(source)?;
    let by = bit_index(proc, dec)?;
    let result = match op {
        Opcode::Shl | Opcode::Ashl => bits.shl(by),
        Opcode::Shr => bits.shr(by),
        Opcode::Ashr => bits.ashr(by),
        Opcode::Rol => bits.rol(by),
        Opcode::Ror => bits.ror(by),
        _ => unreachable!("not a shift opcode: {}", op),
    };
    proc.place(target, Value::Bits(result))?;
    Ok(dec.position())
}
