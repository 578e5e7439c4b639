//! Jumps, the try/catch machinery and termination.

use crate::bytecode::Decoder;
use crate::common::id;
use crate::fault::{Fault, Trap};
use crate::process::frame::TryFrame;

use super::Process;

pub(super) fn op_nop(_proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    Ok(dec.position())
}

pub(super) fn op_jump(_proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    Ok(dec.fetch_address()?)
}

pub(super) fn op_if(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let condition = dec.fetch_register_index()?;
    let truth = proc.fetch_bool(condition)?;
    let if_true = dec.fetch_address()?;
    let if_false = dec.fetch_address()?;
    Ok(if truth { if_true } else { if_false })
}

pub(super) fn op_try(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    if proc.stack().try_frame_new.is_some() {
        return Err(Fault::Exception(
            "requested new try frame while last one is unused".into(),
        )
        .into());
    }
    proc.stack_mut().try_frame_new = Some(TryFrame::new());
    Ok(dec.position())
}

pub(super) fn op_catch(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let type_name = id(dec.fetch_atom()?);
    let block = id(dec.fetch_atom()?);
    if !proc.kernel().is_block(block) {
        return Err(Fault::UndefinedSymbol(block.to_string()).into());
    }
    proc.stack_mut()
        .try_frame_new
        .as_mut()
        .ok_or_else(|| Fault::Exception("catch without a prepared try frame".into()))?
        .catchers
        .insert(type_name, block);
    Ok(dec.position())
}

/// Commit the prepared try frame and transfer control to the block.
pub(super) fn op_enter(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let block = id(dec.fetch_atom()?);
    let (image, entry) = proc
        .kernel()
        .block_entry(block)
        .ok_or_else(|| Fault::UndefinedSymbol(block.to_string()))?;

    let mut tframe = proc
        .stack_mut()
        .try_frame_new
        .take()
        .ok_or_else(|| Fault::Exception("no try frame prepared".into()))?;
    tframe.associated_frame = proc.stack().frames.len();
    tframe.return_address = dec.position();
    proc.stack_mut().tryframes.push(tframe);

    proc.stack_mut().jump_base = image;
    Ok(entry)
}

/// Move the caught exception into a register.
pub(super) fn op_draw(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let caught = proc
        .stack_mut()
        .caught
        .take()
        .ok_or_else(|| Fault::Exception("no caught object to draw".into()))?;
    proc.place(target, caught)?;
    Ok(dec.position())
}

/// Exit the active block, popping its try frame.
pub(super) fn op_leave(proc: &mut Process, _dec: &mut Decoder) -> Result<usize, Trap> {
    let tframe = proc
        .stack_mut()
        .tryframes
        .pop()
        .ok_or_else(|| Fault::Exception("leave without an active try frame".into()))?;

    // restore the jump base of the function the block was entered from
    let caller = proc
        .stack()
        .frames
        .last()
        .ok_or_else(|| Fault::Exception("no frame on stack".into()))?
        .function_name;
    if let Some((image, _)) = proc.kernel().function_entry(caller) {
        proc.stack_mut().jump_base = image;
    }
    Ok(tframe.return_address)
}

pub(super) fn op_throw(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let source = dec.fetch_register_index()?;
    let thrown = proc.pop_value(source)?;
    Err(Trap::Raise(thrown))
}

pub(super) fn op_halt(_proc: &mut Process, _dec: &mut Decoder) -> Result<usize, Trap> {
    Err(Trap::Halt)
}
