//! Process spawning, messaging, joining and the watchdog.
//!
//! `join` and `receive` re-execute their own opcode while waiting: the
//! handler returns the instruction's own address, and the scheduler
//! retries on a later tick.  The first blocked execution arms the
//! deadline; expiry raises TimeoutError.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bytecode::{Decoder, Timeout};
use crate::common::id;
use crate::fault::{Fault, Trap};
use crate::value::{ProcessHandle, Value};

use super::{Outcome, Process};

pub(super) fn op_process(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_target()?;
    let function = id(dec.fetch_atom()?);

    let mut frame = proc.stack_mut().take_prepared().ok_or_else(|| {
        Fault::Exception("process spawn without a frame: use `frame 0' if the function takes no parameters".into())
    })?;
    frame.function_name = function;

    // a spawn with no handle register runs detached
    let joinable = target.is_some();
    let handle = proc.kernel().spawn(frame, joinable, false, 1)?;
    if let Some(operand) = target {
        proc.place(operand, Value::Process(handle))?;
    }
    Ok(dec.position())
}

pub(super) fn op_self(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_register_index()?;
    let handle = ProcessHandle {
        pid: proc.pid(),
        link: Arc::downgrade(proc.shared()),
    };
    proc.place(target, Value::Process(handle))?;
    Ok(dec.position())
}

/// Arm the deadline on the first blocked execution; report whether it
/// has expired.
fn deadline_expired(proc: &mut Process, timeout: Timeout) -> bool {
    match timeout {
        Timeout::Infinite => false,
        Timeout::Ms(ms) => {
            let deadline = *proc
                .deadline
                .get_or_insert_with(|| Instant::now() + Duration::from_millis(ms as u64));
            Instant::now() >= deadline
        }
    }
}

pub(super) fn op_join(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_target()?;
    let source = dec.fetch_register_index()?;
    let timeout = dec.fetch_timeout()?;
    let handle = proc.fetch_process_handle(source)?;

    let shared = handle
        .link
        .upgrade()
        .ok_or_else(|| Fault::Exception("process cannot be joined".into()))?;
    if !shared.joinable() {
        return Err(Fault::Exception("process cannot be joined".into()).into());
    }

    if shared.stopped() {
        proc.deadline = None;
        shared.set_joinable(false);
        let outcome = shared.take_result();
        proc.kernel().release_process(handle.pid);
        match outcome {
            Some(Outcome::Returned(Some(value))) => proc.place_opt(target, value)?,
            Some(Outcome::Returned(None)) | None => {}
            Some(Outcome::Raised(exception)) => return Err(Trap::Raise(exception)),
        }
        return Ok(dec.position());
    }

    if deadline_expired(proc, timeout) {
        proc.deadline = None;
        return Err(Fault::Timeout.into());
    }
    proc.blocked = true;
    Ok(proc.instruction_start)
}

pub(super) fn op_send(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let handle = dec.fetch_register_index()?;
    let source = dec.fetch_register_index()?;
    let handle = proc.fetch_process_handle(handle)?;
    // ownership transfers by deep copy: the payload is isolated and the
    // sender's register left empty
    let message = proc.pop_value(source)?.isolate();

    if let Some(shared) = handle.link.upgrade() {
        if !shared.stopped() {
            shared.mailbox.send(message);
            proc.kernel().notify_activity();
        }
    }
    Ok(dec.position())
}

pub(super) fn op_receive(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let target = dec.fetch_target()?;
    let timeout = dec.fetch_timeout()?;

    if let Some(message) = proc.shared().mailbox.try_receive() {
        proc.deadline = None;
        proc.place_opt(target, message)?;
        return Ok(dec.position());
    }

    if deadline_expired(proc, timeout) {
        proc.deadline = None;
        return Err(Fault::Timeout.into());
    }
    proc.blocked = true;
    Ok(proc.instruction_start)
}

pub(super) fn op_watchdog(proc: &mut Process, dec: &mut Decoder) -> Result<usize, Trap> {
    let function = id(dec.fetch_atom()?);
    if proc.watchdog.is_some() {
        return Err(Fault::Exception("watchdog already set".into()).into());
    }
    if !proc.kernel().is_native_function(function) {
        return Err(Fault::UndefinedSymbol(function.to_string()).into());
    }
    proc.watchdog = Some(function);
    Ok(dec.position())
}
