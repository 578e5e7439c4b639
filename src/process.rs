//! One user-space actor: activation stacks, isolated register sets, a
//! mailbox, and the instruction dispatch that drives them.
//!
//! A process executes exactly one instruction per `tick`; the scheduler
//! may preempt between ticks.  Failures become thrown values handled by
//! the unwinder in the same pass.

pub mod frame;
pub mod stack;

mod arith;
mod bits;
mod calls;
mod classes;
mod closures;
mod concurrency;
mod containers;
mod control;
mod dispatch;
mod slots;
mod text;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use derive_more::Display;
use parking_lot::Mutex;

use crate::bytecode::{Decoder, Opcode, RegisterOperand};
use crate::bytecode::codec::Access;
use crate::common::{Id, Map, DEFAULT_REGISTER_SIZE, STATIC_REGISTER_SIZE};
use crate::fault::{Fault, Trap};
use crate::kernel::Kernel;
use crate::mailbox::Mailbox;
use crate::registers::{RegisterSet, RsSel};
use crate::value::Value;

pub use frame::{Frame, ResolvedReg, TryFrame};
pub use stack::Stack;

/// Process identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display("{_0}")]
pub struct Pid(pub u64);

/// How a process ended.
#[derive(Debug)]
pub enum Outcome {
    /// Clean termination, with the value of local register 0 of the
    /// last frame if any.
    Returned(Option<Value>),
    /// Terminated by an uncaught exception.
    Raised(Value),
}

/// The part of a process other threads may touch: identity, mailbox and
/// final result.
pub struct ProcessShared {
    pid: Pid,
    pub mailbox: Mailbox,
    stopped: AtomicBool,
    suspended: AtomicBool,
    joinable: AtomicBool,
    hidden: AtomicBool,
    result: Mutex<Option<Outcome>>,
}

impl ProcessShared {
    pub fn new(pid: Pid, joinable: bool, hidden: bool) -> ProcessShared {
        ProcessShared {
            pid,
            mailbox: Mailbox::new(),
            stopped: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            joinable: AtomicBool::new(joinable),
            hidden: AtomicBool::new(hidden),
            result: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn mark_stopped(&self, outcome: Outcome) {
        *self.result.lock() = Some(outcome);
        self.stopped.store(true, Ordering::Release);
    }

    pub fn take_result(&self) -> Option<Outcome> {
        self.result.lock().take()
    }

    pub fn joinable(&self) -> bool {
        self.joinable.load(Ordering::Acquire)
    }

    pub fn set_joinable(&self, joinable: bool) {
        self.joinable.store(joinable, Ordering::Release);
    }

    pub fn hidden(&self) -> bool {
        self.hidden.load(Ordering::Acquire)
    }

    pub fn suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }
}

/// A foreign call waiting to be shipped to the FFI scheduler.
pub struct FfiCall {
    pub function: Id,
    pub frame: Frame,
    pub return_target: Option<ResolvedReg>,
}

pub struct Process {
    kernel: Arc<Kernel>,
    shared: Arc<ProcessShared>,
    /// Activation stack; only the last entry is runnable.
    stacks: Vec<Stack>,
    global_register_set: RegisterSet,
    /// Lazily-allocated fixed-size register sets, keyed by function.
    static_registers: Map<Id, RegisterSet>,
    /// What the `current` selector resolves to; reset to local on every
    /// frame push and pop.
    current_sel: RsSel,
    watchdog: Option<Id>,
    priority: u32,
    /// Armed by the first blocked execution of `join`/`receive`.
    deadline: Option<Instant>,
    finished: bool,
    /// Set by a handler that made no progress waiting on an event.
    blocked: bool,
    /// Set by a foreign call; the scheduler ships the process off.
    pending_ffi: Option<FfiCall>,
    last_opcode: Option<Opcode>,
    /// Offset of the instruction being executed.
    instruction_start: usize,
}

impl Process {
    pub fn new(
        kernel: Arc<Kernel>,
        shared: Arc<ProcessShared>,
        mut frame: Frame,
        entry: (Arc<crate::bytecode::Image>, usize),
    ) -> Process {
        let mut stack = Stack::new(frame.function_name, entry.0);
        stack.instruction_pointer = entry.1;
        stack.assign_serial(&mut frame);
        stack.frames.push(frame);

        Process {
            kernel,
            shared,
            stacks: vec![stack],
            global_register_set: RegisterSet::new(DEFAULT_REGISTER_SIZE),
            static_registers: Map::new(),
            current_sel: RsSel::Local,
            watchdog: None,
            priority: 1,
            deadline: None,
            finished: false,
            blocked: false,
            pending_ffi: None,
            last_opcode: None,
            instruction_start: 0,
        }
    }

    pub fn pid(&self) -> Pid {
        self.shared.pid
    }

    pub fn shared(&self) -> &Arc<ProcessShared> {
        &self.shared
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    pub fn watchdog(&self) -> Option<Id> {
        self.watchdog
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn has_pending_ffi(&self) -> bool {
        self.pending_ffi.is_some()
    }

    pub fn take_pending_ffi(&mut self) -> Option<FfiCall> {
        self.pending_ffi.take()
    }

    fn stack(&self) -> &Stack {
        self.stacks.last().expect("process has no activation stack")
    }

    fn stack_mut(&mut self) -> &mut Stack {
        self.stacks.last_mut().expect("process has no activation stack")
    }

    pub fn starting_function(&self) -> Id {
        self.stack().entry_function
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Terminated by an uncaught exception.
    pub fn terminated(&self) -> bool {
        self.stack().thrown.is_some()
    }

    pub fn stopped(&self) -> bool {
        self.finished || self.terminated()
    }

    /// Install a raised value, to be unwound on the next tick.
    pub fn raise(&mut self, exception: Value) {
        self.stack_mut().thrown = Some(exception);
    }

    pub fn take_exception(&mut self) -> Option<Value> {
        self.stack_mut().thrown.take()
    }

    pub fn take_return_value(&mut self) -> Option<Value> {
        self.stack_mut().return_value.take()
    }

    /// Reset the process to run `function_name` with the given frame,
    /// keeping registers, pid and mailbox.  Used to respawn a
    /// watchdogged process after termination.
    pub fn become_function(&mut self, function_name: Id, mut frame: Frame) -> Result<(), Fault> {
        let entry = self
            .kernel
            .function_entry(function_name)
            .ok_or_else(|| Fault::UndefinedSymbol(function_name.to_string()))?;

        let stack = self.stack_mut();
        stack.frames.clear();
        stack.tryframes.clear();
        stack.frame_new = None;
        stack.try_frame_new = None;
        stack.thrown = None;
        stack.caught = None;
        stack.return_value = None;

        frame.function_name = function_name;
        stack.assign_serial(&mut frame);
        stack.frames.push(frame);
        stack.jump_base = entry.0;
        stack.instruction_pointer = entry.1;

        self.current_sel = RsSel::Local;
        self.finished = false;
        self.deadline = None;
        Ok(())
    }

    /// Execute one instruction.  Returns the new instruction pointer, or
    /// None when the process has stopped (finished or terminated).
    pub fn tick(&mut self) -> Option<usize> {
        let previous = self.stack().instruction_pointer;
        self.blocked = false;

        match self.step() {
            Ok(address) => self.stack_mut().instruction_pointer = address,
            Err(Trap::Raise(thrown)) => self.stack_mut().thrown = Some(thrown),
            Err(Trap::Halt) => {
                self.finished = true;
                self.kernel.initiate_shutdown();
                return None;
            }
            Err(Trap::Fatal(message)) => {
                self.finished = true;
                self.kernel.fatal(&message);
                return None;
            }
        }

        if self.stack().frames.is_empty() {
            self.finished = true;
            return None;
        }

        // An unchanged instruction pointer means execution entered an
        // infinite loop, unless the opcode legitimately re-executes
        // (RETURN of a recursive call, JOIN and RECEIVE while waiting)
        // or an exception is about to adjust it.
        if self.stack().instruction_pointer == previous
            && !matches!(
                self.last_opcode,
                Some(Opcode::Return) | Some(Opcode::Join) | Some(Opcode::Receive)
            )
            && self.stack().thrown.is_none()
        {
            self.stack_mut().thrown = Some(Fault::InstructionUnchanged.into_value());
        }

        // Discard a prepared frame once something is thrown; the
        // handling block gets a clean environment and nothing leaks if
        // the exception escapes to the watchdog.
        if self.stack().thrown.is_some() && self.stack().frame_new.is_some() {
            self.stack_mut().frame_new = None;
        }

        if self.stack().thrown.is_some() {
            self.unwind(0);
        }
        if self.stack().thrown.is_some() {
            return None;
        }

        Some(self.stack().instruction_pointer)
    }

    /// Decode and dispatch the instruction under the cursor.
    fn step(&mut self) -> Result<usize, Trap> {
        let image = self.stack().jump_base.clone();
        let code = image.bytecode();
        let ip = self.stack().instruction_pointer;
        self.instruction_start = ip;

        let mut decoder = Decoder::new(code, ip);
        let opcode = decoder.fetch_opcode()?;
        self.last_opcode = Some(opcode);
        dispatch::execute(self, opcode, &mut decoder)
    }

    /// Walk the try-frame stack for a catcher matching the thrown value,
    /// rewind call frames, and reset the instruction pointer.  Frames
    /// below `floor` (used while driving deferred calls) are out of
    /// bounds.
    fn unwind(&mut self, floor: usize) {
        let Some((index, block)) = self.stack().find_catch_frame(&self.kernel) else {
            return;
        };
        let associated = self.stack().tryframes[index].associated_frame;
        if associated <= floor && floor > 0 {
            // handler lives outside the deferred subtree
            return;
        }

        let Some((image, entry)) = self.kernel.block_entry(block) else {
            log::error!("catcher block vanished: {}", block);
            return;
        };

        while self.stack().frames.len() > associated {
            if let Err(fault) = self.pop_frame_running_deferred(false) {
                log::warn!("fault while unwinding: {}", fault);
                break;
            }
        }
        // keep the matching try frame: the handler's `leave` pops it
        self.stack_mut().tryframes.truncate(index + 1);

        let thrown = self.stack_mut().thrown.take();
        self.stack_mut().caught = thrown;
        self.stack_mut().jump_base = image;
        self.stack_mut().instruction_pointer = entry;
        self.current_sel = RsSel::Local;
    }

    /// Pop the top frame and run its deferred calls, most recent first,
    /// before control proceeds.
    fn pop_frame_running_deferred(&mut self, strict: bool) -> Result<Frame, Fault> {
        let mut frame = self.stack_mut().pop_frame(strict)?;
        self.current_sel = RsSel::Local;
        let deferred = std::mem::take(&mut frame.deferred);
        for pending in deferred.into_iter().rev() {
            self.execute_deferred_frame(pending);
        }
        Ok(frame)
    }

    /// Run one deferred call to completion inside the current tick.
    fn execute_deferred_frame(&mut self, mut frame: Frame) {
        let name = frame.function_name;
        let Some((image, entry)) = self.kernel.function_entry(name) else {
            log::warn!("deferred call to unknown function: {}", name);
            return;
        };

        let saved_ip = self.stack().instruction_pointer;
        let saved_base = self.stack().jump_base.clone();
        let floor = self.stack().frames.len();

        frame.return_address = None;
        frame.return_target = None;
        if let Err(fault) = self.stack_mut().push_frame(frame) {
            log::warn!("could not push deferred frame: {}", fault);
            return;
        }
        self.current_sel = RsSel::Local;
        self.stack_mut().jump_base = image;
        self.stack_mut().instruction_pointer = entry;

        self.drive(floor);

        self.stack_mut().jump_base = saved_base;
        self.stack_mut().instruction_pointer = saved_ip;
        self.current_sel = RsSel::Local;
    }

    /// Inner dispatch loop for a deferred subtree: run until the stack
    /// returns to `floor`.  A fault escaping the subtree is logged and
    /// discarded; blocking instructions abort it.
    fn drive(&mut self, floor: usize) {
        loop {
            if self.stack().frames.len() <= floor {
                return;
            }
            let previous = self.stack().instruction_pointer;
            self.blocked = false;

            match self.step() {
                Ok(address) => self.stack_mut().instruction_pointer = address,
                Err(Trap::Raise(thrown)) => self.stack_mut().thrown = Some(thrown),
                Err(Trap::Halt) => {
                    self.kernel.initiate_shutdown();
                    self.abandon_to(floor);
                    return;
                }
                Err(Trap::Fatal(message)) => {
                    self.kernel.fatal(&message);
                    self.abandon_to(floor);
                    return;
                }
            }

            if self.stack().frames.len() <= floor {
                return;
            }
            if self.blocked {
                log::warn!("blocking instruction in deferred call; call abandoned");
                self.abandon_to(floor);
                return;
            }
            if self.stack().instruction_pointer == previous
                && !matches!(self.last_opcode, Some(Opcode::Return))
                && self.stack().thrown.is_none()
            {
                self.stack_mut().thrown = Some(Fault::InstructionUnchanged.into_value());
            }
            if self.stack().thrown.is_some() {
                self.stack_mut().frame_new = None;
                self.unwind(floor);
            }
            if let Some(thrown) = self.stack_mut().thrown.take() {
                log::warn!("exception escaped deferred call: {}", thrown.repr());
                self.abandon_to(floor);
                return;
            }
        }
    }

    fn abandon_to(&mut self, floor: usize) {
        while self.stack().frames.len() > floor {
            // do not run further deferred calls of an abandoned subtree
            if self.stack_mut().pop_frame(false).is_err() {
                break;
            }
        }
        self.current_sel = RsSel::Local;
    }

    // ---- register plumbing ------------------------------------------------

    fn effective(&self, rs: RsSel) -> RsSel {
        match rs {
            RsSel::Current => self.current_sel,
            other => other,
        }
    }

    fn static_key(&self) -> Result<Id, Fault> {
        self.stack()
            .frames
            .last()
            .map(|frame| frame.function_name)
            .ok_or_else(|| Fault::Exception("no frame on stack".into()))
    }

    pub(crate) fn set_current_sel(&mut self, rs: RsSel) {
        self.current_sel = rs;
    }

    pub(crate) fn ensure_static_registers(&mut self) -> Result<(), Fault> {
        let key = self.static_key()?;
        self.static_registers
            .entry(key)
            .or_insert_with(|| RegisterSet::new(STATIC_REGISTER_SIZE));
        Ok(())
    }

    pub(crate) fn registers(&self, rs: RsSel) -> Result<&RegisterSet, Fault> {
        match self.effective(rs) {
            RsSel::Current => unreachable!("current selector resolves to a concrete set"),
            RsSel::Local => self
                .stack()
                .frames
                .last()
                .map(|frame| &frame.local_register_set)
                .ok_or_else(|| Fault::Exception("no frame on stack".into())),
            RsSel::Static => {
                let key = self.static_key()?;
                self.static_registers
                    .get(&key)
                    .ok_or_else(|| Fault::Exception("static registers not allocated".into()))
            }
            RsSel::Global => Ok(&self.global_register_set),
        }
    }

    pub(crate) fn registers_mut(&mut self, rs: RsSel) -> Result<&mut RegisterSet, Fault> {
        match self.effective(rs) {
            RsSel::Current => unreachable!("current selector resolves to a concrete set"),
            RsSel::Local => self
                .stacks
                .last_mut()
                .expect("process has no activation stack")
                .frames
                .last_mut()
                .map(|frame| &mut frame.local_register_set)
                .ok_or_else(|| Fault::Exception("no frame on stack".into())),
            RsSel::Static => {
                self.ensure_static_registers()?;
                let key = self.static_key()?;
                Ok(self.static_registers.get_mut(&key).unwrap())
            }
            RsSel::Global => Ok(&mut self.global_register_set),
        }
    }

    /// Resolve an operand to a concrete register, applying
    /// register-reference indirection.
    pub(crate) fn resolve(&mut self, operand: RegisterOperand) -> Result<ResolvedReg, Fault> {
        let rs = self.effective(operand.rs);
        if rs == RsSel::Static {
            self.ensure_static_registers()?;
        }
        let index = match operand.access {
            Access::Direct | Access::PointerDereference => operand.index as usize,
            Access::RegisterReference => {
                let named = self
                    .registers(rs)?
                    .get(operand.index as usize)?
                    .as_integer()?;
                usize::try_from(named).map_err(|_| {
                    Fault::OutOfRange(format!("negative register index: {}", named))
                })?
            }
            Access::Void | Access::Literal => {
                return Err(Fault::InvalidInstruction(
                    "void or literal operand used as a register".into(),
                ))
            }
        };
        Ok(ResolvedReg {
            rs,
            index,
            deref: operand.access == Access::PointerDereference,
        })
    }

    /// Read the value an operand designates, transparently following
    /// references and validating pointer dereferences.
    pub(crate) fn with_value<R>(
        &self,
        resolved: &ResolvedReg,
        f: impl FnOnce(&Value) -> Result<R, Trap>,
    ) -> Result<R, Trap> {
        let slot = self.registers(resolved.rs)?.get(resolved.index)?;
        if resolved.deref {
            let cell = match slot {
                Value::Pointer(weak) => weak.upgrade().ok_or_else(|| {
                    Trap::from(Fault::Exception("dereferenced an expired pointer".into()))
                })?,
                other => {
                    return Err(Fault::Type {
                        expected: "Pointer",
                        got: other.type_name(),
                    }
                    .into())
                }
            };
            let guard = cell.lock();
            f(&guard)
        } else if let Value::Reference(cell) = slot {
            let cell = cell.clone();
            let guard = cell.lock();
            f(&guard)
        } else {
            f(slot)
        }
    }

    /// Mutate the value an operand designates in place.
    pub(crate) fn mutate<R>(
        &mut self,
        operand: RegisterOperand,
        f: impl FnOnce(&mut Value) -> Result<R, Trap>,
    ) -> Result<R, Trap> {
        let resolved = self.resolve(operand)?;
        if resolved.deref {
            let cell = match self.registers(resolved.rs)?.get(resolved.index)? {
                Value::Pointer(weak) => weak.upgrade().ok_or_else(|| {
                    Trap::from(Fault::Exception("dereferenced an expired pointer".into()))
                })?,
                other => {
                    return Err(Fault::Type {
                        expected: "Pointer",
                        got: other.type_name(),
                    }
                    .into())
                }
            };
            let mut guard = cell.lock();
            return f(&mut guard);
        }
        let shared = match self.registers(resolved.rs)?.get(resolved.index)? {
            Value::Reference(cell) => Some(cell.clone()),
            _ => None,
        };
        if let Some(cell) = shared {
            let mut guard = cell.lock();
            f(&mut guard)
        } else {
            f(self.registers_mut(resolved.rs)?.get_mut(resolved.index)?)
        }
    }

    pub(crate) fn fetch_value(&mut self, operand: RegisterOperand) -> Result<Value, Trap> {
        let resolved = self.resolve(operand)?;
        self.with_value(&resolved, |value| Ok(value.copy()))
    }

    pub(crate) fn fetch_int(&mut self, operand: RegisterOperand) -> Result<i64, Trap> {
        let resolved = self.resolve(operand)?;
        self.with_value(&resolved, |value| Ok(value.as_integer()?))
    }

    pub(crate) fn fetch_bool(&mut self, operand: RegisterOperand) -> Result<bool, Trap> {
        let resolved = self.resolve(operand)?;
        self.with_value(&resolved, |value| Ok(value.boolean()))
    }

    pub(crate) fn fetch_text(&mut self, operand: RegisterOperand) -> Result<String, Trap> {
        let resolved = self.resolve(operand)?;
        self.with_value(&resolved, |value| Ok(value.as_text()?))
    }

    pub(crate) fn fetch_atom_value(&mut self, operand: RegisterOperand) -> Result<Id, Trap> {
        let resolved = self.resolve(operand)?;
        self.with_value(&resolved, |value| Ok(value.as_atom()?))
    }

    pub(crate) fn fetch_bits(
        &mut self,
        operand: RegisterOperand,
    ) -> Result<crate::value::Bits, Trap> {
        let resolved = self.resolve(operand)?;
        self.with_value(&resolved, |value| Ok(value.as_bits()?))
    }

    pub(crate) fn fetch_process_handle(
        &mut self,
        operand: RegisterOperand,
    ) -> Result<crate::value::ProcessHandle, Trap> {
        let resolved = self.resolve(operand)?;
        self.with_value(&resolved, |value| Ok(value.as_process()?))
    }

    /// Move a value out of a register; pointer dereferences cannot be
    /// moved from.
    pub(crate) fn pop_value(&mut self, operand: RegisterOperand) -> Result<Value, Trap> {
        let resolved = self.resolve(operand)?;
        if resolved.deref {
            return Err(Fault::Exception(
                "cannot move out of a pointer dereference".into(),
            )
            .into());
        }
        Ok(self.registers_mut(resolved.rs)?.pop(resolved.index)?)
    }

    pub(crate) fn place(&mut self, operand: RegisterOperand, value: Value) -> Result<(), Trap> {
        let resolved = self.resolve(operand)?;
        self.place_resolved(&resolved, value)
    }

    pub(crate) fn place_resolved(
        &mut self,
        resolved: &ResolvedReg,
        value: Value,
    ) -> Result<(), Trap> {
        if resolved.deref {
            return Err(Fault::Exception(
                "cannot write through a pointer dereference".into(),
            )
            .into());
        }
        self.registers_mut(resolved.rs)?.set(resolved.index, value)?;
        Ok(())
    }

    /// Place into a possibly-void target; void discards the value.
    pub(crate) fn place_opt(
        &mut self,
        target: Option<RegisterOperand>,
        value: Value,
    ) -> Result<(), Trap> {
        match target {
            Some(operand) => self.place(operand, value),
            None => Ok(()),
        }
    }

    /// Both register sets a foreign function receives: the static set
    /// of the called function (if ever allocated) and the globals.
    pub fn ffi_register_sets(
        &mut self,
        function: Id,
    ) -> (Option<&mut RegisterSet>, &mut RegisterSet) {
        (
            self.static_registers.get_mut(&function),
            &mut self.global_register_set,
        )
    }

    /// Place a foreign call's return value; failures come back as
    /// Exception values ready to raise.
    pub fn place_return(&mut self, target: &ResolvedReg, value: Value) -> Result<(), Value> {
        match self.place_resolved(target, value) {
            Ok(()) => Ok(()),
            Err(Trap::Raise(exception)) => Err(exception),
            Err(Trap::Halt) | Err(Trap::Fatal(_)) => Err(Fault::Exception(
                "failed to place foreign return value".into(),
            )
            .into_value()),
        }
    }

    /// Resolve a possibly-void return target, rejecting pointer
    /// dereferences.
    pub(crate) fn resolve_return_target(
        &mut self,
        target: Option<RegisterOperand>,
    ) -> Result<Option<ResolvedReg>, Trap> {
        match target {
            None => Ok(None),
            Some(operand) => {
                let resolved = self.resolve(operand)?;
                if resolved.deref {
                    return Err(Fault::Exception(
                        "cannot write through a pointer dereference".into(),
                    )
                    .into());
                }
                Ok(Some(resolved))
            }
        }
    }
}
