//! Virtual-process schedulers and the FFI scheduler.
//!
//! A fixed pool of OS threads each owns a run queue of processes and
//! round-robin ticks them: each turn executes exactly one instruction,
//! then the process is requeued, finalized, or shipped off.  An idle
//! scheduler steals from the most-loaded queue.  Foreign calls suspend
//! the process and ship it, with its prepared frame, to a dedicated FFI
//! thread pool; completion requeues it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::ffi;
use crate::kernel::Kernel;
use crate::process::{FfiCall, Process};

/// One scheduler's queue of runnable processes.
pub struct RunQueue {
    queue: Mutex<VecDeque<Box<Process>>>,
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RunQueue {
    pub fn new() -> RunQueue {
        RunQueue {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, process: Box<Process>) {
        self.queue.lock().push_back(process);
    }

    pub fn pop(&self) -> Option<Box<Process>> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Give up the newer half of the queue.
    pub fn split_half(&self) -> VecDeque<Box<Process>> {
        let mut queue = self.queue.lock();
        let keep = queue.len() / 2;
        queue.split_off(keep)
    }

    pub fn absorb(&self, mut processes: VecDeque<Box<Process>>) {
        self.queue.lock().append(&mut processes);
    }
}

/// Work item for the FFI thread pool.
pub enum FfiRequest {
    Call {
        process: Box<Process>,
        call: FfiCall,
    },
}

/// Body of one virtual-process scheduler thread.
pub fn vps_main(kernel: Arc<Kernel>, index: usize) {
    log::debug!("virtual process scheduler {} up", index);
    while !kernel.terminating() {
        let Some(process) = kernel.queue(index).pop().or_else(|| kernel.steal(index)) else {
            kernel.idle_wait(Duration::from_millis(1));
            continue;
        };
        run_turn(&kernel, index, process);
    }
    log::debug!("virtual process scheduler {} down", index);
}

/// One round-robin turn: call `tick()` once, then requeue the process,
/// finalize it, or hand it to the FFI pool.
fn run_turn(kernel: &Arc<Kernel>, index: usize, mut process: Box<Process>) {
    if !process.stopped() {
        process.tick();
    }

    if let Some(call) = process.take_pending_ffi() {
        log::debug!("process {} suspended on foreign call", process.pid());
        kernel.ffi_dispatch(process, call);
        return;
    }
    if process.stopped() {
        kernel.finalize_process(process);
        return;
    }

    let was_blocked = process.is_blocked();
    kernel.queue(index).push(process);
    if was_blocked && kernel.queue(index).len() == 1 {
        // lone waiter: back off instead of spinning on its mailbox
        kernel.idle_wait(Duration::from_micros(500));
    }
}

/// Body of one FFI scheduler thread.  Exits when the request channel
/// disconnects at shutdown.
pub fn ffi_main(kernel: Arc<Kernel>, requests: Receiver<FfiRequest>) {
    log::debug!("ffi scheduler up");
    while let Ok(request) = requests.recv() {
        match request {
            FfiRequest::Call { mut process, call } => {
                ffi::invoke(&mut process, call);
                kernel.requeue(process);
            }
        }
    }
    log::debug!("ffi scheduler down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::emit::{local, BodyBuilder, ProgramBuilder};
    use crate::bytecode::image::ImageKind;
    use crate::common::id;
    use crate::kernel::Config;
    use crate::process::{Frame, Pid, ProcessShared};

    fn test_kernel() -> Arc<Kernel> {
        let kernel = Kernel::new(Config {
            vp_schedulers: 2,
            ffi_schedulers: 1,
        });
        let mut main = BodyBuilder::new("main/0");
        main.op_izero(local(1));
        main.op_izero(local(2));
        main.op_return();
        let mut program = ProgramBuilder::new();
        program.add_function(main);
        kernel.load_image(program.link(ImageKind::Executable));
        kernel
    }

    /// A process built outside the kernel's spawn path, so queues can be
    /// exercised without touching the live-process accounting.
    fn test_process(kernel: &Arc<Kernel>, pid: u64) -> Box<Process> {
        let shared = Arc::new(ProcessShared::new(Pid(pid), false, true));
        let mut frame = Frame::new(0, 4);
        frame.function_name = id("main/0");
        let entry = kernel.function_entry(id("main/0")).unwrap();
        Box::new(Process::new(kernel.clone(), shared, frame, entry))
    }

    #[test]
    fn run_queues_are_fifo() {
        let kernel = test_kernel();
        let queue = RunQueue::new();
        for pid in 1..=3 {
            queue.push(test_process(&kernel, pid));
        }
        assert_eq!(queue.len(), 3);
        for pid in 1..=3 {
            assert_eq!(queue.pop().unwrap().pid(), Pid(pid));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn split_half_gives_up_the_newer_half() {
        let kernel = test_kernel();
        let queue = RunQueue::new();
        for pid in 1..=4 {
            queue.push(test_process(&kernel, pid));
        }

        let stolen = queue.split_half();
        let stolen_pids: Vec<Pid> = stolen.iter().map(|p| p.pid()).collect();
        assert_eq!(stolen_pids, [Pid(3), Pid(4)]);
        assert_eq!(queue.len(), 2);

        let thief = RunQueue::new();
        thief.absorb(stolen);
        assert_eq!(thief.pop().unwrap().pid(), Pid(3));
        assert_eq!(thief.pop().unwrap().pid(), Pid(4));
    }

    #[test]
    fn stealing_needs_a_victim_with_at_least_two_processes() {
        let kernel = test_kernel();
        assert!(kernel.steal(0).is_none());

        kernel.queue(1).push(test_process(&kernel, 1));
        assert!(kernel.steal(0).is_none());

        kernel.queue(1).push(test_process(&kernel, 2));
        let stolen = kernel.steal(0).expect("two queued processes are enough");
        // the thief receives the newer half; the victim keeps the rest
        assert_eq!(stolen.pid(), Pid(2));
        assert_eq!(kernel.queue(1).len(), 1);
        assert_eq!(kernel.queue(1).pop().unwrap().pid(), Pid(1));
    }

    #[test]
    fn priority_is_plain_process_state() {
        let kernel = test_kernel();
        let mut process = test_process(&kernel, 1);
        assert_eq!(process.priority(), 1);
        process.set_priority(16);
        assert_eq!(process.priority(), 16);
    }

    #[test]
    fn a_turn_ticks_exactly_once() {
        let kernel = test_kernel();
        let process = test_process(&kernel, 7);
        let shared = process.shared().clone();

        // main/0 is three instructions long; one turn per instruction
        // means two turns leave the process queued and unfinished
        run_turn(&kernel, 0, process);
        let process = kernel.queue(0).pop().expect("requeued after one tick");
        assert!(!process.stopped());
        run_turn(&kernel, 0, process);
        let process = kernel.queue(0).pop().expect("requeued after two ticks");
        assert!(!process.stopped());

        // the third turn executes `return` and finalizes the process
        run_turn(&kernel, 0, process);
        assert!(kernel.queue(0).pop().is_none());
        assert!(shared.stopped());
    }
}
