//! The kernel: symbol registries, process bookkeeping and the run loop.
//!
//! Registries are written at boot and import time and read-only after,
//! behind readers-writer locks.  The kernel seeds the initial process,
//! hands run queues to a pool of scheduler threads, aggregates
//! termination (exit code, terminating exception), and tears the
//! machine down once every non-hidden process has stopped.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::bytecode::Image;
use crate::common::{id, Id, Map, DEFAULT_REGISTER_SIZE};
use crate::fault::Fault;
use crate::ffi::{ForeignFunction, Linked, Linker, NoLinker};
use crate::process::{Frame, Outcome, Pid, Process, ProcessShared};
use crate::scheduler::{self, FfiRequest, RunQueue};
use crate::value::{Prototype, ProcessHandle, Value};

/// Pool sizing, read from the environment by the front-end.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub vp_schedulers: usize,
    pub ffi_schedulers: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            vp_schedulers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            ffi_schedulers: 2,
        }
    }
}

impl Config {
    pub fn from_env() -> Config {
        let mut config = Config::default();
        if let Some(n) = env_usize("VIUA_VP_SCHEDULERS") {
            config.vp_schedulers = n.max(1);
        }
        if let Some(n) = env_usize("VIUA_FFI_SCHEDULERS") {
            config.ffi_schedulers = n.max(1);
        }
        config
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse().ok()
}

/// Priority the initial process is seeded with.
const MAIN_PRIORITY: u32 = 16;

/// Result of a full machine run.
#[derive(Debug)]
pub struct ExitStatus {
    pub code: i32,
    /// The exception that terminated the machine, if any.
    pub exception: Option<Value>,
}

struct Module {
    name: String,
    image: Arc<Image>,
}

struct Class {
    prototype: Prototype,
    /// C3 linearisation, starting with the class itself.
    chain: Vec<Id>,
}

pub struct Kernel {
    /// Handle to the owning Arc, for passing the kernel to processes
    /// and scheduler threads.
    self_ref: Weak<Kernel>,
    config: Config,
    modules: RwLock<Vec<Module>>,
    /// Function name to (module index, byte offset).
    functions: RwLock<Map<Id, (usize, usize)>>,
    blocks: RwLock<Map<Id, (usize, usize)>>,
    classes: RwLock<Map<Id, Class>>,
    foreign_functions: RwLock<Map<Id, ForeignFunction>>,
    foreign_methods: RwLock<Map<Id, ForeignFunction>>,
    linker: RwLock<Box<dyn Linker>>,
    pids: AtomicU64,
    processes: Mutex<Map<Pid, Arc<ProcessShared>>>,
    queues: Vec<Arc<RunQueue>>,
    ffi_sender: Mutex<Option<Sender<FfiRequest>>>,
    ffi_receiver: Mutex<Option<Receiver<FfiRequest>>>,
    /// Non-hidden processes that have not yet stopped.
    live: AtomicUsize,
    terminating: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    terminating_exception: Mutex<Option<Value>>,
    main_pid: Mutex<Option<Pid>>,
    idle_lock: Mutex<()>,
    idle_signal: Condvar,
}

impl Kernel {
    pub fn new(config: Config) -> Arc<Kernel> {
        let (tx, rx) = unbounded();
        let queues = (0..config.vp_schedulers.max(1))
            .map(|_| Arc::new(RunQueue::new()))
            .collect();
        Arc::new_cyclic(|self_ref| Kernel {
            self_ref: self_ref.clone(),
            config,
            modules: RwLock::new(Vec::new()),
            functions: RwLock::new(Map::new()),
            blocks: RwLock::new(Map::new()),
            classes: RwLock::new(Map::new()),
            foreign_functions: RwLock::new(Map::new()),
            foreign_methods: RwLock::new(Map::new()),
            linker: RwLock::new(Box::new(NoLinker)),
            pids: AtomicU64::new(0),
            processes: Mutex::new(Map::new()),
            queues,
            ffi_sender: Mutex::new(Some(tx)),
            ffi_receiver: Mutex::new(Some(rx)),
            live: AtomicUsize::new(0),
            terminating: AtomicBool::new(false),
            exit_code: Mutex::new(None),
            terminating_exception: Mutex::new(None),
            main_pid: Mutex::new(None),
            idle_lock: Mutex::new(()),
            idle_signal: Condvar::new(),
        })
    }

    fn arc(&self) -> Arc<Kernel> {
        self.self_ref.upgrade().expect("kernel outlives its threads")
    }

    // ---- registries -------------------------------------------------------

    /// Load the executable image the machine will run.
    pub fn load_image(&self, image: Image) {
        self.link_module("main", image);
    }

    /// Merge a module's function and block tables into the kernel.
    pub fn link_module(&self, name: &str, image: Image) {
        let image = Arc::new(image);
        // the module is pushed before its symbols so no reader ever
        // resolves a symbol to a not-yet-present module index
        let index = {
            let mut modules = self.modules.write();
            modules.push(Module {
                name: name.to_string(),
                image: image.clone(),
            });
            modules.len() - 1
        };
        {
            let mut functions = self.functions.write();
            for (function, address) in image.functions() {
                functions.insert(id(function), (index, *address as usize));
            }
        }
        {
            let mut blocks = self.blocks.write();
            for (block, address) in image.blocks() {
                blocks.insert(id(block), (index, *address as usize));
            }
        }
        log::debug!("linked module {} as #{}", name, index);
    }

    pub fn set_linker(&self, linker: Box<dyn Linker>) {
        *self.linker.write() = linker;
    }

    /// Resolve and link a module by symbolic name; linking twice is a
    /// no-op.
    pub fn import(&self, module: &str) -> Result<(), Fault> {
        if self.modules.read().iter().any(|m| m.name == module) {
            return Ok(());
        }
        let linked = self.linker.read().resolve(module)?;
        match linked {
            Linked::Native(image) => self.link_module(module, image),
            Linked::Foreign(functions) => {
                for (name, function) in functions {
                    self.register_foreign_function(&name, function);
                }
            }
        }
        Ok(())
    }

    pub fn register_foreign_function(&self, name: &str, function: ForeignFunction) {
        self.foreign_functions.write().insert(id(name), function);
    }

    pub fn register_foreign_method(&self, name: &str, method: ForeignFunction) {
        self.foreign_methods.write().insert(id(name), method);
    }

    pub fn is_native_function(&self, name: Id) -> bool {
        self.functions.read().contains_key(&name)
    }

    pub fn is_foreign_function(&self, name: Id) -> bool {
        self.foreign_functions.read().contains_key(&name)
    }

    pub fn is_foreign_method(&self, name: Id) -> bool {
        self.foreign_methods.read().contains_key(&name)
    }

    pub fn is_block(&self, name: Id) -> bool {
        self.blocks.read().contains_key(&name)
    }

    pub fn foreign_callable(&self, name: Id) -> Option<ForeignFunction> {
        self.foreign_functions
            .read()
            .get(&name)
            .cloned()
            .or_else(|| self.foreign_methods.read().get(&name).cloned())
    }

    pub fn function_entry(&self, name: Id) -> Option<(Arc<Image>, usize)> {
        let (module, offset) = *self.functions.read().get(&name)?;
        let image = self.modules.read()[module].image.clone();
        Some((image, offset))
    }

    pub fn block_entry(&self, name: Id) -> Option<(Arc<Image>, usize)> {
        let (module, offset) = *self.blocks.read().get(&name)?;
        let image = self.modules.read()[module].image.clone();
        Some((image, offset))
    }

    // ---- classes ----------------------------------------------------------

    /// Finalise a prototype.  The inheritance chain is C3-linearised
    /// here, once, so exception matching is a lookup per ancestor.
    pub fn register_class(&self, prototype: Prototype) -> Result<(), Fault> {
        let mut classes = self.classes.write();
        if classes.contains_key(&prototype.name) {
            return Err(Fault::Exception(format!(
                "class already registered: {}",
                prototype.name
            )));
        }
        let chain = linearise(&prototype, &classes)?;
        classes.insert(prototype.name, Class { prototype, chain });
        Ok(())
    }

    pub fn is_class(&self, name: Id) -> bool {
        self.classes.read().contains_key(&name)
    }

    /// The linearised inheritance chain of a registered class, starting
    /// with the class itself.
    pub fn inheritance_chain_of(&self, name: Id) -> Option<Vec<Id>> {
        self.classes.read().get(&name).map(|c| c.chain.clone())
    }

    /// Resolve a method name against the class of a receiver type.
    pub fn resolve_method(&self, receiver_type: &str, method: Id) -> Option<Id> {
        let classes = self.classes.read();
        let class = classes.get(&id(receiver_type))?;
        for ancestor in &class.chain {
            if let Some(function) = classes
                .get(ancestor)
                .and_then(|c| c.prototype.methods.get(&method))
            {
                return Some(*function);
            }
        }
        None
    }

    // ---- processes --------------------------------------------------------

    /// Spawn a process running the prepared frame's function.
    pub fn spawn(
        &self,
        frame: Frame,
        joinable: bool,
        hidden: bool,
        priority: u32,
    ) -> Result<ProcessHandle, Fault> {
        let function = frame.function_name;
        let entry = self.function_entry(function).ok_or_else(|| {
            Fault::UndefinedSymbol(format!("process from undefined function: {}", function))
        })?;

        let pid = Pid(self.pids.fetch_add(1, Ordering::SeqCst) + 1);
        let shared = Arc::new(ProcessShared::new(pid, joinable, hidden));
        self.processes.lock().insert(pid, shared.clone());
        if !hidden {
            self.live.fetch_add(1, Ordering::SeqCst);
        }

        let mut process = Box::new(Process::new(self.arc(), shared.clone(), frame, entry));
        process.set_priority(priority);
        log::debug!("spawned process {} running {}", pid, function);
        self.enqueue(process);
        Ok(ProcessHandle {
            pid,
            link: Arc::downgrade(&shared),
        })
    }

    /// Seed the initial process: `main/1` with the command line if
    /// defined, else `main/0`.
    pub fn launch_main(&self, args: Vec<String>) -> Result<Pid, Fault> {
        let with_args = id("main/1");
        let plain = id("main/0");

        let handle = if self.is_native_function(with_args) {
            let mut frame = Frame::new(1, DEFAULT_REGISTER_SIZE);
            frame.function_name = with_args;
            let argv = Value::Vector(args.into_iter().map(Value::Text).collect());
            frame.arguments.set(0, argv)?;
            self.spawn(frame, false, false, MAIN_PRIORITY)?
        } else if self.is_native_function(plain) {
            let mut frame = Frame::new(0, DEFAULT_REGISTER_SIZE);
            frame.function_name = plain;
            self.spawn(frame, false, false, MAIN_PRIORITY)?
        } else {
            return Err(Fault::UndefinedSymbol("main/0".into()));
        };

        *self.main_pid.lock() = Some(handle.pid);
        Ok(handle.pid)
    }

    pub fn queue(&self, index: usize) -> &RunQueue {
        &self.queues[index]
    }

    fn least_loaded(&self) -> &RunQueue {
        self.queues
            .iter()
            .min_by_key(|q| q.len())
            .expect("kernel has at least one run queue")
    }

    fn enqueue(&self, process: Box<Process>) {
        self.least_loaded().push(process);
        self.notify_activity();
    }

    /// Return a process to a run queue after suspension.
    pub fn requeue(&self, process: Box<Process>) {
        self.enqueue(process);
    }

    /// Work migration: pull half of the most-loaded queue over to the
    /// thief.
    pub fn steal(&self, thief: usize) -> Option<Box<Process>> {
        let victim = (0..self.queues.len())
            .filter(|j| *j != thief)
            .max_by_key(|j| self.queues[*j].len())?;
        if self.queues[victim].len() < 2 {
            return None;
        }
        let mut stolen = self.queues[victim].split_half();
        let first = stolen.pop_front()?;
        log::debug!(
            "scheduler {} stole {} processes from {}",
            thief,
            stolen.len() + 1,
            victim
        );
        self.queues[thief].absorb(stolen);
        Some(first)
    }

    /// Hand a suspended process and its foreign call to the FFI pool.
    pub fn ffi_dispatch(&self, process: Box<Process>, call: crate::process::FfiCall) {
        let sender = self.ffi_sender.lock();
        match sender.as_ref() {
            Some(tx) => {
                if tx
                    .send(FfiRequest::Call { process, call })
                    .is_err()
                {
                    log::error!("ffi scheduler gone; dropping suspended process");
                }
            }
            None => log::error!("ffi scheduler shut down; dropping suspended process"),
        }
    }

    /// Handle a stopped process: record the outcome, run the watchdog
    /// respawn if one is installed, aggregate main's exit code.
    pub fn finalize_process(&self, mut process: Box<Process>) {
        let pid = process.pid();
        let shared = process.shared().clone();
        let is_main = *self.main_pid.lock() == Some(pid);

        if process.terminated() {
            let exception = process
                .take_exception()
                .expect("terminated process has an active exception");

            if let Some(watchdog) = process.watchdog() {
                let mut frame = Frame::new(1, DEFAULT_REGISTER_SIZE);
                if frame.arguments.set(0, exception.copy()).is_ok()
                    && process.become_function(watchdog, frame).is_ok()
                {
                    log::warn!(
                        "process {} died with {}; respawned into watchdog {}",
                        pid,
                        exception.repr(),
                        watchdog
                    );
                    self.requeue(process);
                    return;
                }
                log::error!("watchdog {} could not be spawned for {}", watchdog, pid);
            }

            if shared.joinable() {
                // the exception is the joiner's to handle: join re-raises it
                shared.mark_stopped(Outcome::Raised(exception));
            } else {
                eprintln!(
                    "process {} terminated with unhandled exception: {}",
                    pid,
                    exception.str()
                );
                if is_main {
                    *self.terminating_exception.lock() = Some(exception.copy());
                }
                *self.exit_code.lock() = Some(1);
                shared.mark_stopped(Outcome::Raised(exception));
            }
        } else {
            let value = process.take_return_value();
            if is_main {
                if let Some(Value::Integer(code)) = &value {
                    // main's return register overrides the exit code
                    let mut exit_code = self.exit_code.lock();
                    if exit_code.is_none() {
                        *exit_code = Some(*code as i32);
                    }
                }
            }
            shared.mark_stopped(Outcome::Returned(value));
        }

        if !shared.hidden() {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        if !shared.joinable() {
            self.release_process(pid);
        }
        self.notify_activity();
        log::debug!("process {} stopped", pid);
    }

    /// Drop the kernel's strong reference to a process's shared state,
    /// after it was joined or ran detached to completion.
    pub fn release_process(&self, pid: Pid) {
        self.processes.lock().remove(&pid);
    }

    pub fn live_processes(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    // ---- termination ------------------------------------------------------

    pub fn terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Set the terminating flag; schedulers drain and exit.
    pub fn initiate_shutdown(&self) {
        self.terminating.store(true, Ordering::SeqCst);
        self.notify_activity();
    }

    /// Unrecoverable condition (stack corruption): stop everything.
    pub fn fatal(&self, message: &str) {
        log::error!("fatal: {}", message);
        eprintln!("fatal: {}", message);
        *self.exit_code.lock() = Some(1);
        self.initiate_shutdown();
    }

    pub fn notify_activity(&self) {
        self.idle_signal.notify_all();
    }

    /// Park the calling scheduler until something happens or the
    /// timeout passes.
    pub fn idle_wait(&self, timeout: Duration) {
        let mut guard = self.idle_lock.lock();
        self.idle_signal.wait_for(&mut guard, timeout);
    }

    // ---- run loop ---------------------------------------------------------

    /// Run the machine to completion: start scheduler pools, wait for
    /// every non-hidden process to stop, tear down, and report.
    pub fn run(&self) -> ExitStatus {
        let ffi_receiver = self
            .ffi_receiver
            .lock()
            .take()
            .expect("kernel can only be run once");

        let mut ffi_threads = Vec::new();
        for _ in 0..self.config.ffi_schedulers.max(1) {
            let kernel = self.arc();
            let rx = ffi_receiver.clone();
            ffi_threads.push(std::thread::spawn(move || scheduler::ffi_main(kernel, rx)));
        }
        drop(ffi_receiver);

        let mut vp_threads = Vec::new();
        for index in 0..self.queues.len() {
            let kernel = self.arc();
            vp_threads.push(std::thread::spawn(move || scheduler::vps_main(kernel, index)));
        }

        while !self.terminating() && self.live_processes() > 0 {
            self.idle_wait(Duration::from_millis(5));
        }
        self.initiate_shutdown();

        for handle in vp_threads {
            let _ = handle.join();
        }
        // disconnect the FFI channel so its threads drain and exit
        *self.ffi_sender.lock() = None;
        for handle in ffi_threads {
            let _ = handle.join();
        }

        ExitStatus {
            code: self.exit_code.lock().unwrap_or(0),
            exception: self.terminating_exception.lock().take(),
        }
    }
}

/// C3 linearisation: L(C) = C + merge(L(P1), ..., L(Pn), [P1, ..., Pn]).
fn linearise(prototype: &Prototype, classes: &Map<Id, Class>) -> Result<Vec<Id>, Fault> {
    let mut sequences: Vec<Vec<Id>> = Vec::new();
    for ancestor in &prototype.ancestors {
        let class = classes.get(ancestor).ok_or_else(|| {
            Fault::Exception(format!("cannot derive from unregistered type: {}", ancestor))
        })?;
        sequences.push(class.chain.clone());
    }
    sequences.push(prototype.ancestors.clone());

    let mut chain = vec![prototype.name];
    loop {
        sequences.retain(|s| !s.is_empty());
        if sequences.is_empty() {
            return Ok(chain);
        }
        let head = sequences
            .iter()
            .map(|s| s[0])
            .find(|candidate| !sequences.iter().any(|s| s[1..].contains(candidate)))
            .ok_or_else(|| {
                Fault::Exception(format!(
                    "inconsistent inheritance hierarchy for {}",
                    prototype.name
                ))
            })?;
        chain.push(head);
        for sequence in &mut sequences {
            if sequence.first() == Some(&head) {
                sequence.remove(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(kernel: &Kernel, name: &str, ancestors: &[&str]) {
        let mut proto = Prototype::new(id(name));
        proto.ancestors = ancestors.iter().map(|a| id(a)).collect();
        kernel.register_class(proto).unwrap();
    }

    #[test]
    fn linearisation_is_c3() {
        let kernel = Kernel::new(Config {
            vp_schedulers: 1,
            ffi_schedulers: 1,
        });
        // classic diamond: D(B, C), B(A), C(A)
        class(&kernel, "A", &[]);
        class(&kernel, "B", &["A"]);
        class(&kernel, "C", &["A"]);
        class(&kernel, "D", &["B", "C"]);

        let chain = kernel.inheritance_chain_of(id("D")).unwrap();
        let names: Vec<String> = chain.iter().map(|c| c.to_string()).collect();
        assert_eq!(names, ["D", "B", "C", "A"]);
    }

    #[test]
    fn deriving_from_an_unregistered_type_is_rejected() {
        let kernel = Kernel::new(Config {
            vp_schedulers: 1,
            ffi_schedulers: 1,
        });
        let mut proto = Prototype::new(id("Orphan"));
        proto.ancestors.push(id("Missing"));
        assert!(kernel.register_class(proto).is_err());
    }

    #[test]
    fn importing_a_foreign_module_registers_its_functions() {
        struct FakeLinker;
        impl crate::ffi::Linker for FakeLinker {
            fn resolve(&self, module: &str) -> Result<crate::ffi::Linked, Fault> {
                if module == "host" {
                    Ok(crate::ffi::Linked::Foreign(vec![(
                        "host::nop/0".into(),
                        crate::ffi::foreign(|_, _, _| Ok(())),
                    )]))
                } else {
                    Err(Fault::Link(module.into()))
                }
            }
        }

        let kernel = Kernel::new(Config {
            vp_schedulers: 1,
            ffi_schedulers: 1,
        });
        kernel.set_linker(Box::new(FakeLinker));
        kernel.import("host").unwrap();
        assert!(kernel.is_foreign_function(id("host::nop/0")));
        assert!(kernel.import("missing").is_err());
    }

    #[test]
    fn method_resolution_walks_the_chain() {
        let kernel = Kernel::new(Config {
            vp_schedulers: 1,
            ffi_schedulers: 1,
        });
        kernel.register_foreign_function("base::greet/1", crate::ffi::foreign(|_, _, _| Ok(())));
        let mut base = Prototype::new(id("Base"));
        base.methods.insert(id("greet/1"), id("base::greet/1"));
        kernel.register_class(base).unwrap();
        class(&kernel, "Derived", &["Base"]);

        assert_eq!(
            kernel.resolve_method("Derived", id("greet/1")),
            Some(id("base::greet/1"))
        );
        assert_eq!(kernel.resolve_method("Derived", id("absent/0")), None);
    }
}
