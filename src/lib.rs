//! Viua: a register-based bytecode virtual machine with lightweight,
//! preemptively-scheduled user-space processes.
//!
//! Processes communicate only by message passing, own isolated register
//! sets, and unwind through a structured try/catch exception model.  The
//! crate contains the bytecode model (opcodes, operand codec, emission
//! API, binary image format), the per-process stack machine, and the
//! multi-scheduler kernel that time-slices processes across OS threads.
//! See the `src/bin` directory for the executable runtime using this
//! library.

pub mod common;
pub mod value;
pub mod registers;
pub mod fault;
pub mod bytecode;
pub mod mailbox;
pub mod process;
pub mod ffi;
pub mod scheduler;
pub mod kernel;
