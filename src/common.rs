//! Common definitions that are shared between different parts of the
//! machine.

// Use sorted sets and maps for consistent output
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Interned identifiers: atoms, function names, block names, type names.
pub type Id = internment::Intern<String>;

/// Intern a string slice as an [Id].
pub fn id(name: &str) -> Id {
    Id::from_ref(name)
}

/// Hard limit on call-stack depth, checked at frame push time.
pub const MAX_STACK_SIZE: usize = 8192;

/// Size of the global register set of every process.
pub const DEFAULT_REGISTER_SIZE: usize = 255;

/// Size of the lazily-allocated per-function static register sets.
pub const STATIC_REGISTER_SIZE: usize = 16;

/// Name of the function a process begins executing when none is given.
pub const ENTRY_FUNCTION: &str = "main/0";
