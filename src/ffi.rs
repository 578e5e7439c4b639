//! Foreign functions: registration types, the linker seam used by
//! `import`, and the adapter invoking a foreign callable with a frame.
//!
//! A foreign function receives the call frame plus the calling
//! process's static and global register sets, and places its optional
//! return value in local register 0 of the frame.  Panics escaping
//! foreign code are converted to ordinary Exception values carrying the
//! foreign message.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use crate::bytecode::image::Image;
use crate::common::id;
use crate::fault::Fault;
use crate::process::{FfiCall, Frame, Process};
use crate::registers::RegisterSet;
use crate::value::{Exception, Value};

pub type ForeignResult = Result<(), Value>;

/// Signature of callable foreign code.
pub type ForeignFunction = Arc<
    dyn Fn(&mut Frame, Option<&mut RegisterSet>, &mut RegisterSet) -> ForeignResult
        + Send
        + Sync,
>;

pub fn foreign(
    f: impl Fn(&mut Frame, Option<&mut RegisterSet>, &mut RegisterSet) -> ForeignResult
        + Send
        + Sync
        + 'static,
) -> ForeignFunction {
    Arc::new(f)
}

/// What a linker resolved a module name to.
pub enum Linked {
    /// A bytecode module to merge into the kernel's tables.
    Native(Image),
    /// A set of foreign functions exported under their full names.
    Foreign(Vec<(String, ForeignFunction)>),
}

/// External collaborator resolving symbolic module names for `import`.
pub trait Linker: Send + Sync {
    fn resolve(&self, module: &str) -> Result<Linked, Fault>;
}

/// Default linker: resolves nothing.
pub struct NoLinker;

impl Linker for NoLinker {
    fn resolve(&self, module: &str) -> Result<Linked, Fault> {
        Err(Fault::Link(module.to_string()))
    }
}

/// Searches a list of directories for `<module>.viua` bytecode images,
/// with `::` in module names mapping to directory separators.
pub struct PathLinker {
    paths: Vec<PathBuf>,
}

impl PathLinker {
    pub fn new(paths: Vec<PathBuf>) -> PathLinker {
        PathLinker { paths }
    }
}

impl Linker for PathLinker {
    fn resolve(&self, module: &str) -> Result<Linked, Fault> {
        let relative = format!("{}.viua", module.replace("::", "/"));
        for base in &self.paths {
            let candidate = base.join(&relative);
            if !candidate.is_file() {
                continue;
            }
            return Image::load_file(&candidate)
                .map(Linked::Native)
                .map_err(|e| Fault::Link(format!("{}: {}", module, e)));
        }
        Err(Fault::Link(module.to_string()))
    }
}

/// Run a foreign call against a suspended process: invoke the function,
/// marshal local register 0 of the frame into the return register, and
/// clear the suspension.  Failures are installed as the process's
/// thrown value and unwound on its next tick.
pub fn invoke(process: &mut Process, call: FfiCall) {
    let FfiCall {
        function,
        mut frame,
        return_target,
    } = call;

    let Some(callable) = process.kernel().foreign_callable(function) else {
        process.raise(
            Fault::UndefinedSymbol(format!("call to unregistered foreign function: {}", function))
                .into_value(),
        );
        process.shared().set_suspended(false);
        return;
    };

    let outcome = {
        let (statics, globals) = process.ffi_register_sets(function);
        catch_unwind(AssertUnwindSafe(|| callable(&mut frame, statics, globals)))
    };

    match outcome {
        Ok(Ok(())) => {
            if let Some(target) = return_target {
                match frame.local_register_set.take(0) {
                    Ok(Some(value)) => {
                        if let Err(exception) = process.place_return(&target, value) {
                            process.raise(exception);
                        }
                    }
                    _ => process.raise(
                        Fault::Exception(
                            "return value requested by frame but foreign function \
                             did not set return register"
                                .into(),
                        )
                        .into_value(),
                    ),
                }
            }
        }
        Ok(Err(exception)) => process.raise(exception),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "foreign code panicked".into());
            process.raise(Value::Exception(Exception::new(id("Exception"), message)));
        }
    }
    process.shared().set_suspended(false);
}
