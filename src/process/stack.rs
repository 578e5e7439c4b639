//! One activation of a process: call frames, try frames and the
//! instruction pointer over a module image.

use std::sync::Arc;

use crate::bytecode::Image;
use crate::common::{Id, MAX_STACK_SIZE};
use crate::fault::Fault;
use crate::kernel::Kernel;
use crate::registers::Mask;
use crate::value::Value;

use super::frame::{Frame, TryFrame};

pub struct Stack {
    pub entry_function: Id,
    pub frames: Vec<Frame>,
    pub tryframes: Vec<TryFrame>,
    /// Frame under construction, between `frame` and `call`.
    pub frame_new: Option<Frame>,
    /// Try frame under construction, between `try` and `enter`.
    pub try_frame_new: Option<TryFrame>,
    /// Offset of the next instruction within `jump_base`.
    pub instruction_pointer: usize,
    /// Module image relative jumps resolve against.
    pub jump_base: Arc<Image>,
    pub thrown: Option<Value>,
    pub caught: Option<Value>,
    /// Set when the last frame pops, from its local register 0.
    pub return_value: Option<Value>,
    next_serial: u64,
}

impl Stack {
    pub fn new(entry_function: Id, jump_base: Arc<Image>) -> Stack {
        Stack {
            entry_function,
            frames: Vec::new(),
            tryframes: Vec::new(),
            frame_new: None,
            try_frame_new: None,
            instruction_pointer: 0,
            jump_base,
            thrown: None,
            caught: None,
            return_value: None,
            next_serial: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn assign_serial(&mut self, frame: &mut Frame) {
        self.next_serial += 1;
        frame.serial = self.next_serial;
    }

    /// Begin constructing a frame; fails if one is already pending.
    pub fn prepare_frame(
        &mut self,
        arguments_size: usize,
        registers_size: usize,
    ) -> Result<&mut Frame, Fault> {
        if self.frame_new.is_some() {
            return Err(Fault::Exception(
                "requested new frame while last one is unused".into(),
            ));
        }
        let mut frame = Frame::new(arguments_size, registers_size);
        self.assign_serial(&mut frame);
        self.frame_new = Some(frame);
        Ok(self.frame_new.as_mut().unwrap())
    }

    pub fn take_prepared(&mut self) -> Option<Frame> {
        self.frame_new.take()
    }

    /// Push a frame, validating depth and that the frame is not already
    /// on the stack.
    pub fn push_frame(&mut self, frame: Frame) -> Result<(), Fault> {
        if self.frames.len() > MAX_STACK_SIZE {
            return Err(Fault::StackOverflow {
                function: frame.function_name.to_string(),
                limit: MAX_STACK_SIZE,
            });
        }
        if self.frames.iter().any(|f| f.serial == frame.serial) {
            return Err(Fault::StackCorruption(format!(
                "{}/{}",
                frame.function_name,
                frame.arguments.size()
            )));
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Pop the top frame.  With `strict`, a MOVED-but-still-present
    /// argument is an error; the unwinder passes false and only logs.
    pub fn pop_frame(&mut self, strict: bool) -> Result<Frame, Fault> {
        let mut frame = self
            .frames
            .pop()
            .ok_or_else(|| Fault::Exception("no frame on stack".into()))?;

        for i in 0..frame.arguments.size() {
            if frame.arguments.at(i)?.is_some() && frame.arguments.is_flagged(i, Mask::MOVED)? {
                if strict {
                    return Err(Fault::MovedParameterUnused);
                }
                log::warn!(
                    "unused pass-by-move parameter {} in {}",
                    i,
                    frame.function_name
                );
            }
        }

        if self.frames.is_empty() && frame.local_register_set.size() > 0 {
            self.return_value = frame.local_register_set.take(0)?;
        }

        Ok(frame)
    }

    #[cfg(test)]
    pub(crate) fn test_instance() -> Stack {
        use crate::bytecode::image::ImageKind;
        Stack::new(
            crate::common::id("main/0"),
            Arc::new(Image::new(ImageKind::Executable)),
        )
    }

    /// Find the innermost try frame with a catcher for the thrown value,
    /// walking the linearised inheritance chain of registered classes.
    /// Returns the try-frame index and the catcher block name.
    pub fn find_catch_frame(&self, kernel: &Kernel) -> Option<(usize, Id)> {
        let thrown = self.thrown.as_ref()?;
        let thrown_type = crate::common::id(&thrown.type_name());
        let chain = kernel.inheritance_chain_of(thrown_type);

        for i in (0..self.tryframes.len()).rev() {
            let tframe = &self.tryframes[i];
            if let Some(block) = tframe.catchers.get(&thrown_type) {
                return Some((i, *block));
            }
            if let Some(chain) = &chain {
                for ancestor in chain {
                    if let Some(block) = tframe.catchers.get(ancestor) {
                        return Some((i, *block));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::id;

    #[test]
    fn only_one_frame_may_be_in_construction() {
        let mut stack = Stack::test_instance();
        stack.prepare_frame(0, 4).unwrap();
        assert!(matches!(
            stack.prepare_frame(0, 4),
            Err(Fault::Exception(_))
        ));
    }

    #[test]
    fn pushing_the_same_frame_twice_is_stack_corruption() {
        let mut stack = Stack::test_instance();
        stack.prepare_frame(0, 1).unwrap();
        let frame = stack.take_prepared().unwrap();
        let serial = frame.serial;
        stack.push_frame(frame).unwrap();

        let mut duplicate = Frame::new(0, 1);
        duplicate.function_name = id("dup/0");
        duplicate.serial = serial;
        assert!(matches!(
            stack.push_frame(duplicate),
            Err(Fault::StackCorruption(_))
        ));
    }

    #[test]
    fn strict_pop_flags_unused_pass_by_move_parameters() {
        let mut stack = Stack::test_instance();
        stack.prepare_frame(1, 1).unwrap();
        let mut frame = stack.take_prepared().unwrap();
        frame.arguments.set(0, Value::Integer(1)).unwrap();
        frame.arguments.flag(0, Mask::MOVED).unwrap();
        stack.push_frame(frame).unwrap();
        assert!(matches!(
            stack.pop_frame(true),
            Err(Fault::MovedParameterUnused)
        ));
    }

    #[test]
    fn the_last_frame_leaves_its_return_value_behind() {
        let mut stack = Stack::test_instance();
        stack.prepare_frame(0, 2).unwrap();
        let mut frame = stack.take_prepared().unwrap();
        frame.local_register_set.set(0, Value::Integer(9)).unwrap();
        stack.push_frame(frame).unwrap();
        stack.pop_frame(true).unwrap();
        assert_eq!(stack.return_value.take().unwrap().repr(), "9");
    }
}
