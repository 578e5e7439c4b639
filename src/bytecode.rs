//! The bytecode model: opcode inventory, operand codec, emission API and
//! the binary image format.

pub mod codec;
pub mod emit;
pub mod image;
pub mod ops;

pub use codec::{Access, Decoder, RegisterOperand, Timeout};
pub use emit::ProgramBuilder;
pub use image::Image;
pub use ops::Opcode;
