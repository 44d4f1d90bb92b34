//! The framed, length-prefixed text protocol spoken on every connection.

pub mod instruction;
pub mod io;

pub use instruction::{Instruction, ParseError};
pub use io::{InstructionIo, IoError};
