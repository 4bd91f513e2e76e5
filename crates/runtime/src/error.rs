//! Errors surfaced by [`crate::vm::Vm::interpret`].

use std::fmt;

use lox_compiler::CompileError;

/// A runtime fault: a failed operation plus the call-stack trace at the
/// point of failure.
#[derive(Debug)]
pub struct VmError {
    pub message: String,
    pub line: u32,
    pub trace: Vec<String>,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for entry in &self.trace {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}

impl std::error::Error for VmError {}

#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<CompileError>),
    Runtime(VmError),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile(errors) => {
                for e in errors {
                    writeln!(f, "{e}")?;
                }
                Ok(())
            }
            InterpretError::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for InterpretError {}

pub type InterpretResult = Result<(), InterpretError>;
