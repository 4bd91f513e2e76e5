use std::fmt;

#[derive(Clone, Debug)]
pub struct CompileError {
    pub line: u32,
    pub lexeme: String,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error at '{}': {}", self.line, self.lexeme, self.message)
    }
}
