//! Single-pass Pratt compiler: lowers source text directly to bytecode
//! while resolving lexical scope (locals, upvalues, globals).

use std::collections::HashMap;

use lox_core::{Chunk, Globals, Heap, ObjFunction, ObjHeader, ObjString, OpCode, Value};

use crate::error::CompileError;
use crate::scanner::{Scanner, Token, TokenKind};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Precedence {
    None,
    Assignment,
    Conditional,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn higher(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Conditional,
            Conditional => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

fn get_precedence(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Or => Precedence::Or,
        And => Precedence::And,
        EqualEqual | BangEqual => Precedence::Equality,
        Less | LessEqual | Greater | GreaterEqual => Precedence::Comparison,
        Plus | Minus => Precedence::Term,
        Star | Slash => Precedence::Factor,
        LeftParen | Dot => Precedence::Call,
        Question => Precedence::Conditional,
        _ => Precedence::None,
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'a> {
    name: &'a str,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueInfo {
    index: u8,
    is_local: bool,
}

#[derive(Clone, Copy)]
struct LoopCtx {
    start: usize,
    scope_depth: i32,
}

#[derive(Clone, Copy, Default)]
struct ClassCtx {
    has_superclass: bool,
}

struct FunctionCompiler<'a> {
    function_type: FunctionType,
    name: Option<*mut ObjString>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'a>>,
    upvalues: Vec<UpvalueInfo>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
    height: i32,
    peak: i32,
    last_push: Option<OpCode>,
    string_constants: HashMap<String, u16>,
}

pub struct Compiler<'a, 'h> {
    scanner: Scanner<'a>,
    current: Token<'a>,
    previous: Token<'a>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    heap: &'h mut Heap,
    globals: &'h mut Globals,
    frames: Vec<FunctionCompiler<'a>>,
    classes: Vec<ClassCtx>,
}

/// Compiles `source` into a top-level function ("script"). Global names are
/// resolved against (and, if new, added to) `globals`, so that a REPL can
/// call this repeatedly against the same `Globals`/`Heap` and have earlier
/// lines' globals remain visible to later ones.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    globals: &mut Globals,
) -> Result<*mut ObjFunction, Vec<CompileError>> {
    let scanner = Scanner::new(source);
    let dummy = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
    let mut c = Compiler {
        scanner,
        current: dummy,
        previous: dummy,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        heap,
        globals,
        frames: Vec::new(),
        classes: Vec::new(),
    };
    c.push_frame(FunctionType::Script, None);
    c.advance();
    while !c.check(TokenKind::Eof) {
        c.declaration();
    }
    c.consume(TokenKind::Eof, "Expect end of expression.");
    let (func, _) = c.end_compiler();
    if c.had_error { Err(c.errors) } else { Ok(func) }
}

impl<'a, 'h> Compiler<'a, 'h> {
    // ---- token stream -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.lexeme.to_string();
            self.error_at_current(&msg);
        }
    }

    fn consume(&mut self, kind: TokenKind, msg: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn error_at_current(&mut self, msg: &str) {
        let tok = self.current;
        self.error_at(tok, msg);
    }

    fn error(&mut self, msg: &str) {
        let tok = self.previous;
        self.error_at(tok, msg);
    }

    fn error_at(&mut self, tok: Token<'a>, msg: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(CompileError {
            line: tok.line,
            lexeme: tok.lexeme.to_string(),
            message: msg.to_string(),
        });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            match self.current.kind {
                Class | Fun | Var | For | If | While | Print | Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- frame / scope plumbing ----------------------------------------

    fn current_frame(&self) -> &FunctionCompiler<'a> {
        self.frames.last().unwrap()
    }

    fn current_frame_mut(&mut self) -> &mut FunctionCompiler<'a> {
        self.frames.last_mut().unwrap()
    }

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        &mut self.current_frame_mut().chunk
    }

    fn push_frame(&mut self, ftype: FunctionType, name: Option<&'a str>) {
        let name_ptr = name.map(|n| self.heap.intern(n));
        let slot0_name: &'a str = match ftype {
            FunctionType::Method | FunctionType::Initializer => "this",
            _ => "",
        };
        let mut frame = FunctionCompiler {
            function_type: ftype,
            name: name_ptr,
            arity: 0,
            chunk: Chunk::new(),
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            height: 0,
            peak: 0,
            last_push: None,
            string_constants: HashMap::new(),
        };
        frame.locals.push(Local { name: slot0_name, depth: 0, is_captured: false });
        self.frames.push(frame);
    }

    fn end_compiler(&mut self) -> (*mut ObjFunction, Vec<UpvalueInfo>) {
        self.emit_return();
        let mut frame = self.frames.pop().unwrap();
        frame.chunk.slots = frame.peak.max(0) as usize;
        let func_ptr = self.heap.alloc_function();
        unsafe {
            (*func_ptr).arity = frame.arity;
            (*func_ptr).upvalue_count = frame.upvalues.len();
            (*func_ptr).name = frame.name;
            (*func_ptr).chunk = frame.chunk;
        }
        (func_ptr, frame.upvalues)
    }

    fn begin_scope(&mut self) {
        self.current_frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_frame_mut().scope_depth -= 1;
        let depth = self.current_frame().scope_depth;
        loop {
            let should_pop = match self.current_frame().locals.last() {
                Some(l) => l.depth > depth,
                None => false,
            };
            if !should_pop {
                break;
            }
            let captured = self.current_frame().locals.last().unwrap().is_captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current_frame_mut().locals.pop();
        }
    }

    // ---- name resolution -------------------------------------------------

    fn resolve_local(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        let count = self.frames[frame_idx].locals.len();
        for i in (0..count).rev() {
            if self.frames[frame_idx].locals[i].name == name {
                let depth = self.frames[frame_idx].locals[i].depth;
                if depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &'a str) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        let enclosing = frame_idx - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(frame_idx, local, true));
        }
        if let Some(up) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame_idx, up, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> u8 {
        let count = self.frames[frame_idx].upvalues.len();
        for i in 0..count {
            let uv = self.frames[frame_idx].upvalues[i];
            if uv.index == index && uv.is_local == is_local {
                return i as u8;
            }
        }
        if count >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.frames[frame_idx].upvalues.push(UpvalueInfo { index, is_local });
        count as u8
    }

    fn declare_variable(&mut self, name: &'a str) {
        if self.current_frame().scope_depth == 0 {
            return;
        }
        let depth = self.current_frame().scope_depth;
        let count = self.current_frame().locals.len();
        for i in (0..count).rev() {
            let local_depth = self.current_frame().locals[i].depth;
            if local_depth != -1 && local_depth < depth {
                break;
            }
            if self.current_frame().locals[i].name == name {
                self.error("Already a variable with this name in this scope.");
            }
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'a str) {
        if self.current_frame().locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_frame_mut().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn parse_variable(&mut self, msg: &'static str) -> Option<u16> {
        self.consume(TokenKind::Identifier, msg);
        let name = self.previous.lexeme;
        self.declare_variable(name);
        if self.current_frame().scope_depth > 0 {
            return None;
        }
        Some(self.globals.ensure_index(self.heap, name) as u16)
    }

    fn mark_initialized(&mut self) {
        if self.current_frame().scope_depth == 0 {
            return;
        }
        let depth = self.current_frame().scope_depth;
        let last = self.current_frame().locals.len() - 1;
        self.current_frame_mut().locals[last].depth = depth;
    }

    fn define_variable(&mut self, global: Option<u16>) {
        match global {
            Some(idx) => {
                self.emit_op(OpCode::DefineGlobal);
                self.emit_u16(idx);
            }
            None => self.mark_initialized(),
        }
    }

    fn named_variable(&mut self, name: &'a str, can_assign: bool) {
        let frame_idx = self.frames.len() - 1;
        if let Some(slot) = self.resolve_local(frame_idx, name) {
            if slot == 0 && name == "this" {
                self.emit_op(OpCode::GetThis);
                return;
            }
            if can_assign && self.match_token(TokenKind::Equal) {
                self.expression();
                self.emit_op(OpCode::SetLocal);
                self.emit_operand_byte(slot);
            } else {
                self.emit_op(OpCode::GetLocal);
                self.emit_operand_byte(slot);
            }
        } else if let Some(slot) = self.resolve_upvalue(frame_idx, name) {
            if can_assign && self.match_token(TokenKind::Equal) {
                self.expression();
                self.emit_op(OpCode::SetUpvalue);
                self.emit_operand_byte(slot);
            } else {
                self.emit_op(OpCode::GetUpvalue);
                self.emit_operand_byte(slot);
            }
        } else {
            let idx = self.globals.ensure_index(self.heap, name) as u16;
            if can_assign && self.match_token(TokenKind::Equal) {
                self.expression();
                self.emit_op(OpCode::SetGlobal);
                self.emit_u16(idx);
            } else {
                self.emit_op(OpCode::GetGlobal);
                self.emit_u16(idx);
            }
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u16 {
        if let Some(&idx) = self.current_frame().string_constants.get(name) {
            return idx;
        }
        let ptr = self.heap.intern(name);
        let idx = self.current_chunk_mut().add_constant(Value::object(ptr as *mut ObjHeader));
        if idx > u16::MAX as usize {
            self.error("Too many constants in one chunk.");
        }
        let idx16 = idx as u16;
        self.current_frame_mut().string_constants.insert(name.to_string(), idx16);
        idx16
    }

    // ---- bytecode emission -----------------------------------------------

    fn track(&mut self, op: OpCode) {
        let su = lox_core::slot_usage(op);
        let frame = self.current_frame_mut();
        let before = frame.height;
        frame.height += su.delta;
        let transient = before + su.peak.max(0);
        frame.peak = frame.peak.max(frame.height).max(transient);
    }

    fn track_call(&mut self, arg_count: i32) {
        let frame = self.current_frame_mut();
        frame.peak = frame.peak.max(frame.height);
        frame.height -= arg_count;
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.current_chunk_mut().write(op as u8, line);
        self.track(op);
        self.current_frame_mut().last_push = match op {
            OpCode::ConstantZero | OpCode::ConstantOne | OpCode::ConstantTwo => Some(op),
            _ => None,
        };
    }

    fn emit_operand_byte(&mut self, b: u8) {
        let line = self.previous.line;
        self.current_chunk_mut().write(b, line);
    }

    fn emit_u16(&mut self, v: u16) {
        self.emit_operand_byte((v & 0xff) as u8);
        self.emit_operand_byte((v >> 8) as u8);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_operand_byte(0xff);
        self.emit_operand_byte(0xff);
        self.current_chunk_mut().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let chunk = self.current_chunk_mut();
        let jump = chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        let chunk = self.current_chunk_mut();
        chunk.code[offset] = (jump & 0xff) as u8;
        chunk.code[offset + 1] = (jump >> 8) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk_mut().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_operand_byte((offset & 0xff) as u8);
        self.emit_operand_byte((offset >> 8) as u8);
    }

    fn emit_return(&mut self) {
        if self.current_frame().function_type == FunctionType::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_operand_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.current_chunk_mut().add_constant(value);
        if idx > u16::MAX as usize {
            self.error("Too many constants in one chunk.");
        }
        self.emit_op(OpCode::Constant);
        self.emit_u16(idx as u16);
    }

    fn emit_number(&mut self, value: f64) {
        if value.fract() == 0.0 && (-1.0..=5.0).contains(&value) {
            let op = match value as i64 {
                -1 => OpCode::ConstantNegativeOne,
                0 => OpCode::ConstantZero,
                1 => OpCode::ConstantOne,
                2 => OpCode::ConstantTwo,
                3 => OpCode::ConstantThree,
                4 => OpCode::ConstantFour,
                5 => OpCode::ConstantFive,
                _ => unreachable!(),
            };
            self.emit_op(op);
            return;
        }
        self.emit_constant(Value::number(value));
    }

    /// Collapses an immediately-preceding small-constant push into a single
    /// fused opcode where one of the five known patterns applies.
    fn emit_binary(&mut self, op: OpCode) {
        let prev = self.current_frame().last_push;
        let fused = match (prev, op) {
            (Some(OpCode::ConstantOne), OpCode::Add) => Some(OpCode::AddOne),
            (Some(OpCode::ConstantOne), OpCode::Subtract) => Some(OpCode::SubtractOne),
            (Some(OpCode::ConstantTwo), OpCode::Multiply) => Some(OpCode::MultiplyTwo),
            (Some(OpCode::ConstantZero), OpCode::Equal) => Some(OpCode::EqualZero),
            _ => None,
        };
        if let Some(fused_op) = fused {
            self.current_chunk_mut().amend(1);
            self.current_frame_mut().height -= 1;
            self.emit_op(fused_op);
            return;
        }
        self.emit_op(op);
    }

    fn emit_negate(&mut self) {
        if self.current_frame().last_push == Some(OpCode::ConstantOne) {
            self.current_chunk_mut().amend(1);
            self.current_frame_mut().height -= 1;
            self.emit_op(OpCode::ConstantNegativeOne);
            return;
        }
        self.emit_op(OpCode::Negate);
    }

    fn emit_get_global(&mut self, name: &str) {
        let idx = self.globals.ensure_index(self.heap, name) as u16;
        self.emit_op(OpCode::GetGlobal);
        self.emit_u16(idx);
    }

    // ---- expressions -------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, prec: Precedence) {
        self.advance();
        let can_assign = prec <= Precedence::Assignment;
        if !self.parse_prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        while prec <= get_precedence(self.current.kind) {
            self.advance();
            self.parse_infix(self.previous.kind, can_assign);
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn parse_prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        use TokenKind::*;
        match kind {
            LeftParen => self.grouping(),
            Minus | Bang => self.unary(),
            Number => self.number(),
            String => self.string_literal(),
            Interpolate => self.interpolation(),
            True | False | Nil => self.literal(),
            Identifier => self.variable(can_assign),
            This => self.this_(),
            Super => self.super_(),
            _ => return false,
        }
        true
    }

    fn parse_infix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        use TokenKind::*;
        match kind {
            Plus | Minus | Star | Slash | EqualEqual | BangEqual | Less | LessEqual | Greater
            | GreaterEqual => self.binary(),
            And => self.and_(),
            Or => self.or_(),
            LeftParen => self.call(),
            Dot => self.dot(can_assign),
            Question => self.conditional(),
            _ => return false,
        }
        true
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_negate(),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(get_precedence(op_kind).higher());
        match op_kind {
            TokenKind::BangEqual => self.emit_op(OpCode::NotEqual),
            TokenKind::EqualEqual => self.emit_binary(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_op(OpCode::GreaterEqual),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_op(OpCode::LessEqual),
            TokenKind::Plus => self.emit_binary(OpCode::Add),
            TokenKind::Minus => self.emit_binary(OpCode::Subtract),
            TokenKind::Star => self.emit_binary(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!(),
        }
    }

    fn and_(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn conditional(&mut self) {
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Assignment);
        self.consume(TokenKind::Colon, "Expect ':' after then branch of conditional expression.");
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Conditional);
        self.patch_jump(else_jump);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_operand_byte(arg_count);
        self.track_call(arg_count as i32);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_u16(name_const);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_u16(name_const);
            self.emit_operand_byte(arg_count);
            self.track_call(arg_count as i32);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_u16(name_const);
        }
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_number(value);
    }

    fn string_literal(&mut self) {
        let lex = self.previous.lexeme;
        let text = &lex[1..lex.len() - 1];
        let ptr = self.heap.intern(text);
        self.emit_constant(Value::object(ptr as *mut ObjHeader));
    }

    fn interpolation(&mut self) {
        let lex = self.previous.lexeme;
        let head = &lex[1..lex.len() - 2];
        let head_ptr = self.heap.intern(head);
        self.emit_constant(Value::object(head_ptr as *mut ObjHeader));
        loop {
            self.emit_str_call_for_expression();
            self.emit_op(OpCode::Add);
            if self.match_token(TokenKind::Interpolate) {
                let lex2 = self.previous.lexeme;
                let mid = &lex2[..lex2.len() - 2];
                let mid_ptr = self.heap.intern(mid);
                self.emit_constant(Value::object(mid_ptr as *mut ObjHeader));
                self.emit_op(OpCode::Add);
                continue;
            }
            self.consume(TokenKind::String, "Expect string after expression interpolation.");
            let lex3 = self.previous.lexeme;
            let tail = &lex3[..lex3.len() - 1];
            let tail_ptr = self.heap.intern(tail);
            self.emit_constant(Value::object(tail_ptr as *mut ObjHeader));
            self.emit_op(OpCode::Add);
            break;
        }
    }

    fn emit_str_call_for_expression(&mut self) {
        self.emit_get_global("str");
        self.expression();
        self.emit_op(OpCode::Call);
        self.emit_operand_byte(1);
        self.track_call(1);
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn this_(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name);
        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_u16(name_const);
            self.emit_operand_byte(arg_count);
            self.track_call(arg_count as i32);
        } else {
            self.named_variable("super", false);
            self.emit_op(OpCode::GetSuper);
            self.emit_u16(name_const);
        }
    }

    // ---- statements -------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk_mut().code.len();
        let depth = self.current_frame().scope_depth;
        self.current_frame_mut().loops.push(LoopCtx { start: loop_start, scope_depth: depth });
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.current_frame_mut().loops.pop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk_mut().code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk_mut().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let depth = self.current_frame().scope_depth;
        self.current_frame_mut().loops.push(LoopCtx { start: loop_start, scope_depth: depth });
        self.statement();
        self.emit_loop(loop_start);
        if let Some(ej) = exit_jump {
            self.patch_jump(ej);
            self.emit_op(OpCode::Pop);
        }
        self.current_frame_mut().loops.pop();
        self.end_scope();
    }

    fn continue_statement(&mut self) {
        if self.current_frame().loops.is_empty() {
            self.error("Can't use 'continue' outside of a loop.");
            self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
            return;
        }
        let loop_ctx = *self.current_frame().loops.last().unwrap();
        let count = self.current_frame().locals.len();
        for i in (0..count).rev() {
            let (depth, captured) = {
                let l = &self.current_frame().locals[i];
                (l.depth, l.is_captured)
            };
            if depth <= loop_ctx.scope_depth {
                break;
            }
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
        self.emit_loop(loop_ctx.start);
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
    }

    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after switch value.");
        self.begin_scope();
        self.add_local("");
        self.mark_initialized();
        let disc_slot = (self.current_frame().locals.len() - 1) as u8;
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch body.");

        let mut end_jumps = Vec::new();
        let mut next_case_jump: Option<usize> = None;
        let mut seen_default = false;

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if let Some(j) = next_case_jump.take() {
                self.patch_jump(j);
                self.emit_op(OpCode::Pop);
            }
            if self.match_token(TokenKind::Case) {
                self.emit_op(OpCode::GetLocal);
                self.emit_operand_byte(disc_slot);
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after case value.");
                self.emit_binary(OpCode::Equal);
                next_case_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
                self.emit_op(OpCode::Pop);
                while !self.check(TokenKind::Case)
                    && !self.check(TokenKind::Default)
                    && !self.check(TokenKind::RightBrace)
                    && !self.check(TokenKind::Eof)
                {
                    self.statement();
                }
                end_jumps.push(self.emit_jump(OpCode::Jump));
            } else if self.match_token(TokenKind::Default) {
                if seen_default {
                    self.error("Switch statement can only have one default case.");
                }
                seen_default = true;
                self.consume(TokenKind::Colon, "Expect ':' after 'default'.");
                while !self.check(TokenKind::Case)
                    && !self.check(TokenKind::RightBrace)
                    && !self.check(TokenKind::Eof)
                {
                    self.statement();
                }
            } else {
                self.error_at_current("Expect 'case' or 'default'.");
                break;
            }
        }
        if let Some(j) = next_case_jump {
            self.patch_jump(j);
            self.emit_op(OpCode::Pop);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after switch body.");
        for j in end_jumps {
            self.patch_jump(j);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.current_frame().function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_frame().function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, ftype: FunctionType) {
        let name = self.previous.lexeme;
        self.push_frame(ftype, Some(name));
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = self.current_frame().arity + 1;
                if arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.current_frame_mut().arity = arity;
                self.consume(TokenKind::Identifier, "Expect parameter name.");
                let pname = self.previous.lexeme;
                self.declare_variable(pname);
                self.mark_initialized();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (func_ptr, upvalues) = self.end_compiler();
        let const_idx =
            self.current_chunk_mut().add_constant(Value::object(func_ptr as *mut ObjHeader)) as u16;
        self.emit_op(OpCode::Closure);
        self.emit_u16(const_idx);
        for uv in upvalues {
            self.emit_operand_byte(uv.is_local as u8);
            self.emit_operand_byte(uv.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let const_idx = self.identifier_constant(name);
        let ftype = if name == "init" { FunctionType::Initializer } else { FunctionType::Method };
        self.function(ftype);
        self.emit_op(OpCode::Method);
        self.emit_u16(const_idx);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name_str = self.previous.lexeme;
        self.declare_variable(name_str);
        let global = if self.current_frame().scope_depth > 0 {
            None
        } else {
            Some(self.globals.ensure_index(self.heap, name_str) as u16)
        };
        let name_const = self.identifier_constant(name_str);
        self.emit_op(OpCode::Class);
        self.emit_u16(name_const);
        self.define_variable(global);

        self.classes.push(ClassCtx { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme;
            if super_name == name_str {
                self.error("A class can't inherit from itself.");
            }
            self.named_variable(super_name, false);
            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();
            self.named_variable(name_str, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(name_str, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_compile(src: &str) -> *mut ObjFunction {
        let mut heap = Heap::new();
        let mut globals = Globals::new();
        compile(src, &mut heap, &mut globals).expect("expected a clean compile")
    }

    fn ops_of(func: *mut ObjFunction) -> Vec<OpCode> {
        let chunk = unsafe { &(*func).chunk };
        let mut ops = Vec::new();
        let mut i = 0;
        while i < chunk.code.len() {
            let op = OpCode::from_u8(chunk.code[i]);
            ops.push(op);
            i += operand_len(op);
        }
        ops
    }

    fn operand_len(op: OpCode) -> usize {
        use OpCode::*;
        match op {
            Constant | GetGlobal | DefineGlobal | SetGlobal | GetProperty | SetProperty
            | GetSuper | Jump | JumpIfFalse | Loop | Closure | Class | Method => 3,
            GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call => 2,
            Invoke | SuperInvoke => 4,
            _ => 1,
        }
    }

    #[test]
    fn reports_unexpected_character() {
        let mut heap = Heap::new();
        let mut globals = Globals::new();
        let err = compile("var x = 1 @ 2;", &mut heap, &mut globals).unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn small_integer_literal_uses_dedicated_opcode() {
        let func = ok_compile("var x = 1;");
        assert!(ops_of(func).contains(&OpCode::ConstantOne));
    }

    #[test]
    fn fuses_constant_one_add_into_add_one() {
        let func = ok_compile("var x = 2; x = x + 1;");
        let ops = ops_of(func);
        assert!(ops.contains(&OpCode::AddOne));
        assert!(!ops.contains(&OpCode::Add));
    }

    #[test]
    fn fuses_negated_one_into_constant_negative_one() {
        let func = ok_compile("var x = -1;");
        assert!(ops_of(func).contains(&OpCode::ConstantNegativeOne));
    }

    #[test]
    fn global_reads_and_writes_use_slot_index_opcodes() {
        let func = ok_compile("var x = 1; x = 2; print x;");
        let ops = ops_of(func);
        assert!(ops.contains(&OpCode::DefineGlobal));
        assert!(ops.contains(&OpCode::SetGlobal));
        assert!(ops.contains(&OpCode::GetGlobal));
    }

    #[test]
    fn local_variable_never_touches_globals() {
        let func = ok_compile("{ var x = 1; x = x + 1; print x; }");
        let ops = ops_of(func);
        assert!(!ops.contains(&OpCode::DefineGlobal));
        assert!(ops.contains(&OpCode::GetLocal));
        assert!(ops.contains(&OpCode::SetLocal));
    }

    #[test]
    fn closure_over_outer_local_emits_upvalue_ops() {
        let func = ok_compile(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        );
        let ops = ops_of(func);
        assert!(ops.contains(&OpCode::Closure));
    }

    #[test]
    fn class_with_method_emits_class_and_method_ops() {
        let func = ok_compile("class Foo { bar() { return 1; } }");
        let ops = ops_of(func);
        assert!(ops.contains(&OpCode::Class));
        assert!(ops.contains(&OpCode::Method));
    }

    #[test]
    fn class_inheritance_emits_inherit_and_binds_super_scope() {
        let func = ok_compile(
            "class A { greet() { return 1; } } class B < A { greet() { return super.greet(); } }",
        );
        let ops = ops_of(func);
        assert!(ops.contains(&OpCode::Inherit));
        assert!(ops.contains(&OpCode::SuperInvoke));
    }

    #[test]
    fn this_outside_class_is_a_compile_error() {
        let mut heap = Heap::new();
        let mut globals = Globals::new();
        assert!(compile("print this;", &mut heap, &mut globals).is_err());
    }

    #[test]
    fn continue_inside_while_emits_a_backward_loop() {
        let func = ok_compile("var i = 0; while (i < 5) { i = i + 1; continue; }");
        assert!(ops_of(func).contains(&OpCode::Loop));
    }

    #[test]
    fn continue_outside_loop_is_a_compile_error() {
        let mut heap = Heap::new();
        let mut globals = Globals::new();
        assert!(compile("continue;", &mut heap, &mut globals).is_err());
    }

    #[test]
    fn switch_without_fallthrough_compiles() {
        let func = ok_compile(
            "var x = 1; switch (x) { case 1: print \"one\"; case 2: print \"two\"; default: print \"other\"; }",
        );
        assert!(ops_of(func).contains(&OpCode::EqualZero) || ops_of(func).contains(&OpCode::Equal));
    }

    #[test]
    fn string_interpolation_lowers_to_str_calls_and_concatenation() {
        let func = ok_compile("var x = 1; print \"a${x}b\";");
        let ops = ops_of(func);
        assert!(ops.contains(&OpCode::GetGlobal));
        assert!(ops.contains(&OpCode::Call));
        assert!(ops.contains(&OpCode::Add));
    }

    #[test]
    fn ternary_compiles_to_conditional_jumps() {
        let func = ok_compile("var x = true ? 1 : 2;");
        let ops = ops_of(func);
        assert!(ops.contains(&OpCode::JumpIfFalse));
        assert!(ops.contains(&OpCode::Jump));
    }

    #[test]
    fn too_many_local_variables_is_a_compile_error() {
        let mut src = String::from("{ ");
        for i in 0..300 {
            src.push_str(&format!("var v{} = {};", i, i));
        }
        src.push_str(" }");
        let mut heap = Heap::new();
        let mut globals = Globals::new();
        assert!(compile(&src, &mut heap, &mut globals).is_err());
    }
}
