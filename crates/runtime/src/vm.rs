//! The bytecode interpreter: call stack, operand stack, and dispatch loop.

use std::io::{self, Write};

use lox_core::{
    Globals, Heap, NativeFn, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjHeader,
    ObjInstance, ObjNative, ObjString, ObjType, ObjUpvalue, OpCode, UpvalueState, Value,
    MAX_FRAMES,
};

use crate::error::{InterpretError, InterpretResult, VmError};
use crate::native;

struct CallFrame {
    closure: *mut ObjClosure,
    function: *mut ObjFunction,
    ip: usize,
    /// Index into the VM's value stack of this frame's slot 0.
    slot_base: usize,
}

/// Owns the heap, globals, and the live call/value stacks for one program
/// run. There is no process-wide singleton; every script gets its own `Vm`.
///
/// `print` is routed through `W` rather than written to stdout directly, so
/// tests can capture output in a `Vec<u8>` instead of asserting against the
/// process's real stdout.
pub struct Vm<W: Write = io::Stdout> {
    heap: Heap,
    globals: Globals,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Vec<*mut ObjUpvalue>,
    out: W,
    trace: bool,
}

impl Vm<io::Stdout> {
    pub fn new() -> Vm<io::Stdout> {
        Vm::with_writer(io::stdout())
    }
}

impl Vm<Vec<u8>> {
    /// Drains everything written so far by `print`, for tests that capture
    /// output instead of asserting against process stdout.
    pub fn take_output(&mut self) -> String {
        String::from_utf8(std::mem::take(&mut self.out)).expect("vm output was not valid utf-8")
    }
}

impl<W: Write> Vm<W> {
    pub fn with_writer(out: W) -> Vm<W> {
        let heap = Heap::new();
        let globals = Globals::new();
        let mut vm = Vm {
            heap,
            globals,
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            out,
            trace: false,
        };
        vm.define_native("clock", 0, native::clock);
        vm.define_native("str", 1, native::str_native);
        vm
    }

    /// Enables the `--trace` instrumentation: before each instruction, the
    /// current operand stack is printed to stderr.
    pub fn set_trace(&mut self, enabled: bool) {
        self.trace = enabled;
    }

    fn define_native(&mut self, name: &'static str, arity: u8, function: NativeFn) {
        let native_ptr = self.heap.alloc_native(name, arity, function);
        let idx = self.globals.ensure_index(&mut self.heap, name);
        self.globals.set(idx, Value::object(native_ptr as *mut ObjHeader));
    }

    /// Compiles and runs `source`. Globals persist across calls on the same
    /// `Vm` (a REPL keeps reusing one instance); the value and call stacks
    /// are reset at the start of every call.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        let function = lox_compiler::compile(source, &mut self.heap, &mut self.globals)
            .map_err(InterpretError::Compile)?;
        let closure = self.heap.alloc_closure(function, Vec::new());
        self.push(Value::object(closure as *mut ObjHeader));
        self.call(closure, 0).map_err(InterpretError::Runtime)?;
        self.run().map_err(InterpretError::Runtime)
    }

    // ---- stack plumbing --------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = unsafe { (*frame.function).chunk.code[frame.ip] };
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let lo = self.read_byte() as u16;
        let hi = self.read_byte() as u16;
        lo | (hi << 8)
    }

    fn read_constant(&self, idx: u16) -> Value {
        let frame = self.frame();
        unsafe { (*frame.function).chunk.constants[idx as usize] }
    }

    // ---- calling convention ----------------------------------------------

    fn call(&mut self, closure: *mut ObjClosure, arg_count: u8) -> Result<(), VmError> {
        let function = unsafe { (*closure).function };
        let arity = unsafe { (*function).arity };
        if arg_count != arity {
            return Err(self.runtime_error(format!(
                "Expected {arity} arguments but got {arg_count}."
            )));
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        let slot_base = self.stack.len() - arg_count as usize - 1;
        // Capacity only: locals are pushed as their declarations execute, so
        // growing `len()` here would leave NIL padding above the params that
        // later `GetLocal`/`capture_upvalue` slot math would read right through.
        self.stack.reserve(unsafe { (*function).chunk.slots });
        self.frames.push(CallFrame { closure, function, ip: 0, slot_base });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), VmError> {
        if !callee.is_object() {
            return Err(self.runtime_error("Can only call functions and classes.".to_string()));
        }
        let header = callee.as_object();
        match unsafe { (*header).tag } {
            ObjType::Closure => self.call(header as *mut ObjClosure, arg_count),
            ObjType::Native => self.call_native(header as *mut ObjNative, arg_count),
            ObjType::Class => self.call_class(header as *mut ObjClass, arg_count),
            ObjType::BoundMethod => {
                let bound = header as *mut ObjBoundMethod;
                let base = self.stack.len() - arg_count as usize - 1;
                self.stack[base] = unsafe { (*bound).receiver };
                self.call(unsafe { (*bound).method }, arg_count)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.".to_string())),
        }
    }

    fn call_native(&mut self, native: *mut ObjNative, arg_count: u8) -> Result<(), VmError> {
        let arity = unsafe { (*native).arity };
        if arg_count != arity {
            return Err(self.runtime_error(format!(
                "Expected {arity} arguments but got {arg_count}."
            )));
        }
        let base = self.stack.len() - arg_count as usize;
        let args: Vec<Value> = self.stack[base..].to_vec();
        let function = unsafe { (*native).function };
        match function(&mut self.heap, &args) {
            Ok(result) => {
                self.stack.truncate(base - 1);
                self.push(result);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    fn call_class(&mut self, class: *mut ObjClass, arg_count: u8) -> Result<(), VmError> {
        let instance = self.heap.alloc_instance(class);
        let base = self.stack.len() - arg_count as usize - 1;
        self.stack[base] = Value::object(instance as *mut ObjHeader);
        let init_key = self.intern_value("init");
        if let Some(initializer) = unsafe { (*class).methods.get(init_key) } {
            let closure = initializer.as_object() as *mut ObjClosure;
            self.call(closure, arg_count)
        } else if arg_count != 0 {
            Err(self.runtime_error(format!("Expected 0 arguments but got {arg_count}.")))
        } else {
            Ok(())
        }
    }

    fn intern_value(&mut self, s: &str) -> Value {
        Value::object(self.heap.intern(s) as *mut ObjHeader)
    }

    fn invoke(&mut self, name_idx: u16, arg_count: u8) -> Result<(), VmError> {
        let name_val = self.read_constant(name_idx);
        let name = name_val.as_object() as *mut ObjString;
        let receiver = self.peek(arg_count as usize);
        if !receiver.is_object() || unsafe { (*receiver.as_object()).tag } != ObjType::Instance {
            return Err(self.runtime_error("Only instances have methods.".to_string()));
        }
        let instance = receiver.as_object() as *mut ObjInstance;
        if let Some(field) = unsafe { (*instance).fields.get(name_val) } {
            let base = self.stack.len() - arg_count as usize - 1;
            self.stack[base] = field;
            return self.call_value(field, arg_count);
        }
        let class = unsafe { (*instance).class };
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: *mut ObjClass,
        name: *mut ObjString,
        arg_count: u8,
    ) -> Result<(), VmError> {
        let key = Value::object(name as *mut ObjHeader);
        match unsafe { (*class).methods.get(key) } {
            Some(method) => self.call(method.as_object() as *mut ObjClosure, arg_count),
            None => {
                let name_str = unsafe { (*name).chars.to_string() };
                Err(self.runtime_error(format!("Undefined property '{name_str}'.")))
            }
        }
    }

    fn bind_method(&mut self, class: *mut ObjClass, name: *mut ObjString) -> Result<(), VmError> {
        let key = Value::object(name as *mut ObjHeader);
        let method_val = match unsafe { (*class).methods.get(key) } {
            Some(v) => v,
            None => {
                let name_str = unsafe { (*name).chars.to_string() };
                return Err(self.runtime_error(format!("Undefined property '{name_str}'.")));
            }
        };
        let closure = method_val.as_object() as *mut ObjClosure;
        let receiver = self.peek(0);
        let bound = self.heap.alloc_bound_method(receiver, closure);
        self.pop();
        self.push(Value::object(bound as *mut ObjHeader));
        Ok(())
    }

    // ---- upvalues ----------------------------------------------------------

    fn capture_upvalue(&mut self, slot: usize) -> *mut ObjUpvalue {
        for &uv in &self.open_upvalues {
            if let UpvalueState::Open(existing) = unsafe { (*uv).state.get() } {
                if existing == slot {
                    return uv;
                }
            }
        }
        let uv = self.heap.alloc_upvalue(slot);
        self.open_upvalues.push(uv);
        uv
    }

    fn close_upvalues(&mut self, from_slot: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|&uv| match unsafe { (*uv).state.get() } {
            UpvalueState::Open(slot) if slot >= from_slot => {
                let value = stack[slot];
                unsafe { (*uv).state.set(UpvalueState::Closed(value)) };
                false
            }
            UpvalueState::Open(_) => true,
            UpvalueState::Closed(_) => false,
        });
    }

    fn read_upvalue(&self, uv: *mut ObjUpvalue) -> Value {
        match unsafe { (*uv).state.get() } {
            UpvalueState::Open(slot) => self.stack[slot],
            UpvalueState::Closed(value) => value,
        }
    }

    fn write_upvalue(&mut self, uv: *mut ObjUpvalue, value: Value) {
        match unsafe { (*uv).state.get() } {
            UpvalueState::Open(slot) => self.stack[slot] = value,
            UpvalueState::Closed(_) => unsafe { (*uv).state.set(UpvalueState::Closed(value)) },
        }
    }

    // ---- arithmetic --------------------------------------------------------

    fn add_values(&mut self, a: Value, b: Value) -> Result<Value, VmError> {
        if a.is_number() && b.is_number() {
            return Ok(Value::number(a.as_number() + b.as_number()));
        }
        if is_string(a) || is_string(b) {
            let combined = format!("{}{}", stringify(a), stringify(b));
            let ptr = self.heap.intern(&combined);
            return Ok(Value::object(ptr as *mut ObjHeader));
        }
        Err(self.runtime_error("Operands must be two numbers or one operand must be a string.".to_string()))
    }

    fn binary_numeric(&mut self, f: impl Fn(f64, f64) -> Value) -> Result<(), VmError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if !a.is_number() || !b.is_number() {
            return Err(self.runtime_error("Operands must be numbers.".to_string()));
        }
        let b = self.pop();
        let a = self.pop();
        self.push(f(a.as_number(), b.as_number()));
        Ok(())
    }

    // ---- garbage collection -------------------------------------------------

    fn collect_garbage(&mut self) {
        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure as *mut ObjHeader);
        }
        for &uv in &self.open_upvalues {
            self.heap.mark_object(uv as *mut ObjHeader);
        }
        self.globals.mark(&mut self.heap);
        self.heap.trace();
        self.heap.finish_collect();
    }

    // ---- errors ------------------------------------------------------------

    fn runtime_error(&self, message: String) -> VmError {
        let line = self
            .frames
            .last()
            .map(|f| unsafe { (*f.function).chunk.get_line(f.ip.saturating_sub(1)) })
            .unwrap_or(0);
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let frame_line = unsafe { (*frame.function).chunk.get_line(frame.ip.saturating_sub(1)) };
            let name = unsafe {
                match (*frame.function).name {
                    Some(n) => format!("{}()", (*n).chars),
                    None => "script".to_string(),
                }
            };
            trace.push(format!("[line {frame_line}] in {name}"));
        }
        VmError { message, line, trace }
    }

    // ---- dispatch loop -------------------------------------------------------

    fn run(&mut self) -> Result<(), VmError> {
        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }
            if self.trace {
                let rendered: Vec<String> = self.stack.iter().map(|&v| stringify(v)).collect();
                eprintln!("          [ {} ]", rendered.join(", "));
            }
            let instruction = OpCode::from_u8(self.read_byte());
            match instruction {
                OpCode::Constant => {
                    let idx = self.read_u16();
                    let v = self.read_constant(idx);
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::NIL),
                OpCode::True => self.push(Value::TRUE),
                OpCode::False => self.push(Value::FALSE),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slot_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slot_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetThis => {
                    let base = self.frame().slot_base;
                    self.push(self.stack[base]);
                }
                OpCode::GetGlobal => {
                    let idx = self.read_u16() as usize;
                    if !self.globals.is_defined(idx) {
                        return Err(self.runtime_error("Undefined variable.".to_string()));
                    }
                    self.push(self.globals.get(idx));
                }
                OpCode::DefineGlobal => {
                    let idx = self.read_u16() as usize;
                    let v = self.pop();
                    self.globals.set(idx, v);
                }
                OpCode::SetGlobal => {
                    let idx = self.read_u16() as usize;
                    if !self.globals.is_defined(idx) {
                        return Err(self.runtime_error("Undefined variable.".to_string()));
                    }
                    self.globals.set(idx, self.peek(0));
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let uv = unsafe { (*self.frame().closure).upvalues[slot] };
                    self.push(self.read_upvalue(uv));
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let uv = unsafe { (*self.frame().closure).upvalues[slot] };
                    let v = self.peek(0);
                    self.write_upvalue(uv, v);
                }
                OpCode::GetProperty => {
                    let idx = self.read_u16();
                    let name_val = self.read_constant(idx);
                    let name = name_val.as_object() as *mut ObjString;
                    let receiver = self.peek(0);
                    if !receiver.is_object()
                        || unsafe { (*receiver.as_object()).tag } != ObjType::Instance
                    {
                        return Err(
                            self.runtime_error("Only instances have properties.".to_string())
                        );
                    }
                    let instance = receiver.as_object() as *mut ObjInstance;
                    let field = unsafe { (*instance).fields.get(name_val) };
                    match field {
                        Some(v) => {
                            self.pop();
                            self.push(v);
                        }
                        None => {
                            let class = unsafe { (*instance).class };
                            self.bind_method(class, name)?;
                        }
                    }
                }
                OpCode::SetProperty => {
                    let idx = self.read_u16();
                    let name_val = self.read_constant(idx);
                    let receiver = self.peek(1);
                    if !receiver.is_object()
                        || unsafe { (*receiver.as_object()).tag } != ObjType::Instance
                    {
                        return Err(self.runtime_error("Only instances have fields.".to_string()));
                    }
                    let instance = receiver.as_object() as *mut ObjInstance;
                    let value = self.peek(0);
                    unsafe { (*instance).fields.set(name_val, value) };
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let idx = self.read_u16();
                    let name_val = self.read_constant(idx);
                    let name = name_val.as_object() as *mut ObjString;
                    let superclass_val = self.pop();
                    let superclass = superclass_val.as_object() as *mut ObjClass;
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a == b));
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a != b));
                }
                OpCode::Greater => self.binary_numeric(|a, b| Value::bool(a > b))?,
                OpCode::GreaterEqual => self.binary_numeric(|a, b| Value::bool(a >= b))?,
                OpCode::Less => self.binary_numeric(|a, b| Value::bool(a < b))?,
                OpCode::LessEqual => self.binary_numeric(|a, b| Value::bool(a <= b))?,
                OpCode::Add => {
                    let b = self.pop();
                    let a = self.pop();
                    let result = self.add_values(a, b)?;
                    self.push(result);
                }
                OpCode::Subtract => self.binary_numeric(|a, b| Value::number(a - b))?,
                OpCode::Multiply => self.binary_numeric(|a, b| Value::number(a * b))?,
                OpCode::Divide => self.binary_numeric(|a, b| Value::number(a / b))?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        return Err(self.runtime_error("Operand must be a number.".to_string()));
                    }
                    let v = self.pop();
                    self.push(Value::number(-v.as_number()));
                }
                OpCode::ConstantNegativeOne => self.push(Value::number(-1.0)),
                OpCode::ConstantZero => self.push(Value::number(0.0)),
                OpCode::ConstantOne => self.push(Value::number(1.0)),
                OpCode::ConstantTwo => self.push(Value::number(2.0)),
                OpCode::ConstantThree => self.push(Value::number(3.0)),
                OpCode::ConstantFour => self.push(Value::number(4.0)),
                OpCode::ConstantFive => self.push(Value::number(5.0)),
                OpCode::AddOne => {
                    let a = self.pop();
                    let result = self.add_values(a, Value::number(1.0))?;
                    self.push(result);
                }
                OpCode::SubtractOne => {
                    let a = self.pop();
                    if !a.is_number() {
                        return Err(self.runtime_error("Operand must be a number.".to_string()));
                    }
                    self.push(Value::number(a.as_number() - 1.0));
                }
                OpCode::MultiplyTwo => {
                    let a = self.pop();
                    if !a.is_number() {
                        return Err(self.runtime_error("Operand must be a number.".to_string()));
                    }
                    self.push(Value::number(a.as_number() * 2.0));
                }
                OpCode::EqualZero => {
                    let a = self.pop();
                    self.push(Value::bool(a == Value::number(0.0)));
                }
                OpCode::Print => {
                    let v = self.pop();
                    let _ = writeln!(self.out, "{}", stringify(v));
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frame_mut().ip -= offset as usize;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name_idx = self.read_u16();
                    let arg_count = self.read_byte();
                    self.invoke(name_idx, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name_idx = self.read_u16();
                    let arg_count = self.read_byte();
                    let superclass_val = self.pop();
                    let superclass = superclass_val.as_object() as *mut ObjClass;
                    let name_val = self.read_constant(name_idx);
                    let name = name_val.as_object() as *mut ObjString;
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    let idx = self.read_u16();
                    let func_val = self.read_constant(idx);
                    let function = func_val.as_object() as *mut ObjFunction;
                    let upvalue_count = unsafe { (*function).upvalue_count };
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte();
                        if is_local {
                            let base = self.frame().slot_base;
                            upvalues.push(self.capture_upvalue(base + index as usize));
                        } else {
                            let closure = self.frame().closure;
                            upvalues.push(unsafe { (*closure).upvalues[index as usize] });
                        }
                    }
                    let closure = self.heap.alloc_closure(function, upvalues);
                    self.push(Value::object(closure as *mut ObjHeader));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("return with no active frame");
                    self.close_upvalues(frame.slot_base);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slot_base);
                    self.push(result);
                }
                OpCode::Class => {
                    let idx = self.read_u16();
                    let name_val = self.read_constant(idx);
                    let name = name_val.as_object() as *mut ObjString;
                    let class = self.heap.alloc_class(name);
                    self.push(Value::object(class as *mut ObjHeader));
                }
                OpCode::Inherit => {
                    let subclass_val = self.pop();
                    let superclass_val = self.peek(0);
                    if !superclass_val.is_object()
                        || unsafe { (*superclass_val.as_object()).tag } != ObjType::Class
                    {
                        return Err(self.runtime_error("Superclass must be a class.".to_string()));
                    }
                    let superclass = superclass_val.as_object() as *mut ObjClass;
                    let subclass = subclass_val.as_object() as *mut ObjClass;
                    unsafe {
                        let super_methods = &(*superclass).methods;
                        (*subclass).methods.add_all(super_methods);
                    }
                }
                OpCode::Method => {
                    let idx = self.read_u16();
                    let name_val = self.read_constant(idx);
                    let method_val = self.peek(0);
                    let class_val = self.peek(1);
                    let class = class_val.as_object() as *mut ObjClass;
                    unsafe { (*class).methods.set(name_val, method_val) };
                    self.pop();
                }
            }
        }
    }
}

impl Default for Vm<io::Stdout> {
    fn default() -> Vm<io::Stdout> {
        Vm::new()
    }
}

fn is_string(v: Value) -> bool {
    v.is_object() && unsafe { (*v.as_object()).tag } == ObjType::String
}

/// Renders a value the way `print` and string coercion do.
pub fn stringify(v: Value) -> String {
    if v.is_nil() {
        return "nil".to_string();
    }
    if v.is_bool() {
        return if v.as_bool() { "true".to_string() } else { "false".to_string() };
    }
    if v.is_number() {
        let n = v.as_number();
        if n.fract() == 0.0 && n.is_finite() {
            return format!("{}", n as i64);
        }
        return format!("{n}");
    }
    lox_core::obj_to_string(v.as_object())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(vm: &mut Vm, source: &str) {
        if let Err(e) = vm.interpret(source) {
            panic!("expected a clean run, got: {e}");
        }
    }

    #[test]
    fn arithmetic_and_fused_opcodes_agree() {
        let mut vm = Vm::new();
        run_ok(&mut vm, "var x = 10; x = x + 1; if (x != 11) { print \"bad\"; }");
    }

    #[test]
    fn string_concatenation_and_coercion() {
        let mut vm = Vm::new();
        run_ok(&mut vm, "var s = \"n=\" + 5; if (s != \"n=5\") { print \"bad\"; }");
    }

    #[test]
    fn closures_share_captured_state() {
        let mut vm = Vm::new();
        run_ok(
            &mut vm,
            r#"
            fun counter() {
                var n = 0;
                fun increment() { n = n + 1; return n; }
                return increment;
            }
            var inc = counter();
            if (inc() != 1) { print "bad"; }
            if (inc() != 2) { print "bad"; }
            "#,
        );
    }

    #[test]
    fn classes_methods_and_inheritance() {
        let mut vm = Vm::new();
        run_ok(
            &mut vm,
            r#"
            class Animal {
                init(name) { this.name = name; }
                speak() { return this.name; }
            }
            class Dog < Animal {
                speak() { return super.speak() + " woof"; }
            }
            var d = Dog("Rex");
            if (d.speak() != "Rex woof") { print "bad"; }
            "#,
        );
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("print undefinedThing;").unwrap_err();
        assert!(matches!(err, InterpretError::Runtime(_)));
    }

    #[test]
    fn calling_a_non_callable_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("var x = 1; x();").unwrap_err();
        assert!(matches!(err, InterpretError::Runtime(_)));
    }

    #[test]
    fn compile_error_is_reported_without_running() {
        let mut vm = Vm::new();
        let err = vm.interpret("var x = ;").unwrap_err();
        assert!(matches!(err, InterpretError::Compile(_)));
    }

    #[test]
    fn print_output_is_captured_through_the_injected_writer() {
        let mut vm = Vm::with_writer(Vec::<u8>::new());
        vm.interpret("print 1 + 2;").expect("expected a clean run");
        assert_eq!(vm.take_output(), "3\n");
    }

    #[test]
    fn garbage_collector_can_run_mid_program() {
        let mut vm = Vm::new();
        run_ok(
            &mut vm,
            r#"
            var i = 0;
            while (i < 50) {
                var s = "value" + i;
                i = i + 1;
            }
            "#,
        );
    }
}
