//! Built-in native functions exposed in the global namespace at startup.

use std::sync::OnceLock;
use std::time::Instant;

use lox_core::{Heap, ObjHeader, Value};

use crate::vm::stringify;

static START: OnceLock<Instant> = OnceLock::new();

/// Seconds elapsed since the process started. Used for crude timing in
/// scripts, not wall-clock time-of-day.
pub fn clock(_heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    if !args.is_empty() {
        return Err(format!("clock() takes no arguments but got {}.", args.len()));
    }
    let start = START.get_or_init(Instant::now);
    Ok(Value::number(start.elapsed().as_secs_f64()))
}

/// Converts any value to its string form, interning the result. This is the
/// native that `ADD`'s string-coercion path and interpolated expressions
/// both lower to.
pub fn str_native(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    if args.len() != 1 {
        return Err(format!("str() takes exactly one argument but got {}.", args.len()));
    }
    let text = stringify(args[0]);
    let ptr = heap.intern(&text);
    Ok(Value::object(ptr as *mut ObjHeader))
}
