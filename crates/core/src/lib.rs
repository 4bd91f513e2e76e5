pub mod chunk;
pub mod globals;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{slot_usage, Chunk, OpCode, SlotUsage};
pub use globals::Globals;
pub use heap::Heap;
pub use object::{
    obj_to_string, NativeFn, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjHeader,
    ObjInstance, ObjNative, ObjString, ObjType, ObjUpvalue, UpvalueState,
};
pub use table::Table;
pub use value::Value;

/// Maximum call-frame depth before a runtime "Stack overflow." error.
pub const MAX_FRAMES: usize = 1000;
/// Maximum locals (and, separately, upvalues) in a single function.
pub const MAX_LOCALS: usize = 256;
