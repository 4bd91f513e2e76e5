//! Heap object model.
//!
//! Every heap object begins with an [`ObjHeader`] so that a `*mut ObjHeader`
//! can be reinterpreted as the concrete variant once its tag is known. This
//! mirrors the C reference's `Obj` header-first layout rather than using a
//! Rust enum, because [`crate::value::Value`] stores only a type-erased
//! pointer and the garbage collector must walk a type-erased intrusive list.

use std::cell::Cell;

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ObjType {
    String,
    Function,
    Closure,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
    Native,
}

#[repr(C)]
pub struct ObjHeader {
    pub tag: ObjType,
    pub marked: Cell<bool>,
    /// Intrusive link to the next object allocated, used only by sweep.
    pub next: Cell<*mut ObjHeader>,
}

impl ObjHeader {
    pub fn new(tag: ObjType) -> ObjHeader {
        ObjHeader {
            tag,
            marked: Cell::new(false),
            next: Cell::new(std::ptr::null_mut()),
        }
    }
}

#[repr(C)]
pub struct ObjString {
    pub header: ObjHeader,
    pub hash: u32,
    pub chars: Box<str>,
}

#[repr(C)]
pub struct ObjFunction {
    pub header: ObjHeader,
    pub arity: u8,
    pub upvalue_count: usize,
    pub name: Option<*mut ObjString>,
    pub chunk: Chunk,
}

/// A native function's heap parameter lets natives such as `str()` intern
/// fresh strings; ones that don't need it (`clock()`) simply ignore it.
pub type NativeFn = fn(&mut crate::heap::Heap, &[Value]) -> Result<Value, String>;

#[repr(C)]
pub struct ObjNative {
    pub header: ObjHeader,
    pub name: &'static str,
    pub arity: u8,
    pub function: NativeFn,
}

#[derive(Clone, Copy)]
pub enum UpvalueState {
    /// Still aliasing a live VM stack slot.
    Open(usize),
    Closed(Value),
}

#[repr(C)]
pub struct ObjUpvalue {
    pub header: ObjHeader,
    pub state: Cell<UpvalueState>,
}

#[repr(C)]
pub struct ObjClosure {
    pub header: ObjHeader,
    pub function: *mut ObjFunction,
    pub upvalues: Vec<*mut ObjUpvalue>,
}

#[repr(C)]
pub struct ObjClass {
    pub header: ObjHeader,
    pub name: *mut ObjString,
    pub methods: Table,
}

#[repr(C)]
pub struct ObjInstance {
    pub header: ObjHeader,
    pub class: *mut ObjClass,
    pub fields: Table,
}

#[repr(C)]
pub struct ObjBoundMethod {
    pub header: ObjHeader,
    pub receiver: Value,
    pub method: *mut ObjClosure,
}

/// # Safety
/// Caller must ensure `ptr` was produced by the matching `Obj*` constructor
/// and has not been freed by a sweep.
pub unsafe fn header_of<T>(ptr: *mut T) -> *mut ObjHeader {
    ptr as *mut ObjHeader
}

impl ObjString {
    /// FNV-1a, matching the reference hash function byte for byte.
    pub fn hash_bytes(bytes: &[u8]) -> u32 {
        let mut hash: u32 = 2166136261;
        for &b in bytes {
            hash ^= b as u32;
            hash = hash.wrapping_mul(16777619);
        }
        hash
    }
}

pub fn obj_to_string(header: *mut ObjHeader) -> String {
    unsafe {
        match (*header).tag {
            ObjType::String => {
                let s = header as *mut ObjString;
                (*s).chars.to_string()
            }
            ObjType::Function => {
                let f = header as *mut ObjFunction;
                match (*f).name {
                    Some(name) => format!("<fn {}>", (*name).chars),
                    None => "<script>".to_string(),
                }
            }
            ObjType::Closure => {
                let c = header as *mut ObjClosure;
                obj_to_string((*c).function as *mut ObjHeader)
            }
            ObjType::Upvalue => "upvalue".to_string(),
            ObjType::Class => {
                let c = header as *mut ObjClass;
                (*(*c).name).chars.to_string()
            }
            ObjType::Instance => {
                let i = header as *mut ObjInstance;
                format!("{} instance", (*(*(*i).class).name).chars)
            }
            ObjType::BoundMethod => {
                let b = header as *mut ObjBoundMethod;
                obj_to_string((*b).method as *mut ObjHeader)
            }
            ObjType::Native => "<native fn>".to_string(),
        }
    }
}
