//! The owned allocation + garbage-collection context.
//!
//! There is no process-wide singleton: a `Heap` is created by whoever owns
//! the interpreter (the VM) and freed when it is dropped. This replaces the
//! reference implementation's global `VM vm` plus intrusive `next`-object
//! list with a single owned value, per the re-architecture called for where
//! a global singleton was load-bearing only because C has no ownership.

use std::mem::size_of;

use crate::chunk::Chunk;
use crate::object::{
    ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjHeader, ObjInstance, ObjNative,
    ObjString, ObjType, ObjUpvalue, UpvalueState,
};
use crate::table::Table;
use crate::value::Value;

const INITIAL_NEXT_GC: usize = 1024 * 1024;

pub struct Heap {
    objects: *mut ObjHeader,
    pub strings: Table,
    gray: Vec<*mut ObjHeader>,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            objects: std::ptr::null_mut(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
        }
    }

    fn register<T>(&mut self, boxed: Box<T>) -> *mut T {
        self.bytes_allocated += size_of::<T>();
        let ptr = Box::into_raw(boxed);
        let header = ptr as *mut ObjHeader;
        unsafe {
            (*header).next.set(self.objects);
        }
        self.objects = header;
        ptr
    }

    pub fn should_collect(&self) -> bool {
        if cfg!(feature = "stress_gc") {
            return true;
        }
        self.bytes_allocated > self.next_gc
    }

    /// Interns `s`, returning the canonical string object. Allocates only if
    /// no equal string already lives in the intern table.
    pub fn intern(&mut self, s: &str) -> *mut ObjString {
        let hash = ObjString::hash_bytes(s.as_bytes());
        if let Some(existing) = self.strings.find_string(s, hash) {
            return existing;
        }
        let obj = ObjString { header: ObjHeader::new(ObjType::String), hash, chars: s.into() };
        let ptr = self.register(Box::new(obj));
        // Root the new string on the caller's value stack before this call
        // if a GC could otherwise run between here and the `strings.set`
        // below; table growth here never itself allocates GC objects, so
        // no further rooting is required.
        self.strings.set(Value::object(ptr as *mut ObjHeader), Value::NIL);
        ptr
    }

    pub fn alloc_function(&mut self) -> *mut ObjFunction {
        let obj = ObjFunction {
            header: ObjHeader::new(ObjType::Function),
            arity: 0,
            upvalue_count: 0,
            name: None,
            chunk: Chunk::new(),
        };
        self.register(Box::new(obj))
    }

    pub fn alloc_closure(
        &mut self,
        function: *mut ObjFunction,
        upvalues: Vec<*mut ObjUpvalue>,
    ) -> *mut ObjClosure {
        let obj = ObjClosure { header: ObjHeader::new(ObjType::Closure), function, upvalues };
        self.register(Box::new(obj))
    }

    pub fn alloc_upvalue(&mut self, slot: usize) -> *mut ObjUpvalue {
        let obj = ObjUpvalue {
            header: ObjHeader::new(ObjType::Upvalue),
            state: std::cell::Cell::new(UpvalueState::Open(slot)),
        };
        self.register(Box::new(obj))
    }

    pub fn alloc_class(&mut self, name: *mut ObjString) -> *mut ObjClass {
        let obj = ObjClass { header: ObjHeader::new(ObjType::Class), name, methods: Table::new() };
        self.register(Box::new(obj))
    }

    pub fn alloc_instance(&mut self, class: *mut ObjClass) -> *mut ObjInstance {
        let obj =
            ObjInstance { header: ObjHeader::new(ObjType::Instance), class, fields: Table::new() };
        self.register(Box::new(obj))
    }

    pub fn alloc_bound_method(
        &mut self,
        receiver: Value,
        method: *mut ObjClosure,
    ) -> *mut ObjBoundMethod {
        let obj =
            ObjBoundMethod { header: ObjHeader::new(ObjType::BoundMethod), receiver, method };
        self.register(Box::new(obj))
    }

    pub fn alloc_native(
        &mut self,
        name: &'static str,
        arity: u8,
        function: crate::object::NativeFn,
    ) -> *mut ObjNative {
        let obj = ObjNative { header: ObjHeader::new(ObjType::Native), name, arity, function };
        self.register(Box::new(obj))
    }

    pub fn mark_value(&mut self, v: Value) {
        if v.is_object() {
            self.mark_object(v.as_object());
        }
    }

    pub fn mark_object(&mut self, header: *mut ObjHeader) {
        unsafe {
            if header.is_null() || (*header).marked.get() {
                return;
            }
            (*header).marked.set(true);
            self.gray.push(header);
        }
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (k, v) in table.iter() {
            self.mark_value(k);
            self.mark_value(v);
        }
    }

    /// Drains the gray worklist, blackening each object by marking what it
    /// references. Call after seeding roots with [`Heap::mark_value`] /
    /// [`Heap::mark_object`].
    pub fn trace(&mut self) {
        while let Some(header) = self.gray.pop() {
            self.blacken(header);
        }
    }

    fn blacken(&mut self, header: *mut ObjHeader) {
        unsafe {
            match (*header).tag {
                ObjType::String | ObjType::Native => {}
                ObjType::Function => {
                    let f = header as *mut ObjFunction;
                    if let Some(name) = (*f).name {
                        self.mark_object(name as *mut ObjHeader);
                    }
                    for c in (*f).chunk.constants.clone() {
                        self.mark_value(c);
                    }
                }
                ObjType::Closure => {
                    let c = header as *mut ObjClosure;
                    self.mark_object((*c).function as *mut ObjHeader);
                    for uv in (*c).upvalues.clone() {
                        self.mark_object(uv as *mut ObjHeader);
                    }
                }
                ObjType::Upvalue => {
                    let u = header as *mut ObjUpvalue;
                    if let UpvalueState::Closed(v) = (*u).state.get() {
                        self.mark_value(v);
                    }
                }
                ObjType::Class => {
                    let c = header as *mut ObjClass;
                    self.mark_object((*c).name as *mut ObjHeader);
                    self.mark_table(&(*c).methods);
                }
                ObjType::Instance => {
                    let i = header as *mut ObjInstance;
                    self.mark_object((*i).class as *mut ObjHeader);
                    self.mark_table(&(*i).fields);
                }
                ObjType::BoundMethod => {
                    let b = header as *mut ObjBoundMethod;
                    self.mark_value((*b).receiver);
                    self.mark_object((*b).method as *mut ObjHeader);
                }
            }
        }
    }

    /// Sweeps the intern table of unmarked strings, walks the object list
    /// freeing unmarked objects, and doubles the allocation threshold.
    pub fn finish_collect(&mut self) {
        self.strings.remove_white();
        self.sweep();
        self.next_gc = self.bytes_allocated * 2;
    }

    fn sweep(&mut self) {
        let mut prev: *mut ObjHeader = std::ptr::null_mut();
        let mut current = self.objects;
        while !current.is_null() {
            unsafe {
                let next = (*current).next.get();
                if (*current).marked.get() {
                    (*current).marked.set(false);
                    prev = current;
                    current = next;
                } else {
                    if prev.is_null() {
                        self.objects = next;
                    } else {
                        (*prev).next.set(next);
                    }
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(object_size(current));
                    free_object(current);
                    current = next;
                }
            }
        }
    }
}

fn object_size(header: *mut ObjHeader) -> usize {
    unsafe {
        match (*header).tag {
            ObjType::String => size_of::<ObjString>(),
            ObjType::Function => size_of::<ObjFunction>(),
            ObjType::Closure => size_of::<ObjClosure>(),
            ObjType::Upvalue => size_of::<ObjUpvalue>(),
            ObjType::Class => size_of::<ObjClass>(),
            ObjType::Instance => size_of::<ObjInstance>(),
            ObjType::BoundMethod => size_of::<ObjBoundMethod>(),
            ObjType::Native => size_of::<ObjNative>(),
        }
    }
}

/// # Safety
/// `header` must point to a live object registered through this module's
/// `alloc_*`/`intern` functions and must not be referenced again afterward.
unsafe fn free_object(header: *mut ObjHeader) {
    unsafe {
        match (*header).tag {
            ObjType::String => drop(Box::from_raw(header as *mut ObjString)),
            ObjType::Function => drop(Box::from_raw(header as *mut ObjFunction)),
            ObjType::Closure => drop(Box::from_raw(header as *mut ObjClosure)),
            ObjType::Upvalue => drop(Box::from_raw(header as *mut ObjUpvalue)),
            ObjType::Class => drop(Box::from_raw(header as *mut ObjClass)),
            ObjType::Instance => drop(Box::from_raw(header as *mut ObjInstance)),
            ObjType::BoundMethod => drop(Box::from_raw(header as *mut ObjBoundMethod)),
            ObjType::Native => drop(Box::from_raw(header as *mut ObjNative)),
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.objects;
        while !current.is_null() {
            unsafe {
                let next = (*current).next.get();
                free_object(current);
                current = next;
            }
        }
        self.objects = std::ptr::null_mut();
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_identity_preserving() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
        let c = heap.intern("world");
        assert_ne!(a, c);
    }

    #[test]
    fn unreachable_object_is_swept() {
        let mut heap = Heap::new();
        let s = heap.intern("throwaway");
        let header = s as *mut ObjHeader;
        unsafe { assert!(!(*header).marked.get()) };
        // No roots marked: the sweep should reclaim the string and drop its
        // intern-table entry.
        heap.finish_collect();
        assert!(heap.strings.find_string("throwaway", ObjString::hash_bytes(b"throwaway")).is_none());
    }

    #[test]
    fn marked_object_survives_collection() {
        let mut heap = Heap::new();
        let s = heap.intern("keepme");
        heap.mark_object(s as *mut ObjHeader);
        heap.trace();
        heap.finish_collect();
        assert!(heap.strings.find_string("keepme", ObjString::hash_bytes(b"keepme")).is_some());
    }
}
