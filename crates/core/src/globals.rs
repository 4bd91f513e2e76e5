//! Global-variable storage: a name→index table plus a parallel value array.
//!
//! This is the "modern" variant of the two global-variable representations
//! found in the reference material (the alternative being a single
//! name-keyed table); it is adopted here because indexed access lets
//! `GET_GLOBAL`/`SET_GLOBAL` carry a 16-bit constant-pool index rather than
//! re-hashing a name string on every access.

use crate::heap::Heap;
use crate::object::ObjHeader;
use crate::table::Table;
use crate::value::Value;

pub struct Globals {
    names: Table,
    values: Vec<Value>,
}

impl Globals {
    pub fn new() -> Globals {
        Globals { names: Table::new(), values: Vec::new() }
    }

    /// Interns `name` and returns its slot index, allocating a fresh
    /// `undefined` slot the first time a given name is seen.
    pub fn ensure_index(&mut self, heap: &mut Heap, name: &str) -> usize {
        let key = Value::object(heap.intern(name) as *mut ObjHeader);
        if let Some(idx) = self.names.get(key) {
            return idx.as_number() as usize;
        }
        let idx = self.values.len();
        self.names.set(key, Value::number(idx as f64));
        self.values.push(Value::UNDEFINED);
        idx
    }

    pub fn get(&self, index: usize) -> Value {
        self.values[index]
    }

    pub fn set(&mut self, index: usize, value: Value) {
        self.values[index] = value;
    }

    pub fn is_defined(&self, index: usize) -> bool {
        !self.values[index].is_undefined()
    }

    pub fn mark(&self, heap: &mut Heap) {
        heap.mark_table(&self.names);
        for v in &self.values {
            heap.mark_value(*v);
        }
    }
}

impl Default for Globals {
    fn default() -> Globals {
        Globals::new()
    }
}
