//! Open-addressed hash table keyed by [`Value`], used for string interning,
//! class method tables, instance fields, and (in the compiler) string
//! constant deduplication.

use crate::object::{ObjString, ObjType};
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: Value,
    value: Value,
}

pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

fn hash_value(v: Value) -> u32 {
    if v.is_bool() {
        if v.as_bool() { 3 } else { 5 }
    } else if v.is_nil() {
        7
    } else if v.is_number() {
        hash_double(v.as_number())
    } else if v.is_object() {
        unsafe {
            let header = v.as_object();
            match (*header).tag {
                ObjType::String => (*(header as *mut ObjString)).hash,
                _ => 0,
            }
        }
    } else {
        0
    }
}

fn hash_double(n: f64) -> u32 {
    let bits = n.to_bits();
    (bits as u32) ^ ((bits >> 32) as u32)
}

impl Table {
    pub fn new() -> Table {
        Table { count: 0, entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Linear probe starting at `hash(key) & (capacity - 1)`, remembering the
    /// first tombstone seen so inserts can reuse it.
    fn find_entry(entries: &[Entry], capacity: usize, key: Value) -> usize {
        let mut index = (hash_value(key) as usize) & (capacity - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            if entry.key.is_empty() {
                if entry.value.is_nil() {
                    return tombstone.unwrap_or(index);
                } else if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.key == key {
                return index;
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![Entry { key: Value::EMPTY, value: Value::NIL }; capacity];
        let mut new_count = 0;
        for entry in self.entries.iter() {
            if entry.key.is_empty() {
                continue;
            }
            let dest = Table::find_entry(&entries, capacity, entry.key);
            entries[dest] = *entry;
            new_count += 1;
        }
        self.entries = entries;
        self.count = new_count;
    }

    pub fn get(&self, key: Value) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Table::find_entry(&self.entries, self.capacity(), key);
        let entry = &self.entries[index];
        if entry.key.is_empty() { None } else { Some(entry.value) }
    }

    /// Returns `true` if `key` was not already present.
    pub fn set(&mut self, key: Value, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            let new_cap = if self.capacity() < 8 { 8 } else { self.capacity() * 2 };
            self.adjust_capacity(new_cap);
        }
        let index = Table::find_entry(&self.entries, self.capacity(), key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_empty();
        if is_new_key && entry.value.is_nil() {
            self.count += 1;
        }
        entry.key = key;
        entry.value = value;
        is_new_key
    }

    pub fn delete(&mut self, key: Value) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Table::find_entry(&self.entries, self.capacity(), key);
        let entry = &mut self.entries[index];
        if entry.key.is_empty() {
            return false;
        }
        entry.key = Value::EMPTY;
        entry.value = Value::bool(true);
        true
    }

    pub fn add_all(&mut self, from: &Table) {
        for entry in from.entries.iter() {
            if !entry.key.is_empty() {
                self.set(entry.key, entry.value);
            }
        }
    }

    /// Looks an interned string up by content without allocating a `Value`
    /// key first (the key doesn't exist as an object yet during interning).
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<*mut ObjString> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            if entry.key.is_empty() {
                if entry.value.is_nil() {
                    return None;
                }
            } else {
                unsafe {
                    let s = entry.key.as_object() as *mut ObjString;
                    if (*s).hash == hash && (*s).chars.as_ref() == chars {
                        return Some(s);
                    }
                }
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    pub fn remove_white(&mut self) {
        let keys: Vec<Value> = self
            .entries
            .iter()
            .filter(|e| !e.key.is_empty())
            .filter(|e| unsafe { !(*e.key.as_object()).marked.get() })
            .map(|e| e.key)
            .collect();
        for key in keys {
            self.delete(key);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().filter(|e| !e.key.is_empty()).map(|e| (e.key, e.value))
    }
}

impl Default for Table {
    fn default() -> Table {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn set_get_delete_roundtrip() {
        let mut heap = Heap::new();
        let mut t = Table::new();
        let key = Value::object(heap.intern("answer") as *mut crate::object::ObjHeader);
        assert!(t.set(key, Value::number(42.0)));
        assert_eq!(t.get(key).unwrap(), Value::number(42.0));
        assert!(t.delete(key));
        assert!(t.get(key).is_none());
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let mut t = Table::new();
        for i in 0..200 {
            let key = Value::object(heap.intern(&format!("k{i}")) as *mut crate::object::ObjHeader);
            t.set(key, Value::number(i as f64));
        }
        assert_eq!(t.len(), 200);
        for i in 0..200 {
            let key = Value::object(heap.intern(&format!("k{i}")) as *mut crate::object::ObjHeader);
            assert_eq!(t.get(key).unwrap(), Value::number(i as f64));
        }
    }

    #[test]
    fn reinserting_a_deleted_key_does_not_double_count() {
        let mut heap = Heap::new();
        let mut t = Table::new();
        let key = Value::object(heap.intern("k") as *mut crate::object::ObjHeader);
        t.set(key, Value::number(1.0));
        t.delete(key);
        t.set(key, Value::number(2.0));
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(key).unwrap(), Value::number(2.0));
    }
}
