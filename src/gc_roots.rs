//! Explicit roots and the symbol table.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::{Mutex, RwLock};

use crate::{
    error::{Result, RuntimeError},
    heap::mark::Marker,
    system::object::ObjectRef,
};

#[derive(Default)]
struct Symbols {
    by_name: BTreeMap<String, ObjectRef>,
    by_object: HashMap<ObjectRef, String>,
}

/// Objects pinned against collection. Symbols pin their referent too.
#[derive(Default)]
pub struct RootSet {
    roots: Mutex<HashSet<ObjectRef>>,
    symbols: RwLock<Symbols>,
}

/// Symbol names start with an ASCII letter followed by ASCII alphanumerics
/// or underscores.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(RuntimeError::InvalidSymbolName(name.to_string()))
    }
}

impl RootSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `object` was already a root.
    pub fn add(&self, object: &ObjectRef) -> bool {
        self.roots.lock().insert(object.clone())
    }

    pub fn remove(&self, object: &ObjectRef) -> bool {
        self.roots.lock().remove(object)
    }

    pub fn contains(&self, object: &ObjectRef) -> bool {
        self.roots.lock().contains(object)
    }

    /// Roots ordered by id.
    pub fn list(&self) -> Vec<ObjectRef> {
        let mut roots: Vec<ObjectRef> = self.roots.lock().iter().cloned().collect();
        roots.sort_unstable();
        roots
    }

    pub fn len(&self) -> usize {
        self.roots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find_symbol(&self, name: &str) -> Option<ObjectRef> {
        self.symbols.read().by_name.get(name).cloned()
    }

    pub fn symbol_name(&self, object: &ObjectRef) -> Option<String> {
        self.symbols.read().by_object.get(object).cloned()
    }

    /// Binds `name` to `object`, returning the previous referent.
    pub fn bind_symbol(&self, name: &str, object: &ObjectRef) -> Result<Option<ObjectRef>> {
        validate_name(name)?;
        let mut symbols = self.symbols.write();
        let previous = symbols.by_name.insert(name.to_string(), object.clone());
        if let Some(previous) = &previous {
            if symbols.by_object.get(previous).map(String::as_str) == Some(name) {
                symbols.by_object.remove(previous);
            }
        }
        symbols.by_object.insert(object.clone(), name.to_string());
        Ok(previous)
    }

    /// Binds `name` to the object made by `make` unless it is already bound.
    /// When two threads race, both may run `make` and the loser's object is
    /// dropped.
    pub fn intern_with(
        &self,
        name: &str,
        make: impl FnOnce() -> ObjectRef,
    ) -> Result<ObjectRef> {
        validate_name(name)?;
        if let Some(existing) = self.find_symbol(name) {
            return Ok(existing);
        }
        let object = make();
        let mut symbols = self.symbols.write();
        if let Some(existing) = symbols.by_name.get(name) {
            return Ok(existing.clone());
        }
        symbols.by_name.insert(name.to_string(), object.clone());
        symbols.by_object.insert(object.clone(), name.to_string());
        Ok(object)
    }

    pub fn unbind_symbol(&self, name: &str) -> Option<ObjectRef> {
        let mut symbols = self.symbols.write();
        let object = symbols.by_name.remove(name)?;
        if symbols.by_object.get(&object).map(String::as_str) == Some(name) {
            symbols.by_object.remove(&object);
        }
        Some(object)
    }

    /// Symbol names in lexicographic order.
    pub fn list_symbols(&self) -> Vec<String> {
        self.symbols.read().by_name.keys().cloned().collect()
    }

    pub fn mark(&self, marker: &mut Marker) {
        for root in self.roots.lock().iter() {
            marker.mark_object(root);
        }
        for object in self.symbols.read().by_name.values() {
            marker.mark_object(object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::validate_name;

    #[test]
    fn test_symbol_names() {
        assert!(validate_name("object").is_ok());
        assert!(validate_name("a1_b2").is_ok());
        assert!(validate_name("X").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("1abc").is_err());
        assert!(validate_name("_private").is_err());
        assert!(validate_name("with space").is_err());
        assert!(validate_name("né").is_err());
    }
}
