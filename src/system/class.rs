use std::collections::HashMap;

use crate::{
    error::{Result, RuntimeError},
    heap::mark::Marker,
};

use super::{object::ObjectRef, payload::Payload, value::Value};

/// Payload of class objects.
pub struct ClassInfo {
    pub name: String,
    superclass: Option<ObjectRef>,
    methods: HashMap<ObjectRef, Value>,
}

impl ClassInfo {
    pub fn new(name: impl Into<String>, superclass: Option<ObjectRef>) -> Self {
        Self {
            name: name.into(),
            superclass,
            methods: HashMap::new(),
        }
    }

    pub fn superclass(&self) -> Option<&ObjectRef> {
        self.superclass.as_ref()
    }

    pub fn define_method(&mut self, selector: ObjectRef, closure: Value) -> Value {
        if closure.is_empty() {
            self.methods.remove(&selector).unwrap_or_default()
        } else {
            self.methods.insert(selector, closure).unwrap_or_default()
        }
    }

    pub fn local_method(&self, selector: &ObjectRef) -> Value {
        self.methods.get(selector).cloned().unwrap_or_default()
    }

    pub fn nb_methods(&self) -> usize {
        self.methods.len()
    }
}

impl Payload for ClassInfo {
    crate::payload_kind!("class");

    fn link(&self) -> Option<&ObjectRef> {
        self.superclass.as_ref()
    }

    fn mark(&self, marker: &mut Marker) {
        if let Some(superclass) = &self.superclass {
            marker.mark_object(superclass);
        }
        for (selector, closure) in self.methods.iter() {
            marker.mark_object(selector);
            marker.mark_value(closure);
        }
    }
}

pub fn is_class(object: &ObjectRef) -> bool {
    object.has_payload::<ClassInfo>()
}

pub fn superclass_of(class: &ObjectRef) -> Option<ObjectRef> {
    class
        .payload_ref(|info: &ClassInfo| info.superclass.clone())
        .flatten()
}

pub fn class_name(class: &ObjectRef) -> Option<String> {
    class.payload_ref(|info: &ClassInfo| info.name.clone())
}

/// True if `class` is `superclass` or inherits from it. Terminates because
/// superclass links are checked for cycles whenever they are installed.
pub fn is_subclass_of(class: &ObjectRef, superclass: &ObjectRef) -> bool {
    let mut current = Some(class.clone());
    while let Some(c) = current {
        if &c == superclass {
            return true;
        }
        current = superclass_of(&c);
    }
    false
}

pub fn is_instance_of(object: &ObjectRef, class: &ObjectRef) -> bool {
    object
        .class()
        .map_or(false, |own| is_subclass_of(&own, class))
}

/// Installs `superclass` as the parent of `class`, rejecting cycles.
pub fn set_superclass(class: &ObjectRef, superclass: Option<&ObjectRef>) -> Result<()> {
    class.edit_chain(|| {
        if !is_class(class) {
            return Err(RuntimeError::NotAClass(class.id()));
        }
        if let Some(sup) = superclass {
            if !is_class(sup) {
                return Err(RuntimeError::NotAClass(sup.id()));
            }
            if is_subclass_of(sup, class) {
                return Err(RuntimeError::CyclicClass {
                    subclass: class.id(),
                    superclass: sup.id(),
                });
            }
        }
        class.payload_mut(|info: &mut ClassInfo| info.superclass = superclass.cloned());
        Ok(())
    })
}

pub fn define_method(class: &ObjectRef, selector: &ObjectRef, closure: Value) -> Result<Value> {
    class
        .payload_mut(|info: &mut ClassInfo| info.define_method(selector.clone(), closure))
        .ok_or(RuntimeError::NotAClass(class.id()))
}

/// Finds the method for `selector` in `class` or its superclasses.
pub fn method_lookup(class: &ObjectRef, selector: &ObjectRef) -> Value {
    let mut current = Some(class.clone());
    while let Some(c) = current {
        let step = c.payload_ref(|info: &ClassInfo| {
            (info.local_method(selector), info.superclass.clone())
        });
        match step {
            Some((method, _)) if !method.is_empty() => return method,
            Some((_, parent)) => current = parent,
            None => break,
        }
    }
    Value::Empty
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{options::RuntimeOptions, runtime::Runtime};

    #[test]
    fn test_method_lookup_walks_superclasses() {
        let rt = Runtime::new(RuntimeOptions::default());
        let animal = rt.make_class("animal", None).unwrap();
        let dog = rt.make_class("dog", Some(&animal)).unwrap();
        let speak = rt.register_symbol("speak").unwrap();
        let walk = rt.register_symbol("walk").unwrap();

        let generic = Value::string(&rt, "...");
        let bark = Value::string(&rt, "woof");
        define_method(&animal, &speak, generic.clone()).unwrap();
        define_method(&animal, &walk, Value::int(4)).unwrap();
        assert_eq!(define_method(&dog, &speak, bark.clone()).unwrap(), Value::Empty);

        assert_eq!(method_lookup(&dog, &speak), bark);
        assert_eq!(method_lookup(&dog, &walk), Value::int(4));
        assert_eq!(method_lookup(&animal, &speak), generic);

        // Storing Empty removes the override.
        define_method(&dog, &speak, Value::Empty).unwrap();
        assert_eq!(method_lookup(&dog, &speak), generic);

        let plain = rt.create(None, None);
        assert_eq!(
            define_method(&plain, &speak, Value::int(1)),
            Err(RuntimeError::NotAClass(plain.id()))
        );
        assert_eq!(method_lookup(&plain, &speak), Value::Empty);
    }

    #[test]
    fn test_hierarchy_queries() {
        let rt = Runtime::new(RuntimeOptions::default());
        let object = rt.predefined().object.clone();
        let class = rt.predefined().class.clone();
        assert!(is_class(&object));
        assert!(is_instance_of(&class, &class));
        assert!(is_instance_of(&object, &class));
        assert!(is_subclass_of(&class, &object));
        assert_eq!(class_name(&object).as_deref(), Some("object"));
        assert_eq!(superclass_of(&object), None);

        let a = rt.make_class("a", None).unwrap();
        let b = rt.make_class("b", Some(&a)).unwrap();
        assert!(matches!(
            set_superclass(&a, Some(&b)),
            Err(RuntimeError::CyclicClass { .. })
        ));
        assert!(matches!(set_superclass(&a, Some(&a)), Err(RuntimeError::CyclicClass { .. })));
        assert_eq!(superclass_of(&a), Some(object.clone()));

        set_superclass(&b, None).unwrap();
        assert!(!is_subclass_of(&b, &a));
        set_superclass(&a, Some(&b)).unwrap();
        assert!(is_subclass_of(&a, &b));
    }
}
