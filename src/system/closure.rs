//! Capabilities attached to objects: applying functions for closure
//! connectors and magic getters for attribute keys.

use crate::{
    error::{Result, RuntimeError},
    heap::thread::{Frame, Mutator},
    runtime::Runtime,
};

use super::{object::ObjectRef, value::Value};

/// Environment handed to applying functions and magic getters.
#[derive(Clone, Copy)]
pub struct CallContext<'a> {
    runtime: &'a Runtime,
    mutator: Option<&'a Mutator>,
    tasklet: Option<&'a ObjectRef>,
}

impl<'a> CallContext<'a> {
    pub fn new(
        runtime: &'a Runtime,
        mutator: Option<&'a Mutator>,
        tasklet: Option<&'a ObjectRef>,
    ) -> Self {
        Self {
            runtime,
            mutator,
            tasklet,
        }
    }

    pub fn runtime(&self) -> &'a Runtime {
        self.runtime
    }

    pub fn mutator(&self) -> Option<&'a Mutator> {
        self.mutator
    }

    /// Tasklet being executed, if the call comes from a worker.
    pub fn tasklet(&self) -> Option<&'a ObjectRef> {
        self.tasklet
    }

    /// Pushes a frame with `slots` empty locals on the calling mutator.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not attached to the runtime.
    pub fn frame(&self, descr: &'static str, slots: usize) -> Frame<'a> {
        match self.mutator {
            Some(mutator) => Frame::new(mutator, descr, slots),
            None => panic!("frame {:?} requested on a thread that is not attached", descr),
        }
    }

    pub fn check_arity(&self, name: &str, args: &[Value], expected: usize) -> Result<()> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(RuntimeError::BadArity {
                name: name.to_string(),
                expected,
                got: args.len(),
            })
        }
    }
}

/// Applying function of a closure connector.
///
/// `closure` is the closure value being applied; its captured values are
/// available through [`Value::closed_values`]. The fixed-arity entry points
/// default to [`Applyable::apply`].
pub trait Applyable: Send + Sync {
    fn apply(&self, cx: &CallContext<'_>, closure: &Value, args: &[Value]) -> Result<Value>;

    fn apply0(&self, cx: &CallContext<'_>, closure: &Value) -> Result<Value> {
        self.apply(cx, closure, &[])
    }

    fn apply1(&self, cx: &CallContext<'_>, closure: &Value, a: &Value) -> Result<Value> {
        self.apply(cx, closure, std::slice::from_ref(a))
    }

    fn apply2(&self, cx: &CallContext<'_>, closure: &Value, a: &Value, b: &Value) -> Result<Value> {
        self.apply(cx, closure, &[a.clone(), b.clone()])
    }

    fn apply3(
        &self,
        cx: &CallContext<'_>,
        closure: &Value,
        a: &Value,
        b: &Value,
        c: &Value,
    ) -> Result<Value> {
        self.apply(cx, closure, &[a.clone(), b.clone(), c.clone()])
    }
}

type NativeBody = dyn Fn(&CallContext<'_>, &[Value], &[Value]) -> Result<Value> + Send + Sync;

/// Applying function backed by a Rust closure receiving the captured values
/// and the arguments.
pub struct NativeFn {
    name: String,
    body: Box<NativeBody>,
}

impl NativeFn {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&CallContext<'_>, &[Value], &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: Box::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Applyable for NativeFn {
    fn apply(&self, cx: &CallContext<'_>, closure: &Value, args: &[Value]) -> Result<Value> {
        let closed = closure.closed_values();
        (self.body)(cx, closed, args)
    }
}

/// Computes the value of an attribute instead of the attribute map.
pub trait MagicGetter: Send + Sync {
    fn get(&self, value: &Value, key: &ObjectRef, cx: &CallContext<'_>) -> Value;
}

impl<F> MagicGetter for F
where
    F: Fn(&Value, &ObjectRef, &CallContext<'_>) -> Value + Send + Sync,
{
    fn get(&self, value: &Value, key: &ObjectRef, cx: &CallContext<'_>) -> Value {
        self(value, key, cx)
    }
}

/// Applies a closure value, dispatching small arities to the fixed-arity
/// entry points of its connector.
pub fn apply_closure(cx: &CallContext<'_>, closure: &Value, args: &[Value]) -> Result<Value> {
    let connector = match closure.connector() {
        Some(connector) => connector,
        None => {
            return Err(RuntimeError::failure(format!(
                "cannot apply a {} value",
                closure.kind_name()
            )))
        }
    };
    let applier = connector
        .applier()
        .ok_or(RuntimeError::NotCallable(connector.id()))?;
    match args {
        [] => applier.apply0(cx, closure),
        [a] => applier.apply1(cx, closure, a),
        [a, b] => applier.apply2(cx, closure, a, b),
        [a, b, c] => applier.apply3(cx, closure, a, b, c),
        _ => applier.apply(cx, closure, args),
    }
}
