//! Object model: values, objects, payloads and the object store.

pub mod class;
pub mod closure;
pub mod object;
pub mod payload;
pub mod store;
pub mod value;

pub use class::ClassInfo;
pub use closure::{Applyable, CallContext, MagicGetter, NativeFn};
pub use object::{ObjectGuard, ObjectId, ObjectRef};
pub use payload::{Environment, MutableSet, MutableVector, Payload, SymbolInfo};
pub use store::ObjectStore;
pub use value::{ExternalData, Value};
