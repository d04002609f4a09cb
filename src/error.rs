use thiserror::Error;

use crate::system::object::ObjectId;

/// Errors returned by runtime operations that callers can detect and
/// recover from. Internal corruption panics instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("invalid UTF-8 in string value at byte {0}")]
    InvalidUtf8(usize),
    #[error("NaN cannot be boxed as a double value")]
    NanDouble,
    #[error("attribute {0} has a magic getter and cannot be stored")]
    MagicAttribute(ObjectId),
    #[error("linking {subclass} to {superclass} would create a cycle")]
    CyclicClass {
        subclass: ObjectId,
        superclass: ObjectId,
    },
    #[error("object {0} is not a class")]
    NotAClass(ObjectId),
    #[error("connector {0} has no applying function")]
    NotCallable(ObjectId),
    #[error("{name} expects {expected} argument(s), got {got}")]
    BadArity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("invalid symbol name {0:?}")]
    InvalidSymbolName(String),
    #[error("invalid object id {0:?}")]
    InvalidObjectId(String),
    #[error("component index {index} out of range for {len} component(s)")]
    ComponentIndex { index: isize, len: usize },
    #[error("object {0} is not a tasklet")]
    NotATasklet(ObjectId),
    #[error("{0}")]
    Failure(String),
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

impl RuntimeError {
    pub fn failure(msg: impl Into<String>) -> Self {
        RuntimeError::Failure(msg.into())
    }
}
