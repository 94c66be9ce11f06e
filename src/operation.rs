//! Dispatch of named application operations.
//!
//! Operations are looked up by name in an [`OperationRegistry`] and called
//! with positional arguments. Each handler declares its argument type, which
//! is decoded from the JSON argument array, so a handler taking
//! `(String, i64)` accepts `["key", 42]`.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::{MaatError, Result};

/// Whether an operation needs the open resource transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationBinding {
    /// Runs inside the transaction handle. Only legal while the transaction is started.
    Resource,
    /// Pass-through call that does not touch the local resource. Legal in any
    /// non-terminal worker state.
    Detached,
}

/// Executes named operations against the resource handle of type `T`.
pub trait OperationExecutor<T>: Send + Sync {
    /// Binding of `name`, or `None` if no such operation exists.
    fn binding(&self, name: &str) -> Option<OperationBinding>;

    /// Runs `name` with `args`. `handle` is present for resource-bound operations.
    fn execute(&self, name: &str, handle: Option<&mut T>, args: Vec<Value>) -> Result<Value>;
}

type Handler<T> = Arc<dyn Fn(Option<&mut T>, Vec<Value>) -> Result<Value> + Send + Sync>;

struct Registered<T> {
    binding: OperationBinding,
    handler: Handler<T>,
}

/// Name to handler dispatch table.
pub struct OperationRegistry<T> {
    operations: HashMap<String, Registered<T>>,
}

impl<T> Default for OperationRegistry<T> {
    fn default() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }
}

impl<T> fmt::Debug for OperationRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.operations.keys().collect();
        names.sort();
        f.debug_struct("OperationRegistry").field("operations", &names).finish()
    }
}

impl<T: 'static> OperationRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an operation that runs inside the resource transaction.
    ///
    /// Registering a name twice replaces the earlier handler.
    pub fn register<A, R, F>(&mut self, name: &str, operation: F) -> &mut Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&mut T, A) -> Result<R> + Send + Sync + 'static,
    {
        let operation_name = name.to_string();
        let handler: Handler<T> = Arc::new(move |handle: Option<&mut T>, args: Vec<Value>| {
            let handle = handle.ok_or_else(|| {
                MaatError::IllegalState(format!(
                    "operation '{operation_name}' needs an open resource transaction"
                ))
            })?;
            let args = decode_arguments::<A>(&operation_name, args)?;
            encode_result(&operation_name, operation(handle, args)?)
        });
        self.insert(name, OperationBinding::Resource, handler)
    }

    /// Registers a pass-through operation that does not use the resource transaction.
    pub fn register_detached<A, R, F>(&mut self, name: &str, operation: F) -> &mut Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> Result<R> + Send + Sync + 'static,
    {
        let operation_name = name.to_string();
        let handler: Handler<T> = Arc::new(move |_handle: Option<&mut T>, args: Vec<Value>| {
            let args = decode_arguments::<A>(&operation_name, args)?;
            encode_result(&operation_name, operation(args)?)
        });
        self.insert(name, OperationBinding::Detached, handler)
    }

    fn insert(&mut self, name: &str, binding: OperationBinding, handler: Handler<T>) -> &mut Self {
        self.operations
            .insert(name.to_string(), Registered { binding, handler });
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }
}

impl<T: Send + 'static> OperationExecutor<T> for OperationRegistry<T> {
    fn binding(&self, name: &str) -> Option<OperationBinding> {
        self.operations.get(name).map(|registered| registered.binding)
    }

    fn execute(&self, name: &str, handle: Option<&mut T>, args: Vec<Value>) -> Result<Value> {
        let registered = self
            .operations
            .get(name)
            .ok_or_else(|| MaatError::UnknownOperation(name.to_string()))?;
        (registered.handler)(handle, args)
    }
}

fn decode_arguments<A: DeserializeOwned>(operation: &str, args: Vec<Value>) -> Result<A> {
    let no_arguments = args.is_empty();
    match serde_json::from_value(Value::Array(args)) {
        Ok(decoded) => Ok(decoded),
        // `()` decodes from null, not from an empty array
        Err(_) if no_arguments => serde_json::from_value(Value::Null).map_err(|e| {
            MaatError::InvalidArguments {
                operation: operation.to_string(),
                reason: e.to_string(),
            }
        }),
        Err(e) => Err(MaatError::InvalidArguments {
            operation: operation.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn encode_result<R: Serialize>(operation: &str, result: R) -> Result<Value> {
    serde_json::to_value(result).map_err(|e| MaatError::InvalidArguments {
        operation: operation.to_string(),
        reason: format!("result is not serializable: {e}"),
    })
}
