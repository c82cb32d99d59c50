//! Service registration and dispatch tables.
//!
//! Dispatch is built at registration time: each service maps method names
//! to an entry holding the arity, whether the method takes a cancellation
//! token, and a boxed async invoker. There is no name resolution at call
//! time beyond the table lookup.
//!
//! # Example
//!
//! ```
//! use postwire::rpc::{reply, CallArgs, Service};
//!
//! let calculator = Service::new("Calculator").method("Add", 2, |args: CallArgs| async move {
//!     let a: i64 = args.get(0)?;
//!     let b: i64 = args.get(1)?;
//!     reply(&(a + b))
//! });
//! assert!(calculator.entry("Add").is_some());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::codec::FieldCodec;
use crate::cancel::CancelToken;
use crate::error::{RemoteException, WireError};
use crate::postmaster::BoxFuture;

/// Decoded positional arguments handed to an invoker.
pub struct CallArgs {
    fields: Vec<Bytes>,
}

impl CallArgs {
    pub fn new(fields: Vec<Bytes>) -> Self {
        Self { fields }
    }

    /// Number of arguments.
    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Decode the argument at `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, MethodError> {
        let field = self.fields.get(index).ok_or_else(|| {
            MethodError::new("ArgumentError", format!("missing argument {index}"))
        })?;
        FieldCodec::decode(field, index as u8)
            .map_err(|e| MethodError::new("ArgumentError", e.to_string()))
    }
}

/// Failure raised by a method body; becomes a `RemoteException` on the
/// wire.
#[derive(Debug, Clone)]
pub struct MethodError {
    pub type_name: String,
    pub message: String,
}

impl MethodError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    pub fn into_exception(self) -> RemoteException {
        RemoteException::new(self.type_name, self.message)
    }
}

impl From<WireError> for MethodError {
    fn from(err: WireError) -> Self {
        MethodError::new("WireError", err.to_string())
    }
}

/// What an invoker produces: an encoded return field, or a failure.
pub type MethodResult = std::result::Result<Bytes, MethodError>;

/// Encode a method's return value as its reply field.
pub fn reply<T: Serialize>(value: &T) -> MethodResult {
    FieldCodec::encode(value, 0).map_err(MethodError::from)
}

type Invoker =
    Box<dyn Fn(CallArgs, Option<CancelToken>) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// One registered method.
pub struct MethodEntry {
    arity: u8,
    wants_cancel: bool,
    invoker: Invoker,
}

impl MethodEntry {
    /// Declared positional argument count.
    #[inline]
    pub fn arity(&self) -> u8 {
        self.arity
    }

    /// Whether the method's terminal formal parameter is a cancellation
    /// token.
    #[inline]
    pub fn wants_cancel(&self) -> bool {
        self.wants_cancel
    }

    /// Run the method.
    pub fn invoke(
        &self,
        args: CallArgs,
        token: Option<CancelToken>,
    ) -> BoxFuture<'static, MethodResult> {
        (self.invoker)(args, token)
    }
}

/// A named service: `method name -> entry`.
pub struct Service {
    name: String,
    methods: HashMap<String, MethodEntry>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a method.
    pub fn method<F, Fut>(mut self, name: &str, arity: u8, handler: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        self.methods.insert(
            name.to_string(),
            MethodEntry {
                arity,
                wants_cancel: false,
                invoker: Box::new(move |args, _token| Box::pin(handler(args))),
            },
        );
        self
    }

    /// Register a method whose last formal parameter is a cancellation
    /// token. `arity` counts serialized arguments only; the token is
    /// never on the wire.
    pub fn method_with_cancel<F, Fut>(mut self, name: &str, arity: u8, handler: F) -> Self
    where
        F: Fn(CallArgs, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        self.methods.insert(
            name.to_string(),
            MethodEntry {
                arity,
                wants_cancel: true,
                invoker: Box::new(move |args, token| {
                    Box::pin(handler(args, token.unwrap_or_default()))
                }),
            },
        );
        self
    }

    /// Look up a method entry.
    pub fn entry(&self, method: &str) -> Option<&MethodEntry> {
        self.methods.get(method)
    }
}

/// All services an endpoint exposes, frozen before the endpoint starts.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Service>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service; replaces any previous one with the same name.
    pub fn register(&mut self, service: Service) {
        self.services.insert(service.name.clone(), service);
    }

    /// Look up a service by name.
    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Freeze into the shared handle sessions dispatch against.
    pub fn freeze(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> Service {
        Service::new("Calculator")
            .method("Add", 2, |args: CallArgs| async move {
                let a: i64 = args.get(0)?;
                let b: i64 = args.get(1)?;
                reply(&(a + b))
            })
            .method_with_cancel("Wait", 1, |args: CallArgs, token| async move {
                let _ms: u64 = args.get(0)?;
                if token.is_cancelled() {
                    return Err(MethodError::new("Cancelled", "interrupted"));
                }
                reply(&true)
            })
    }

    fn encode_args(values: &[i64]) -> CallArgs {
        CallArgs::new(
            values
                .iter()
                .enumerate()
                .map(|(i, v)| FieldCodec::encode(v, i as u8).unwrap())
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_invoke_add() {
        let service = calculator();
        let entry = service.entry("Add").unwrap();
        assert_eq!(entry.arity(), 2);
        assert!(!entry.wants_cancel());

        let result = entry.invoke(encode_args(&[100, 200]), None).await.unwrap();
        let sum: i64 = FieldCodec::decode(&result, 0).unwrap();
        assert_eq!(sum, 300);
    }

    #[tokio::test]
    async fn test_missing_argument_is_method_error() {
        let service = calculator();
        let entry = service.entry("Add").unwrap();

        let err = entry.invoke(encode_args(&[1]), None).await.unwrap_err();
        assert_eq!(err.type_name, "ArgumentError");
    }

    #[tokio::test]
    async fn test_cancel_token_reaches_method() {
        let service = calculator();
        let entry = service.entry("Wait").unwrap();
        assert!(entry.wants_cancel());

        let token = CancelToken::new();
        token.cancel();
        let err = entry
            .invoke(encode_args(&[50]), Some(token))
            .await
            .unwrap_err();
        assert_eq!(err.type_name, "Cancelled");
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ServiceRegistry::new();
        registry.register(calculator());
        let registry = registry.freeze();

        assert!(registry.get("Calculator").is_some());
        assert!(registry.get("Missing").is_none());
        assert!(registry.get("Calculator").unwrap().entry("Add").is_some());
        assert!(registry.get("Calculator").unwrap().entry("Sub").is_none());
    }

    #[test]
    fn test_method_error_into_exception() {
        let err = MethodError::new("Boom", "it broke");
        let ex = err.into_exception();
        assert_eq!(ex.type_name, "Boom");
        assert_eq!(ex.message, "it broke");
        assert!(ex.stack.is_empty());
    }
}
