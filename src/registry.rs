//! Method registry: maps `"<module>_<method>"` names to callable descriptors.
//!
//! Handlers are statically typed closures taking the connection handle and a
//! deserializable parameter value, erased behind the [`Handler`] trait so the
//! dispatch loop works with raw body bytes. The connection-handle-first-
//! parameter rule is enforced by the closure shape at compile time; duplicate
//! names are rejected at registration time.
//!
//! Registration is expected to finish before serving begins; lookups are then
//! read-only and safe from any number of dispatch workers.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = MethodRegistry::new();
//! registry.register_func("global", "Hello", |_conn, name: String| async move {
//!     Ok(format!("你好哈:{name}"))
//! })?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::connection::Connection;
use crate::error::{Result, RpcError};

/// Boxed future returned by erased handlers: encoded result bytes or an error.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Bytes>> + Send>>;

/// Type-erased callable: raw body bytes in, encoded result bytes out.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, conn: Arc<Connection>, body: Bytes) -> HandlerFuture;
}

/// Adapter from a typed closure to the erased [`Handler`] contract.
///
/// Parameter decode and result encode both go through the connection's codec,
/// so a decode failure surfaces as an error response rather than a crash.
pub struct TypedHandler<F, P, R, Fut> {
    handler: F,
    _phantom: PhantomData<fn(P) -> (R, Fut)>,
}

impl<F, P, R, Fut> TypedHandler<F, P, R, Fut>
where
    F: Fn(Arc<Connection>, P) -> Fut + Send + Sync + 'static,
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, P, R, Fut> Handler for TypedHandler<F, P, R, Fut>
where
    F: Fn(Arc<Connection>, P) -> Fut + Send + Sync + 'static,
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, conn: Arc<Connection>, body: Bytes) -> HandlerFuture {
        let codec = conn.codec();
        let params: P = match codec.decode(&body) {
            Ok(value) => value,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(conn, params);
        Box::pin(async move {
            let value = fut.await?;
            codec.encode(&value).map(Bytes::from)
        })
    }
}

/// A registered callable and its dotted name.
pub struct MethodDescriptor {
    name: String,
    handler: Box<dyn Handler>,
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the erased handler.
    pub fn invoke(&self, conn: Arc<Connection>, body: Bytes) -> HandlerFuture {
        self.handler.call(conn, body)
    }
}

/// A service object whose methods register as a module.
///
/// The Rust counterpart of enumerating a struct's exported methods: the
/// implementation lists its callable methods explicitly, and each gets
/// registered under `"<module_name>_<method>"`.
pub trait Service: Send + Sync + Sized + 'static {
    /// Module name the service's methods register under.
    fn module_name() -> &'static str;

    /// Register every exposed method into the registry.
    fn register(self: &Arc<Self>, registry: &mut MethodRegistry) -> Result<()>;
}

/// Registry mapping dotted method names to descriptors.
pub struct MethodRegistry {
    methods: HashMap<String, MethodDescriptor>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self {
            methods: HashMap::with_capacity(8),
        }
    }

    /// Register a single function under `"<module>_<method>"`.
    ///
    /// Fails with [`RpcError::DuplicateMethod`] if the name is taken.
    pub fn register_func<F, P, R, Fut>(
        &mut self,
        module_name: &str,
        method_name: &str,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Arc<Connection>, P) -> Fut + Send + Sync + 'static,
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let name = format!("{module_name}_{method_name}");
        if self.methods.contains_key(&name) {
            return Err(RpcError::DuplicateMethod(name));
        }

        let descriptor = MethodDescriptor {
            name: name.clone(),
            handler: Box::new(TypedHandler::new(handler)),
        };
        self.methods.insert(name, descriptor);
        Ok(())
    }

    /// Register every method a [`Service`] exposes.
    pub fn register_service<S: Service>(&mut self, service: S) -> Result<()> {
        Arc::new(service).register(self)
    }

    /// Read-only lookup by dotted name.
    pub fn resolve(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Log every registered method at debug level.
    pub fn record_methods(&self) {
        for name in self.methods.keys() {
            tracing::debug!(method = %name, "registered method");
        }
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}
