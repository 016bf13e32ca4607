//! RPC server: accepts connections and watches their liveness.
//!
//! Each accepted socket gets its own [`Connection`] with a server-side
//! watcher: the watchdog tracks when the last keepalive arrived (defaulting
//! to accept time) and force-closes the connection once the configured
//! timeout elapses in silence. Keepalive requests are answered immediately
//! and never reach dispatch.
//!
//! Connection tracking is not special-cased: the server chains its own
//! untrack callback into the shared close hook slot, exactly like user hooks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};

use crate::codec::PayloadCodec;
use crate::connection::Connection;
use crate::error::{Result, RpcError};
use crate::protocol::{ByteOrder, Frame};
use crate::registry::{MethodRegistry, Service};
use crate::watcher::{ConnectionWatcher, HookRegistry};

/// Default keepalive-silence window before a connection is closed.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(20);

/// Server-side lifecycle watcher: keepalive watchdog plus hook fan-out.
struct ServerWatcher {
    hooks: Arc<HookRegistry>,
    connection_timeout_ms: Arc<AtomicU64>,
    last_keepalive_received: Mutex<Instant>,
}

impl ServerWatcher {
    fn new(hooks: Arc<HookRegistry>, connection_timeout_ms: Arc<AtomicU64>) -> Self {
        Self {
            hooks,
            connection_timeout_ms,
            // Accept time counts as the first sign of life.
            last_keepalive_received: Mutex::new(Instant::now()),
        }
    }
}

impl ConnectionWatcher for ServerWatcher {
    fn after_send(&self, conn: &Arc<Connection>, frame: &Frame) {
        self.hooks.invoke_after_send(conn, frame);
    }

    fn send_schedule(&self, conn: &Arc<Connection>) -> Result<()> {
        let timeout = Duration::from_millis(self.connection_timeout_ms.load(Ordering::Relaxed));
        if self.last_keepalive_received.lock().unwrap().elapsed() > timeout {
            tracing::debug!(peer = %conn.peer_addr(), "keepalive timeout");
            return Err(RpcError::KeepaliveTimeout);
        }

        self.hooks.invoke_send_schedule(conn);
        Ok(())
    }

    fn before_handle_frame(&self, conn: &Arc<Connection>, frame: &Frame) -> Result<bool> {
        if frame.is_keepalive() {
            // Only a keepalive request gets a keepalive response; a response
            // to our own probe just refreshes the clock.
            if frame.is_request() {
                let response = Frame::response(frame, Bytes::new(), conn.next_request_id());
                if let Err(e) = conn.try_enqueue(response) {
                    tracing::debug!(peer = %conn.peer_addr(), error = %e, "keepalive response dropped");
                }
            }
            *self.last_keepalive_received.lock().unwrap() = Instant::now();
            return Ok(true);
        }

        self.hooks.invoke_before_handle_frame(conn, frame)
    }

    fn after_invoke(&self, conn: &Arc<Connection>, frame: &Frame, result: &Result<Bytes>) {
        self.hooks.invoke_after_invoke(conn, frame, result);
    }

    fn after_close(&self, conn: &Arc<Connection>) {
        self.hooks.invoke_close(conn);
    }
}

struct ServerInner {
    registry: Arc<RwLock<MethodRegistry>>,
    hooks: Arc<HookRegistry>,
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
    codec: PayloadCodec,
    byte_order: ByteOrder,
    connection_timeout_ms: Arc<AtomicU64>,
}

impl ServerInner {
    fn accept(self: &Arc<Self>, stream: TcpStream) {
        let watcher = Arc::new(ServerWatcher::new(
            self.hooks.clone(),
            self.connection_timeout_ms.clone(),
        ));
        let conn = Connection::spawn_tcp(
            stream,
            self.registry.clone(),
            watcher,
            self.byte_order,
            self.codec,
        );

        self.connections
            .write()
            .unwrap()
            .insert(conn.id(), conn.clone());
        self.hooks.invoke_connect(&conn);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::debug!(peer = %addr, "accepted connection");
                    self.accept(stream);
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }
}

/// Server endpoint of peerwire connections.
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    pub fn new(byte_order: ByteOrder, codec: PayloadCodec) -> Self {
        let inner = Arc::new(ServerInner {
            registry: Arc::new(RwLock::new(MethodRegistry::new())),
            hooks: Arc::new(HookRegistry::new()),
            connections: RwLock::new(HashMap::with_capacity(8)),
            codec,
            byte_order,
            connection_timeout_ms: Arc::new(AtomicU64::new(
                DEFAULT_CONNECTION_TIMEOUT.as_millis() as u64,
            )),
        });

        let weak: Weak<ServerInner> = Arc::downgrade(&inner);
        inner
            .hooks
            .add_close_hook("RpcServer.untrack", move |conn| {
                if let Some(inner) = weak.upgrade() {
                    inner.connections.write().unwrap().remove(&conn.id());
                }
            })
            .expect("close slot is empty at construction");

        Self { inner }
    }

    /// Bind `addr` and start accepting connections.
    pub async fn start(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "listening");
        self.start_on_listener(listener);
        Ok(())
    }

    /// Start accepting on an already-bound listener.
    pub fn start_on_listener(&self, listener: TcpListener) {
        tokio::spawn(self.inner.clone().accept_loop(listener));
    }

    pub fn get_connection(&self, connection_id: u64) -> Option<Arc<Connection>> {
        self.inner
            .connections
            .read()
            .unwrap()
            .get(&connection_id)
            .cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().unwrap().len()
    }

    /// Keepalive-silence window; applies to live connections immediately.
    pub fn set_connection_timeout(&self, timeout: Duration) {
        self.inner
            .connection_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn register_func<F, P, R, Fut>(&self, module: &str, method: &str, handler: F) -> Result<()>
    where
        F: Fn(Arc<Connection>, P) -> Fut + Send + Sync + 'static,
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: std::future::Future<Output = Result<R>> + Send + 'static,
    {
        self.inner
            .registry
            .write()
            .unwrap()
            .register_func(module, method, handler)
    }

    pub fn register_service<S: Service>(&self, service: S) -> Result<()> {
        self.inner.registry.write().unwrap().register_service(service)
    }

    /// Log every registered method at debug level.
    pub fn record_methods(&self) {
        self.inner.registry.read().unwrap().record_methods();
    }

    pub fn add_connect_hook(
        &self,
        name: &str,
        hook: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) -> Result<()> {
        self.inner.hooks.add_connect_hook(name, hook)
    }

    pub fn add_close_hook(
        &self,
        name: &str,
        hook: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) -> Result<()> {
        self.inner.hooks.add_close_hook(name, hook)
    }

    pub fn add_after_send_hook(
        &self,
        name: &str,
        hook: impl Fn(&Arc<Connection>, &Frame) + Send + Sync + 'static,
    ) -> Result<()> {
        self.inner.hooks.add_after_send_hook(name, hook)
    }

    pub fn add_send_schedule_hook(
        &self,
        name: &str,
        hook: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) -> Result<()> {
        self.inner.hooks.add_send_schedule_hook(name, hook)
    }

    pub fn add_before_handle_frame_hook(
        &self,
        name: &str,
        hook: impl Fn(&Arc<Connection>, &Frame) -> Result<bool> + Send + Sync + 'static,
    ) -> Result<()> {
        self.inner.hooks.add_before_handle_frame_hook(name, hook)
    }

    pub fn add_after_invoke_hook(
        &self,
        name: &str,
        hook: impl Fn(&Arc<Connection>, &Frame, &Result<Bytes>) + Send + Sync + 'static,
    ) -> Result<()> {
        self.inner.hooks.add_after_invoke_hook(name, hook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_method_rejected_at_server() {
        let server = RpcServer::new(ByteOrder::Big, PayloadCodec::Json);
        server
            .register_func("global", "Hello", |_conn, _: ()| async { Ok(()) })
            .unwrap();

        let result = server.register_func("global", "Hello", |_conn, _: ()| async { Ok(()) });
        assert!(matches!(result, Err(RpcError::DuplicateMethod(_))));
    }

    #[tokio::test]
    async fn test_connection_tracking() {
        let server = RpcServer::new(ByteOrder::Big, PayloadCodec::Json);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        server.start_on_listener(listener);

        assert_eq!(server.connection_count(), 0);

        let stream = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.connection_count(), 1);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.connection_count(), 0);
    }
}
