//! RPC client: dials a peer, keeps the connection alive, reconnects.
//!
//! The client owns at most one live [`Connection`]. `start` makes one
//! synchronous connection attempt; with auto-reconnect enabled, a background
//! loop keeps retrying on a fixed interval until it succeeds or the client is
//! stopped. Every `start` mints a fresh generation token, so a stale
//! reconnect loop that wakes up after a new `start` (or a `close`) finds its
//! token invalidated and exits instead of racing the new connection.
//!
//! The keepalive sender piggybacks on the connection's send-schedule tick:
//! whenever more than the configured interval has elapsed, it emits a
//! zero-body keepalive request.
//!
//! # Example
//!
//! ```ignore
//! let client = RpcClient::new(ByteOrder::Big, PayloadCodec::Json);
//! client.start("127.0.0.1:50001", true).await?;
//! let say: String = client.call("global_Hello", "qqnihao").await?;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;

use crate::codec::PayloadCodec;
use crate::connection::{CallHandle, Connection};
use crate::error::{Result, RpcError};
use crate::protocol::{ByteOrder, Frame};
use crate::registry::{MethodRegistry, Service};
use crate::watcher::{ConnectionWatcher, HookRegistry};

/// Default interval between keepalive emissions.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Fixed delay between reconnection attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// Client-side lifecycle watcher: keepalive sender plus hook fan-out.
struct ClientWatcher {
    hooks: Arc<HookRegistry>,
    keepalive_interval_ms: Arc<AtomicU64>,
    last_keepalive_sent: Mutex<Instant>,
}

impl ClientWatcher {
    fn new(hooks: Arc<HookRegistry>, keepalive_interval_ms: Arc<AtomicU64>) -> Self {
        Self {
            hooks,
            keepalive_interval_ms,
            last_keepalive_sent: Mutex::new(Instant::now()),
        }
    }
}

impl ConnectionWatcher for ClientWatcher {
    fn after_send(&self, conn: &Arc<Connection>, frame: &Frame) {
        self.hooks.invoke_after_send(conn, frame);
    }

    fn send_schedule(&self, conn: &Arc<Connection>) -> Result<()> {
        let interval = Duration::from_millis(self.keepalive_interval_ms.load(Ordering::Relaxed));
        let mut last_sent = self.last_keepalive_sent.lock().unwrap();
        if last_sent.elapsed() > interval {
            if let Err(e) = conn.try_enqueue(Frame::keepalive(conn.next_request_id())) {
                tracing::debug!(peer = %conn.peer_addr(), error = %e, "keepalive enqueue failed");
            }
            // Stamped even on failure, so a full queue cannot retrigger the
            // emission on every tick.
            *last_sent = Instant::now();
        }
        drop(last_sent);

        self.hooks.invoke_send_schedule(conn);
        Ok(())
    }

    fn before_handle_frame(&self, conn: &Arc<Connection>, frame: &Frame) -> Result<bool> {
        if frame.is_keepalive() {
            tracing::debug!(peer = %conn.peer_addr(), "keepalive received");
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

struct ClientState {
    connection: Option<Arc<Connection>>,
    /// Generation token; `true` means this generation is dead. Replaced on
    /// every `start`/`close` so stale reconnect loops self-terminate.
    stopped: Arc<AtomicBool>,
    auto_reconnect: bool,
    addr: String,
}

struct ClientInner {
    registry: Arc<RwLock<MethodRegistry>>,
    hooks: Arc<HookRegistry>,
    codec: PayloadCodec,
    byte_order: ByteOrder,
    keepalive_interval_ms: Arc<AtomicU64>,
    state: Mutex<ClientState>,
}

impl ClientInner {
    /// Wrap a freshly dialed stream into a connection, unless the generation
    /// that initiated the dial has been superseded in the meantime.
    fn attach(self: &Arc<Self>, stream: TcpStream, token: &Arc<AtomicBool>) {
        let watcher = Arc::new(ClientWatcher::new(
            self.hooks.clone(),
            self.keepalive_interval_ms.clone(),
        ));
        let conn = Connection::spawn_tcp(
            stream,
            self.registry.clone(),
            watcher,
            self.byte_order,
            self.codec,
        );

        {
            let mut state = self.state.lock().unwrap();
            if !Arc::ptr_eq(&state.stopped, token) || token.load(Ordering::Acquire) {
                drop(state);
                tracing::info!(peer = %conn.peer_addr(), "connection superseded, dropping");
                tokio::spawn(async move { conn.close().await });
                return;
            }
            state.connection = Some(conn.clone());
        }

        tracing::info!(peer = %conn.peer_addr(), "connected");
        self.hooks.invoke_connect(&conn);
    }

    async fn reconnect_loop(self: Arc<Self>, token: Arc<AtomicBool>, addr: String) {
        while !token.load(Ordering::Acquire) {
            tokio::time::sleep(RECONNECT_INTERVAL).await;
            if token.load(Ordering::Acquire) {
                return;
            }

            tracing::info!(%addr, "reconnecting");
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    self.attach(stream, &token);
                    return;
                }
                Err(e) => {
                    tracing::info!(%addr, error = %e, "connect failed");
                }
            }
        }
    }

    /// Re-arm reconnection after a connection closed.
    fn spawn_reconnect_if_needed(self: &Arc<Self>) {
        let (token, addr) = {
            let state = self.state.lock().unwrap();
            if !state.auto_reconnect || state.stopped.load(Ordering::Acquire) {
                return;
            }
            (state.stopped.clone(), state.addr.clone())
        };
        tokio::spawn(self.clone().reconnect_loop(token, addr));
    }
}

/// Client endpoint of a peerwire connection.
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    pub fn new(byte_order: ByteOrder, codec: PayloadCodec) -> Self {
        let inner = Arc::new(ClientInner {
            registry: Arc::new(RwLock::new(MethodRegistry::new())),
            hooks: Arc::new(HookRegistry::new()),
            codec,
            byte_order,
            keepalive_interval_ms: Arc::new(AtomicU64::new(
                DEFAULT_KEEPALIVE_INTERVAL.as_millis() as u64,
            )),
            state: Mutex::new(ClientState {
                connection: None,
                stopped: Arc::new(AtomicBool::new(true)),
                auto_reconnect: false,
                addr: String::new(),
            }),
        });

        let weak: Weak<ClientInner> = Arc::downgrade(&inner);
        inner
            .hooks
            .add_close_hook("RpcClient.reconnect", move |_conn| {
                if let Some(inner) = weak.upgrade() {
                    inner.spawn_reconnect_if_needed();
                }
            })
            .expect("close slot is empty at construction");

        Self { inner }
    }

    /// Connect to `addr`.
    ///
    /// One attempt is made inline. If it fails and `auto_reconnect` is set,
    /// a background loop keeps retrying and `start` returns Ok; otherwise the
    /// dial error is returned. Fails with [`RpcError::AlreadyConnected`] when
    /// a previous `start` is still in effect — call [`RpcClient::close`]
    /// first.
    pub async fn start(&self, addr: &str, auto_reconnect: bool) -> Result<()> {
        let token = self.begin_start(addr, auto_reconnect)?;

        tracing::info!(%addr, "connecting");
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                self.inner.attach(stream, &token);
                Ok(())
            }
            Err(e) => {
                if auto_reconnect {
                    tokio::spawn(
                        self.inner
                            .clone()
                            .reconnect_loop(token, addr.to_string()),
                    );
                    Ok(())
                } else {
                    token.store(true, Ordering::Release);
                    Err(RpcError::Io(e))
                }
            }
        }
    }

    /// Attach an externally established socket. No reconnect management.
    pub fn start_on_connection(&self, stream: TcpStream) -> Result<()> {
        let token = self.begin_start("", false)?;
        self.inner.attach(stream, &token);
        Ok(())
    }

    fn begin_start(&self, addr: &str, auto_reconnect: bool) -> Result<Arc<AtomicBool>> {
        let mut state = self.inner.state.lock().unwrap();

        if !state.stopped.load(Ordering::Acquire) {
            return Err(RpcError::AlreadyConnected);
        }
        if let Some(conn) = &state.connection {
            if !conn.is_closed() {
                return Err(RpcError::AlreadyConnected);
            }
        }

        let token = Arc::new(AtomicBool::new(false));
        state.stopped = token.clone();
        state.auto_reconnect = auto_reconnect;
        state.addr = addr.to_string();
        Ok(token)
    }

    /// Stop reconnection and close the live connection, waiting for its
    /// workers to exit. Calling it again is a no-op.
    pub async fn close(&self) {
        let conn = {
            let mut state = self.inner.state.lock().unwrap();
            state.stopped.store(true, Ordering::Release);
            state.stopped = Arc::new(AtomicBool::new(true));
            state.connection.take()
        };

        if let Some(conn) = conn {
            conn.close().await;
        }
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.state.lock().unwrap().connection.clone()
    }

    fn live_connection(&self) -> Result<Arc<Connection>> {
        match self.connection() {
            Some(conn) if !conn.is_closed() => Ok(conn),
            _ => Err(RpcError::NotConnected),
        }
    }

    /// Address passed to the last `start`, or the peer address of an
    /// externally attached connection.
    pub fn addr(&self) -> String {
        let state = self.inner.state.lock().unwrap();
        if !state.addr.is_empty() {
            return state.addr.clone();
        }
        state
            .connection
            .as_ref()
            .map(|conn| conn.peer_addr().to_string())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.live_connection().is_err()
    }

    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.live_connection()?.call(method, params).await
    }

    pub async fn call_timeout<P, R>(&self, method: &str, params: &P, timeout: Duration) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.live_connection()?
            .call_timeout(method, params, timeout)
            .await
    }

    pub async fn call_async<P, R>(&self, method: &str, params: &P) -> Result<CallHandle<R>>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.live_connection()?.call_async(method, params).await
    }

    pub async fn notify<P>(&self, method: &str, params: &P) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        self.live_connection()?.notify(method, params).await
    }

    /// Register a function callable by the peer (the server may call back).
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

    /// Interval between keepalive emissions (applies to the live connection
    /// immediately).
    pub fn set_keepalive_interval(&self, interval: Duration) {
        self.inner
            .keepalive_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
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
    async fn test_start_rejected_when_unreachable_without_reconnect() {
        let client = RpcClient::new(ByteOrder::Big, PayloadCodec::Json);
        // Reserved port that nothing listens on.
        let result = client.start("127.0.0.1:1", false).await;
        assert!(matches!(result, Err(RpcError::Io(_))));

        // A failed start leaves the client startable again.
        let result = client.start("127.0.0.1:1", false).await;
        assert!(matches!(result, Err(RpcError::Io(_))));
    }

    #[tokio::test]
    async fn test_call_without_connection() {
        let client = RpcClient::new(ByteOrder::Big, PayloadCodec::Json);
        let result: Result<String> = client.call("global_Hello", "x").await;
        assert!(matches!(result, Err(RpcError::NotConnected)));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // Hold accepted sockets open.
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = RpcClient::new(ByteOrder::Big, PayloadCodec::Json);
        client.start(&addr, false).await.unwrap();

        let result = client.start(&addr, false).await;
        assert!(matches!(result, Err(RpcError::AlreadyConnected)));

        client.close().await;
        // After close the client can start again.
        client.start(&addr, false).await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let client = RpcClient::new(ByteOrder::Big, PayloadCodec::Json);
        client.close().await;
        client.close().await;
    }
}
