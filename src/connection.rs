//! Connection engine: the per-connection send/receive/dispatch pipeline.
//!
//! One [`Connection`] owns one byte stream and three workers:
//!
//! ```text
//! socket ─► receive loop ──► correlation (responses) ─► pending table
//!                        └─► dispatch queue ─► dispatch loop ─► registry
//! callers ─► outbound queue ─► send loop ─► socket
//! ```
//!
//! The workers are independently scheduled tasks coordinated by bounded
//! queues, so a slow peer backpressures callers instead of growing memory.
//! Close is funneled through a single compare-and-set: whichever trigger wins
//! (read error, write error, explicit close, watchdog) runs the teardown
//! sequence exactly once.

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::codec::PayloadCodec;
use crate::error::{Result, RpcError};
use crate::pending::{CompletionReceiver, PendingRequest, PendingTable};
use crate::protocol::{ByteOrder, Frame, FrameBuffer};
use crate::registry::MethodRegistry;
use crate::watcher::ConnectionWatcher;

/// Depth of the outbound and dispatch queues.
pub const QUEUE_CAPACITY: usize = 1024;

/// Default expiry for calls issued without an explicit timeout.
pub const DEFAULT_REQUEST_EXPIRY: Duration = Duration::from_secs(120);

/// Send-loop poll delay while the outbound queue is empty.
const SEND_POLL_INTERVAL: Duration = Duration::from_millis(5);

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// An entry on the outbound queue: the frame plus, for calls expecting a
/// reply, the pending entry to fail if the write never happens.
struct Outbound {
    frame: Frame,
    pending: Option<Arc<PendingRequest>>,
}

/// One physical byte stream plus its protocol state.
pub struct Connection {
    id: u64,
    peer_addr: String,
    state: AtomicU8,
    request_id: AtomicU32,
    request_expiry_ms: AtomicU64,
    pending: PendingTable,
    outbound_tx: mpsc::Sender<Outbound>,
    dispatch_tx: mpsc::Sender<Option<Frame>>,
    registry: Arc<RwLock<MethodRegistry>>,
    watcher: Arc<dyn ConnectionWatcher>,
    codec: PayloadCodec,
    byte_order: ByteOrder,
    shutdown: Notify,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Spawn the three workers over an already-established stream pair.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        peer_addr: String,
        registry: Arc<RwLock<MethodRegistry>>,
        watcher: Arc<dyn ConnectionWatcher>,
        byte_order: ByteOrder,
        codec: PayloadCodec,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(QUEUE_CAPACITY);

        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            state: AtomicU8::new(STATE_OPEN),
            // Random seed so ids rarely collide across reconnect cycles.
            request_id: AtomicU32::new(rand::random()),
            request_expiry_ms: AtomicU64::new(DEFAULT_REQUEST_EXPIRY.as_millis() as u64),
            pending: PendingTable::new(),
            outbound_tx,
            dispatch_tx,
            registry,
            watcher,
            codec,
            byte_order,
            shutdown: Notify::new(),
            workers: Mutex::new(Vec::with_capacity(3)),
        });

        let mut workers = conn.workers.lock().unwrap();
        workers.push(tokio::spawn(Self::receive_loop(conn.clone(), reader)));
        workers.push(tokio::spawn(Self::send_loop(conn.clone(), writer, outbound_rx)));
        workers.push(tokio::spawn(Self::dispatch_loop(conn.clone(), dispatch_rx)));
        drop(workers);

        conn
    }

    /// Spawn over a TCP stream, splitting it into its two halves.
    pub fn spawn_tcp(
        stream: TcpStream,
        registry: Arc<RwLock<MethodRegistry>>,
        watcher: Arc<dyn ConnectionWatcher>,
        byte_order: ByteOrder,
        codec: PayloadCodec,
    ) -> Arc<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let (reader, writer) = stream.into_split();
        Self::spawn(reader, writer, peer_addr, registry, watcher, byte_order, codec)
    }

    /// Process-unique connection id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer address, or an empty string when the stream has none.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_OPEN
    }

    pub fn codec(&self) -> PayloadCodec {
        self.codec
    }

    /// Default expiry applied by `call`/`call_async`.
    pub fn request_expiry(&self) -> Duration {
        Duration::from_millis(self.request_expiry_ms.load(Ordering::Relaxed))
    }

    pub fn set_request_expiry(&self, expiry: Duration) {
        self.request_expiry_ms
            .store(expiry.as_millis() as u64, Ordering::Relaxed);
    }

    /// Allocate the next request id (wrapping; uniqueness only matters among
    /// concurrently outstanding requests).
    pub(crate) fn next_request_id(&self) -> u32 {
        self.request_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Queue a frame without blocking; used by watchers on the sync paths
    /// (keepalive emission, keepalive responses).
    pub(crate) fn try_enqueue(&self, frame: Frame) -> Result<()> {
        self.outbound_tx
            .try_send(Outbound { frame, pending: None })
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Call a method and wait for its typed result.
    pub async fn call<P, R>(self: &Arc<Self>, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_timeout(method, params, self.request_expiry()).await
    }

    /// Call a method, failing locally after `timeout` if no response arrived.
    pub async fn call_timeout<P, R>(
        self: &Arc<Self>,
        method: &str,
        params: &P,
        timeout: Duration,
    ) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_async_timeout(method, params, timeout).await?.wait().await
    }

    /// Issue a call and return a handle to await later.
    pub async fn call_async<P, R>(self: &Arc<Self>, method: &str, params: &P) -> Result<CallHandle<R>>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_async_timeout(method, params, self.request_expiry()).await
    }

    /// Issue a call with an explicit expiry and return its handle.
    pub async fn call_async_timeout<P, R>(
        self: &Arc<Self>,
        method: &str,
        params: &P,
        timeout: Duration,
    ) -> Result<CallHandle<R>>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }

        let body = self.codec.encode(params)?;
        let request_id = self.next_request_id();
        let (pending, signal) = PendingRequest::new(request_id, Instant::now() + timeout);
        let frame = Frame::request(method, Bytes::from(body), request_id, true);

        self.pending.add(pending.clone());
        if self
            .outbound_tx
            .send(Outbound { frame, pending: Some(pending) })
            .await
            .is_err()
        {
            self.pending.remove(request_id);
            return Err(RpcError::ConnectionClosed);
        }

        Ok(CallHandle {
            signal,
            codec: self.codec,
            _marker: PhantomData,
        })
    }

    /// Fire-and-forget call: no response expected, no pending entry.
    pub async fn notify<P>(self: &Arc<Self>, method: &str, params: &P) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }

        let body = self.codec.encode(params)?;
        let frame = Frame::request(method, Bytes::from(body), self.next_request_id(), false);
        self.outbound_tx
            .send(Outbound { frame, pending: None })
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Close the connection and wait for all three workers to exit.
    ///
    /// Safe to call any number of times; only the first has any effect.
    /// Must not be called from inside a registered method — that would join
    /// the dispatch worker from itself.
    pub async fn close(self: &Arc<Self>) {
        self.begin_close(&RpcError::ConnectionClosed);

        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        self.state.store(STATE_CLOSED, Ordering::Release);
    }

    /// Run the teardown sequence once; every later trigger is a no-op.
    pub(crate) fn begin_close(self: &Arc<Self>, err: &RpcError) {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // Unblock the dispatch loop; if the queue is full it will observe the
        // state flag on its next message instead.
        let _ = self.dispatch_tx.try_send(None);

        self.pending.fail_all(|| RpcError::ConnectionClosed);

        // Wake the receive loop out of a blocked read.
        self.shutdown.notify_one();

        self.watcher.after_close(self);
        tracing::debug!(peer = %self.peer_addr, error = %err, "connection closed");
    }

    async fn receive_loop<R: AsyncRead + Unpin>(conn: Arc<Self>, mut reader: R) {
        let mut frame_buffer = FrameBuffer::new(conn.byte_order);
        let mut buf = vec![0u8; 64 * 1024];

        let err = 'outer: loop {
            if conn.is_closed() {
                break 'outer RpcError::ConnectionClosed;
            }

            let n = tokio::select! {
                result = reader.read(&mut buf) => match result {
                    Ok(0) => break 'outer RpcError::Io(std::io::ErrorKind::UnexpectedEof.into()),
                    Ok(n) => n,
                    Err(e) => break 'outer RpcError::Io(e),
                },
                _ = conn.shutdown.notified() => break 'outer RpcError::ConnectionClosed,
            };

            let frames = match frame_buffer.push(&buf[..n]) {
                Ok(frames) => frames,
                Err(e) => break 'outer e,
            };

            for frame in frames {
                match conn.watcher.before_handle_frame(&conn, &frame) {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(peer = %conn.peer_addr, error = %e, "frame hook error");
                        continue;
                    }
                }

                if frame.is_malformed() {
                    tracing::warn!(peer = %conn.peer_addr, "dropping malformed frame");
                    continue;
                }

                if !frame.is_request() {
                    conn.correlate(frame);
                } else if conn.dispatch_tx.send(Some(frame)).await.is_err() {
                    break 'outer RpcError::ConnectionClosed;
                }
            }
        };

        conn.begin_close(&err);
    }

    /// Match a response frame to its pending request; unmatched responses
    /// (late, duplicate, cancelled) are dropped.
    fn correlate(&self, frame: Frame) {
        let Some(pending) = self.pending.get(frame.response_frame_id) else {
            tracing::debug!(
                response_id = frame.response_frame_id,
                "dropping unmatched response"
            );
            return;
        };

        if frame.is_error() {
            let message = String::from_utf8_lossy(&frame.body).into_owned();
            pending.complete(Err(RpcError::Remote(message)));
        } else {
            pending.complete(Ok(frame.body));
        }
        self.pending.remove(pending.request_id());
    }

    async fn send_loop<W: AsyncWrite + Unpin>(
        conn: Arc<Self>,
        mut writer: W,
        mut outbound_rx: mpsc::Receiver<Outbound>,
    ) {
        let mut close_err: Option<RpcError> = None;

        'outer: while !conn.is_closed() {
            match outbound_rx.try_recv() {
                Ok(item) => {
                    let bytes = item.frame.encode(conn.byte_order);
                    match writer.write_all(&bytes).await {
                        Ok(()) => {
                            let _ = writer.flush().await;
                            conn.watcher.after_send(&conn, &item.frame);
                        }
                        Err(e) => {
                            if let Some(pending) = item.pending {
                                pending.complete(Err(RpcError::ConnectionClosed));
                                conn.pending.remove(pending.request_id());
                            }
                            close_err = Some(RpcError::Io(e));
                            break 'outer;
                        }
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    tokio::time::sleep(SEND_POLL_INTERVAL).await;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }

            if let Err(e) = conn.watcher.send_schedule(&conn) {
                close_err = Some(e);
                break;
            }

            conn.pending.sweep_expired(Instant::now());
        }

        // Abandon whatever is still queued; each entry is failed and removed.
        while let Ok(item) = outbound_rx.try_recv() {
            if let Some(pending) = item.pending {
                pending.complete(Err(RpcError::ConnectionClosed));
                conn.pending.remove(pending.request_id());
            }
        }

        let _ = writer.shutdown().await;
        conn.begin_close(&close_err.unwrap_or(RpcError::ConnectionClosed));
    }

    async fn dispatch_loop(conn: Arc<Self>, mut dispatch_rx: mpsc::Receiver<Option<Frame>>) {
        while let Some(message) = dispatch_rx.recv().await {
            let Some(frame) = message else {
                break; // close sentinel
            };
            if conn.is_closed() {
                break;
            }
            conn.handle_request(frame).await;
        }
    }

    /// Resolve, invoke, and (when owed) answer one inbound request frame.
    async fn handle_request(self: &Arc<Self>, frame: Frame) {
        let method_name = frame.method_name_str().into_owned();

        let invocation = {
            let registry = self.registry.read().unwrap();
            registry
                .resolve(&method_name)
                .map(|descriptor| descriptor.invoke(self.clone(), frame.body.clone()))
        };

        let result = match invocation {
            Some(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(RpcError::InvokeFault(method_name.clone())),
            },
            None => {
                tracing::error!(method = %method_name, "method not found");
                Err(RpcError::MethodNotFound(method_name.clone()))
            }
        };

        self.watcher.after_invoke(self, &frame, &result);

        if !frame.needs_response() {
            if let Err(e) = result {
                tracing::warn!(method = %method_name, error = %e, "no-response invocation failed");
            }
            return;
        }

        let mut response = Frame::response(&frame, Bytes::new(), self.next_request_id());
        match result {
            Ok(body) => response.body = body,
            Err(e) => response.set_error(&e.to_string()),
        }

        if self
            .outbound_tx
            .send(Outbound { frame: response, pending: None })
            .await
            .is_err()
        {
            tracing::debug!(method = %method_name, "response dropped, connection closing");
        }
    }
}

/// Typed handle to an in-flight async call.
pub struct CallHandle<R> {
    signal: CompletionReceiver,
    codec: PayloadCodec,
    _marker: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> CallHandle<R> {
    /// Wait for the completion signal and decode the result.
    ///
    /// Yields the remote error, a timeout, or a connection-closed error when
    /// the call did not complete normally.
    pub async fn wait(self) -> Result<R> {
        let body = self
            .signal
            .await
            .map_err(|_| RpcError::ConnectionClosed)??;
        self.codec.decode(&body)
    }
}
