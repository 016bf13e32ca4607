//! Lifecycle watcher contract and the named hook registry.
//!
//! The connection engine is lifecycle-agnostic: the receive, send, and
//! dispatch loops report into a [`ConnectionWatcher`] at fixed points, and the
//! client/server variants supply the behavior (keepalive emission, watchdog,
//! frame filtering). External code attaches to the same points through the
//! [`HookRegistry`]'s named slots without touching the engine.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::connection::Connection;
use crate::error::{Result, RpcError};
use crate::protocol::Frame;

/// Hook invoked with the connection only (connect, close, send-schedule).
pub type ConnHook = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;
/// Hook invoked after a frame is written.
pub type AfterSendHook = Box<dyn Fn(&Arc<Connection>, &Frame) + Send + Sync>;
/// Pre-dispatch filter. `Ok(true)` claims the frame, short-circuiting
/// dispatch; `Err` aborts processing of that frame.
pub type BeforeHandleFrameHook =
    Box<dyn Fn(&Arc<Connection>, &Frame) -> Result<bool> + Send + Sync>;
/// Hook invoked after a method invocation completes, before the response is
/// queued.
pub type AfterInvokeHook = Box<dyn Fn(&Arc<Connection>, &Frame, &Result<Bytes>) + Send + Sync>;

/// Per-worker callbacks the connection engine reports into.
pub trait ConnectionWatcher: Send + Sync + 'static {
    /// Runs on the send loop after each frame is written.
    fn after_send(&self, conn: &Arc<Connection>, frame: &Frame);

    /// Runs on every send-loop tick. Returning an error closes the
    /// connection with that error.
    fn send_schedule(&self, conn: &Arc<Connection>) -> Result<()>;

    /// Runs on the receive loop for every decoded frame, before the
    /// malformed check and dispatch. `Ok(true)` swallows the frame.
    fn before_handle_frame(&self, conn: &Arc<Connection>, frame: &Frame) -> Result<bool>;

    /// Runs on the dispatch loop once a method invocation finished.
    fn after_invoke(&self, conn: &Arc<Connection>, frame: &Frame, result: &Result<Bytes>);

    /// Runs exactly once, inside the close sequence.
    fn after_close(&self, conn: &Arc<Connection>);
}

/// Named callback slots shared by lifecycle extensions and user code.
///
/// Registration under an already-used name fails; invocation order across
/// independently registered hooks of one slot is unspecified.
#[derive(Default)]
pub struct HookRegistry {
    connect: RwLock<HashMap<String, ConnHook>>,
    close: RwLock<HashMap<String, ConnHook>>,
    after_send: RwLock<HashMap<String, AfterSendHook>>,
    send_schedule: RwLock<HashMap<String, ConnHook>>,
    before_handle_frame: RwLock<HashMap<String, BeforeHandleFrameHook>>,
    after_invoke: RwLock<HashMap<String, AfterInvokeHook>>,
}

fn insert_hook<H>(slot: &RwLock<HashMap<String, H>>, name: &str, hook: H) -> Result<()> {
    let mut slot = slot.write().unwrap();
    if slot.contains_key(name) {
        return Err(RpcError::HookExists(name.to_string()));
    }
    slot.insert(name.to_string(), hook);
    Ok(())
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connect_hook(
        &self,
        name: &str,
        hook: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) -> Result<()> {
        insert_hook(&self.connect, name, Box::new(hook))
    }

    pub fn add_close_hook(
        &self,
        name: &str,
        hook: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) -> Result<()> {
        insert_hook(&self.close, name, Box::new(hook))
    }

    pub fn add_after_send_hook(
        &self,
        name: &str,
        hook: impl Fn(&Arc<Connection>, &Frame) + Send + Sync + 'static,
    ) -> Result<()> {
        insert_hook(&self.after_send, name, Box::new(hook))
    }

    pub fn add_send_schedule_hook(
        &self,
        name: &str,
        hook: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) -> Result<()> {
        insert_hook(&self.send_schedule, name, Box::new(hook))
    }

    pub fn add_before_handle_frame_hook(
        &self,
        name: &str,
        hook: impl Fn(&Arc<Connection>, &Frame) -> Result<bool> + Send + Sync + 'static,
    ) -> Result<()> {
        insert_hook(&self.before_handle_frame, name, Box::new(hook))
    }

    pub fn add_after_invoke_hook(
        &self,
        name: &str,
        hook: impl Fn(&Arc<Connection>, &Frame, &Result<Bytes>) + Send + Sync + 'static,
    ) -> Result<()> {
        insert_hook(&self.after_invoke, name, Box::new(hook))
    }

    pub fn invoke_connect(&self, conn: &Arc<Connection>) {
        for hook in self.connect.read().unwrap().values() {
            hook(conn);
        }
    }

    pub fn invoke_close(&self, conn: &Arc<Connection>) {
        for hook in self.close.read().unwrap().values() {
            hook(conn);
        }
    }

    pub fn invoke_after_send(&self, conn: &Arc<Connection>, frame: &Frame) {
        for hook in self.after_send.read().unwrap().values() {
            hook(conn, frame);
        }
    }

    pub fn invoke_send_schedule(&self, conn: &Arc<Connection>) {
        for hook in self.send_schedule.read().unwrap().values() {
            hook(conn);
        }
    }

    /// Fan out until some hook claims the frame or errors.
    pub fn invoke_before_handle_frame(
        &self,
        conn: &Arc<Connection>,
        frame: &Frame,
    ) -> Result<bool> {
        for hook in self.before_handle_frame.read().unwrap().values() {
            if hook(conn, frame)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn invoke_after_invoke(&self, conn: &Arc<Connection>, frame: &Frame, result: &Result<Bytes>) {
        for hook in self.after_invoke.read().unwrap().values() {
            hook(conn, frame, result);
        }
    }
}

/// Watcher that only fans out to a hook registry.
///
/// Used for connections with no lifecycle extension of their own (tests,
/// embedding the engine directly).
pub struct HookWatcher {
    hooks: Arc<HookRegistry>,
}

impl HookWatcher {
    pub fn new(hooks: Arc<HookRegistry>) -> Self {
        Self { hooks }
    }
}

impl ConnectionWatcher for HookWatcher {
    fn after_send(&self, conn: &Arc<Connection>, frame: &Frame) {
        self.hooks.invoke_after_send(conn, frame);
    }

    fn send_schedule(&self, conn: &Arc<Connection>) -> Result<()> {
        self.hooks.invoke_send_schedule(conn);
        Ok(())
    }

    fn before_handle_frame(&self, conn: &Arc<Connection>, frame: &Frame) -> Result<bool> {
        self.hooks.invoke_before_handle_frame(conn, frame)
    }

    fn after_invoke(&self, conn: &Arc<Connection>, frame: &Frame, result: &Result<Bytes>) {
        self.hooks.invoke_after_invoke(conn, frame, result);
    }

    fn after_close(&self, conn: &Arc<Connection>) {
        self.hooks.invoke_close(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_hook_name_rejected() {
        let hooks = HookRegistry::new();
        hooks.add_close_hook("a", |_conn| {}).unwrap();

        let result = hooks.add_close_hook("a", |_conn| {});
        assert!(matches!(result, Err(RpcError::HookExists(name)) if name == "a"));

        // Same name in a different slot is fine.
        hooks.add_connect_hook("a", |_conn| {}).unwrap();
    }

    #[test]
    fn test_slots_are_independent() {
        let hooks = HookRegistry::new();
        hooks.add_close_hook("x", |_conn| {}).unwrap();
        hooks.add_after_send_hook("x", |_conn, _frame| {}).unwrap();
        hooks.add_send_schedule_hook("x", |_conn| {}).unwrap();
        hooks
            .add_before_handle_frame_hook("x", |_conn, _frame| Ok(false))
            .unwrap();
        hooks
            .add_after_invoke_hook("x", |_conn, _frame, _result| {})
            .unwrap();
    }
}
