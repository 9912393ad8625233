//! Request transports
//!
//! A transport couples one client channel to one [`ProtocolServer`]. The
//! stateful HTTP mode keeps a transport alive per session and emits the
//! session id to the client; the stateless mode builds a one-shot
//! transport per request and tears it down with the response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use serde_json::Value;
use tokio::sync::mpsc;

use super::server::ProtocolServer;

/// Hook fired at most once when the transport closes.
pub type CloseHook = Box<dyn FnOnce() + Send>;

pub struct HttpTransport {
    session_id: Option<String>,
    server: Mutex<Option<Arc<dyn ProtocolServer>>>,
    close_hook: Mutex<Option<CloseHook>>,
    events: Mutex<Option<mpsc::Sender<Value>>>,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Transport bound to a session; responses carry `session_id` in the
    /// `Mcp-Session-Id` header.
    pub fn for_session(session_id: &str) -> Arc<Self> {
        Arc::new(Self {
            session_id: Some(session_id.to_string()),
            server: Mutex::new(None),
            close_hook: Mutex::new(None),
            events: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// One-shot transport for the stateless mode; emits no session id.
    pub fn one_shot() -> Arc<Self> {
        Arc::new(Self {
            session_id: None,
            server: Mutex::new(None),
            close_hook: Mutex::new(None),
            events: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Couples `server` to this transport. Dispatch fails until connected.
    pub fn connect(&self, server: Arc<dyn ProtocolServer>) {
        *self.server.lock().expect("transport lock") = Some(server);
    }

    pub fn set_close_hook(&self, hook: CloseHook) {
        *self.close_hook.lock().expect("transport lock") = Some(hook);
    }

    /// Forwards one JSON-RPC envelope to the connected server.
    ///
    /// Returns `None` for notifications, which produce no response body.
    pub async fn handle_request(&self, request: Value) -> Result<Option<Value>> {
        if self.is_closed() {
            return Err(anyhow!("transport is closed"));
        }

        let server = self
            .server
            .lock()
            .expect("transport lock")
            .clone()
            .ok_or_else(|| anyhow!("transport has no connected server"))?;

        Ok(server.handle_request(request).await)
    }

    /// Opens the server-sent event channel for this transport, replacing
    /// any previous subscriber.
    pub fn subscribe(&self) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(16);
        *self.events.lock().expect("transport lock") = Some(tx);
        rx
    }

    /// Pushes a server-initiated message to the event stream, if one is
    /// attached. Messages sent with no subscriber are dropped.
    pub async fn send_event(&self, message: Value) {
        let sender = self.events.lock().expect("transport lock").clone();
        if let Some(sender) = sender {
            let _ = sender.send(message).await;
        }
    }

    /// Closes the transport: fires the close hook at most once, drops the
    /// event channel so any SSE stream ends, and rejects further dispatch.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.events.lock().expect("transport lock").take();

        let hook = self.close_hook.lock().expect("transport lock").take();
        if let Some(hook) = hook {
            hook();
        }
    }
}
