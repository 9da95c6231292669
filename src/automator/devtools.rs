//! Minimal Chrome DevTools protocol client
//!
//! One websocket per target. Commands are matched to responses by id; events
//! are fanned out on a broadcast channel.

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// Protocol event pushed by the browser
#[derive(Debug, Clone)]
pub struct DevToolsEvent {
    pub method: String,
    pub params: Value,
}

/// Connection to a single DevTools target (browser or page)
pub struct DevToolsClient {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_id: AtomicU64,
    events: broadcast::Sender<DevToolsEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl DevToolsClient {
    /// Connect to a DevTools websocket endpoint
    pub async fn connect(url: &str) -> Result<Self> {
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to DevTools at {}", url))?;
        debug!("Connected to DevTools endpoint {}", url);

        let (mut sink, mut stream) = socket.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(64);

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("DevTools write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = {
            let pending = pending.clone();
            let events = events.clone();
            tokio::spawn(async move {
                while let Some(message) = stream.next().await {
                    let text = match message {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("DevTools read failed: {}", e);
                            break;
                        }
                    };

                    match serde_json::from_str::<Value>(&text) {
                        Ok(value) => dispatch(value, &pending, &events),
                        Err(e) => warn!("Unparseable DevTools message: {}", e),
                    }
                }

                // Fail every in-flight command; dropping the senders does that
                pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
            })
        };

        Ok(Self {
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            events,
            tasks: vec![writer, reader],
        })
    }

    /// Subscribe to protocol events
    pub fn subscribe(&self) -> broadcast::Receiver<DevToolsEvent> {
        self.events.subscribe()
    }

    /// Send a command and wait for its result
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        let request = json!({ "id": id, "method": method, "params": params });
        trace!("DevTools -> {}", request);
        if self.outgoing.send(Message::Text(request.to_string())).is_err() {
            self.forget(id);
            bail!("DevTools connection closed before {}", method);
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(result)) => result.with_context(|| format!("DevTools {} failed", method)),
            Ok(Err(_)) => bail!("DevTools connection closed during {}", method),
            Err(_) => {
                self.forget(id);
                bail!("DevTools {} timed out after {:?}", method, COMMAND_TIMEOUT)
            }
        }
    }

    /// Evaluate a JavaScript expression in the page and return its value
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .pointer("/exception/description")
                .or_else(|| details.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("unknown exception");
            bail!("Script threw: {}", text);
        }

        Ok(result
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

impl Drop for DevToolsClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Route one incoming message to its waiting command or to event subscribers
fn dispatch(message: Value, pending: &Pending, events: &broadcast::Sender<DevToolsEvent>) {
    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        let waiter = pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        let Some(waiter) = waiter else {
            trace!("Response for abandoned DevTools command {}", id);
            return;
        };

        let result = match message.get("error") {
            Some(error) => Err(anyhow!(
                "{}",
                error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown DevTools error")
            )),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = waiter.send(result);
        return;
    }

    if let Some(method) = message.get("method").and_then(Value::as_str) {
        let _ = events.send(DevToolsEvent {
            method: method.to_string(),
            params: message.get("params").cloned().unwrap_or(Value::Null),
        });
    }
}
