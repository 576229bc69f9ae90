//! In-process doubles for the transport and the outbound sink.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use crate::connection::{Connector, FrameSink, Link};
use crate::errors::AppError;
use crate::protocol::OutboundFrame;

/// Server end of one mock transport.
pub(crate) struct MockServer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<String>>,
}

impl MockServer {
    pub async fn next_frame(&mut self) -> Value {
        let text = timeout(Duration::from_secs(300), self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the transport");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }

    /// Everything the client has sent that was not read yet.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            frames.push(serde_json::from_str(&text).expect("client sent invalid JSON"));
        }
        frames
    }

    pub fn push(&self, frame: Value) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(frame.to_string());
        }
    }

    /// Simulates the server dropping the connection.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }

    /// Waits until the client has closed its side.
    pub async fn closed(&mut self) -> bool {
        loop {
            match timeout(Duration::from_secs(300), self.from_client.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }
}

pub(crate) struct MockConnector {
    servers: mpsc::UnboundedSender<MockServer>,
    refusals: AtomicU32,
    opens: Mutex<Vec<Instant>>,
}

impl MockConnector {
    pub fn refuse_next(&self, count: u32) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().clone()
    }
}

pub(crate) fn mock_connector() -> (Arc<MockConnector>, mpsc::UnboundedReceiver<MockServer>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = MockConnector {
        servers: tx,
        refusals: AtomicU32::new(0),
        opens: Mutex::new(Vec::new()),
    };
    (Arc::new(connector), rx)
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self) -> Result<Link, AppError> {
        self.opens.lock().unwrap().push(Instant::now());
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(AppError::TransportClosed("connection refused".into()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.servers.send(MockServer { from_client: out_rx, to_client: Some(in_tx) });
        Ok(Link { outbound: out_tx, inbound: in_rx })
    }
}

/// Records every frame; can pretend to be offline.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    frames: Arc<Mutex<Vec<OutboundFrame>>>,
    offline: Arc<AtomicBool>,
}

impl RecordingSink {
    pub fn frames(&self) -> Vec<OutboundFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl FrameSink for RecordingSink {
    fn send_frame(&self, frame: OutboundFrame) -> bool {
        if self.offline.load(Ordering::SeqCst) {
            return false;
        }
        self.frames.lock().unwrap().push(frame);
        true
    }
}
