//! Stream bridge between a media producer and an encoder
//!
//! A one-slot channel of opaque byte chunks. A write waits until the previous
//! chunk has been taken by the reader, so a slow encoder throttles capture
//! instead of letting frames pile up in memory.

use thiserror::Error;
use tokio::sync::mpsc;

/// Write failed because the reading end is gone
#[derive(Debug, Error, PartialEq, Eq)]
#[error("stream bridge closed by reader")]
pub struct BridgeClosed;

/// Create a connected writer/reader pair
pub fn stream_bridge() -> (BridgeWriter, BridgeReader) {
    let (tx, rx) = mpsc::channel(1);
    (BridgeWriter { tx }, BridgeReader { rx })
}

/// Producer end. Dropping it signals end-of-stream once buffered data drains.
#[derive(Debug)]
pub struct BridgeWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl BridgeWriter {
    /// Send one chunk, waiting for room in the bridge
    ///
    /// Fails immediately if the reader has been dropped or closed, including
    /// while this call is waiting.
    pub async fn write(&self, chunk: Vec<u8>) -> Result<(), BridgeClosed> {
        self.tx.send(chunk).await.map_err(|_| BridgeClosed)
    }

    /// Resolves once the reader has gone away
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Consumer end
#[derive(Debug)]
pub struct BridgeReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl BridgeReader {
    /// Next chunk in write order, or `None` at end-of-stream
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Stop accepting chunks; pending and future writes fail
    pub fn close(&mut self) {
        self.rx.close();
    }
}
