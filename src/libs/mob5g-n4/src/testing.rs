//! Test doubles shared by the engine unit tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mob5g_pfcp::header::PfcpHeader;
use mob5g_pfcp::message::{build_message, parse_message, PfcpMessage};
use tokio::sync::{mpsc, Mutex};

use crate::store::{KeyedStore, MemoryStore, StoreError, StoreResult};
use crate::transport::Transport;
use crate::xact::Correlator;

/// Transport that captures every datagram instead of sending it
pub(crate) struct MockTransport {
    tx: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    rx: Mutex<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>,
    sent: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            sent: AtomicUsize::new(0),
        })
    }

    /// Next captured datagram as sent
    pub(crate) async fn recv_raw(&self) -> (Bytes, SocketAddr) {
        self.rx.lock().await.recv().await.expect("transport closed")
    }

    /// Next captured datagram, decoded
    pub(crate) async fn recv(&self) -> (PfcpHeader, PfcpMessage, SocketAddr) {
        let (mut data, peer) = self.recv_raw().await;
        let (header, message) = parse_message(&mut data).expect("captured datagram decodes");
        (header, message, peer)
    }

    /// Captured datagram if one arrives within `wait`
    pub(crate) async fn try_recv(&self, wait: Duration) -> Option<(PfcpHeader, PfcpMessage, SocketAddr)> {
        tokio::time::timeout(wait, self.recv()).await.ok()
    }

    /// Datagrams sent so far, including retransmissions
    pub(crate) fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Deliver `message` to `correlator` as the answer to `request`
    pub(crate) async fn respond(&self, correlator: &Correlator, request: &PfcpHeader, message: PfcpMessage) {
        let mut data = build_message(&message, request.sequence_number)
            .expect("response encodes")
            .freeze();
        let (header, message) = parse_message(&mut data).expect("response decodes");
        correlator.on_response(&header, message).await;
    }
}

impl Transport for MockTransport {
    fn send(&self, data: Bytes, peer: SocketAddr) {
        self.sent.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send((data, peer));
    }
}

/// Store whose every operation fails
pub(crate) struct FailingStore;

#[async_trait]
impl KeyedStore for FailingStore {
    async fn put(&self, key: &str, _value: String, _ttl: Option<Duration>) -> StoreResult<()> {
        Err(StoreError::Unavailable(format!("put {key}")))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Err(StoreError::Unavailable(format!("get {key}")))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        Err(StoreError::Unavailable(format!("delete {key}")))
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Err(StoreError::Unavailable(format!("keys {prefix}")))
    }
}

/// In-memory store whose writes take `delay` to complete
pub(crate) struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

impl SlowStore {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl KeyedStore for SlowStore {
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.inner.keys(prefix).await
    }
}
