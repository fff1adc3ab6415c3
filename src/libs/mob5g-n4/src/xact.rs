//! PFCP Request Correlator
//!
//! Outstanding requests are keyed by sequence number. A single timer task per
//! correlator retransmits requests whose response wait expired and fails the
//! caller once the retransmission budget is spent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use mob5g_pfcp::header::{PfcpHeader, PfcpMessageType};
use mob5g_pfcp::message::{build_message, PfcpMessage};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::Instant;

use crate::config::TimerConfig;
use crate::error::{N4Error, N4Result};
use crate::transport::Transport;

/// Matched response to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub message: PfcpMessage,
    /// Retransmissions sent before the response arrived
    pub retransmissions: u32,
}

/// Request waiting for its response
struct PendingRequest {
    message_type: PfcpMessageType,
    peer: SocketAddr,
    data: Bytes,
    deadline: Instant,
    retry_count: u32,
    reply: oneshot::Sender<N4Result<Response>>,
}

struct XactTable {
    next_sequence_number: u32,
    pending: HashMap<u32, PendingRequest>,
}

impl XactTable {
    /// Next sequence number not held by an outstanding request; 0 is never used
    fn alloc_sequence_number(&mut self) -> u32 {
        loop {
            let seq = self.next_sequence_number;
            self.next_sequence_number = self.next_sequence_number.wrapping_add(1);
            if self.next_sequence_number == 0 {
                self.next_sequence_number = 1;
            }
            if !self.pending.contains_key(&seq) {
                return seq;
            }
        }
    }
}

/// Sequence-number request/response correlator
pub struct Correlator {
    transport: Arc<dyn Transport>,
    timer: TimerConfig,
    table: Mutex<XactTable>,
    wakeup: Arc<Notify>,
    retransmissions: AtomicU64,
}

impl Correlator {
    /// Create a correlator and start its timer task
    pub fn new(transport: Arc<dyn Transport>, timer: TimerConfig) -> Arc<Self> {
        let wakeup = Arc::new(Notify::new());
        let correlator = Arc::new(Self {
            transport,
            timer,
            table: Mutex::new(XactTable {
                next_sequence_number: 1,
                pending: HashMap::new(),
            }),
            wakeup: wakeup.clone(),
            retransmissions: AtomicU64::new(0),
        });

        tokio::spawn(run_timer(Arc::downgrade(&correlator), wakeup));
        correlator
    }

    pub fn timer(&self) -> TimerConfig {
        self.timer
    }

    /// Send a request and wait for its response or retry exhaustion
    pub async fn request(&self, peer: SocketAddr, message: PfcpMessage) -> N4Result<Response> {
        let rx = self.submit(peer, message).await?;
        rx.await.map_err(|_| N4Error::Shutdown)?
    }

    /// Like [`request`](Self::request) but gives up after `timeout`.
    ///
    /// Retransmissions already scheduled keep running until the response
    /// arrives or the retry budget is spent.
    pub async fn request_with_timeout(
        &self,
        peer: SocketAddr,
        message: PfcpMessage,
        timeout: Duration,
    ) -> N4Result<Response> {
        let rx = self.submit(peer, message).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(result) => result.map_err(|_| N4Error::Shutdown)?,
            Err(_) => Err(N4Error::Timeout),
        }
    }

    async fn submit(
        &self,
        peer: SocketAddr,
        message: PfcpMessage,
    ) -> N4Result<oneshot::Receiver<N4Result<Response>>> {
        let message_type = message.message_type();
        let (reply, rx) = oneshot::channel();

        let (sequence_number, data) = {
            let mut table = self.table.lock().await;
            let sequence_number = table.alloc_sequence_number();
            let data = build_message(&message, sequence_number)?.freeze();
            table.pending.insert(
                sequence_number,
                PendingRequest {
                    message_type,
                    peer,
                    data: data.clone(),
                    deadline: Instant::now() + self.timer.duration,
                    retry_count: 0,
                    reply,
                },
            );
            (sequence_number, data)
        };

        log::debug!("[{}] {} sent to {}", sequence_number, message_type.name(), peer);
        self.transport.send(data, peer);
        self.wakeup.notify_one();
        Ok(rx)
    }

    /// Resolve the pending request matching this response.
    ///
    /// Returns `false` for duplicates, late responses and mismatched types.
    pub async fn on_response(&self, header: &PfcpHeader, message: PfcpMessage) -> bool {
        let mut table = self.table.lock().await;
        let matches = table
            .pending
            .get(&header.sequence_number)
            .is_some_and(|p| p.message_type.response_type() == Some(header.message_type));
        if !matches {
            log::debug!(
                "[{}] Unmatched {} dropped",
                header.sequence_number,
                header.message_type.name()
            );
            return false;
        }

        if let Some(pending) = table.pending.remove(&header.sequence_number) {
            log::debug!(
                "[{}] {} matched after {} retransmissions",
                header.sequence_number,
                header.message_type.name(),
                pending.retry_count
            );
            let _ = pending.reply.send(Ok(Response {
                message,
                retransmissions: pending.retry_count,
            }));
        }
        true
    }

    /// Number of requests awaiting a response
    pub async fn pending_count(&self) -> usize {
        self.table.lock().await.pending.len()
    }

    /// Total retransmissions sent by this correlator
    pub fn retransmissions(&self) -> u64 {
        self.retransmissions.load(Ordering::Relaxed)
    }

    /// Retransmit or fail expired requests; returns the next deadline
    async fn process_expired(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut resend = Vec::new();
        let mut failed = Vec::new();

        let next_deadline = {
            let mut table = self.table.lock().await;
            let expired: Vec<u32> = table
                .pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(seq, _)| *seq)
                .collect();

            for seq in expired {
                let exhausted = table
                    .pending
                    .get(&seq)
                    .is_some_and(|p| p.retry_count >= self.timer.max_count);
                if exhausted {
                    if let Some(pending) = table.pending.remove(&seq) {
                        failed.push((seq, pending));
                    }
                } else if let Some(pending) = table.pending.get_mut(&seq) {
                    pending.retry_count += 1;
                    pending.deadline = now + self.timer.duration;
                    resend.push((seq, pending.message_type, pending.retry_count, pending.data.clone(), pending.peer));
                }
            }

            table.pending.values().map(|p| p.deadline).min()
        };

        for (seq, message_type, retry_count, data, peer) in resend {
            log::debug!(
                "[{}] {} retransmitted to {} ({}/{})",
                seq,
                message_type.name(),
                peer,
                retry_count,
                self.timer.max_count
            );
            self.retransmissions.fetch_add(1, Ordering::Relaxed);
            self.transport.send(data, peer);
        }

        for (seq, pending) in failed {
            log::warn!(
                "[{}] No response to {} from {} after {} retransmissions",
                seq,
                pending.message_type.name(),
                pending.peer,
                pending.retry_count
            );
            let _ = pending.reply.send(Err(N4Error::Timeout));
        }

        next_deadline
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.wakeup.notify_one();
    }
}

/// Shared timer driving every pending request of one correlator
async fn run_timer(correlator: Weak<Correlator>, wakeup: Arc<Notify>) {
    loop {
        let next_deadline = match correlator.upgrade() {
            Some(correlator) => correlator.process_expired().await,
            None => break,
        };

        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = wakeup.notified() => {}
                }
            }
            None => wakeup.notified().await,
        }
    }
    log::trace!("PFCP correlator timer stopped");
}
