//! N4 UDP Transport
//!
//! Owns the PFCP socket. Every received datagram is handed to the datagram
//! handler on its own task, bounded by the handler timeout.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::N4Result;

/// Largest datagram accepted from a peer
pub const MAX_DATAGRAM_LEN: usize = 65535;

/// Best-effort datagram sender
pub trait Transport: Send + Sync {
    /// Queue `data` for `peer`; never blocks and never reports delivery
    fn send(&self, data: Bytes, peer: SocketAddr);
}

/// Receives every inbound datagram
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn on_datagram(&self, data: Bytes, peer: SocketAddr);
}

/// UDP socket shared between the receive loop and senders
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind the PFCP socket
    pub async fn bind(addr: SocketAddr) -> N4Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        log::info!("PFCP socket bound to {local_addr}");

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the receive loop until the returned task is aborted
    pub fn listen<H: DatagramHandler>(&self, handler: Arc<H>, handler_timeout: Duration) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let local_addr = self.local_addr;

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
            log::info!("PFCP receive loop started on {local_addr}");

            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        log::warn!("PFCP socket read error: {e}");
                        continue;
                    }
                };

                log::trace!("PFCP received {len} bytes from {peer}");
                let data = Bytes::copy_from_slice(&buf[..len]);
                let handler = handler.clone();

                tokio::spawn(async move {
                    if tokio::time::timeout(handler_timeout, handler.on_datagram(data, peer))
                        .await
                        .is_err()
                    {
                        log::warn!("PFCP handler for datagram from {peer} exceeded {handler_timeout:?}");
                    }
                });
            }
        })
    }
}

impl Transport for UdpTransport {
    fn send(&self, data: Bytes, peer: SocketAddr) {
        match self.socket.try_send_to(&data, peer) {
            Ok(_) => log::trace!("PFCP sent {} bytes to {peer}", data.len()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                let socket = self.socket.clone();
                tokio::spawn(async move {
                    if let Err(e) = socket.send_to(&data, peer).await {
                        log::warn!("PFCP send to {peer} failed: {e}");
                    }
                });
            }
            Err(e) => log::warn!("PFCP send to {peer} failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct Echo {
        transport: Arc<UdpTransport>,
    }

    #[async_trait]
    impl DatagramHandler for Echo {
        async fn on_datagram(&self, data: Bytes, peer: SocketAddr) {
            self.transport.send(data, peer);
        }
    }

    struct Slow {
        done: mpsc::UnboundedSender<Bytes>,
        stalled: AtomicUsize,
    }

    #[async_trait]
    impl DatagramHandler for Slow {
        async fn on_datagram(&self, data: Bytes, _peer: SocketAddr) {
            if data.as_ref() == b"stall" {
                self.stalled.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
            }
            let _ = self.done.send(data);
        }
    }

    #[tokio::test]
    async fn test_udp_send_and_listen() {
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let handler = Arc::new(Echo { transport: transport.clone() });
        let listener = transport.listen(handler, Duration::from_secs(1));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"ping", transport.local_addr()).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, transport.local_addr());
        listener.abort();
    }

    #[tokio::test]
    async fn test_stalled_handler_does_not_block_others() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Slow { done: tx, stalled: AtomicUsize::new(0) });
        let listener = transport.listen(handler.clone(), Duration::from_millis(200));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"stall", transport.local_addr()).await.unwrap();
        client.send_to(b"fast", transport.local_addr()).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"fast"[..]));
        assert_eq!(handler.stalled.load(Ordering::SeqCst), 1);
        listener.abort();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let first = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(UdpTransport::bind(first.local_addr()).await.is_err());
    }
}
