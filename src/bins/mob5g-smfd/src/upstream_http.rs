//! HTTP Upstream Sink
//!
//! Posts every upstream event as JSON to the session orchestration layer.
//! Delivery runs in its own task and is retried a few times before the
//! event is dropped.

use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use mob5g_n4::upstream::{UpstreamEvent, UpstreamSink, UsageRecord};
use mob5g_n4::ReleaseReason;
use tokio::net::TcpStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const DELIVERY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Upstream sink posting JSON events to one URL
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    uri: Uri,
    authority: String,
}

impl HttpUpstream {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let uri: Uri = url
            .parse()
            .with_context(|| format!("Invalid upstream URL {url}"))?;
        if uri.scheme_str() != Some("http") {
            bail!("Upstream URL must use http: {url}");
        }
        let host = uri
            .host()
            .ok_or_else(|| anyhow!("Upstream URL without host: {url}"))?;
        let authority = format!("{host}:{}", uri.port_u16().unwrap_or(80));
        Ok(Self { uri, authority })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    fn forward(&self, event: UpstreamEvent) {
        let body = match serde_json::to_vec(&event) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                log::error!("Failed to encode upstream event: {e}");
                return;
            }
        };
        let sink = self.clone();

        tokio::spawn(async move {
            for attempt in 1..=DELIVERY_ATTEMPTS {
                match sink.post_json(body.clone()).await {
                    Ok(status) if status.is_success() => return,
                    Ok(status) => log::warn!("Upstream {} answered {status}", sink.uri),
                    Err(e) => log::warn!(
                        "Upstream {} unreachable (attempt {attempt}/{DELIVERY_ATTEMPTS}): {e:#}",
                        sink.uri
                    ),
                }
                if attempt < DELIVERY_ATTEMPTS {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
            log::error!("Upstream event dropped: {event:?}");
        });
    }

    async fn post_json(&self, body: Bytes) -> anyhow::Result<StatusCode> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.authority))
            .await
            .context("Connect timed out")??;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                log::debug!("Upstream connection error: {e}");
            }
        });

        let path = self.uri.path_and_query().map_or("/", |p| p.as_str());
        let request = Request::post(path)
            .header(HOST, self.authority.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(body))?;
        let response = sender.send_request(request).await?;
        Ok(response.status())
    }
}

impl UpstreamSink for HttpUpstream {
    fn usage_report(&self, record: UsageRecord) {
        self.forward(UpstreamEvent::UsageReport(record));
    }

    fn session_released(&self, seid: u64, reason: ReleaseReason) {
        self.forward(UpstreamEvent::SessionReleased { seid, reason });
    }
}
