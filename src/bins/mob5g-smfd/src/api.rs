//! N4 HTTP API
//!
//! JSON over HTTP/1.1 front end used by the session orchestration layer.
//!
//! | Method | Path                                   | Operation                 |
//! |--------|----------------------------------------|---------------------------|
//! | POST   | `/n4/sessions`                         | establish a session       |
//! | GET    | `/n4/sessions/{seid}`                  | session snapshot          |
//! | PUT    | `/n4/sessions/{seid}`                  | modify rules              |
//! | DELETE | `/n4/sessions/{seid}`                  | release, returns usage    |
//! | GET    | `/n4/associations`                     | established associations  |
//! | POST   | `/n4/associations/{node_id}/release`   | release an association    |

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{bail, Context};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use mob5g_n4::{N4Error, N4Node, SessionChanges, SessionManager};
use mob5g_pfcp::types::{Far, NodeId, Pdr};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};

/// Body of `POST /n4/sessions`
#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    node_id: NodeId,
    #[serde(default)]
    pdrs: Vec<Pdr>,
    #[serde(default)]
    fars: Vec<Far>,
}

/// JSON reply with its status
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiResponse {
    fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    fn error(status: StatusCode, detail: impl Into<String>) -> Self {
        Self::new(
            status,
            json!({ "status": status.as_u16(), "detail": detail.into() }),
        )
    }

    fn from_n4(err: &N4Error) -> Self {
        Self::error(error_status(err), err.to_string())
    }

    fn into_http(self) -> Response<Full<Bytes>> {
        let status = self.status;
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(self.body.to_string())))
            .unwrap_or_else(|_| {
                let mut response = Response::new(Full::new(Bytes::new()));
                *response.status_mut() = status;
                response
            })
    }
}

/// HTTP status for an engine error
pub fn error_status(err: &N4Error) -> StatusCode {
    match err {
        N4Error::AssociationNotEstablished(_) | N4Error::InvalidAssociationState { .. } => {
            StatusCode::CONFLICT
        }
        N4Error::AssociationNotFound(_) | N4Error::SessionNotFound(_) => StatusCode::NOT_FOUND,
        N4Error::InvalidSessionState { .. } | N4Error::InvalidRules(_) => StatusCode::BAD_REQUEST,
        N4Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
        N4Error::Rejected(_) | N4Error::UnexpectedResponse(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Session identifiers are accepted in decimal or `0x` hex
fn parse_seid(raw: &str) -> Result<u64, ApiResponse> {
    let parsed = match raw.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|_| ApiResponse::error(StatusCode::BAD_REQUEST, format!("Invalid SEID `{raw}`")))
}

fn parse_body<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, ApiResponse> {
    serde_json::from_slice(body)
        .map_err(|e| ApiResponse::error(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {e}")))
}

fn session_manager(node: &N4Node) -> Result<&Arc<SessionManager>, ApiResponse> {
    node.sessions()
        .ok_or_else(|| ApiResponse::error(StatusCode::NOT_FOUND, "Not a control plane node"))
}

fn to_json<T: serde::Serialize>(value: &T) -> ApiResponse {
    match serde_json::to_value(value) {
        Ok(body) => ApiResponse::new(StatusCode::OK, body),
        Err(e) => ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Route one request to the N4 node
pub async fn route(node: &N4Node, method: &Method, path: &str, body: &[u8]) -> ApiResponse {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let result = match (method, segments.as_slice()) {
        (&Method::POST, ["n4", "sessions"]) => create_session(node, body).await,
        (&Method::GET, ["n4", "sessions", seid]) => get_session(node, seid).await,
        (&Method::PUT, ["n4", "sessions", seid]) => modify_session(node, seid, body).await,
        (&Method::DELETE, ["n4", "sessions", seid]) => release_session(node, seid).await,
        (&Method::GET, ["n4", "associations"]) => Ok(to_json(&node.associations().established().await)),
        (&Method::POST, ["n4", "associations", node_id, "release"]) => {
            release_association(node, node_id).await
        }
        (_, ["n4", ..]) => Err(ApiResponse::error(
            StatusCode::NOT_FOUND,
            format!("No route for {method} {path}"),
        )),
        _ => Err(ApiResponse::error(StatusCode::NOT_FOUND, "Not found")),
    };
    result.unwrap_or_else(|rsp| rsp)
}

async fn create_session(node: &N4Node, body: &[u8]) -> Result<ApiResponse, ApiResponse> {
    let sessions = session_manager(node)?;
    let request: CreateSessionRequest = parse_body(body)?;
    let seid = sessions
        .create_session(&request.node_id, request.pdrs, request.fars)
        .await
        .map_err(|e| ApiResponse::from_n4(&e))?;
    log::info!("[{seid:#x}] Session created via API on {}", request.node_id);
    Ok(ApiResponse::new(StatusCode::CREATED, json!({ "seid": seid })))
}

async fn get_session(node: &N4Node, seid: &str) -> Result<ApiResponse, ApiResponse> {
    let sessions = session_manager(node)?;
    let seid = parse_seid(seid)?;
    let session = sessions
        .get(seid)
        .await
        .ok_or_else(|| ApiResponse::from_n4(&N4Error::SessionNotFound(seid)))?;
    Ok(to_json(&session))
}

async fn modify_session(node: &N4Node, seid: &str, body: &[u8]) -> Result<ApiResponse, ApiResponse> {
    let sessions = session_manager(node)?;
    let seid = parse_seid(seid)?;
    let changes: SessionChanges = parse_body(body)?;
    sessions
        .modify_session(seid, changes)
        .await
        .map_err(|e| ApiResponse::from_n4(&e))?;
    Ok(ApiResponse::new(StatusCode::OK, json!({ "seid": seid })))
}

async fn release_session(node: &N4Node, seid: &str) -> Result<ApiResponse, ApiResponse> {
    let sessions = session_manager(node)?;
    let seid = parse_seid(seid)?;
    let usage = sessions
        .release_session(seid)
        .await
        .map_err(|e| ApiResponse::from_n4(&e))?;
    Ok(ApiResponse::new(
        StatusCode::OK,
        json!({ "seid": seid, "usage_report": usage }),
    ))
}

async fn release_association(node: &N4Node, node_id: &str) -> Result<ApiResponse, ApiResponse> {
    let node_id = NodeId::new(node_id);
    node.associations()
        .release(&node_id)
        .await
        .map_err(|e| ApiResponse::from_n4(&e))?;
    Ok(ApiResponse::new(
        StatusCode::OK,
        json!({ "node_id": node_id, "state": "released" }),
    ))
}

/// Hyper service wrapper
#[derive(Clone)]
struct ApiService {
    node: Arc<N4Node>,
}

impl Service<Request<Incoming>> for ApiService {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let node = self.node.clone();

        Box::pin(async move {
            let method = req.method().clone();
            let path = req.uri().path().to_string();
            let body = match req.into_body().collect().await {
                Ok(body) => body.to_bytes(),
                Err(e) => {
                    let rsp = ApiResponse::error(StatusCode::BAD_REQUEST, format!("Failed to read body: {e}"));
                    return Ok(rsp.into_http());
                }
            };

            let response = route(&node, &method, &path, &body).await;
            log::debug!("{method} {path} -> {}", response.status);
            Ok(response.into_http())
        })
    }
}

enum ServerState {
    Stopped,
    Running(oneshot::Sender<()>),
}

/// HTTP/1.1 API server
pub struct ApiServer {
    addr: SocketAddr,
    state: Mutex<ServerState>,
}

impl ApiServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            state: Mutex::new(ServerState::Stopped),
        }
    }

    /// Bind and serve; returns the bound address
    pub async fn start(&self, node: Arc<N4Node>) -> anyhow::Result<SocketAddr> {
        let mut state = self.state.lock().await;
        if matches!(*state, ServerState::Running(_)) {
            bail!("API server already running");
        }

        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("Failed to bind API server on {}", self.addr))?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *state = ServerState::Running(shutdown_tx);
        drop(state);

        let service = ApiService { node };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let service = service.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        log::debug!("HTTP connection error: {e}");
                                    }
                                });
                            }
                            Err(e) => log::warn!("Accept error: {e}"),
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            log::debug!("API server stopped");
        });

        log::info!("N4 API listening on {local_addr}");
        Ok(local_addr)
    }

    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let ServerState::Running(shutdown_tx) = std::mem::replace(&mut *state, ServerState::Stopped) {
            let _ = shutdown_tx.send(());
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, ServerState::Running(_))
    }
}
