//! PFCP Dispatcher
//!
//! Decodes inbound datagrams, hands responses to the correlator and answers
//! requests. Responses reuse the sequence number of the request.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mob5g_pfcp::message::{build_message, parse_message, HeartbeatResponse, PfcpMessage};
use mob5g_pfcp::PfcpError;

use crate::assoc::AssociationManager;
use crate::transport::{DatagramHandler, Transport};
use crate::xact::Correlator;

/// Handles session-level requests (establishment, modification, deletion, report)
#[async_trait]
pub trait SessionRequestHandler: Send + Sync {
    /// Returns the response to send, if any
    async fn handle_session_request(&self, peer: SocketAddr, message: PfcpMessage) -> Option<PfcpMessage>;
}

/// Routes decoded messages to their handlers
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    correlator: Arc<Correlator>,
    assoc: Arc<AssociationManager>,
    sessions: Option<Arc<dyn SessionRequestHandler>>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        correlator: Arc<Correlator>,
        assoc: Arc<AssociationManager>,
        sessions: Option<Arc<dyn SessionRequestHandler>>,
    ) -> Self {
        Self {
            transport,
            correlator,
            assoc,
            sessions,
        }
    }

    /// Handle one datagram; returns the response sent back, if any
    pub async fn dispatch(&self, data: Bytes, peer: SocketAddr) -> Option<PfcpMessage> {
        let mut buf = data;
        let (header, message) = match parse_message(&mut buf) {
            Ok(parsed) => parsed,
            Err(PfcpError::InvalidMessageType(t)) => {
                log::warn!("Unknown PFCP message type {t} from {peer} ignored");
                return None;
            }
            Err(e) => {
                log::warn!("Malformed PFCP message from {peer} dropped: {e}");
                return None;
            }
        };

        log::debug!(
            "[{}] {} received from {peer}",
            header.sequence_number,
            header.message_type.name()
        );

        if header.message_type.is_response() {
            self.correlator.on_response(&header, message).await;
            return None;
        }

        let response = self.handle_request(peer, message).await?;
        match build_message(&response, header.sequence_number) {
            Ok(buf) => self.transport.send(buf.freeze(), peer),
            Err(e) => {
                log::error!(
                    "[{}] Failed to encode {}: {e}",
                    header.sequence_number,
                    response.message_type().name()
                );
                return None;
            }
        }
        Some(response)
    }

    async fn handle_request(&self, peer: SocketAddr, message: PfcpMessage) -> Option<PfcpMessage> {
        match message {
            PfcpMessage::HeartbeatRequest(req) => {
                if let Some(node_id) = self.assoc.find_by_addr(peer).await {
                    self.assoc.touch(&node_id).await;
                    self.assoc.observe_recovery(&node_id, req.recovery_time_stamp).await;
                }
                Some(PfcpMessage::HeartbeatResponse(HeartbeatResponse::new(
                    self.assoc.recovery_time_stamp(),
                )))
            }
            PfcpMessage::AssociationSetupRequest(req) => Some(PfcpMessage::AssociationSetupResponse(
                self.assoc.handle_setup_request(peer, req).await,
            )),
            PfcpMessage::AssociationUpdateRequest(req) => Some(PfcpMessage::AssociationUpdateResponse(
                self.assoc.handle_update_request(peer, req).await,
            )),
            PfcpMessage::AssociationReleaseRequest(req) => Some(PfcpMessage::AssociationReleaseResponse(
                self.assoc.handle_release_request(peer, req).await,
            )),
            message => match &self.sessions {
                Some(sessions) => sessions.handle_session_request(peer, message).await,
                None => {
                    log::warn!("{} from {peer} has no handler", message.message_type().name());
                    None
                }
            },
        }
    }
}

#[async_trait]
impl DatagramHandler for Dispatcher {
    async fn on_datagram(&self, data: Bytes, peer: SocketAddr) {
        self.dispatch(data, peer).await;
    }
}
