//! N4 Node
//!
//! Wires transport, correlator, association manager, session handling and
//! heartbeat supervision into one PFCP endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mob5g_pfcp::types::NodeId;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::assoc::{AssociationManager, AssociationObserver, AssociationState};
use crate::config::N4Config;
use crate::dispatch::{Dispatcher, SessionRequestHandler};
use crate::error::N4Result;
use crate::heartbeat::HeartbeatSupervisor;
use crate::sess::SessionManager;
use crate::store::KeyedStore;
use crate::transport::{Transport, UdpTransport};
use crate::upf::UpSessionTable;
use crate::upstream::UpstreamSink;
use crate::xact::Correlator;

/// UP function features advertised by the user plane
pub const UP_FUNCTION_FEATURES: u16 = 0x0001;

/// Which end of N4 this node is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// SMF side: initiates associations and sessions
    ControlPlane,
    /// UPF side: answers requests and reports usage
    UserPlane,
}

/// A running PFCP endpoint
pub struct N4Node {
    config: N4Config,
    role: Role,
    local_addr: Option<SocketAddr>,
    correlator: Arc<Correlator>,
    assoc: Arc<AssociationManager>,
    heartbeat: Arc<HeartbeatSupervisor>,
    sessions: Option<Arc<SessionManager>>,
    up_sessions: Option<Arc<UpSessionTable>>,
    dispatcher: Arc<Dispatcher>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl N4Node {
    /// Bind the PFCP socket and start every background task
    pub async fn start(
        config: N4Config,
        role: Role,
        store: Arc<dyn KeyedStore>,
        upstream: Arc<dyn UpstreamSink>,
    ) -> N4Result<Arc<Self>> {
        let udp = Arc::new(UdpTransport::bind(config.listen_addr()).await?);
        let local_addr = udp.local_addr();
        let handler_timeout = config.handler_timeout();

        let mut node = Self::build(config, role, udp.clone(), store, upstream).await?;
        node.local_addr = Some(local_addr);
        let node = Arc::new(node);

        let mut tasks = vec![udp.listen(node.dispatcher.clone(), handler_timeout)];
        if let (Some(up_sessions), Some(interval)) = (&node.up_sessions, node.config.report_interval()) {
            tasks.push(up_sessions.clone().run_reporter(interval));
        }
        if role == Role::ControlPlane {
            for peer in &node.config.peers {
                tasks.push(keep_associated(
                    node.assoc.clone(),
                    peer.node_id.clone(),
                    peer.addr,
                    node.config.association_interval(),
                ));
            }
        }
        node.tasks.lock().await.extend(tasks);

        log::info!(
            "N4 node {} ({:?}) ready on {local_addr}",
            node.config.node_id,
            role
        );
        Ok(node)
    }

    /// Assemble a node over an existing transport without starting tasks
    pub async fn with_transport(
        config: N4Config,
        role: Role,
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyedStore>,
        upstream: Arc<dyn UpstreamSink>,
    ) -> N4Result<Arc<Self>> {
        Ok(Arc::new(Self::build(config, role, transport, store, upstream).await?))
    }

    async fn build(
        config: N4Config,
        role: Role,
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyedStore>,
        upstream: Arc<dyn UpstreamSink>,
    ) -> N4Result<Self> {
        let recovery_time_stamp = config.recovery_time_stamp.unwrap_or_else(now_secs);
        let ttl = config.store.ttl();
        let correlator = Correlator::new(transport.clone(), config.xact.timer());

        let mut assoc = AssociationManager::new(
            config.node_id.clone(),
            recovery_time_stamp,
            correlator.clone(),
            store.clone(),
            ttl,
        );
        if role == Role::UserPlane {
            assoc = assoc.with_up_function_features(UP_FUNCTION_FEATURES);
        }
        let assoc = Arc::new(assoc);

        let heartbeat = HeartbeatSupervisor::new(assoc.clone(), correlator.clone(), config.heartbeat.clone());
        let observer: Arc<dyn AssociationObserver> = heartbeat.clone();
        assoc.add_observer(Arc::downgrade(&observer)).await;

        let (sessions, up_sessions, handler) = match role {
            Role::ControlPlane => {
                let sessions = Arc::new(SessionManager::new(
                    assoc.clone(),
                    correlator.clone(),
                    store,
                    ttl,
                    upstream,
                ));
                let observer: Arc<dyn AssociationObserver> = sessions.clone();
                assoc.add_observer(Arc::downgrade(&observer)).await;
                let handler: Arc<dyn SessionRequestHandler> = sessions.clone();
                (Some(sessions), None, handler)
            }
            Role::UserPlane => {
                let table = Arc::new(UpSessionTable::new(assoc.clone(), correlator.clone(), store, ttl));
                let observer: Arc<dyn AssociationObserver> = table.clone();
                assoc.add_observer(Arc::downgrade(&observer)).await;
                let handler: Arc<dyn SessionRequestHandler> = table.clone();
                (None, Some(table), handler)
            }
        };

        let dispatcher = Arc::new(Dispatcher::new(
            transport,
            correlator.clone(),
            assoc.clone(),
            Some(handler),
        ));

        log::info!(
            "N4 node {} recovery time stamp {recovery_time_stamp}",
            config.node_id
        );

        // Associations first: sessions are only kept for established ones
        let associations = assoc.restore().await?;
        let restored = match (&sessions, &up_sessions) {
            (Some(sessions), _) => sessions.restore().await?,
            (None, Some(table)) => table.restore().await?,
            (None, None) => 0,
        };
        if associations > 0 || restored > 0 {
            log::info!("Restored {associations} association(s) and {restored} session(s)");
        }

        Ok(Self {
            config,
            role,
            local_addr: None,
            correlator,
            assoc,
            heartbeat,
            sessions,
            up_sessions,
            dispatcher,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &N4Config {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    /// Bound PFCP address; `None` for nodes built over a caller transport
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn associations(&self) -> &Arc<AssociationManager> {
        &self.assoc
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatSupervisor> {
        &self.heartbeat
    }

    /// Control plane session manager
    pub fn sessions(&self) -> Option<&Arc<SessionManager>> {
        self.sessions.as_ref()
    }

    /// User plane session table
    pub fn up_sessions(&self) -> Option<&Arc<UpSessionTable>> {
        self.up_sessions.as_ref()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Set up an association with a peer
    pub async fn associate(&self, node_id: &NodeId, peer_addr: SocketAddr) -> N4Result<()> {
        self.assoc.setup(node_id, peer_addr).await
    }

    /// Stop background tasks; associations are left as they are
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.heartbeat.stop_all().await;
        log::info!("N4 node {} stopped", self.config.node_id);
    }
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// Keep an association with `node_id` up, retrying setup every `interval`
fn keep_associated(
    assoc: Arc<AssociationManager>,
    node_id: NodeId,
    peer_addr: SocketAddr,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match assoc.state(&node_id).await {
                Some(AssociationState::Established) | Some(AssociationState::Pending) => continue,
                _ => {}
            }
            if let Err(e) = assoc.setup(&node_id, peer_addr).await {
                log::warn!("[{node_id}] Association setup with {peer_addr} failed: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeartbeatConfig, XactConfig};
    use crate::sess::SessionState;
    use crate::store::MemoryStore;
    use crate::testing::MockTransport;
    use crate::upstream::{ChannelSink, LogSink, UpstreamEvent};
    use mob5g_pfcp::message::{build_message, AssociationSetupResponse, PfcpMessage, SessionEstablishmentResponse};
    use mob5g_pfcp::types::{ApplyAction, Far, PfcpCause, Pdr, Qos};

    const UPF: &str = "127.0.0.7:8805";

    fn config() -> N4Config {
        N4Config {
            node_id: NodeId::new("smf-1"),
            xact: XactConfig { t1_ms: 500, n1: 0 },
            heartbeat: HeartbeatConfig {
                enabled: true,
                interval_ms: 1000,
                miss_threshold: 3,
            },
            recovery_time_stamp: Some(1),
            ..Default::default()
        }
    }

    /// Feed a response through the dispatcher as if it came off the wire
    async fn deliver(node: &N4Node, sequence_number: u32, message: PfcpMessage) {
        let data = build_message(&message, sequence_number).unwrap().freeze();
        node.dispatcher().dispatch(data, UPF.parse().unwrap()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_failure_releases_association_and_sessions() {
        let transport = MockTransport::new();
        let (sink, mut events) = ChannelSink::new();
        let node = N4Node::with_transport(
            config(),
            Role::ControlPlane,
            transport.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(sink),
        )
        .await
        .unwrap();
        let upf = NodeId::new("upf-1");

        // Association goes Pending, then Established on the response
        let n = node.clone();
        let setup = tokio::spawn(async move { n.associate(&NodeId::new("upf-1"), UPF.parse().unwrap()).await });
        let (header, _, _) = transport.recv().await;
        assert_eq!(
            node.associations().state(&upf).await,
            Some(AssociationState::Pending)
        );
        deliver(
            &node,
            header.sequence_number,
            PfcpMessage::AssociationSetupResponse(AssociationSetupResponse::new(
                upf.clone(),
                PfcpCause::RequestAccepted,
                77,
            )),
        )
        .await;
        setup.await.unwrap().unwrap();
        assert_eq!(
            node.associations().state(&upf).await,
            Some(AssociationState::Established)
        );

        // Session with one PDR
        let sessions = node.sessions().unwrap().clone();
        let create = tokio::spawn(async move {
            sessions
                .create_session(
                    &NodeId::new("upf-1"),
                    vec![Pdr {
                        rule_id: 1,
                        match_criteria: "permit out ip from any to assigned".to_string(),
                        qos: Qos::default(),
                        far_id: 1,
                    }],
                    vec![Far {
                        far_id: 1,
                        action: ApplyAction::Forward,
                        destination: "internet".to_string(),
                    }],
                )
                .await
        });
        let (header, _, _) = transport.recv().await;
        let mut rsp = SessionEstablishmentResponse::new(upf.clone(), PfcpCause::RequestAccepted);
        rsp.up_seid = Some(0x100);
        deliver(&node, header.sequence_number, PfcpMessage::SessionEstablishmentResponse(rsp)).await;
        let seid = create.await.unwrap().unwrap();
        assert_eq!(
            node.sessions().unwrap().state(seid).await,
            Some(SessionState::Established)
        );

        // Three unanswered heartbeats
        for _ in 0..3 {
            let (_, msg, _) = transport.recv().await;
            assert!(matches!(msg, PfcpMessage::HeartbeatRequest(_)));
        }
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(
            node.associations().state(&upf).await,
            Some(AssociationState::Released)
        );
        assert_eq!(
            node.sessions().unwrap().state(seid).await,
            Some(SessionState::Released)
        );
        assert_eq!(
            events.recv().await,
            Some(UpstreamEvent::SessionReleased {
                seid,
                reason: crate::assoc::ReleaseReason::HeartbeatFailure
            })
        );
        node.shutdown().await;
    }

    /// Drive `create_session` on `node` to completion with the given UP SEID
    async fn establish_session(node: &Arc<N4Node>, transport: &MockTransport, up_seid: u64) -> u64 {
        let sessions = node.sessions().unwrap().clone();
        let create = tokio::spawn(async move {
            sessions
                .create_session(
                    &NodeId::new("upf-1"),
                    vec![Pdr {
                        rule_id: 1,
                        match_criteria: "permit out ip from any to assigned".to_string(),
                        qos: Qos::default(),
                        far_id: 1,
                    }],
                    vec![Far {
                        far_id: 1,
                        action: ApplyAction::Forward,
                        destination: "internet".to_string(),
                    }],
                )
                .await
        });
        // Heartbeats may be interleaved with the establishment
        let header = loop {
            let (header, msg, _) = transport.recv().await;
            if matches!(msg, PfcpMessage::SessionEstablishmentRequest(_)) {
                break header;
            }
        };
        let mut rsp = SessionEstablishmentResponse::new(NodeId::new("upf-1"), PfcpCause::RequestAccepted);
        rsp.up_seid = Some(up_seid);
        deliver(node, header.sequence_number, PfcpMessage::SessionEstablishmentResponse(rsp)).await;
        create.await.unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_restores_state_from_store() {
        let store = Arc::new(MemoryStore::new());
        let transport = MockTransport::new();
        let node = N4Node::with_transport(
            config(),
            Role::ControlPlane,
            transport.clone(),
            store.clone(),
            Arc::new(LogSink),
        )
        .await
        .unwrap();
        let upf = NodeId::new("upf-1");

        let n = node.clone();
        let setup = tokio::spawn(async move { n.associate(&NodeId::new("upf-1"), UPF.parse().unwrap()).await });
        let (header, _, _) = transport.recv().await;
        deliver(
            &node,
            header.sequence_number,
            PfcpMessage::AssociationSetupResponse(AssociationSetupResponse::new(
                upf.clone(),
                PfcpCause::RequestAccepted,
                77,
            )),
        )
        .await;
        setup.await.unwrap().unwrap();
        let first = establish_session(&node, &transport, 0x100).await;
        let second = establish_session(&node, &transport, 0x101).await;
        node.shutdown().await;

        // Same store, new process
        let transport = MockTransport::new();
        let node = N4Node::with_transport(
            config(),
            Role::ControlPlane,
            transport.clone(),
            store.clone(),
            Arc::new(LogSink),
        )
        .await
        .unwrap();

        let association = node.associations().get(&upf).await.unwrap();
        assert_eq!(association.state, AssociationState::Established);
        assert_eq!(association.recovery_time_stamp, Some(77));
        let sessions = node.sessions().unwrap();
        assert_eq!(sessions.sessions_for(&upf).await, vec![first, second]);
        let session = sessions.get(second).await.unwrap();
        assert_eq!(session.state, SessionState::Established);
        assert_eq!(session.remote_seid, Some(0x101));

        let third = establish_session(&node, &transport, 0x102).await;
        assert!(third > second);
        node.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_session_against_pending_association() {
        let transport = MockTransport::new();
        let node = N4Node::with_transport(
            config(),
            Role::ControlPlane,
            transport.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(LogSink),
        )
        .await
        .unwrap();

        let n = node.clone();
        let _setup = tokio::spawn(async move { n.associate(&NodeId::new("upf-1"), UPF.parse().unwrap()).await });
        transport.recv().await;
        let sent = transport.sent_count();

        let result = node
            .sessions()
            .unwrap()
            .create_session(&NodeId::new("upf-1"), Vec::new(), Vec::new())
            .await;
        assert!(matches!(
            result,
            Err(crate::error::N4Error::AssociationNotEstablished(_))
        ));
        assert_eq!(transport.sent_count(), sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_plane_node_wiring() {
        let node = N4Node::with_transport(
            N4Config {
                node_id: NodeId::new("upf-1"),
                ..config()
            },
            Role::UserPlane,
            MockTransport::new(),
            Arc::new(MemoryStore::new()),
            Arc::new(LogSink),
        )
        .await
        .unwrap();
        assert!(node.sessions().is_none());
        assert!(node.up_sessions().is_some());
        assert_eq!(node.role(), Role::UserPlane);
        assert_eq!(node.associations().recovery_time_stamp(), 1);
        assert_eq!(node.local_addr(), None);
    }

    #[tokio::test]
    async fn test_start_binds_socket() {
        let node = N4Node::start(
            N4Config {
                addr: "127.0.0.1".parse().unwrap(),
                port: 0,
                ..config()
            },
            Role::UserPlane,
            Arc::new(MemoryStore::new()),
            Arc::new(LogSink),
        )
        .await
        .unwrap();
        assert!(node.local_addr().unwrap().port() != 0);
        node.shutdown().await;
    }
}
