//! User Plane Session Table
//!
//! Sessions installed by the control plane, keyed by the SEID this node
//! allocates. Usage is metered per session and reported back periodically.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mob5g_pfcp::message::{
    PfcpMessage, SessionDeletionRequest, SessionDeletionResponse, SessionEstablishmentRequest,
    SessionEstablishmentResponse, SessionModificationRequest, SessionModificationResponse,
    SessionReportRequest,
};
use mob5g_pfcp::types::{NodeId, PfcpCause, UsageReport};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::assoc::{AssociationManager, AssociationObserver, ReleaseReason};
use crate::dispatch::SessionRequestHandler;
use crate::error::{N4Error, N4Result};
use crate::sess::{RuleSet, SessionChanges};
use crate::store::{load_records, put_record, KeyedStore};
use crate::xact::Correlator;

/// Session installed on the user plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpSession {
    pub seid: u64,
    pub cp_seid: u64,
    pub node_id: NodeId,
    pub rules: RuleSet,
    /// Bytes metered since establishment
    pub volume: u64,
    #[serde(skip, default = "Instant::now")]
    started_at: Instant,
}

impl UpSession {
    pub fn usage(&self) -> UsageReport {
        let elapsed = self.started_at.elapsed().as_millis();
        UsageReport::new(self.volume, u64::try_from(elapsed).unwrap_or(u64::MAX))
    }

    fn store_key(&self) -> String {
        store_key(self.seid)
    }
}

fn store_key(seid: u64) -> String {
    format!("upsession:{seid}")
}

/// User plane session table
pub struct UpSessionTable {
    assoc: Arc<AssociationManager>,
    correlator: Arc<Correlator>,
    store: Arc<dyn KeyedStore>,
    ttl: Option<Duration>,
    next_seid: AtomicU64,
    sessions: RwLock<HashMap<u64, Arc<Mutex<UpSession>>>>,
    by_cp_seid: RwLock<HashMap<(NodeId, u64), u64>>,
}

impl UpSessionTable {
    pub fn new(
        assoc: Arc<AssociationManager>,
        correlator: Arc<Correlator>,
        store: Arc<dyn KeyedStore>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            assoc,
            correlator,
            store,
            ttl,
            next_seid: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
            by_cp_seid: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, seid: u64) -> Option<Arc<Mutex<UpSession>>> {
        self.sessions.read().await.get(&seid).cloned()
    }

    async fn persist(&self, session: &UpSession) -> N4Result<()> {
        put_record(self.store.as_ref(), &session.store_key(), session, self.ttl).await?;
        Ok(())
    }

    async fn remove(&self, seid: u64) -> Option<UpSession> {
        let entry = self.sessions.write().await.remove(&seid)?;
        let session = entry.lock().await.clone();
        self.by_cp_seid
            .write()
            .await
            .remove(&(session.node_id.clone(), session.cp_seid));
        if let Err(e) = self.store.delete(&session.store_key()).await {
            log::error!("[{seid:#x}] Failed to delete session record: {e}");
        }
        Some(session)
    }

    /// Reload sessions persisted before a restart.
    ///
    /// Sessions of control planes that are not associated again are deleted
    /// from the store. Metering restarts from the persisted volume and SEID
    /// allocation resumes above every persisted SEID.
    pub async fn restore(&self) -> N4Result<usize> {
        let records: Vec<UpSession> = load_records(self.store.as_ref(), "upsession:").await?;
        let mut by_cp_seid = self.by_cp_seid.write().await;
        let mut restored = 0;

        for session in records {
            let seid = session.seid;
            self.next_seid.fetch_max(seid.saturating_add(1), Ordering::Relaxed);

            if !self.assoc.is_established(&session.node_id).await {
                log::debug!("[{seid:#x}] Dropping session record of {}", session.node_id);
                if let Err(e) = self.store.delete(&session.store_key()).await {
                    log::error!("[{seid:#x}] Failed to delete session record: {e}");
                }
                continue;
            }
            let key = (session.node_id.clone(), session.cp_seid);
            if by_cp_seid.contains_key(&key) {
                continue;
            }

            log::info!("[{seid:#x}] Session restored for {} (CP SEID {:#x})", session.node_id, session.cp_seid);
            by_cp_seid.insert(key, seid);
            self.sessions
                .write()
                .await
                .insert(seid, Arc::new(Mutex::new(session)));
            restored += 1;
        }
        Ok(restored)
    }

    /// Install a session requested by the control plane
    pub async fn handle_establishment(&self, request: SessionEstablishmentRequest) -> SessionEstablishmentResponse {
        let local = self.assoc.local_node_id().clone();
        let node_id = request.node_id.clone();

        if !self.assoc.is_established(&node_id).await {
            log::warn!("[{node_id}] Session establishment without association");
            return SessionEstablishmentResponse::new(local, PfcpCause::NoEstablishedPfcpAssociation);
        }

        let rules = match RuleSet::new(request.create_pdrs, request.create_fars) {
            Ok(rules) => rules,
            Err(e) => {
                log::warn!("[{node_id}] Session establishment rejected: {e}");
                return SessionEstablishmentResponse::new(local, PfcpCause::RuleCreationModificationFailure);
            }
        };

        // A retransmitted request gets the session created the first time;
        // the index stays locked until the new session is in it
        let key = (node_id.clone(), request.cp_seid);
        let mut by_cp_seid = self.by_cp_seid.write().await;
        if let Some(seid) = by_cp_seid.get(&key).copied() {
            let mut response = SessionEstablishmentResponse::new(local, PfcpCause::RequestAccepted);
            response.up_seid = Some(seid);
            return response;
        }

        let seid = self.next_seid.fetch_add(1, Ordering::Relaxed);
        let session = UpSession {
            seid,
            cp_seid: request.cp_seid,
            node_id: node_id.clone(),
            rules,
            volume: 0,
            started_at: Instant::now(),
        };
        if let Err(e) = self.persist(&session).await {
            log::error!("[{seid:#x}] Failed to persist session: {e}");
            return SessionEstablishmentResponse::new(local, PfcpCause::SystemFailure);
        }

        self.sessions
            .write()
            .await
            .insert(seid, Arc::new(Mutex::new(session)));
        by_cp_seid.insert(key, seid);
        drop(by_cp_seid);
        log::info!("[{seid:#x}] Session established for {node_id} (CP SEID {:#x})", request.cp_seid);

        let mut response = SessionEstablishmentResponse::new(local, PfcpCause::RequestAccepted);
        response.up_seid = Some(seid);
        response
    }

    /// Apply removals then upserts to an installed session
    pub async fn handle_modification(&self, request: SessionModificationRequest) -> SessionModificationResponse {
        let seid = request.seid;
        let Some(entry) = self.entry(seid).await else {
            log::warn!("[{seid:#x}] Modification for unknown session");
            return SessionModificationResponse::new(PfcpCause::SessionContextNotFound);
        };

        let changes = SessionChanges {
            create_pdrs: request.create_pdrs,
            create_fars: request.create_fars,
            remove_pdrs: request.remove_pdrs,
            remove_fars: request.remove_fars,
        };

        let mut session = entry.lock().await;
        let rules = match session.rules.applied(&changes) {
            Ok(rules) => rules,
            Err(e) => {
                log::warn!("[{seid:#x}] Modification rejected: {e}");
                return SessionModificationResponse::new(PfcpCause::RuleCreationModificationFailure);
            }
        };

        let mut updated = session.clone();
        updated.rules = rules;
        if let Err(e) = self.persist(&updated).await {
            log::error!("[{seid:#x}] Failed to persist session: {e}");
            return SessionModificationResponse::new(PfcpCause::SystemFailure);
        }
        *session = updated;

        log::info!("[{seid:#x}] Session modified");
        SessionModificationResponse::new(PfcpCause::RequestAccepted)
    }

    /// Remove a session and answer with its final usage
    pub async fn handle_deletion(&self, request: SessionDeletionRequest) -> SessionDeletionResponse {
        let seid = request.seid;
        match self.remove(seid).await {
            Some(session) => {
                log::info!("[{seid:#x}] Session deleted");
                let mut response = SessionDeletionResponse::new(PfcpCause::RequestAccepted);
                response.usage_report = Some(session.usage());
                response
            }
            None => {
                log::warn!("[{seid:#x}] Deletion for unknown session");
                SessionDeletionResponse::new(PfcpCause::SessionContextNotFound)
            }
        }
    }

    /// Meter `bytes` of traffic against a session
    pub async fn record_usage(&self, seid: u64, bytes: u64) -> N4Result<()> {
        let entry = self.entry(seid).await.ok_or(N4Error::SessionNotFound(seid))?;
        let mut session = entry.lock().await;
        session.volume = session.volume.saturating_add(bytes);
        Ok(())
    }

    pub async fn get(&self, seid: u64) -> Option<UpSession> {
        match self.entry(seid).await {
            Some(entry) => Some(entry.lock().await.clone()),
            None => None,
        }
    }

    pub async fn usage(&self, seid: u64) -> Option<UsageReport> {
        self.get(seid).await.map(|session| session.usage())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn snapshot(&self) -> Vec<UpSession> {
        let entries: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut sessions = Vec::with_capacity(entries.len());
        for entry in entries {
            sessions.push(entry.lock().await.clone());
        }
        sessions
    }

    /// Send a Session Report Request for every session; returns how many were sent
    pub async fn report_usage(&self) -> usize {
        let mut peers: HashMap<NodeId, Option<SocketAddr>> = HashMap::new();
        let mut sent = 0;

        for session in self.snapshot().await {
            let peer_addr = match peers.get(&session.node_id) {
                Some(addr) => *addr,
                None => {
                    let addr = self.assoc.established_peer(&session.node_id).await.ok();
                    peers.insert(session.node_id.clone(), addr);
                    addr
                }
            };
            let Some(peer_addr) = peer_addr else {
                continue;
            };

            let seid = session.seid;
            let request = SessionReportRequest::new(session.cp_seid, session.usage());
            let correlator = self.correlator.clone();
            tokio::spawn(async move {
                match correlator
                    .request(peer_addr, PfcpMessage::SessionReportRequest(request))
                    .await
                {
                    Ok(rsp) => match rsp.message.cause() {
                        Some(cause) if !cause.is_success() => {
                            log::warn!("[{seid:#x}] Usage report answered with {cause}")
                        }
                        _ => log::trace!("[{seid:#x}] Usage report acknowledged"),
                    },
                    Err(e) => log::warn!("[{seid:#x}] Usage report unanswered: {e}"),
                }
            });
            sent += 1;
        }
        sent
    }

    /// Report usage every `interval` until the returned task is aborted
    pub fn run_reporter(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let sent = self.report_usage().await;
                log::debug!("{sent} usage reports sent");
            }
        })
    }
}

#[async_trait]
impl AssociationObserver for UpSessionTable {
    async fn association_released(&self, node_id: &NodeId, reason: ReleaseReason) {
        let seids: Vec<u64> = self
            .by_cp_seid
            .read()
            .await
            .iter()
            .filter(|((owner, _), _)| owner == node_id)
            .map(|(_, seid)| *seid)
            .collect();

        for seid in seids {
            if self.remove(seid).await.is_some() {
                log::info!("[{seid:#x}] Session removed with association {node_id} ({reason:?})");
            }
        }
    }
}

#[async_trait]
impl SessionRequestHandler for UpSessionTable {
    async fn handle_session_request(&self, peer: SocketAddr, message: PfcpMessage) -> Option<PfcpMessage> {
        match message {
            PfcpMessage::SessionEstablishmentRequest(req) => Some(PfcpMessage::SessionEstablishmentResponse(
                self.handle_establishment(req).await,
            )),
            PfcpMessage::SessionModificationRequest(req) => Some(PfcpMessage::SessionModificationResponse(
                self.handle_modification(req).await,
            )),
            PfcpMessage::SessionDeletionRequest(req) => Some(PfcpMessage::SessionDeletionResponse(
                self.handle_deletion(req).await,
            )),
            other => {
                log::warn!("{} from {peer} not handled by user plane", other.message_type().name());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimerConfig;
    use crate::store::MemoryStore;
    use crate::testing::{FailingStore, MockTransport, SlowStore};
    use mob5g_pfcp::message::{AssociationSetupRequest, SessionReportResponse};
    use mob5g_pfcp::types::{ApplyAction, Far, Pdr, Qos};

    const SMF: &str = "127.0.0.4:8805";

    fn pdr(rule_id: u32, far_id: u32) -> Pdr {
        Pdr {
            rule_id,
            match_criteria: "permit out ip from any to assigned".to_string(),
            qos: Qos::default(),
            far_id,
        }
    }

    fn far(far_id: u32) -> Far {
        Far {
            far_id,
            action: ApplyAction::Forward,
            destination: "internet".to_string(),
        }
    }

    fn establishment(cp_seid: u64) -> SessionEstablishmentRequest {
        let mut request = SessionEstablishmentRequest::new(NodeId::new("smf-1"), cp_seid);
        request.create_pdrs = vec![pdr(1, 1)];
        request.create_fars = vec![far(1)];
        request
    }

    async fn fixture_with_store(
        store: Arc<dyn KeyedStore>,
    ) -> (Arc<MockTransport>, Arc<Correlator>, Arc<AssociationManager>, Arc<UpSessionTable>) {
        let transport = MockTransport::new();
        let correlator = Correlator::new(transport.clone(), TimerConfig::new_millis(0, 1000));
        let assoc = Arc::new(AssociationManager::new(
            NodeId::new("upf-1"),
            1,
            correlator.clone(),
            Arc::new(MemoryStore::new()),
            None,
        ));
        let table = Arc::new(UpSessionTable::new(assoc.clone(), correlator.clone(), store, None));
        let observer: Arc<dyn AssociationObserver> = table.clone();
        assoc.add_observer(Arc::downgrade(&observer)).await;
        (transport, correlator, assoc, table)
    }

    async fn fixture() -> (Arc<MockTransport>, Arc<Correlator>, Arc<AssociationManager>, Arc<UpSessionTable>) {
        fixture_with_store(Arc::new(MemoryStore::new())).await
    }

    async fn associate(assoc: &AssociationManager) {
        assoc
            .handle_setup_request(SMF.parse().unwrap(), AssociationSetupRequest::new(NodeId::new("smf-1"), 1))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_establishment_requires_association() {
        let (_, _, _, table) = fixture().await;
        let response = table.handle_establishment(establishment(1)).await;
        assert_eq!(response.cause, PfcpCause::NoEstablishedPfcpAssociation);
        assert_eq!(response.up_seid, None);
        assert!(table.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_establishment_and_retransmission() {
        let (_, _, assoc, table) = fixture().await;
        associate(&assoc).await;

        let response = table.handle_establishment(establishment(0x10)).await;
        assert_eq!(response.cause, PfcpCause::RequestAccepted);
        let seid = response.up_seid.unwrap();

        let again = table.handle_establishment(establishment(0x10)).await;
        assert_eq!(again.up_seid, Some(seid));
        assert_eq!(table.len().await, 1);
        assert_eq!(table.get(seid).await.unwrap().cp_seid, 0x10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_retransmission_shares_session() {
        let (_, _, assoc, table) = fixture_with_store(Arc::new(SlowStore::new(Duration::from_millis(100)))).await;
        associate(&assoc).await;

        // The retransmission arrives while the first request is still persisting
        let (first, second) = tokio::join!(
            table.handle_establishment(establishment(0x10)),
            table.handle_establishment(establishment(0x10)),
        );
        assert_eq!(first.cause, PfcpCause::RequestAccepted);
        assert_eq!(second.cause, PfcpCause::RequestAccepted);
        assert!(first.up_seid.is_some());
        assert_eq!(first.up_seid, second.up_seid);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_after_restart() {
        let store = Arc::new(MemoryStore::new());
        let (_, _, assoc, table) = fixture_with_store(store.clone()).await;
        associate(&assoc).await;
        let first = table.handle_establishment(establishment(0x10)).await.up_seid.unwrap();
        let second = table.handle_establishment(establishment(0x11)).await.up_seid.unwrap();
        let mut orphan = table.get(second).await.unwrap();
        orphan.seid = 9;
        orphan.node_id = NodeId::new("smf-9");
        put_record(store.as_ref(), "upsession:9", &orphan, None).await.unwrap();

        let (_, _, assoc, table) = fixture_with_store(store.clone()).await;
        associate(&assoc).await;
        assert_eq!(table.restore().await.unwrap(), 2);
        assert_eq!(table.get(first).await.unwrap().cp_seid, 0x10);
        assert!(table.get(9).await.is_none());
        assert!(store.get("upsession:9").await.unwrap().is_none());

        // A retransmission of a restored session keeps its SEID
        let again = table.handle_establishment(establishment(0x11)).await;
        assert_eq!(again.up_seid, Some(second));

        let fresh = table.handle_establishment(establishment(0x12)).await.up_seid.unwrap();
        assert_eq!(fresh, 10);
        assert_eq!(table.len().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_establishment_rule_failure() {
        let (_, _, assoc, table) = fixture().await;
        associate(&assoc).await;

        let mut request = establishment(1);
        request.create_fars.clear();
        let response = table.handle_establishment(request).await;
        assert_eq!(response.cause, PfcpCause::RuleCreationModificationFailure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_establishment_persist_failure() {
        let (_, _, assoc, table) = fixture_with_store(Arc::new(FailingStore)).await;
        associate(&assoc).await;
        let response = table.handle_establishment(establishment(1)).await;
        assert_eq!(response.cause, PfcpCause::SystemFailure);
        assert!(table.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modification_and_deletion() {
        let (_, _, assoc, table) = fixture().await;
        associate(&assoc).await;
        let seid = table.handle_establishment(establishment(1)).await.up_seid.unwrap();

        let mut request = SessionModificationRequest::new(seid);
        request.create_pdrs = vec![pdr(2, 2)];
        request.create_fars = vec![far(2)];
        request.remove_pdrs = vec![1];
        let response = table.handle_modification(request).await;
        assert_eq!(response.cause, PfcpCause::RequestAccepted);
        let rules = table.get(seid).await.unwrap().rules;
        assert_eq!(rules.pdrs.keys().copied().collect::<Vec<_>>(), vec![2]);

        // Removing the FAR a PDR still uses is refused and changes nothing
        let mut request = SessionModificationRequest::new(seid);
        request.remove_fars = vec![2];
        let response = table.handle_modification(request).await;
        assert_eq!(response.cause, PfcpCause::RuleCreationModificationFailure);
        assert_eq!(table.get(seid).await.unwrap().rules, rules);

        let response = table
            .handle_modification(SessionModificationRequest::new(999))
            .await;
        assert_eq!(response.cause, PfcpCause::SessionContextNotFound);

        table.record_usage(seid, 1000).await.unwrap();
        table.record_usage(seid, 500).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        let response = table.handle_deletion(SessionDeletionRequest::new(seid)).await;
        assert_eq!(response.cause, PfcpCause::RequestAccepted);
        assert_eq!(response.usage_report, Some(UsageReport::new(1500, 3000)));
        assert!(table.is_empty().await);

        let response = table.handle_deletion(SessionDeletionRequest::new(seid)).await;
        assert_eq!(response.cause, PfcpCause::SessionContextNotFound);
        assert!(matches!(
            table.record_usage(seid, 1).await,
            Err(N4Error::SessionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_reporter_sends_cp_seid() {
        let (transport, correlator, assoc, table) = fixture().await;
        associate(&assoc).await;
        let seid = table.handle_establishment(establishment(0x77)).await.up_seid.unwrap();
        table.record_usage(seid, 42).await.unwrap();

        let reporter = table.clone().run_reporter(Duration::from_secs(5));
        let (header, msg, peer) = transport.recv().await;
        assert_eq!(peer, SMF.parse().unwrap());
        match msg {
            PfcpMessage::SessionReportRequest(req) => {
                assert_eq!(req.seid, 0x77);
                assert_eq!(req.usage_report.volume, 42);
                assert_eq!(req.usage_report.duration_ms, 5000);
            }
            other => panic!("unexpected {other:?}"),
        }
        transport
            .respond(
                &correlator,
                &header,
                PfcpMessage::SessionReportResponse(SessionReportResponse::new(PfcpCause::RequestAccepted)),
            )
            .await;
        reporter.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_association_release_removes_sessions() {
        let (_, _, assoc, table) = fixture().await;
        associate(&assoc).await;
        table.handle_establishment(establishment(1)).await;
        table.handle_establishment(establishment(2)).await;
        assert_eq!(table.len().await, 2);

        assoc
            .force_release(&NodeId::new("smf-1"), ReleaseReason::HeartbeatFailure)
            .await;
        assert!(table.is_empty().await);
    }
}
