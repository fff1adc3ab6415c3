//! PFCP Session Manager (control plane)
//!
//! Sessions are keyed by the locally allocated SEID. Each session has an
//! operation lock serializing create/modify/release for that SEID, and a data
//! lock guarding its state. Sessions of different SEIDs never contend.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use mob5g_pfcp::message::{
    PfcpMessage, SessionDeletionRequest, SessionEstablishmentRequest, SessionModificationRequest,
    SessionReportResponse,
};
use mob5g_pfcp::types::{Far, NodeId, PfcpCause, Pdr, UsageReport};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::assoc::{AssociationManager, AssociationObserver, ReleaseReason};
use crate::dispatch::SessionRequestHandler;
use crate::error::{N4Error, N4Result};
use crate::store::{load_records, put_record, KeyedStore};
use crate::upstream::{UpstreamSink, UsageRecord};
use crate::xact::{Correlator, Response};

/// Released sessions kept for state queries
const RELEASED_HISTORY: usize = 256;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Requested,
    Established,
    ModifyPending,
    Released,
}

/// PDR and FAR set of one session, keyed by rule id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub pdrs: BTreeMap<u32, Pdr>,
    pub fars: BTreeMap<u32, Far>,
}

impl RuleSet {
    /// Build a rule set; later rules replace earlier ones with the same id
    pub fn new(pdrs: Vec<Pdr>, fars: Vec<Far>) -> N4Result<Self> {
        let rules = Self {
            pdrs: pdrs.into_iter().map(|pdr| (pdr.rule_id, pdr)).collect(),
            fars: fars.into_iter().map(|far| (far.far_id, far)).collect(),
        };
        rules.validate()?;
        Ok(rules)
    }

    /// Every PDR must point at a FAR of the same set
    pub fn validate(&self) -> N4Result<()> {
        if let Some(pdr) = self.pdrs.values().find(|pdr| !self.fars.contains_key(&pdr.far_id)) {
            return Err(N4Error::InvalidRules(format!(
                "PDR {} references unknown FAR {}",
                pdr.rule_id, pdr.far_id
            )));
        }
        Ok(())
    }

    /// Copy of this set with `changes` applied: removals, then upserts
    pub fn applied(&self, changes: &SessionChanges) -> N4Result<Self> {
        let mut rules = self.clone();
        for id in &changes.remove_pdrs {
            rules.pdrs.remove(id);
        }
        for id in &changes.remove_fars {
            rules.fars.remove(id);
        }
        for pdr in &changes.create_pdrs {
            rules.pdrs.insert(pdr.rule_id, pdr.clone());
        }
        for far in &changes.create_fars {
            rules.fars.insert(far.far_id, far.clone());
        }
        rules.validate()?;
        Ok(rules)
    }

    pub fn pdr_list(&self) -> Vec<Pdr> {
        self.pdrs.values().cloned().collect()
    }

    pub fn far_list(&self) -> Vec<Far> {
        self.fars.values().cloned().collect()
    }
}

/// Rule changes for one modification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionChanges {
    pub create_pdrs: Vec<Pdr>,
    pub create_fars: Vec<Far>,
    pub remove_pdrs: Vec<u32>,
    pub remove_fars: Vec<u32>,
}

impl SessionChanges {
    fn to_request(&self, seid: u64) -> SessionModificationRequest {
        SessionModificationRequest {
            seid,
            create_pdrs: self.create_pdrs.clone(),
            create_fars: self.create_fars.clone(),
            remove_pdrs: self.remove_pdrs.clone(),
            remove_fars: self.remove_fars.clone(),
        }
    }
}

/// Control plane view of one PFCP session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub seid: u64,
    /// SEID allocated by the user plane
    pub remote_seid: Option<u64>,
    pub node_id: NodeId,
    pub state: SessionState,
    pub rules: RuleSet,
    pub usage: UsageReport,
    pub created_at: SystemTime,
}

impl Session {
    fn store_key(&self) -> String {
        store_key(self.seid)
    }
}

fn store_key(seid: u64) -> String {
    format!("session:{seid}")
}

struct SessionEntry {
    node_id: NodeId,
    op: Mutex<()>,
    data: Mutex<Session>,
}

/// Control plane session table
pub struct SessionManager {
    local_node_id: NodeId,
    assoc: Arc<AssociationManager>,
    correlator: Arc<Correlator>,
    store: Arc<dyn KeyedStore>,
    ttl: Option<Duration>,
    upstream: Arc<dyn UpstreamSink>,
    next_seid: AtomicU64,
    sessions: RwLock<HashMap<u64, Arc<SessionEntry>>>,
    released: Mutex<VecDeque<Session>>,
}

impl SessionManager {
    pub fn new(
        assoc: Arc<AssociationManager>,
        correlator: Arc<Correlator>,
        store: Arc<dyn KeyedStore>,
        ttl: Option<Duration>,
        upstream: Arc<dyn UpstreamSink>,
    ) -> Self {
        Self {
            local_node_id: assoc.local_node_id().clone(),
            assoc,
            correlator,
            store,
            ttl,
            upstream,
            next_seid: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
            released: Mutex::new(VecDeque::new()),
        }
    }

    async fn entry(&self, seid: u64) -> Option<Arc<SessionEntry>> {
        self.sessions.read().await.get(&seid).cloned()
    }

    async fn persist(&self, session: &Session) -> N4Result<()> {
        put_record(self.store.as_ref(), &session.store_key(), session, self.ttl).await?;
        Ok(())
    }

    async fn forget(&self, seid: u64) -> N4Result<()> {
        self.sessions.write().await.remove(&seid);
        self.store.delete(&store_key(seid)).await?;
        Ok(())
    }

    async fn remember_released(&self, session: Session) {
        let mut released = self.released.lock().await;
        if released.len() == RELEASED_HISTORY {
            released.pop_front();
        }
        released.push_back(session);
    }

    /// Reload established sessions persisted before a restart.
    ///
    /// Only sessions whose association is established again are kept; the
    /// rest are deleted from the store. SEID allocation resumes above every
    /// persisted SEID.
    pub async fn restore(&self) -> N4Result<usize> {
        let records: Vec<Session> = load_records(self.store.as_ref(), "session:").await?;
        let mut restored = 0;

        for session in records {
            let seid = session.seid;
            self.next_seid.fetch_max(seid.saturating_add(1), Ordering::Relaxed);
            if self.entry(seid).await.is_some() {
                continue;
            }

            let live = session.state == SessionState::Established
                && session.remote_seid.is_some()
                && self.assoc.is_established(&session.node_id).await;
            if !live {
                log::debug!("[{seid:#x}] Dropping stale session record ({:?})", session.state);
                self.discard(seid).await;
                continue;
            }

            log::info!("[{seid:#x}] Session restored on {}", session.node_id);
            let entry = Arc::new(SessionEntry {
                node_id: session.node_id.clone(),
                op: Mutex::new(()),
                data: Mutex::new(session),
            });
            self.sessions.write().await.insert(seid, entry);
            restored += 1;
        }
        Ok(restored)
    }

    /// Establish a session on the user plane behind `node_id`
    pub async fn create_session(&self, node_id: &NodeId, pdrs: Vec<Pdr>, fars: Vec<Far>) -> N4Result<u64> {
        let peer_addr = self.assoc.established_peer(node_id).await?;
        let rules = RuleSet::new(pdrs, fars)?;

        let seid = self.next_seid.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            seid,
            remote_seid: None,
            node_id: node_id.clone(),
            state: SessionState::Requested,
            rules,
            usage: UsageReport::default(),
            created_at: SystemTime::now(),
        };
        let entry = Arc::new(SessionEntry {
            node_id: node_id.clone(),
            op: Mutex::new(()),
            data: Mutex::new(session.clone()),
        });
        let _op = entry.op.lock().await;

        self.sessions.write().await.insert(seid, entry.clone());
        if let Err(e) = self.persist(&session).await {
            self.sessions.write().await.remove(&seid);
            return Err(e);
        }

        let mut request = SessionEstablishmentRequest::new(self.local_node_id.clone(), seid);
        request.create_pdrs = session.rules.pdr_list();
        request.create_fars = session.rules.far_list();
        log::debug!("[{seid:#x}] Session Establishment Request sent to {node_id}");

        let result = self
            .correlator
            .request(peer_addr, PfcpMessage::SessionEstablishmentRequest(request))
            .await;

        let remote_seid = match result {
            Ok(Response {
                message: PfcpMessage::SessionEstablishmentResponse(rsp),
                ..
            }) => match (rsp.cause.is_success(), rsp.up_seid) {
                (true, Some(remote_seid)) => remote_seid,
                (true, None) => {
                    self.discard(seid).await;
                    return Err(N4Error::UnexpectedResponse(
                        "Session Establishment Response without F-SEID".to_string(),
                    ));
                }
                (false, _) => {
                    log::warn!("[{seid:#x}] Session establishment rejected: {}", rsp.cause);
                    self.discard(seid).await;
                    return Err(N4Error::Rejected(rsp.cause));
                }
            },
            Ok(other) => {
                self.discard(seid).await;
                return Err(N4Error::UnexpectedResponse(other.message.message_type().name().to_string()));
            }
            Err(e) => {
                log::warn!("[{seid:#x}] Session establishment failed: {e}");
                self.discard(seid).await;
                return Err(e);
            }
        };

        let established = {
            let mut data = entry.data.lock().await;
            if data.state != SessionState::Requested {
                // Association went away while the request was in flight
                return Err(N4Error::AssociationNotEstablished(node_id.clone()));
            }
            data.state = SessionState::Established;
            data.remote_seid = Some(remote_seid);
            data.clone()
        };

        if let Err(e) = self.persist(&established).await {
            log::error!("[{seid:#x}] Failed to persist session, deleting it on {node_id}: {e}");
            self.discard(seid).await;
            let correlator = self.correlator.clone();
            tokio::spawn(async move {
                let request = SessionDeletionRequest::new(remote_seid);
                let _ = correlator
                    .request(peer_addr, PfcpMessage::SessionDeletionRequest(request))
                    .await;
            });
            return Err(e);
        }

        log::info!("[{seid:#x}] Session established on {node_id} (remote SEID {remote_seid:#x})");
        Ok(seid)
    }

    async fn discard(&self, seid: u64) {
        if let Err(e) = self.forget(seid).await {
            log::error!("[{seid:#x}] Failed to delete session record: {e}");
        }
    }

    /// Apply rule changes; the previous rule set is kept until the peer confirms
    pub async fn modify_session(&self, seid: u64, changes: SessionChanges) -> N4Result<()> {
        let entry = self.entry(seid).await.ok_or(N4Error::SessionNotFound(seid))?;
        let _op = entry.op.lock().await;
        let peer_addr = self.assoc.established_peer(&entry.node_id).await?;

        let (snapshot, request) = {
            let mut data = entry.data.lock().await;
            if data.state != SessionState::Established {
                return Err(N4Error::InvalidSessionState {
                    seid,
                    state: data.state,
                });
            }
            let rules = data.rules.applied(&changes)?;
            let remote_seid = data.remote_seid.ok_or(N4Error::InvalidSessionState {
                seid,
                state: data.state,
            })?;
            let snapshot = std::mem::replace(&mut data.rules, rules);
            data.state = SessionState::ModifyPending;
            (snapshot, changes.to_request(remote_seid))
        };

        let result = self
            .correlator
            .request(peer_addr, PfcpMessage::SessionModificationRequest(request))
            .await;
        let outcome = match result {
            Ok(Response {
                message: PfcpMessage::SessionModificationResponse(rsp),
                ..
            }) if rsp.cause.is_success() => Ok(()),
            Ok(Response {
                message: PfcpMessage::SessionModificationResponse(rsp),
                ..
            }) => Err(N4Error::Rejected(rsp.cause)),
            Ok(other) => Err(N4Error::UnexpectedResponse(other.message.message_type().name().to_string())),
            Err(e) => Err(e),
        };

        let mut data = entry.data.lock().await;
        if data.state != SessionState::ModifyPending {
            return Err(N4Error::InvalidSessionState {
                seid,
                state: data.state,
            });
        }
        data.state = SessionState::Established;

        match outcome {
            Ok(()) => {
                log::info!("[{seid:#x}] Session modified");
                let updated = data.clone();
                drop(data);
                self.persist(&updated).await
            }
            Err(e) => {
                log::warn!("[{seid:#x}] Session modification failed, rules restored: {e}");
                data.rules = snapshot;
                Err(e)
            }
        }
    }

    /// Delete a session on the user plane; returns its final usage.
    ///
    /// The session ends up released even if the peer never answers.
    pub async fn release_session(&self, seid: u64) -> N4Result<Option<UsageReport>> {
        let Some(entry) = self.entry(seid).await else {
            return Err(match self.released_snapshot(seid).await {
                Some(session) => N4Error::InvalidSessionState {
                    seid,
                    state: session.state,
                },
                None => N4Error::SessionNotFound(seid),
            });
        };
        let _op = entry.op.lock().await;

        let remote_seid = {
            let data = entry.data.lock().await;
            if data.state == SessionState::Released {
                return Err(N4Error::InvalidSessionState {
                    seid,
                    state: data.state,
                });
            }
            data.remote_seid
        };

        let mut final_usage = None;
        match (remote_seid, self.assoc.established_peer(&entry.node_id).await) {
            (Some(remote_seid), Ok(peer_addr)) => {
                let request = SessionDeletionRequest::new(remote_seid);
                match self
                    .correlator
                    .request(peer_addr, PfcpMessage::SessionDeletionRequest(request))
                    .await
                {
                    Ok(Response {
                        message: PfcpMessage::SessionDeletionResponse(rsp),
                        ..
                    }) => {
                        if !rsp.cause.is_success() {
                            log::warn!("[{seid:#x}] Peer answered deletion with {}", rsp.cause);
                        }
                        final_usage = rsp.usage_report;
                    }
                    Ok(other) => log::warn!(
                        "[{seid:#x}] Unexpected {} to deletion",
                        other.message.message_type().name()
                    ),
                    Err(e) => log::warn!("[{seid:#x}] Session Deletion Request unanswered: {e}"),
                }
            }
            (_, Err(_)) => log::warn!("[{seid:#x}] No association with {}, releasing locally", entry.node_id),
            (None, _) => {}
        }

        let released = {
            let mut data = entry.data.lock().await;
            if data.state == SessionState::Released {
                // Cascaded away while the deletion was in flight
                return Ok(final_usage);
            }
            data.state = SessionState::Released;
            if let Some(usage) = final_usage {
                data.usage = usage;
            }
            data.clone()
        };

        log::info!("[{seid:#x}] Session released");
        self.remember_released(released.clone()).await;
        let forgotten = self.forget(seid).await;

        self.upstream.session_released(seid, ReleaseReason::Local);
        if let Some(usage) = final_usage {
            self.upstream
                .usage_report(UsageRecord::new(seid, released.node_id.clone(), usage));
        }
        forgotten.map(|()| final_usage)
    }

    /// Record a usage report and forward it upstream.
    ///
    /// Reports for unknown or released sessions are logged and dropped; the
    /// peer still gets an accepting answer.
    pub async fn handle_usage_report(&self, seid: u64, report: UsageReport) -> PfcpCause {
        let Some(entry) = self.entry(seid).await else {
            log::warn!("[{seid:#x}] Usage report for unknown session discarded");
            return PfcpCause::RequestAccepted;
        };

        let node_id = {
            let mut data = entry.data.lock().await;
            if data.state == SessionState::Released {
                log::warn!("[{seid:#x}] Usage report for released session discarded");
                return PfcpCause::RequestAccepted;
            }
            data.usage = report;
            data.node_id.clone()
        };

        log::debug!(
            "[{seid:#x}] Usage report: volume={} duration={}ms",
            report.volume,
            report.duration_ms
        );
        self.upstream.usage_report(UsageRecord::new(seid, node_id, report));
        PfcpCause::RequestAccepted
    }

    async fn released_snapshot(&self, seid: u64) -> Option<Session> {
        self.released
            .lock()
            .await
            .iter()
            .rev()
            .find(|session| session.seid == seid)
            .cloned()
    }

    /// Current or recently released session
    pub async fn get(&self, seid: u64) -> Option<Session> {
        match self.entry(seid).await {
            Some(entry) => Some(entry.data.lock().await.clone()),
            None => self.released_snapshot(seid).await,
        }
    }

    pub async fn state(&self, seid: u64) -> Option<SessionState> {
        self.get(seid).await.map(|session| session.state)
    }

    /// SEIDs of live sessions owned by `node_id`
    pub async fn sessions_for(&self, node_id: &NodeId) -> Vec<u64> {
        let mut seids: Vec<u64> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.node_id == *node_id)
            .map(|(seid, _)| *seid)
            .collect();
        seids.sort_unstable();
        seids
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AssociationObserver for SessionManager {
    async fn association_released(&self, node_id: &NodeId, reason: ReleaseReason) {
        for seid in self.sessions_for(node_id).await {
            let Some(entry) = self.entry(seid).await else {
                continue;
            };
            let released = {
                let mut data = entry.data.lock().await;
                if data.state == SessionState::Released {
                    continue;
                }
                data.state = SessionState::Released;
                data.clone()
            };

            log::info!("[{seid:#x}] Session released with association {node_id} ({reason:?})");
            self.remember_released(released).await;
            self.discard(seid).await;
            self.upstream.session_released(seid, reason);
        }
    }
}

#[async_trait]
impl SessionRequestHandler for SessionManager {
    async fn handle_session_request(&self, peer: SocketAddr, message: PfcpMessage) -> Option<PfcpMessage> {
        match message {
            PfcpMessage::SessionReportRequest(req) => {
                let cause = self.handle_usage_report(req.seid, req.usage_report).await;
                Some(PfcpMessage::SessionReportResponse(SessionReportResponse::new(cause)))
            }
            other => {
                log::warn!("{} from {peer} not handled by control plane", other.message_type().name());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimerConfig;
    use crate::store::{get_record, put_record, MemoryStore};
    use crate::testing::{FailingStore, MockTransport};
    use crate::upstream::{ChannelSink, UpstreamEvent};
    use mob5g_pfcp::message::{
        AssociationSetupRequest, SessionDeletionResponse, SessionEstablishmentResponse,
        SessionModificationResponse,
    };
    use mob5g_pfcp::types::{ApplyAction, Qos};
    use tokio::sync::mpsc;

    const UPF: &str = "127.0.0.7:8805";

    fn pdr(rule_id: u32, far_id: u32) -> Pdr {
        Pdr {
            rule_id,
            match_criteria: format!("permit out ip from any to 10.45.0.{rule_id}"),
            qos: Qos {
                five_qi: 9,
                ..Default::default()
            },
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

    struct Fixture {
        transport: Arc<MockTransport>,
        correlator: Arc<Correlator>,
        assoc: Arc<AssociationManager>,
        sessions: Arc<SessionManager>,
        store: Arc<MemoryStore>,
        events: mpsc::UnboundedReceiver<UpstreamEvent>,
    }

    async fn fixture_with_store(store: Arc<dyn KeyedStore>) -> (Fixture, Arc<SessionManager>) {
        let transport = MockTransport::new();
        let correlator = Correlator::new(transport.clone(), TimerConfig::new_millis(2, 1000));
        let assoc_store = Arc::new(MemoryStore::new());
        let assoc = Arc::new(AssociationManager::new(
            NodeId::new("smf-1"),
            1,
            correlator.clone(),
            assoc_store.clone(),
            None,
        ));
        let (sink, events) = ChannelSink::new();
        let sessions = Arc::new(SessionManager::new(
            assoc.clone(),
            correlator.clone(),
            store,
            None,
            Arc::new(sink),
        ));
        let observer: Arc<dyn AssociationObserver> = sessions.clone();
        assoc.add_observer(Arc::downgrade(&observer)).await;

        // Peer-initiated setup establishes without any wire exchange
        assoc
            .handle_setup_request(UPF.parse().unwrap(), AssociationSetupRequest::new(NodeId::new("upf-1"), 100))
            .await;

        let fixture = Fixture {
            transport,
            correlator,
            assoc,
            sessions: sessions.clone(),
            store: assoc_store,
            events,
        };
        (fixture, sessions)
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let (mut f, _) = fixture_with_store(store.clone()).await;
        f.store = store;
        f
    }

    async fn create(f: &Fixture, remote_seid: u64) -> u64 {
        let sessions = f.sessions.clone();
        let task = tokio::spawn(async move {
            sessions
                .create_session(&NodeId::new("upf-1"), vec![pdr(1, 1)], vec![far(1)])
                .await
        });
        let (header, msg, _) = f.transport.recv().await;
        let seid = match msg {
            PfcpMessage::SessionEstablishmentRequest(req) => {
                assert_eq!(req.create_pdrs, vec![pdr(1, 1)]);
                assert_eq!(f.sessions.state(req.cp_seid).await, Some(SessionState::Requested));
                req.cp_seid
            }
            other => panic!("unexpected {other:?}"),
        };
        let mut rsp = SessionEstablishmentResponse::new(NodeId::new("upf-1"), PfcpCause::RequestAccepted);
        rsp.up_seid = Some(remote_seid);
        f.transport
            .respond(&f.correlator, &header, PfcpMessage::SessionEstablishmentResponse(rsp))
            .await;
        assert_eq!(task.await.unwrap().unwrap(), seid);
        seid
    }

    #[test]
    fn test_rule_set_validation() {
        assert!(RuleSet::new(vec![pdr(1, 1)], vec![far(1)]).is_ok());
        assert!(matches!(
            RuleSet::new(vec![pdr(1, 2)], vec![far(1)]),
            Err(N4Error::InvalidRules(_))
        ));

        let rules = RuleSet::new(vec![pdr(1, 1)], vec![far(1)]).unwrap();
        let changes = SessionChanges {
            remove_fars: vec![1],
            ..Default::default()
        };
        assert!(rules.applied(&changes).is_err());

        let changes = SessionChanges {
            create_pdrs: vec![pdr(1, 2)],
            create_fars: vec![far(2)],
            remove_fars: vec![1],
            ..Default::default()
        };
        let updated = rules.applied(&changes).unwrap();
        assert_eq!(updated.pdrs[&1].far_id, 2);
        assert!(!updated.fars.contains_key(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_session() {
        let f = fixture().await;
        let seid = create(&f, 0x9000).await;

        let session = f.sessions.get(seid).await.unwrap();
        assert_eq!(session.state, SessionState::Established);
        assert_eq!(session.remote_seid, Some(0x9000));
        assert_eq!(f.sessions.sessions_for(&NodeId::new("upf-1")).await, vec![seid]);

        let record: Option<Session> = get_record(f.store.as_ref(), &format!("session:{seid}")).await.unwrap();
        assert_eq!(record.unwrap().state, SessionState::Established);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_sessions_after_restart() {
        let f = fixture().await;
        let first = create(&f, 0x9000).await;
        let second = create(&f, 0x9001).await;

        let stale = |seid: u64, node: &str, state: SessionState| Session {
            seid,
            remote_seid: Some(0x9100),
            node_id: NodeId::new(node),
            state,
            rules: RuleSet::new(vec![pdr(1, 1)], vec![far(1)]).unwrap(),
            usage: UsageReport::default(),
            created_at: SystemTime::now(),
        };
        // Establishment in flight at shutdown, and a session on a peer that is gone
        put_record(f.store.as_ref(), "session:40", &stale(40, "upf-1", SessionState::Requested), None)
            .await
            .unwrap();
        put_record(f.store.as_ref(), "session:7", &stale(7, "upf-9", SessionState::Established), None)
            .await
            .unwrap();

        let (g, sessions) = fixture_with_store(f.store.clone()).await;
        assert_eq!(sessions.restore().await.unwrap(), 2);
        assert_eq!(sessions.sessions_for(&NodeId::new("upf-1")).await, vec![first, second]);
        let session = sessions.get(first).await.unwrap();
        assert_eq!(session.state, SessionState::Established);
        assert_eq!(session.remote_seid, Some(0x9000));
        assert!(f.store.get("session:40").await.unwrap().is_none());
        assert!(f.store.get("session:7").await.unwrap().is_none());

        // SEIDs continue above the highest one ever persisted
        assert_eq!(create(&g, 0x9002).await, 41);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_session_without_association() {
        let f = fixture().await;
        let result = f
            .sessions
            .create_session(&NodeId::new("upf-2"), vec![pdr(1, 1)], vec![far(1)])
            .await;
        assert!(matches!(result, Err(N4Error::AssociationNotEstablished(_))));
        assert_eq!(f.transport.sent_count(), 0);
        assert!(f.sessions.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_session_invalid_rules_not_sent() {
        let f = fixture().await;
        let result = f
            .sessions
            .create_session(&NodeId::new("upf-1"), vec![pdr(1, 7)], vec![far(1)])
            .await;
        assert!(matches!(result, Err(N4Error::InvalidRules(_))));
        assert_eq!(f.transport.sent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_session_rejected_or_timeout_discards() {
        let f = fixture().await;
        let sessions = f.sessions.clone();
        let task = tokio::spawn(async move {
            sessions
                .create_session(&NodeId::new("upf-1"), vec![pdr(1, 1)], vec![far(1)])
                .await
        });
        let (header, msg, _) = f.transport.recv().await;
        let PfcpMessage::SessionEstablishmentRequest(req) = msg else {
            panic!("expected establishment request");
        };
        f.transport
            .respond(
                &f.correlator,
                &header,
                PfcpMessage::SessionEstablishmentResponse(SessionEstablishmentResponse::new(
                    NodeId::new("upf-1"),
                    PfcpCause::RuleCreationModificationFailure,
                )),
            )
            .await;
        assert!(matches!(
            task.await.unwrap(),
            Err(N4Error::Rejected(PfcpCause::RuleCreationModificationFailure))
        ));
        assert_eq!(f.sessions.state(req.cp_seid).await, None);

        let result = f
            .sessions
            .create_session(&NodeId::new("upf-1"), vec![pdr(1, 1)], vec![far(1)])
            .await;
        assert!(matches!(result, Err(N4Error::Timeout)));
        assert!(f.sessions.is_empty().await);
        assert!(f.store.get("session:2").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_session_persist_failure() {
        let (f, sessions) = fixture_with_store(Arc::new(FailingStore)).await;
        let result = sessions
            .create_session(&NodeId::new("upf-1"), vec![pdr(1, 1)], vec![far(1)])
            .await;
        assert!(matches!(result, Err(N4Error::Store(_))));
        assert!(sessions.is_empty().await);
        assert_eq!(f.transport.sent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modify_success() {
        let f = fixture().await;
        let seid = create(&f, 0x9000).await;

        let sessions = f.sessions.clone();
        let changes = SessionChanges {
            create_pdrs: vec![pdr(2, 2)],
            create_fars: vec![far(2)],
            ..Default::default()
        };
        let task = tokio::spawn(async move { sessions.modify_session(seid, changes).await });

        let (header, msg, _) = f.transport.recv().await;
        let PfcpMessage::SessionModificationRequest(req) = msg else {
            panic!("expected modification request");
        };
        assert_eq!(req.seid, 0x9000);
        assert_eq!(f.sessions.state(seid).await, Some(SessionState::ModifyPending));

        f.transport
            .respond(
                &f.correlator,
                &header,
                PfcpMessage::SessionModificationResponse(SessionModificationResponse::new(
                    PfcpCause::RequestAccepted,
                )),
            )
            .await;
        task.await.unwrap().unwrap();

        let session = f.sessions.get(seid).await.unwrap();
        assert_eq!(session.state, SessionState::Established);
        assert_eq!(session.rules.pdrs.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_modify_restores_snapshot() {
        let f = fixture().await;
        let seid = create(&f, 0x9000).await;
        let before = f.sessions.get(seid).await.unwrap().rules;

        let changes = SessionChanges {
            create_pdrs: vec![pdr(1, 2)],
            create_fars: vec![far(2)],
            remove_fars: vec![1],
            ..Default::default()
        };

        // Rejected by the peer
        let sessions = f.sessions.clone();
        let c = changes.clone();
        let task = tokio::spawn(async move { sessions.modify_session(seid, c).await });
        let (header, _, _) = f.transport.recv().await;
        f.transport
            .respond(
                &f.correlator,
                &header,
                PfcpMessage::SessionModificationResponse(SessionModificationResponse::new(
                    PfcpCause::RuleCreationModificationFailure,
                )),
            )
            .await;
        assert!(matches!(task.await.unwrap(), Err(N4Error::Rejected(_))));
        let session = f.sessions.get(seid).await.unwrap();
        assert_eq!(session.state, SessionState::Established);
        assert_eq!(session.rules, before);

        // No answer at all
        let result = f.sessions.modify_session(seid, changes).await;
        assert!(matches!(result, Err(N4Error::Timeout)));
        let session = f.sessions.get(seid).await.unwrap();
        assert_eq!(session.state, SessionState::Established);
        assert_eq!(session.rules, before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modify_unknown_session() {
        let f = fixture().await;
        assert!(matches!(
            f.sessions.modify_session(42, SessionChanges::default()).await,
            Err(N4Error::SessionNotFound(42))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_session_with_usage() {
        let mut f = fixture().await;
        let seid = create(&f, 0x9000).await;

        let sessions = f.sessions.clone();
        let task = tokio::spawn(async move { sessions.release_session(seid).await });
        let (header, msg, _) = f.transport.recv().await;
        assert_eq!(
            msg,
            PfcpMessage::SessionDeletionRequest(SessionDeletionRequest::new(0x9000))
        );

        let mut rsp = SessionDeletionResponse::new(PfcpCause::RequestAccepted);
        rsp.usage_report = Some(UsageReport::new(4096, 12_000));
        f.transport
            .respond(&f.correlator, &header, PfcpMessage::SessionDeletionResponse(rsp))
            .await;

        let usage = task.await.unwrap().unwrap();
        assert_eq!(usage, Some(UsageReport::new(4096, 12_000)));
        assert_eq!(f.sessions.state(seid).await, Some(SessionState::Released));
        assert!(f.store.get(&format!("session:{seid}")).await.unwrap().is_none());

        assert_eq!(
            f.events.recv().await,
            Some(UpstreamEvent::SessionReleased {
                seid,
                reason: ReleaseReason::Local
            })
        );
        assert!(matches!(f.events.recv().await, Some(UpstreamEvent::UsageReport(r)) if r.volume == 4096));

        assert!(matches!(
            f.sessions.release_session(seid).await,
            Err(N4Error::InvalidSessionState {
                state: SessionState::Released,
                ..
            })
        ));
        assert!(matches!(
            f.sessions.modify_session(seid, SessionChanges::default()).await,
            Err(N4Error::SessionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_on_timeout() {
        let f = fixture().await;
        let seid = create(&f, 0x9000).await;

        let usage = f.sessions.release_session(seid).await.unwrap();
        assert_eq!(usage, None);
        assert_eq!(f.sessions.state(seid).await, Some(SessionState::Released));
        // Deletion request plus two retransmissions
        assert_eq!(f.transport.sent_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_report() {
        let mut f = fixture().await;
        let seid = create(&f, 0x9000).await;

        let cause = f.sessions.handle_usage_report(seid, UsageReport::new(100, 1000)).await;
        assert_eq!(cause, PfcpCause::RequestAccepted);
        assert_eq!(f.sessions.get(seid).await.unwrap().usage.volume, 100);
        assert!(matches!(f.events.recv().await, Some(UpstreamEvent::UsageReport(r)) if r.session_id == seid));

        // Unknown SEID is not an error towards the peer
        let cause = f.sessions.handle_usage_report(777, UsageReport::new(1, 1)).await;
        assert_eq!(cause, PfcpCause::RequestAccepted);
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_association_release_cascades() {
        let mut f = fixture().await;
        let first = create(&f, 0x9000).await;
        let second = create(&f, 0x9001).await;

        assert!(
            f.assoc
                .force_release(&NodeId::new("upf-1"), ReleaseReason::PeerRestart)
                .await
        );
        assert_eq!(f.sessions.state(first).await, Some(SessionState::Released));
        assert_eq!(f.sessions.state(second).await, Some(SessionState::Released));
        assert!(f.sessions.is_empty().await);

        let mut released = Vec::new();
        while let Ok(UpstreamEvent::SessionReleased { seid, reason }) = f.events.try_recv() {
            assert_eq!(reason, ReleaseReason::PeerRestart);
            released.push(seid);
        }
        released.sort_unstable();
        assert_eq!(released, vec![first, second]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_report_request_handler() {
        let f = fixture().await;
        let seid = create(&f, 0x9000).await;
        let request = mob5g_pfcp::message::SessionReportRequest::new(seid, UsageReport::new(5, 5));
        let response = f
            .sessions
            .handle_session_request(UPF.parse().unwrap(), PfcpMessage::SessionReportRequest(request))
            .await;
        assert_eq!(
            response,
            Some(PfcpMessage::SessionReportResponse(SessionReportResponse::new(
                PfcpCause::RequestAccepted
            )))
        );
    }
}
