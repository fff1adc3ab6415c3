//! PFCP Association Manager
//!
//! One entry per peer Node ID, each behind its own lock. Observers are told
//! about establishment and release so sessions and heartbeats follow the
//! association lifecycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use mob5g_pfcp::message::{
    AssociationReleaseRequest, AssociationReleaseResponse, AssociationSetupRequest,
    AssociationSetupResponse, AssociationUpdateRequest, AssociationUpdateResponse, PfcpMessage,
};
use mob5g_pfcp::types::{NodeId, PfcpCause};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::{N4Error, N4Result};
use crate::store::{load_records, put_record, KeyedStore};
use crate::xact::{Correlator, Response};

/// Association state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationState {
    Unassociated,
    Pending,
    Established,
    Released,
}

/// Why an association was released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// Released by this node
    Local,
    /// Peer sent an Association Release Request
    PeerRequested,
    /// Heartbeat miss threshold reached
    HeartbeatFailure,
    /// Peer recovery time stamp went backwards
    PeerRestart,
    /// Peer set up a new association over a live one
    PeerResetup,
}

/// Outcome of checking a peer recovery time stamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryCheck {
    /// No established association to compare against
    Unknown,
    Unchanged,
    /// A newer time stamp was recorded
    Updated,
    /// The time stamp decreased and the association was released
    Restarted,
}

/// Association with one PFCP peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub node_id: NodeId,
    pub peer_addr: SocketAddr,
    pub state: AssociationState,
    pub last_seen: SystemTime,
    pub recovery_time_stamp: Option<u32>,
    pub up_function_features: Option<u16>,
    #[serde(skip)]
    epoch: u64,
}

impl Association {
    fn new(node_id: NodeId, peer_addr: SocketAddr) -> Self {
        Self {
            node_id,
            peer_addr,
            state: AssociationState::Unassociated,
            last_seen: SystemTime::now(),
            recovery_time_stamp: None,
            up_function_features: None,
            epoch: 0,
        }
    }

    /// Reuse a released entry as a fresh unassociated one
    fn reset(&mut self, peer_addr: SocketAddr) {
        let epoch = self.epoch + 1;
        *self = Self::new(self.node_id.clone(), peer_addr);
        self.epoch = epoch;
    }

    fn is_active(&self) -> bool {
        matches!(self.state, AssociationState::Pending | AssociationState::Established)
    }

    fn store_key(&self) -> String {
        store_key(&self.node_id)
    }
}

fn store_key(node_id: &NodeId) -> String {
    format!("association:{node_id}")
}

/// Receives association lifecycle events
#[async_trait]
pub trait AssociationObserver: Send + Sync {
    async fn association_established(&self, _association: &Association) {}

    async fn association_released(&self, node_id: &NodeId, reason: ReleaseReason);
}

/// Per-peer association table
pub struct AssociationManager {
    local_node_id: NodeId,
    recovery_time_stamp: u32,
    up_function_features: Option<u16>,
    correlator: Arc<Correlator>,
    store: Arc<dyn KeyedStore>,
    ttl: Option<Duration>,
    associations: RwLock<HashMap<NodeId, Arc<Mutex<Association>>>>,
    observers: RwLock<Vec<Weak<dyn AssociationObserver>>>,
}

impl AssociationManager {
    pub fn new(
        local_node_id: NodeId,
        recovery_time_stamp: u32,
        correlator: Arc<Correlator>,
        store: Arc<dyn KeyedStore>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            local_node_id,
            recovery_time_stamp,
            up_function_features: None,
            correlator,
            store,
            ttl,
            associations: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Advertise UP function features in setup responses
    pub fn with_up_function_features(mut self, features: u16) -> Self {
        self.up_function_features = Some(features);
        self
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    pub fn recovery_time_stamp(&self) -> u32 {
        self.recovery_time_stamp
    }

    pub async fn add_observer(&self, observer: Weak<dyn AssociationObserver>) {
        self.observers.write().await.push(observer);
    }

    async fn entry(&self, node_id: &NodeId) -> Option<Arc<Mutex<Association>>> {
        self.associations.read().await.get(node_id).cloned()
    }

    async fn entry_or_insert(&self, node_id: &NodeId, peer_addr: SocketAddr) -> Arc<Mutex<Association>> {
        if let Some(entry) = self.entry(node_id).await {
            return entry;
        }
        self.associations
            .write()
            .await
            .entry(node_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Association::new(node_id.clone(), peer_addr))))
            .clone()
    }

    async fn entries(&self) -> Vec<Arc<Mutex<Association>>> {
        self.associations.read().await.values().cloned().collect()
    }

    async fn persist(&self, association: &Association) -> N4Result<()> {
        put_record(self.store.as_ref(), &association.store_key(), association, self.ttl).await?;
        Ok(())
    }

    async fn notify_established(&self, association: &Association) {
        for observer in self.live_observers().await {
            observer.association_established(association).await;
        }
    }

    async fn notify_released(&self, node_id: &NodeId, reason: ReleaseReason) {
        for observer in self.live_observers().await {
            observer.association_released(node_id, reason).await;
        }
    }

    async fn live_observers(&self) -> Vec<Arc<dyn AssociationObserver>> {
        self.observers.read().await.iter().filter_map(Weak::upgrade).collect()
    }

    /// Reload established associations persisted before a restart.
    ///
    /// Observers are told about each one as if it had just been set up, so
    /// heartbeats resume and a peer that went away is noticed. Records in any
    /// other state are dropped.
    pub async fn restore(&self) -> N4Result<usize> {
        let records: Vec<Association> = load_records(self.store.as_ref(), "association:").await?;
        let mut restored = Vec::new();

        for association in records {
            let node_id = association.node_id.clone();
            if association.state != AssociationState::Established {
                self.forget(&node_id).await;
                continue;
            }
            let inserted = {
                let mut associations = self.associations.write().await;
                if associations.contains_key(&node_id) {
                    false
                } else {
                    associations.insert(node_id.clone(), Arc::new(Mutex::new(association.clone())));
                    true
                }
            };
            if inserted {
                log::info!("[{node_id}] Association restored ({})", association.peer_addr);
                restored.push(association);
            }
        }

        for association in &restored {
            self.notify_established(association).await;
        }
        Ok(restored.len())
    }

    /// Set up an association with a peer (initiator side)
    pub async fn setup(&self, node_id: &NodeId, peer_addr: SocketAddr) -> N4Result<()> {
        let entry = self.entry_or_insert(node_id, peer_addr).await;
        let epoch = {
            let mut association = entry.lock().await;
            let state = association.state;
            match state {
                AssociationState::Unassociated => association.peer_addr = peer_addr,
                AssociationState::Released => association.reset(peer_addr),
                state => {
                    return Err(N4Error::InvalidAssociationState {
                        node_id: node_id.clone(),
                        state,
                    })
                }
            }
            association.state = AssociationState::Pending;
            association.epoch
        };
        log::info!("[{node_id}] Association Setup Request sent to {peer_addr}");

        let request = AssociationSetupRequest::new(self.local_node_id.clone(), self.recovery_time_stamp);
        let result = self
            .correlator
            .request(peer_addr, PfcpMessage::AssociationSetupRequest(request))
            .await;

        let response = match result {
            Ok(Response {
                message: PfcpMessage::AssociationSetupResponse(response),
                ..
            }) => response,
            Ok(other) => {
                self.revert_pending(&entry, epoch).await;
                return Err(N4Error::UnexpectedResponse(other.message.message_type().name().to_string()));
            }
            Err(e) => {
                log::warn!("[{node_id}] Association setup failed: {e}");
                self.revert_pending(&entry, epoch).await;
                return Err(e);
            }
        };

        if !response.cause.is_success() {
            log::warn!("[{node_id}] Association setup rejected: {}", response.cause);
            self.revert_pending(&entry, epoch).await;
            return Err(N4Error::Rejected(response.cause));
        }
        if response.node_id != *node_id {
            log::warn!("[{node_id}] Peer answered with Node ID {}", response.node_id);
        }

        let established = {
            let mut association = entry.lock().await;
            if association.state != AssociationState::Pending || association.epoch != epoch {
                return Err(N4Error::InvalidAssociationState {
                    node_id: node_id.clone(),
                    state: association.state,
                });
            }
            association.state = AssociationState::Established;
            association.last_seen = SystemTime::now();
            association.recovery_time_stamp = Some(response.recovery_time_stamp);
            association.up_function_features = response.up_function_features;
            if let Err(e) = self.persist(&association).await {
                association.state = AssociationState::Unassociated;
                return Err(e);
            }
            association.clone()
        };

        log::info!("[{node_id}] Association established");
        self.notify_established(&established).await;
        Ok(())
    }

    async fn revert_pending(&self, entry: &Mutex<Association>, epoch: u64) {
        let mut association = entry.lock().await;
        if association.state == AssociationState::Pending && association.epoch == epoch {
            association.state = AssociationState::Unassociated;
        }
    }

    /// Answer an Association Setup Request (responder side)
    pub async fn handle_setup_request(
        &self,
        peer_addr: SocketAddr,
        request: AssociationSetupRequest,
    ) -> AssociationSetupResponse {
        let node_id = request.node_id.clone();
        let entry = self.entry_or_insert(&node_id, peer_addr).await;

        let (replaced, outcome) = {
            let mut association = entry.lock().await;
            let replaced = association.is_active().then(|| {
                if association
                    .recovery_time_stamp
                    .is_some_and(|previous| request.recovery_time_stamp < previous)
                {
                    ReleaseReason::PeerRestart
                } else {
                    ReleaseReason::PeerResetup
                }
            });

            association.reset(peer_addr);
            association.state = AssociationState::Established;
            association.recovery_time_stamp = Some(request.recovery_time_stamp);
            association.up_function_features = request.up_function_features;

            let outcome = match self.persist(&association).await {
                Ok(()) => Ok(association.clone()),
                Err(e) => {
                    association.state = AssociationState::Unassociated;
                    Err(e)
                }
            };
            (replaced, outcome)
        };

        if let Some(reason) = replaced {
            log::info!("[{node_id}] Existing association replaced ({reason:?})");
            self.notify_released(&node_id, reason).await;
        }

        let cause = match outcome {
            Ok(established) => {
                log::info!("[{node_id}] Association established with {peer_addr}");
                self.notify_established(&established).await;
                PfcpCause::RequestAccepted
            }
            Err(e) => {
                log::error!("[{node_id}] Failed to persist association: {e}");
                PfcpCause::SystemFailure
            }
        };

        let mut response = AssociationSetupResponse::new(self.local_node_id.clone(), cause, self.recovery_time_stamp);
        response.up_function_features = self.up_function_features;
        response
    }

    /// Send an Association Update Request advertising new features
    pub async fn update(&self, node_id: &NodeId, up_function_features: Option<u16>) -> N4Result<()> {
        let peer_addr = self.established_peer(node_id).await?;

        let mut request = AssociationUpdateRequest::new(self.local_node_id.clone());
        request.up_function_features = up_function_features;
        let response = self
            .correlator
            .request(peer_addr, PfcpMessage::AssociationUpdateRequest(request))
            .await?;

        match response.message {
            PfcpMessage::AssociationUpdateResponse(rsp) if rsp.cause.is_success() => {
                self.touch(node_id).await;
                log::info!("[{node_id}] Association updated");
                Ok(())
            }
            PfcpMessage::AssociationUpdateResponse(rsp) => Err(N4Error::Rejected(rsp.cause)),
            other => Err(N4Error::UnexpectedResponse(other.message_type().name().to_string())),
        }
    }

    /// Answer an Association Update Request
    pub async fn handle_update_request(
        &self,
        peer_addr: SocketAddr,
        request: AssociationUpdateRequest,
    ) -> AssociationUpdateResponse {
        let node_id = request.node_id.clone();
        let local = self.local_node_id.clone();

        let Some(entry) = self.entry(&node_id).await else {
            log::warn!("[{node_id}] Association Update from unknown peer {peer_addr}");
            return AssociationUpdateResponse::new(local, PfcpCause::NoEstablishedPfcpAssociation);
        };

        {
            let mut association = entry.lock().await;
            if association.state != AssociationState::Established {
                return AssociationUpdateResponse::new(local, PfcpCause::NoEstablishedPfcpAssociation);
            }
            association.last_seen = SystemTime::now();
            if request.up_function_features.is_some() {
                association.up_function_features = request.up_function_features;
            }
            if let Err(e) = self.persist(&association).await {
                log::error!("[{node_id}] Failed to persist association: {e}");
                return AssociationUpdateResponse::new(local, PfcpCause::SystemFailure);
            }
        }

        if let Some(ts) = request.recovery_time_stamp {
            self.observe_recovery(&node_id, ts).await;
        }
        log::debug!("[{node_id}] Association updated by peer");
        AssociationUpdateResponse::new(local, PfcpCause::RequestAccepted)
    }

    /// Release an association and tell the peer (best effort)
    pub async fn release(&self, node_id: &NodeId) -> N4Result<()> {
        let entry = self
            .entry(node_id)
            .await
            .ok_or_else(|| N4Error::AssociationNotFound(node_id.clone()))?;

        let (previous, peer_addr) = {
            let mut association = entry.lock().await;
            if association.state == AssociationState::Released {
                return Err(N4Error::InvalidAssociationState {
                    node_id: node_id.clone(),
                    state: association.state,
                });
            }
            let previous = association.state;
            association.state = AssociationState::Released;
            (previous, association.peer_addr)
        };

        self.forget(node_id).await;
        log::info!("[{node_id}] Association released");
        self.notify_released(node_id, ReleaseReason::Local).await;

        if previous == AssociationState::Unassociated {
            return Ok(());
        }

        let request = AssociationReleaseRequest::new(self.local_node_id.clone());
        match self
            .correlator
            .request(peer_addr, PfcpMessage::AssociationReleaseRequest(request))
            .await
        {
            Ok(Response {
                message: PfcpMessage::AssociationReleaseResponse(rsp),
                ..
            }) if !rsp.cause.is_success() => {
                log::warn!("[{node_id}] Peer answered release with {}", rsp.cause);
            }
            Ok(_) => {}
            Err(e) => log::warn!("[{node_id}] Association Release Request unanswered: {e}"),
        }
        Ok(())
    }

    /// Answer an Association Release Request
    pub async fn handle_release_request(
        &self,
        peer_addr: SocketAddr,
        request: AssociationReleaseRequest,
    ) -> AssociationReleaseResponse {
        let cause = if self.force_release(&request.node_id, ReleaseReason::PeerRequested).await {
            PfcpCause::RequestAccepted
        } else {
            log::warn!("[{}] Association Release from {peer_addr} without association", request.node_id);
            PfcpCause::NoEstablishedPfcpAssociation
        };
        AssociationReleaseResponse::new(self.local_node_id.clone(), cause)
    }

    /// Release without signalling the peer; returns `false` if nothing was live
    pub async fn force_release(&self, node_id: &NodeId, reason: ReleaseReason) -> bool {
        let Some(entry) = self.entry(node_id).await else {
            return false;
        };

        {
            let mut association = entry.lock().await;
            if association.state == AssociationState::Released {
                return false;
            }
            association.state = AssociationState::Released;
        }

        self.forget(node_id).await;
        log::info!("[{node_id}] Association released ({reason:?})");
        self.notify_released(node_id, reason).await;
        true
    }

    async fn forget(&self, node_id: &NodeId) {
        if let Err(e) = self.store.delete(&store_key(node_id)).await {
            log::error!("[{node_id}] Failed to delete association record: {e}");
        }
    }

    /// Compare a peer recovery time stamp with the last one seen.
    ///
    /// A lower value means the peer restarted: the association is released
    /// along with every session it owns.
    pub async fn observe_recovery(&self, node_id: &NodeId, recovery_time_stamp: u32) -> RecoveryCheck {
        let Some(entry) = self.entry(node_id).await else {
            return RecoveryCheck::Unknown;
        };

        let check = {
            let mut association = entry.lock().await;
            if association.state != AssociationState::Established {
                return RecoveryCheck::Unknown;
            }
            match association.recovery_time_stamp {
                Some(previous) if recovery_time_stamp < previous => RecoveryCheck::Restarted,
                Some(previous) if recovery_time_stamp == previous => RecoveryCheck::Unchanged,
                _ => {
                    association.recovery_time_stamp = Some(recovery_time_stamp);
                    if let Err(e) = self.persist(&association).await {
                        log::error!("[{node_id}] Failed to persist association: {e}");
                    }
                    RecoveryCheck::Updated
                }
            }
        };

        if check == RecoveryCheck::Restarted {
            log::warn!("[{node_id}] Peer restart detected (recovery time stamp {recovery_time_stamp})");
            self.force_release(node_id, ReleaseReason::PeerRestart).await;
        }
        check
    }

    /// Record peer activity
    pub async fn touch(&self, node_id: &NodeId) {
        if let Some(entry) = self.entry(node_id).await {
            entry.lock().await.last_seen = SystemTime::now();
        }
    }

    pub async fn state(&self, node_id: &NodeId) -> Option<AssociationState> {
        match self.entry(node_id).await {
            Some(entry) => Some(entry.lock().await.state),
            None => None,
        }
    }

    pub async fn get(&self, node_id: &NodeId) -> Option<Association> {
        match self.entry(node_id).await {
            Some(entry) => Some(entry.lock().await.clone()),
            None => None,
        }
    }

    pub async fn is_established(&self, node_id: &NodeId) -> bool {
        self.state(node_id).await == Some(AssociationState::Established)
    }

    /// Peer address of an established association
    pub async fn established_peer(&self, node_id: &NodeId) -> N4Result<SocketAddr> {
        match self.get(node_id).await {
            Some(association) if association.state == AssociationState::Established => Ok(association.peer_addr),
            _ => Err(N4Error::AssociationNotEstablished(node_id.clone())),
        }
    }

    /// Snapshot of every established association
    pub async fn established(&self) -> Vec<Association> {
        let mut established = Vec::new();
        for entry in self.entries().await {
            let association = entry.lock().await;
            if association.state == AssociationState::Established {
                established.push(association.clone());
            }
        }
        established
    }

    /// Node ID of the established association with a peer address
    pub async fn find_by_addr(&self, peer_addr: SocketAddr) -> Option<NodeId> {
        for entry in self.entries().await {
            let association = entry.lock().await;
            if association.state == AssociationState::Established && association.peer_addr == peer_addr {
                return Some(association.node_id.clone());
            }
        }
        None
    }
}
