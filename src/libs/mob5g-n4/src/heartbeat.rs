//! Heartbeat Supervisor
//!
//! One periodic task per established association. Consecutive heartbeat
//! timeouts up to the miss threshold force-release the association.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use mob5g_pfcp::message::{HeartbeatRequest, PfcpMessage};
use mob5g_pfcp::types::NodeId;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::assoc::{Association, AssociationManager, AssociationObserver, ReleaseReason};
use crate::config::HeartbeatConfig;
use crate::xact::{Correlator, Response};

/// Starts and stops per-association heartbeat tasks
pub struct HeartbeatSupervisor {
    me: Weak<HeartbeatSupervisor>,
    assoc: Arc<AssociationManager>,
    correlator: Arc<Correlator>,
    config: HeartbeatConfig,
    tasks: Mutex<HashMap<NodeId, JoinHandle<()>>>,
}

impl HeartbeatSupervisor {
    pub fn new(assoc: Arc<AssociationManager>, correlator: Arc<Correlator>, config: HeartbeatConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            assoc,
            correlator,
            config,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Start supervising `node_id`, replacing any previous task for it
    pub async fn spawn(&self, node_id: NodeId, peer_addr: SocketAddr) {
        if !self.config.enabled {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };

        let handle = tokio::spawn(me.run(node_id.clone(), peer_addr));
        if let Some(previous) = self.tasks.lock().await.insert(node_id.clone(), handle) {
            previous.abort();
        }
        log::debug!("[{node_id}] Heartbeat supervision started");
    }

    /// Stop supervising `node_id`
    pub async fn stop(&self, node_id: &NodeId) {
        if let Some(handle) = self.tasks.lock().await.remove(node_id) {
            handle.abort();
            log::debug!("[{node_id}] Heartbeat supervision stopped");
        }
    }

    /// Stop every task
    pub async fn stop_all(&self) {
        for (_, handle) in self.tasks.lock().await.drain() {
            handle.abort();
        }
    }

    pub async fn active_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    async fn run(self: Arc<Self>, node_id: NodeId, peer_addr: SocketAddr) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        let mut missed = 0u32;
        loop {
            interval.tick().await;

            let request = HeartbeatRequest::new(self.assoc.recovery_time_stamp());
            match self
                .correlator
                .request(peer_addr, PfcpMessage::HeartbeatRequest(request))
                .await
            {
                Ok(Response {
                    message: PfcpMessage::HeartbeatResponse(rsp),
                    ..
                }) => {
                    missed = 0;
                    // Releasing from here would abort this task mid-cascade
                    let assoc = self.assoc.clone();
                    let node_id = node_id.clone();
                    tokio::spawn(async move {
                        assoc.touch(&node_id).await;
                        assoc.observe_recovery(&node_id, rsp.recovery_time_stamp).await;
                    });
                }
                Ok(other) => {
                    missed += 1;
                    log::warn!(
                        "[{node_id}] Unexpected {} to heartbeat",
                        other.message.message_type().name()
                    );
                }
                Err(e) => {
                    missed += 1;
                    log::warn!(
                        "[{node_id}] Heartbeat failed ({missed}/{}): {e}",
                        self.config.miss_threshold
                    );
                }
            }

            if missed >= self.config.miss_threshold {
                log::error!("[{node_id}] No heartbeat response, releasing association");
                let assoc = self.assoc.clone();
                let node_id = node_id.clone();
                tokio::spawn(async move {
                    assoc.force_release(&node_id, ReleaseReason::HeartbeatFailure).await;
                });
                break;
            }
        }
    }
}

#[async_trait]
impl AssociationObserver for HeartbeatSupervisor {
    async fn association_established(&self, association: &Association) {
        self.spawn(association.node_id.clone(), association.peer_addr).await;
    }

    async fn association_released(&self, node_id: &NodeId, _reason: ReleaseReason) {
        self.stop(node_id).await;
    }
}
