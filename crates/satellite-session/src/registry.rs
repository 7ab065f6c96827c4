//! Session registry: keyed store of paired satellites.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use satellite_core::error::{Result, SatelliteError};
use satellite_core::types::SatelliteId;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use crate::entity::{SatelliteEntity, SatelliteUpdate};
use crate::session::{Collaborators, Session};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SatelliteId, Arc<Session>>>,
    collaborators: Collaborators,
    updates: broadcast::Sender<SatelliteUpdate>,
}

impl SessionRegistry {
    pub fn new(collaborators: Collaborators) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            collaborators,
            updates,
        }
    }

    /// Receive every published satellite update.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<SatelliteUpdate> {
        self.updates.subscribe()
    }

    /// Create the session for a newly paired device.
    pub async fn pair(
        &self,
        id: SatelliteId,
        name: impl Into<String>,
        keep_alive_target: Option<String>,
    ) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(SatelliteError::InvalidParams(format!(
                "Satellite {id} is already paired"
            )));
        }

        let session = Session::new(
            id.clone(),
            name,
            keep_alive_target,
            &self.collaborators,
            self.updates.clone(),
        );
        if let Some(timers) = &self.collaborators.timers {
            timers.register(&id, session.timer_handler());
        }
        sessions.insert(id.clone(), Arc::clone(&session));
        info!(satellite = %id, name = %session.name(), "Satellite paired");
        let _ = self.updates.send(session.snapshot());
        Ok(session)
    }

    /// Remove a device and tear its session down.
    pub async fn unpair(&self, id: &SatelliteId) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SatelliteError::NotFound(format!("Satellite {id}")))?;

        if let Some(timers) = &self.collaborators.timers {
            timers.unregister(id);
        }
        session.teardown().await;
        info!(satellite = %id, "Satellite unpaired");
        Ok(())
    }

    pub async fn get(&self, id: &SatelliteId) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SatelliteError::NotFound(format!("Satellite {id}")))
    }

    /// Snapshots of every satellite, ordered by id.
    pub async fn list(&self) -> Vec<SatelliteUpdate> {
        let mut list: Vec<SatelliteUpdate> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.snapshot())
            .collect();
        list.sort_by(|a, b| a.satellite.cmp(&b.satellite));
        list
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Release subscriptions and runs bound to a closed connection.
    pub async fn disconnect(&self, conn_id: &str) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        join_all(sessions.iter().map(|s| s.disconnect(conn_id))).await;
    }

    /// Tear down every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        if let Some(timers) = &self.collaborators.timers {
            for session in &sessions {
                timers.unregister(session.id());
            }
        }
        join_all(sessions.iter().map(|s| s.teardown())).await;
    }
}
