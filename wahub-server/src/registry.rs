//! Device registry: device id -> live session.
//!
//! Creation holds the write lock until the session is registered, so a
//! lookup never sees a half-built session.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;
use wahub_core::models::{DeviceConfig, DeviceStatus, NewDevice};
use wahub_core::HubError;

use crate::session::{Session, SessionContext};

pub struct DeviceRegistry {
    ctx: Arc<SessionContext>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl DeviceRegistry {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            ctx,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create, persist and start a new device under a fresh random id.
    pub async fn create(&self, request: NewDevice) -> Result<Arc<Session>, HubError> {
        let mut sessions = self.sessions.write().await;
        let device_id = loop {
            let id = Uuid::new_v4().to_string();
            if !sessions.contains_key(&id) {
                break id;
            }
        };

        let mut config = DeviceConfig::new(&device_id, request);
        self.ctx.store.save(&mut config).await?;

        let session = Session::start(config, Arc::clone(&self.ctx));
        sessions.insert(device_id.clone(), Arc::clone(&session));
        info!(device_id = %device_id, total = sessions.len(), "Device created");
        Ok(session)
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(device_id).cloned()
    }

    pub async fn list(&self) -> Vec<DeviceStatus> {
        let sessions = self.sessions.read().await;
        let mut statuses: Vec<DeviceStatus> = sessions.values().map(|s| s.status()).collect();
        statuses.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        statuses
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn ready_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_ready())
            .count()
    }

    /// Forget the device, then destroy it. The entry is gone before teardown
    /// starts, so a concurrent delete of the same id gets `NotFound`.
    pub async fn delete(&self, device_id: &str) -> Result<(), HubError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(device_id)
            .ok_or_else(|| HubError::NotFound(device_id.to_string()))?;

        let result = session.destroy().await;
        info!(device_id, "Device deleted");
        result
    }

    /// Start a session for every persisted config. Unreadable configs are
    /// skipped. Returns how many devices were restored.
    pub async fn restore_from_disk(&self) -> Result<usize, HubError> {
        let ids = self.ctx.store.list_device_ids().await?;
        let mut sessions = self.sessions.write().await;
        let mut restored = 0;

        for device_id in ids {
            if sessions.contains_key(&device_id) {
                continue;
            }
            match self.ctx.store.load(&device_id).await {
                Ok(Some(config)) => {
                    let session = Session::start(config, Arc::clone(&self.ctx));
                    sessions.insert(device_id.clone(), session);
                    info!(device_id = %device_id, "Device restored");
                    restored += 1;
                }
                Ok(None) => warn!(device_id = %device_id, "Config disappeared during restore"),
                Err(e) => error!(device_id = %device_id, error = %e, "Failed to load device config"),
            }
        }

        info!(restored, "Restored devices from disk");
        Ok(restored)
    }

    /// Stop every session without deleting anything on disk.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        info!(count = sessions.len(), "Shutting down sessions");
        join_all(sessions.iter().map(|s| s.shutdown())).await;
    }
}
