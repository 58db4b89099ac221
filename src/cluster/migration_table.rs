//! The migration table: durable list of migrations and their sought states.
//!
//! In a deployment this table is replicated through the cluster's consensus
//! log; every node sees the same totally ordered sequence of writes. The
//! in-memory form here keeps the contract the backend relies on: writes are
//! validated against current state (a conflicting advance is rejected, not
//! applied), the recorded sought state never regresses, and every change
//! fires a per-migration notification.

use crate::cluster::SubscriptionId;
use crate::error::{Error, Result};
use crate::types::{Migration, MigrationId, MigrationMetadata, MigrationState};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

type MigrationCallback = Arc<dyn Fn(MigrationId) + Send + Sync>;

#[derive(Default)]
struct SubscriptionRegistry {
    next_id: SubscriptionId,
    subscribers: Vec<(SubscriptionId, MigrationCallback)>,
}

#[derive(Default)]
struct TableInner {
    migrations: BTreeMap<MigrationId, MigrationMetadata>,
    next_id: MigrationId,
}

/// The cluster-wide migration authority.
#[derive(Default)]
pub struct MigrationTable {
    inner: RwLock<TableInner>,
    subscriptions: Mutex<SubscriptionRegistry>,
}

impl MigrationTable {
    /// Create an empty migration table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new migration in the `planned` state and return its id.
    ///
    /// A topic may participate in at most one active migration; a
    /// conflicting declaration is rejected.
    pub fn create(&self, migration: Migration) -> Result<MigrationId> {
        let mut inner = self.inner.write();
        for topic in migration.topics() {
            let conflict = inner.migrations.values().find(|existing| {
                !existing.sought_state.is_terminal()
                    && existing.migration.topics().contains(topic)
            });
            if let Some(existing) = conflict {
                return Err(Error::TopicAlreadyMigrating {
                    topic: topic.clone(),
                    migration: existing.id,
                });
            }
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.migrations.insert(
            id,
            MigrationMetadata {
                id,
                migration,
                sought_state: MigrationState::Planned,
            },
        );
        drop(inner);
        tracing::info!(migration = id, "migration created");
        self.notify(id);
        Ok(id)
    }

    /// Look up one migration.
    pub fn get(&self, id: MigrationId) -> Option<MigrationMetadata> {
        self.inner.read().migrations.get(&id).cloned()
    }

    /// Snapshot every migration currently in the table.
    pub fn snapshot(&self) -> Vec<MigrationMetadata> {
        self.inner.read().migrations.values().cloned().collect()
    }

    /// Durably advance a migration's sought state to `to`.
    ///
    /// The write is validated against the table's current state: anything
    /// other than the immediate next lifecycle state is rejected with
    /// [`Error::AdvanceConflict`] and the caller must re-read the table.
    /// This is what keeps the recorded sought state monotonic.
    pub async fn advance(&self, id: MigrationId, to: MigrationState) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let metadata = inner
                .migrations
                .get_mut(&id)
                .ok_or(Error::MigrationNotFound(id))?;
            if metadata.sought_state.next() != Some(to) {
                return Err(Error::AdvanceConflict {
                    migration: id,
                    current: metadata.sought_state,
                    requested: to,
                });
            }
            metadata.sought_state = to;
        }
        tracing::info!(migration = id, sought_state = %to, "migration advanced");
        self.notify(id);
        Ok(())
    }

    /// Remove a migration from the table.
    pub fn remove(&self, id: MigrationId) -> Result<()> {
        let removed = self.inner.write().migrations.remove(&id);
        if removed.is_none() {
            return Err(Error::MigrationNotFound(id));
        }
        tracing::info!(migration = id, "migration removed");
        self.notify(id);
        Ok(())
    }

    /// Subscribe to per-migration change notifications. The callback must
    /// be short and non-blocking.
    pub fn subscribe(&self, callback: impl Fn(MigrationId) + Send + Sync + 'static) -> SubscriptionId {
        let mut registry = self.subscriptions.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.push((id, Arc::new(callback)));
        id
    }

    /// Deregister a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions
            .lock()
            .subscribers
            .retain(|(sub_id, _)| *sub_id != id);
    }

    fn notify(&self, id: MigrationId) {
        let callbacks: Vec<MigrationCallback> = {
            let registry = self.subscriptions.lock();
            registry
                .subscribers
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };
        for callback in callbacks {
            callback(id);
        }
    }
}

impl fmt::Debug for MigrationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationTable")
            .field("migrations", &self.inner.read().migrations.len())
            .finish()
    }
}
