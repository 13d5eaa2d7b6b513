//! Recovery after a backend restore
//!
//! When the backend is rolled back it may hold objects for policies deleted
//! since the backup and lack objects for policies created since. Every
//! [`Restorable`] kind first collects garbage, then re-reconciles what is
//! missing.

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

use crate::controller::{reconcile_key, Context};
use crate::gc::GarbageCollector;
use crate::{Error, Result};

/// A resource kind that can be brought back in line after a backend restore
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Restorable: Send + Sync {
    /// Kind name used in aggregated errors
    fn kind(&self) -> String;

    /// Remove backend objects with no live owner
    async fn collect_garbage(&self) -> Result<()>;

    /// Reconcile live resources the backend has no objects for
    async fn restore_reconcile(&self) -> Result<()>;
}

/// Garbage-collect, then restore, every kind; failures are named by kind
pub async fn restore_all(kinds: &[Arc<dyn Restorable>]) -> Result<()> {
    let mut errors = Vec::new();
    for restorable in kinds {
        let kind = restorable.kind();
        info!(%kind, "restoring");
        if let Err(e) = restorable.collect_garbage().await {
            warn!(%kind, error = %e, "garbage collection before restore failed");
            errors.push(Error::for_kind(kind.clone(), e));
        }
        if let Err(e) = restorable.restore_reconcile().await {
            warn!(%kind, error = %e, "restore reconcile failed");
            errors.push(Error::for_kind(kind, e));
        }
    }
    Error::aggregate(errors)
}

/// [`Restorable`] for SecurityPolicy
pub struct SecurityPolicyRestorer {
    ctx: Arc<Context>,
    gc: Arc<GarbageCollector>,
}

impl SecurityPolicyRestorer {
    /// Create a restorer sharing the controller's context and collector
    pub fn new(ctx: Arc<Context>, gc: Arc<GarbageCollector>) -> Self {
        Self { ctx, gc }
    }
}

#[async_trait]
impl Restorable for SecurityPolicyRestorer {
    fn kind(&self) -> String {
        "SecurityPolicy".to_string()
    }

    async fn collect_garbage(&self) -> Result<()> {
        self.gc.collect_garbage().await?;
        self.gc.collect_orphan_groups().await
    }

    async fn restore_reconcile(&self) -> Result<()> {
        let realized = self.ctx.backend.policy_uids();
        let mut errors = Vec::new();
        let mut restored = 0usize;

        for obj in self.ctx.api.list().await? {
            let Some(uid) = obj.uid() else { continue };
            if realized.contains(&uid) {
                continue;
            }
            let key = match obj.key() {
                Ok(key) => key,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            match reconcile_key(&key, &self.ctx).await {
                Ok(_) => restored += 1,
                Err(e) => {
                    warn!(policy = %key, error = %e, "failed to restore security policy");
                    errors.push(e);
                }
            }
        }

        info!(restored, failed = errors.len(), "security policy restore complete");
        Error::aggregate(errors)
    }
}
