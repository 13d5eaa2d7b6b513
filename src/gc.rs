//! Orphan collection for backend objects
//!
//! A backend object whose owner UID no longer matches any live SecurityPolicy
//! is an orphan. Passes never stop at the first failure: every independent
//! deletion is attempted and the failures come back as one aggregate error.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::service::OWNER_TAG_SCOPES;
use crate::backend::{parse_group_path, BackendObject, PolicyBackend};
use crate::controller::PolicyApi;
use crate::{Error, Result};

/// Periodic collector for SecurityPolicy-owned backend objects
pub struct GarbageCollector {
    api: Arc<dyn PolicyApi>,
    backend: Arc<dyn PolicyBackend>,
}

impl GarbageCollector {
    /// Create a collector
    pub fn new(api: Arc<dyn PolicyApi>, backend: Arc<dyn PolicyBackend>) -> Self {
        Self { api, backend }
    }

    async fn live_uids(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .api
            .list()
            .await?
            .iter()
            .filter_map(|obj| obj.uid())
            .collect())
    }

    /// Delete every object set whose owner UID is not live
    ///
    /// Candidates come from policies, rules and shares, so children left
    /// behind by a partial delete are found even once their policy is gone.
    pub async fn collect_garbage(&self) -> Result<()> {
        // Backend first: a policy created between the two reads is then
        // missing from the backend set rather than wrongly treated as orphaned
        let realized = self.backend.owned_uids();
        let live = self.live_uids().await?;

        let orphans: Vec<&String> = realized.difference(&live).collect();
        if orphans.is_empty() {
            debug!(realized = realized.len(), "no orphaned security policies");
            return Ok(());
        }

        let mut errors = Vec::new();
        for uid in &orphans {
            match self.backend.delete_by_uid(uid).await {
                Ok(()) => info!(%uid, "deleted orphaned security policy"),
                Err(e) => {
                    warn!(%uid, error = %e, "failed to delete orphaned security policy");
                    errors.push(e);
                }
            }
        }
        info!(
            orphans = orphans.len(),
            failed = errors.len(),
            "security policy garbage collection pass complete"
        );
        Error::aggregate(errors)
    }

    /// Delete every group none of whose tags name a live policy or rule.
    ///
    /// Ownership is resolved against the union of owner UIDs across every
    /// policy and rule inventory, so a group shared from the project is kept
    /// while any placement still references it.
    pub async fn collect_orphan_groups(&self) -> Result<()> {
        // Groups land before their owners, so snapshot them first: a group
        // applied after this point is not a candidate in this pass
        let groups: Vec<BackendObject> = self
            .backend
            .group_stores()
            .iter()
            .flat_map(|store| store.list())
            .collect();

        let owners: BTreeSet<String> = self
            .backend
            .owner_stores()
            .iter()
            .flat_map(|store| {
                OWNER_TAG_SCOPES
                    .iter()
                    .flat_map(|scope| store.list_index_values(scope))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut errors = Vec::new();
        let mut deleted = 0usize;
        for group in &groups {
            if group.tags.iter().any(|t| owners.contains(&t.tag)) {
                continue;
            }
            let location = match parse_group_path(&group.path) {
                Ok(location) => location,
                Err(e) => {
                    warn!(path = %group.path, error = %e, "cannot resolve orphaned group");
                    errors.push(e);
                    continue;
                }
            };
            match self.backend.delete_group(&location).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(path = %group.path, "deleted orphaned group");
                }
                Err(e) => {
                    warn!(path = %group.path, error = %e, "failed to delete orphaned group");
                    errors.push(e);
                }
            }
        }
        if deleted > 0 || !errors.is_empty() {
            info!(deleted, failed = errors.len(), "group garbage collection pass complete");
        }
        Error::aggregate(errors)
    }

    /// Run both passes every `period` until `cancel` fires
    pub async fn run(&self, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(?period, "garbage collector started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("garbage collector stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.collect_garbage().await {
                warn!(error = %e, "security policy garbage collection failed");
            }
            if let Err(e) = self.collect_orphan_groups().await {
                warn!(error = %e, "group garbage collection failed");
            }
        }
    }
}
