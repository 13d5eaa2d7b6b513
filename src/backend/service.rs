//! SecurityPolicy realization on the backend
//!
//! [`SecurityPolicyService`] owns the inventories, applies built policies
//! diff-wise, and deletes everything a policy UID owns in dependency order.
//! The controller and the garbage collector see it through [`PolicyBackend`].

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::builder::PolicyBuilder;
use super::store::{IndexedStore, Inventories, Inventory};
use super::{
    Backend, BackendObject, BackendVersion, GroupLocation, ObjectKind, Placement, Scope,
    TAG_SCOPE_NAMESPACE, TAG_SCOPE_POLICY_NAME, TAG_SCOPE_POLICY_UID, TAG_SCOPE_RULE_UID,
};
use crate::config::{OperatorConfig, PolicySchema};
use crate::crd::ManagedPolicy;
use crate::naming::{truncate_with_hash, MAX_TAG_VALUE_LENGTH};
use crate::Result;

/// Policy-level backend operations used by the controller and collector
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyBackend: Send + Sync {
    /// Whether the backend version supports `schema`
    async fn supports(&self, schema: PolicySchema) -> Result<bool>;

    /// Converge the backend to `policy`
    async fn create_or_update(&self, policy: &ManagedPolicy) -> Result<()>;

    /// Delete every object owned by the policy with `uid`
    async fn delete_by_uid(&self, uid: &str) -> Result<()>;

    /// Delete one group
    async fn delete_group(&self, location: &GroupLocation) -> Result<()>;

    /// UIDs of realized policies recorded under `namespace/name`
    fn uids_for_name(&self, namespace: &str, name: &str) -> BTreeSet<String>;

    /// UIDs of every realized policy
    fn policy_uids(&self) -> BTreeSet<String>;

    /// UIDs tagged on any policy, rule or share, whether or not the policy
    /// itself is still on the backend
    fn owned_uids(&self) -> BTreeSet<String>;

    /// Stores holding policy and rule objects, across placements
    fn owner_stores(&self) -> Vec<Arc<dyn IndexedStore>>;

    /// Stores holding groups, across placements
    fn group_stores(&self) -> Vec<Arc<dyn IndexedStore>>;
}

/// Backend service for SecurityPolicy
pub struct SecurityPolicyService {
    backend: Arc<dyn Backend>,
    builder: PolicyBuilder,
    cluster: String,
    min_legacy: BackendVersion,
    min_vpc: BackendVersion,
    version: RwLock<Option<BackendVersion>>,
    inventories: Inventories,
}

impl SecurityPolicyService {
    /// Create a service with empty inventories
    pub fn new(backend: Arc<dyn Backend>, config: &OperatorConfig) -> Self {
        Self {
            backend,
            builder: PolicyBuilder::new(
                config.cluster.clone(),
                Placement::new(&config.org, &config.project, &config.domain),
            ),
            cluster: config.cluster.clone(),
            min_legacy: config.min_version(PolicySchema::Legacy),
            min_vpc: config.min_version(PolicySchema::Vpc),
            version: RwLock::new(None),
            inventories: Inventories::new(),
        }
    }

    /// Load every inventory from the backend
    pub async fn initialize(&self) -> Result<()> {
        for kind in ObjectKind::ALL {
            let objects = self.backend.search(kind, &self.cluster).await?;
            let mut by_scope: Vec<Vec<BackendObject>> = vec![Vec::new(); Scope::ALL.len()];
            for obj in objects {
                match obj.scope() {
                    Ok(scope) => by_scope[scope.index()].push(obj),
                    Err(e) => debug!(error = %e, "ignoring object outside known placements"),
                }
            }
            for (scope, objects) in Scope::ALL.iter().zip(by_scope) {
                let count = objects.len();
                self.inventories.get(*scope, kind).replace_all(objects);
                debug!(%kind, %scope, count, "inventory loaded");
            }
        }
        info!(cluster = %self.cluster, "backend inventories initialized");
        Ok(())
    }

    /// Inventories backing this service
    pub fn inventories(&self) -> &Inventories {
        &self.inventories
    }

    async fn apply_object(&self, obj: &BackendObject) -> Result<()> {
        let store = self.inventories.for_object(obj)?;
        if store.get(&obj.path).as_ref() == Some(obj) {
            return Ok(());
        }
        self.backend.apply(obj).await?;
        store.upsert(obj.clone());
        debug!(path = %obj.path, kind = %obj.kind(), "applied backend object");
        Ok(())
    }

    async fn delete_object(&self, store: &Inventory, path: &str) -> Result<()> {
        self.backend.delete(path).await?;
        store.remove(path);
        debug!(path, kind = %store.kind(), "deleted backend object");
        Ok(())
    }

    /// Delete objects of `kind` tagged `uid` whose path is not in `keep`
    async fn prune(&self, kind: ObjectKind, uid: &str, keep: &BTreeSet<String>) -> Result<()> {
        for store in self.inventories.of_kind(kind) {
            for obj in store.by_index(TAG_SCOPE_POLICY_UID, uid) {
                if !keep.contains(&obj.path) {
                    self.delete_object(&store, &obj.path).await?;
                }
            }
        }
        Ok(())
    }

    fn stores_of(&self, kinds: &[ObjectKind]) -> Vec<Arc<dyn IndexedStore>> {
        kinds
            .iter()
            .flat_map(|kind| self.inventories.of_kind(*kind))
            .map(|store| store as Arc<dyn IndexedStore>)
            .collect()
    }
}

#[async_trait]
impl PolicyBackend for SecurityPolicyService {
    async fn supports(&self, schema: PolicySchema) -> Result<bool> {
        let cached = *self.version.read();
        let version = match cached {
            Some(v) => v,
            None => {
                let v = self.backend.version().await?;
                info!(version = %v, "backend version");
                *self.version.write() = Some(v);
                v
            }
        };
        let min = match schema {
            PolicySchema::Legacy => self.min_legacy,
            PolicySchema::Vpc => self.min_vpc,
        };
        Ok(version >= min)
    }

    async fn create_or_update(&self, policy: &ManagedPolicy) -> Result<()> {
        let built = self.builder.build(policy)?;
        for obj in built.apply_order() {
            self.apply_object(obj).await?;
        }

        // Stale children go only after their replacements landed
        let keep = built.paths();
        for kind in [ObjectKind::Rule, ObjectKind::SecurityPolicy, ObjectKind::Share, ObjectKind::Group] {
            self.prune(kind, &policy.uid, &keep).await?;
        }

        info!(policy = %policy.key, uid = %policy.uid, objects = keep.len(), "policy realized");
        Ok(())
    }

    async fn delete_by_uid(&self, uid: &str) -> Result<()> {
        let keep = BTreeSet::new();
        for kind in ObjectKind::ALL {
            self.prune(kind, uid, &keep).await?;
        }
        info!(uid, "policy objects deleted");
        Ok(())
    }

    async fn delete_group(&self, location: &GroupLocation) -> Result<()> {
        let store = self.inventories.get(location.scope, ObjectKind::Group);
        self.delete_object(&store, &location.path()).await
    }

    fn uids_for_name(&self, namespace: &str, name: &str) -> BTreeSet<String> {
        let name = truncate_with_hash(name, MAX_TAG_VALUE_LENGTH);
        self.inventories
            .by_index(ObjectKind::SecurityPolicy, TAG_SCOPE_POLICY_NAME, &name)
            .into_iter()
            .filter(|obj| obj.tag(TAG_SCOPE_NAMESPACE) == Some(namespace))
            .filter_map(|obj| obj.tag(TAG_SCOPE_POLICY_UID).map(str::to_string))
            .collect()
    }

    fn policy_uids(&self) -> BTreeSet<String> {
        self.inventories
            .of_kind(ObjectKind::SecurityPolicy)
            .iter()
            .flat_map(|store| store.list_index_values(TAG_SCOPE_POLICY_UID))
            .collect()
    }

    fn owned_uids(&self) -> BTreeSet<String> {
        [ObjectKind::SecurityPolicy, ObjectKind::Rule, ObjectKind::Share]
            .into_iter()
            .flat_map(|kind| self.inventories.of_kind(kind))
            .flat_map(|store| store.list_index_values(TAG_SCOPE_POLICY_UID))
            .collect()
    }

    fn owner_stores(&self) -> Vec<Arc<dyn IndexedStore>> {
        self.stores_of(&[ObjectKind::SecurityPolicy, ObjectKind::Rule])
    }

    fn group_stores(&self) -> Vec<Arc<dyn IndexedStore>> {
        self.stores_of(&[ObjectKind::Group])
    }
}

/// Tag scopes whose values identify an owning policy or rule
pub const OWNER_TAG_SCOPES: [&str; 2] = [TAG_SCOPE_POLICY_UID, TAG_SCOPE_RULE_UID];
