//! Kubernetes API seams used by the SecurityPolicy controller
//!
//! The controller never touches `kube::Api` directly. It goes through
//! [`PolicyApi`] for the resources it manages and [`NamespaceClassifier`] for
//! the protected-namespace check, so both can be mocked in tests.

use std::collections::BTreeSet;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::config::{OperatorConfig, PolicySchema};
use crate::crd::{LegacySecurityPolicy, ManagedPolicy, PolicyObject, ResourceKey, SecurityPolicy};
use crate::Result;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "nsx-operator";

/// Namespaces carrying this label set to `true` are protected
pub const SYSTEM_NAMESPACE_LABEL: &str = "nsx.vmware.com/system-namespace";

/// Namespaces that are always protected
pub const SYSTEM_NAMESPACES: [&str; 3] = ["kube-system", "kube-public", "kube-node-lease"];

/// Operations on SecurityPolicy resources of the active schema
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyApi: Send + Sync {
    /// Fetch one policy; `None` when it no longer exists
    async fn get(&self, key: &ResourceKey) -> Result<Option<PolicyObject>>;

    /// Every policy in the cluster
    async fn list(&self) -> Result<Vec<PolicyObject>>;

    /// Drop `finalizer` from the policy's finalizer list
    async fn remove_finalizer(&self, key: &ResourceKey, finalizer: &str) -> Result<()>;

    /// Set an annotation, or remove it when `value` is `None`
    async fn set_annotation(&self, key: &ResourceKey, name: &str, value: Option<String>)
        -> Result<()>;

    /// Write the policy's conditions back in the active schema's status shape
    async fn update_status(&self, policy: &ManagedPolicy) -> Result<()>;
}

/// Answers whether a namespace is off-limits for security policies
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceClassifier: Send + Sync {
    /// Whether `namespace` is a protected system namespace
    async fn is_protected(&self, namespace: &str) -> Result<bool>;
}

/// [`PolicyApi`] over a kube client, dispatching on the configured schema
pub struct KubePolicyApi {
    client: Client,
    schema: PolicySchema,
}

impl KubePolicyApi {
    /// Create an API handle for `schema`
    pub fn new(client: Client, schema: PolicySchema) -> Self {
        Self { client, schema }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn get_object<K>(api: Api<K>, name: &str) -> Result<Option<PolicyObject>>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Into<PolicyObject>,
{
    Ok(api.get_opt(name).await?.map(Into::into))
}

async fn list_objects<K>(api: Api<K>) -> Result<Vec<PolicyObject>>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Into<PolicyObject>,
{
    let list = api.list(&ListParams::default()).await?;
    Ok(list.items.into_iter().map(Into::into).collect())
}

async fn remove_finalizer_from<K>(api: Api<K>, name: &str, finalizer: &str) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let Some(current) = api.get_opt(name).await? else {
        return Ok(());
    };
    let meta = current.meta();
    let finalizers = meta.finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let remaining: Vec<String> = finalizers.into_iter().filter(|f| f != finalizer).collect();

    // resourceVersion makes the merge patch fail on a concurrent edit
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": remaining,
            "resourceVersion": meta.resource_version,
        }
    });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn patch_metadata<K>(api: Api<K>, name: &str, patch: serde_json::Value) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn patch_status<K>(api: Api<K>, name: &str, patch: serde_json::Value) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[async_trait]
impl PolicyApi for KubePolicyApi {
    async fn get(&self, key: &ResourceKey) -> Result<Option<PolicyObject>> {
        match self.schema {
            PolicySchema::Legacy => {
                get_object(self.namespaced::<LegacySecurityPolicy>(&key.namespace), &key.name).await
            }
            PolicySchema::Vpc => {
                get_object(self.namespaced::<SecurityPolicy>(&key.namespace), &key.name).await
            }
        }
    }

    async fn list(&self) -> Result<Vec<PolicyObject>> {
        match self.schema {
            PolicySchema::Legacy => {
                list_objects(Api::<LegacySecurityPolicy>::all(self.client.clone())).await
            }
            PolicySchema::Vpc => list_objects(Api::<SecurityPolicy>::all(self.client.clone())).await,
        }
    }

    async fn remove_finalizer(&self, key: &ResourceKey, finalizer: &str) -> Result<()> {
        debug!(policy = %key, finalizer, "removing finalizer");
        match self.schema {
            PolicySchema::Legacy => {
                let api = self.namespaced::<LegacySecurityPolicy>(&key.namespace);
                remove_finalizer_from(api, &key.name, finalizer).await
            }
            PolicySchema::Vpc => {
                let api = self.namespaced::<SecurityPolicy>(&key.namespace);
                remove_finalizer_from(api, &key.name, finalizer).await
            }
        }
    }

    async fn set_annotation(
        &self,
        key: &ResourceKey,
        name: &str,
        value: Option<String>,
    ) -> Result<()> {
        // A null value deletes the key under merge-patch semantics
        let patch = serde_json::json!({ "metadata": { "annotations": { name: value } } });
        match self.schema {
            PolicySchema::Legacy => {
                let api = self.namespaced::<LegacySecurityPolicy>(&key.namespace);
                patch_metadata(api, &key.name, patch).await
            }
            PolicySchema::Vpc => {
                let api = self.namespaced::<SecurityPolicy>(&key.namespace);
                patch_metadata(api, &key.name, patch).await
            }
        }
    }

    async fn update_status(&self, policy: &ManagedPolicy) -> Result<()> {
        let key = &policy.key;
        let patch = policy.status_patch();
        match policy.schema {
            PolicySchema::Legacy => {
                let api = self.namespaced::<LegacySecurityPolicy>(&key.namespace);
                patch_status(api, &key.name, patch).await
            }
            PolicySchema::Vpc => {
                let api = self.namespaced::<SecurityPolicy>(&key.namespace);
                patch_status(api, &key.name, patch).await
            }
        }
    }
}

/// Static part of the protected set: system namespaces, the operator's own
/// namespace and any configured extras
pub fn static_protected_namespaces(config: &OperatorConfig) -> BTreeSet<String> {
    SYSTEM_NAMESPACES
        .iter()
        .map(|ns| ns.to_string())
        .chain(std::iter::once(config.operator_namespace.clone()))
        .chain(config.protected_namespaces.iter().cloned())
        .map(|ns| ns.trim().to_string())
        .filter(|ns| !ns.is_empty())
        .collect()
}

/// Whether namespace labels mark it as a system namespace
pub fn labelled_system<'a>(mut labels: impl Iterator<Item = (&'a String, &'a String)>) -> bool {
    labels.any(|(k, v)| k == SYSTEM_NAMESPACE_LABEL && v.eq_ignore_ascii_case("true"))
}

/// [`NamespaceClassifier`] backed by the static list and namespace labels
pub struct KubeNamespaceClassifier {
    client: Client,
    protected: BTreeSet<String>,
}

impl KubeNamespaceClassifier {
    /// Create a classifier for `config`
    pub fn new(client: Client, config: &OperatorConfig) -> Self {
        Self {
            client,
            protected: static_protected_namespaces(config),
        }
    }
}

#[async_trait]
impl NamespaceClassifier for KubeNamespaceClassifier {
    async fn is_protected(&self, namespace: &str) -> Result<bool> {
        if self.protected.contains(namespace) {
            return Ok(true);
        }
        let api: Api<Namespace> = Api::all(self.client.clone());
        let Some(ns) = api.get_opt(namespace).await? else {
            return Ok(false);
        };
        Ok(ns
            .metadata
            .labels
            .as_ref()
            .is_some_and(|labels| labelled_system(labels.iter())))
    }
}
