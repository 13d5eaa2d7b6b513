//! SecurityPolicy controller implementation
//!
//! Converges the backend to each SecurityPolicy: realize on create/update,
//! tear down on delete, delete by name when the resource vanished without the
//! delete path running. Outcomes are reported as merged status conditions.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::api::{NamespaceClassifier, PolicyApi};
use super::requeue::RequeueTracker;
use crate::backend::PolicyBackend;
use crate::config::PolicySchema;
use crate::crd::{
    merge_conditions, Condition, ConditionStatus, ManagedPolicy, ResourceKey, ERROR_ANNOTATION,
    LEGACY_FINALIZER,
};
use crate::{Error, Result};

/// Condition type reported on every SecurityPolicy
pub const CONDITION_READY: &str = "Ready";

/// Realized on the backend
pub const REASON_CREATED: &str = "SuccessfulCreateOrUpdate";
/// Realization failed
pub const REASON_CREATE_FAILED: &str = "FailedCreateOrUpdate";
/// Removed from the backend
pub const REASON_DELETED: &str = "SuccessfulDelete";
/// Removal failed
pub const REASON_DELETE_FAILED: &str = "FailedDelete";
/// Backend version too old for the schema
pub const REASON_NOT_SUPPORTED: &str = "NotSupported";
/// Backend license does not cover the feature
pub const REASON_LICENSE: &str = "LicenseRestricted";

/// Requeue delay while the backend does not support the schema
pub const UNSUPPORTED_REQUEUE: Duration = Duration::from_secs(300);

/// Shared state for SecurityPolicy reconciliation
pub struct Context {
    /// SecurityPolicy resources of the active schema
    pub api: Arc<dyn PolicyApi>,
    /// Backend realization
    pub backend: Arc<dyn PolicyBackend>,
    /// Protected-namespace check
    pub namespaces: Arc<dyn NamespaceClassifier>,
    /// Per-key requeue history
    pub requeues: RequeueTracker,
    /// Cancelled when the operator must stop (invalid license)
    pub fatal: CancellationToken,
}

impl Context {
    /// Create a context from its collaborators
    pub fn new(
        api: Arc<dyn PolicyApi>,
        backend: Arc<dyn PolicyBackend>,
        namespaces: Arc<dyn NamespaceClassifier>,
    ) -> Self {
        Self {
            api,
            backend,
            namespaces,
            requeues: RequeueTracker::new(),
            fatal: CancellationToken::new(),
        }
    }
}

fn key_of<K: Resource>(obj: &K) -> ResourceKey {
    ResourceKey::new(obj.namespace().unwrap_or_default(), obj.name_any())
}

/// `kube::runtime::Controller` entry point for either schema
pub async fn reconcile<K: Resource>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action> {
    let key = key_of(obj.as_ref());
    let action = reconcile_key(&key, &ctx).await?;
    ctx.requeues.forget(&key);
    Ok(action)
}

/// Requeue decision for a failed reconcile
pub fn error_policy<K: Resource>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = key_of(obj.as_ref());
    error!(?error, policy = %key, "reconciliation failed");
    ctx.requeues.action_for(&key, error)
}

/// Clean up a key the controller reports as gone from its cache
///
/// The key never comes back through the queue, so its requeue history is
/// dropped whatever the outcome. Leftovers from a failure are the garbage
/// collector's to remove.
pub async fn reconcile_vanished(key: &ResourceKey, ctx: &Context) -> Result<Action> {
    let result = reconcile_key(key, ctx).await;
    ctx.requeues.forget(key);
    result
}

/// Reconcile one SecurityPolicy by key
///
/// A key whose resource no longer exists is a deletion by name: every backend
/// policy recorded under that namespace/name is removed.
#[instrument(skip(key, ctx), fields(policy = %key))]
pub async fn reconcile_key(key: &ResourceKey, ctx: &Context) -> Result<Action> {
    let Some(obj) = ctx.api.get(key).await? else {
        return delete_by_name(key, ctx).await;
    };
    let mut policy = obj.into_managed()?;
    debug!(uid = %policy.uid, schema = %policy.schema, "reconciling");

    if !ctx.backend.supports(policy.schema).await? {
        warn!(schema = %policy.schema, "backend version does not support this schema");
        let condition = failed(
            REASON_NOT_SUPPORTED,
            format!("backend does not support {} security policies", policy.schema),
        );
        record(ctx, &mut policy, condition).await?;
        return Ok(Action::requeue(UNSUPPORTED_REQUEUE));
    }

    if policy.deletion_requested {
        delete(ctx, &mut policy).await
    } else {
        create_or_update(ctx, &mut policy).await
    }
}

async fn create_or_update(ctx: &Context, policy: &mut ManagedPolicy) -> Result<Action> {
    let namespace = policy.key.namespace.clone();
    if ctx.namespaces.is_protected(&namespace).await? {
        let err = Error::protected_namespace(namespace);
        record(ctx, policy, failed(REASON_CREATE_FAILED, err.to_string())).await?;
        return Err(err);
    }

    match ctx.backend.create_or_update(policy).await {
        Ok(()) => {
            if policy.last_error().is_some() {
                ctx.api
                    .set_annotation(&policy.key, ERROR_ANNOTATION, None)
                    .await?;
            }
            let ready = Condition::new(
                CONDITION_READY,
                ConditionStatus::True,
                REASON_CREATED,
                "SecurityPolicy has been successfully created/updated",
            );
            record(ctx, policy, ready).await?;
            info!(uid = %policy.uid, "security policy realized");
            Ok(Action::await_change())
        }
        Err(Error::LicenseRestricted { reason }) => {
            warn!(%reason, "backend license does not cover security policies");
            record(ctx, policy, failed(REASON_LICENSE, reason.clone())).await?;
            ctx.api
                .set_annotation(&policy.key, ERROR_ANNOTATION, Some(reason))
                .await?;
            Ok(Action::await_change())
        }
        Err(err @ Error::InvalidLicense { .. }) => {
            error!(error = %err, "backend license is invalid, stopping operator");
            if let Err(e) = ctx
                .api
                .set_annotation(&policy.key, ERROR_ANNOTATION, Some(err.to_string()))
                .await
            {
                warn!(error = %e, "failed to annotate policy with license error");
            }
            ctx.fatal.cancel();
            Err(err)
        }
        Err(err) => {
            record(ctx, policy, failed(REASON_CREATE_FAILED, err.to_string())).await?;
            Err(err)
        }
    }
}

async fn delete(ctx: &Context, policy: &mut ManagedPolicy) -> Result<Action> {
    if policy.has_legacy_finalizer() {
        ctx.api.remove_finalizer(&policy.key, LEGACY_FINALIZER).await?;
        policy.finalizers.retain(|f| f != LEGACY_FINALIZER);
    } else {
        debug!("no legacy finalizer on deleted policy");
    }

    if let Err(err) = ctx.backend.delete_by_uid(&policy.uid).await {
        record(ctx, policy, failed(REASON_DELETE_FAILED, err.to_string())).await?;
        return Err(err);
    }

    let deleted = Condition::new(
        CONDITION_READY,
        ConditionStatus::False,
        REASON_DELETED,
        "SecurityPolicy has been successfully deleted",
    );
    record(ctx, policy, deleted).await?;
    info!(uid = %policy.uid, "security policy deleted");
    Ok(Action::await_change())
}

async fn delete_by_name(key: &ResourceKey, ctx: &Context) -> Result<Action> {
    let uids = ctx.backend.uids_for_name(&key.namespace, &key.name);
    if uids.is_empty() {
        debug!("policy gone and nothing left on the backend");
        return Ok(Action::await_change());
    }
    for uid in &uids {
        ctx.backend.delete_by_uid(uid).await?;
    }
    info!(count = uids.len(), "deleted backend policies of a vanished resource");
    Ok(Action::await_change())
}

fn failed(reason: &str, message: impl Into<String>) -> Condition {
    Condition::new(CONDITION_READY, ConditionStatus::False, reason, message)
}

/// Merge `condition` into the policy and write status only if it changed
async fn record(ctx: &Context, policy: &mut ManagedPolicy, condition: Condition) -> Result<()> {
    if !merge_conditions(&mut policy.conditions, &[condition]) {
        debug!("conditions unchanged, skipping status update");
        return Ok(());
    }
    match ctx.api.update_status(policy).await {
        // Resource already gone once its last finalizer was dropped
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Schema the controller serves, for log fields
pub fn schema_label(schema: PolicySchema) -> &'static str {
    match schema {
        PolicySchema::Legacy => "nsx.vmware.com",
        PolicySchema::Vpc => "crd.nsx.vmware.com",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::service::MockPolicyBackend;
    use crate::controller::api::{MockNamespaceClassifier, MockPolicyApi};
    use crate::crd::{
        LegacySecurityPolicy, LegacySecurityPolicySpec, PolicyObject, SecurityPolicy,
        SecurityPolicySpec,
    };
    use crate::retry::RetryPolicy;
    use kube::api::ObjectMeta;
    use std::collections::{BTreeMap, BTreeSet};

    fn key() -> ResourceKey {
        ResourceKey::new("ns1", "web")
    }

    fn meta() -> ObjectMeta {
        ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("ns1".to_string()),
            uid: Some("uid-1".to_string()),
            generation: Some(1),
            ..Default::default()
        }
    }

    fn legacy_policy() -> PolicyObject {
        let mut p = LegacySecurityPolicy::new("web", LegacySecurityPolicySpec::default());
        p.metadata = meta();
        p.into()
    }

    fn deleting_policy(finalizer: bool) -> PolicyObject {
        let mut p = LegacySecurityPolicy::new("web", LegacySecurityPolicySpec::default());
        p.metadata = meta();
        p.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        if finalizer {
            p.metadata.finalizers = Some(vec![LEGACY_FINALIZER.to_string()]);
        }
        p.into()
    }

    fn with_error_annotation(obj: PolicyObject) -> PolicyObject {
        match obj {
            PolicyObject::Legacy(mut p) => {
                p.metadata.annotations = Some(BTreeMap::from([(
                    ERROR_ANNOTATION.to_string(),
                    "previous failure".to_string(),
                )]));
                p.into()
            }
            other => other,
        }
    }

    fn supported_backend() -> MockPolicyBackend {
        let mut backend = MockPolicyBackend::new();
        backend.expect_supports().returning(|_| Ok(true));
        backend
    }

    fn open_namespaces() -> MockNamespaceClassifier {
        let mut ns = MockNamespaceClassifier::new();
        ns.expect_is_protected().returning(|_| Ok(false));
        ns
    }

    fn ctx(
        api: MockPolicyApi,
        backend: MockPolicyBackend,
        namespaces: MockNamespaceClassifier,
    ) -> Context {
        Context::new(Arc::new(api), Arc::new(backend), Arc::new(namespaces))
    }

    /// Story: a new policy is realized and reported Ready
    #[tokio::test]
    async fn story_new_policy_is_realized_and_ready() {
        let mut api = MockPolicyApi::new();
        api.expect_get().returning(|_| Ok(Some(legacy_policy())));
        api.expect_update_status()
            .withf(|p| {
                p.conditions.len() == 1
                    && p.conditions[0].status == ConditionStatus::True
                    && p.conditions[0].reason == REASON_CREATED
            })
            .times(1)
            .returning(|_| Ok(()));
        api.expect_set_annotation().never();

        let mut backend = supported_backend();
        backend
            .expect_create_or_update()
            .withf(|p| p.uid == "uid-1" && p.schema == PolicySchema::Legacy)
            .times(1)
            .returning(|_| Ok(()));

        let action = reconcile_key(&key(), &ctx(api, backend, open_namespaces()))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: a successful sync clears an error left by an earlier failure
    #[tokio::test]
    async fn story_success_clears_previous_error_annotation() {
        let mut api = MockPolicyApi::new();
        api.expect_get()
            .returning(|_| Ok(Some(with_error_annotation(legacy_policy()))));
        api.expect_set_annotation()
            .withf(|_, name, value| name == ERROR_ANNOTATION && value.is_none())
            .times(1)
            .returning(|_, _, _| Ok(()));
        api.expect_update_status().returning(|_| Ok(()));

        let mut backend = supported_backend();
        backend.expect_create_or_update().returning(|_| Ok(()));

        reconcile_key(&key(), &ctx(api, backend, open_namespaces()))
            .await
            .unwrap();
    }

    /// Story: an unchanged Ready condition causes no status write
    #[tokio::test]
    async fn story_identical_condition_skips_status_write() {
        let mut api = MockPolicyApi::new();
        api.expect_get().returning(|_| {
            let mut p = LegacySecurityPolicy::new("web", LegacySecurityPolicySpec::default());
            p.metadata = meta();
            p.status = Some(crate::crd::LegacySecurityPolicyStatus {
                conditions: vec![Condition::new(
                    CONDITION_READY,
                    ConditionStatus::True,
                    REASON_CREATED,
                    "SecurityPolicy has been successfully created/updated",
                )],
            });
            Ok(Some(p.into()))
        });
        api.expect_update_status().never();

        let mut backend = supported_backend();
        backend.expect_create_or_update().returning(|_| Ok(()));

        reconcile_key(&key(), &ctx(api, backend, open_namespaces()))
            .await
            .unwrap();
    }

    /// Story: policies in protected namespaces fail permanently
    #[tokio::test]
    async fn story_protected_namespace_is_rejected_without_retry() {
        let mut api = MockPolicyApi::new();
        api.expect_get().returning(|_| Ok(Some(legacy_policy())));
        api.expect_update_status()
            .withf(|p| p.conditions[0].message.contains("protected"))
            .returning(|_| Ok(()));

        let mut backend = supported_backend();
        backend.expect_create_or_update().never();

        let mut namespaces = MockNamespaceClassifier::new();
        namespaces.expect_is_protected().returning(|_| Ok(true));

        let context = ctx(api, backend, namespaces);
        let err = reconcile_key(&key(), &context).await.unwrap_err();
        assert!(matches!(err, Error::ProtectedNamespace { .. }));
        assert_eq!(context.requeues.action_for(&key(), &err), Action::await_change());
    }

    /// Story: an old backend gets a long fixed delay, not backoff
    #[tokio::test]
    async fn story_unsupported_backend_requeues_after_fixed_delay() {
        let mut api = MockPolicyApi::new();
        api.expect_get().returning(|_| Ok(Some(legacy_policy())));
        api.expect_update_status()
            .withf(|p| p.conditions[0].reason == REASON_NOT_SUPPORTED)
            .times(1)
            .returning(|_| Ok(()));

        let mut backend = MockPolicyBackend::new();
        backend.expect_supports().returning(|_| Ok(false));
        backend.expect_create_or_update().never();

        let action = reconcile_key(&key(), &ctx(api, backend, open_namespaces()))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(UNSUPPORTED_REQUEUE));
    }

    /// Story: a license restriction is surfaced and not retried
    #[tokio::test]
    async fn story_license_restriction_annotates_and_stops() {
        let mut api = MockPolicyApi::new();
        api.expect_get().returning(|_| Ok(Some(legacy_policy())));
        api.expect_update_status()
            .withf(|p| p.conditions[0].reason == REASON_LICENSE)
            .returning(|_| Ok(()));
        api.expect_set_annotation()
            .withf(|_, name, value| {
                name == ERROR_ANNOTATION && value.as_deref() == Some("DFW not licensed")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut backend = supported_backend();
        backend.expect_create_or_update().returning(|_| {
            Err(Error::LicenseRestricted {
                reason: "DFW not licensed".to_string(),
            })
        });

        let context = ctx(api, backend, open_namespaces());
        let action = reconcile_key(&key(), &context).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(!context.fatal.is_cancelled());
    }

    /// Story: an invalid license stops the operator
    #[tokio::test]
    async fn story_invalid_license_signals_shutdown() {
        let mut api = MockPolicyApi::new();
        api.expect_get().returning(|_| Ok(Some(legacy_policy())));
        api.expect_set_annotation().times(1).returning(|_, _, _| Ok(()));

        let mut backend = supported_backend();
        backend.expect_create_or_update().returning(|_| {
            Err(Error::InvalidLicense {
                message: "expired".to_string(),
            })
        });

        let context = ctx(api, backend, open_namespaces());
        let err = reconcile_key(&key(), &context).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(context.fatal.is_cancelled());
    }

    /// Story: the operator still stops when the license annotation cannot be written
    #[tokio::test]
    async fn story_invalid_license_stops_even_if_annotation_write_fails() {
        let mut api = MockPolicyApi::new();
        api.expect_get().returning(|_| Ok(Some(legacy_policy())));
        api.expect_set_annotation().times(1).returning(|_, _, _| {
            Err(Error::from(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "the object has been modified".to_string(),
                reason: "Conflict".to_string(),
                code: 409,
            })))
        });

        let mut backend = supported_backend();
        backend.expect_create_or_update().returning(|_| {
            Err(Error::InvalidLicense {
                message: "expired".to_string(),
            })
        });

        let context = ctx(api, backend, open_namespaces());
        let err = reconcile_key(&key(), &context).await.unwrap_err();
        assert!(matches!(err, Error::InvalidLicense { .. }));
        assert!(context.fatal.is_cancelled());
    }

    /// Story: transient backend failures are recorded and retried with backoff
    #[tokio::test]
    async fn story_transient_failure_is_recorded_and_retried() {
        let mut api = MockPolicyApi::new();
        api.expect_get().returning(|_| Ok(Some(legacy_policy())));
        api.expect_update_status()
            .withf(|p| p.conditions[0].reason == REASON_CREATE_FAILED)
            .returning(|_| Ok(()));

        let mut backend = supported_backend();
        backend.expect_create_or_update().returning(|_| {
            Err(Error::backend(
                "patch /infra/x",
                "503",
                Some(RetryPolicy::unbounded(
                    Duration::from_millis(500),
                    Duration::from_secs(300),
                )),
            ))
        });

        let context = ctx(api, backend, open_namespaces());
        let err = reconcile_key(&key(), &context).await.unwrap_err();
        assert_eq!(
            context.requeues.action_for(&key(), &err),
            Action::requeue(Duration::from_millis(500))
        );
        assert_eq!(
            context.requeues.action_for(&key(), &err),
            Action::requeue(Duration::from_secs(1))
        );
    }

    /// Story: deleting a policy drops the legacy finalizer, then the backend objects
    #[tokio::test]
    async fn story_delete_removes_finalizer_then_backend_objects() {
        let mut seq = mockall::Sequence::new();
        let mut api = MockPolicyApi::new();
        api.expect_get().returning(|_| Ok(Some(deleting_policy(true))));
        api.expect_remove_finalizer()
            .withf(|k, f| k.name == "web" && f == LEGACY_FINALIZER)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        api.expect_update_status()
            .withf(|p| p.conditions[0].reason == REASON_DELETED && p.finalizers.is_empty())
            .returning(|_| Ok(()));

        let mut backend = supported_backend();
        backend
            .expect_delete_by_uid()
            .withf(|uid| uid == "uid-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let action = reconcile_key(&key(), &ctx(api, backend, open_namespaces()))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_delete_without_finalizer_still_cleans_backend() {
        let mut api = MockPolicyApi::new();
        api.expect_get().returning(|_| Ok(Some(deleting_policy(false))));
        api.expect_remove_finalizer().never();
        // The resource disappears before the status write lands
        api.expect_update_status().returning(|_| {
            Err(Error::from(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "not found".to_string(),
                reason: "NotFound".to_string(),
                code: 404,
            })))
        });

        let mut backend = supported_backend();
        backend.expect_delete_by_uid().times(1).returning(|_| Ok(()));

        reconcile_key(&key(), &ctx(api, backend, open_namespaces()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_backend_delete_is_returned_for_retry() {
        let mut api = MockPolicyApi::new();
        api.expect_get().returning(|_| Ok(Some(deleting_policy(false))));
        api.expect_update_status()
            .withf(|p| p.conditions[0].reason == REASON_DELETE_FAILED)
            .returning(|_| Ok(()));

        let mut backend = supported_backend();
        backend.expect_delete_by_uid().returning(|_| {
            Err(Error::backend(
                "delete /infra/x",
                "timeout",
                Some(RetryPolicy::unbounded_default()),
            ))
        });

        let err = reconcile_key(&key(), &ctx(api, backend, open_namespaces()))
            .await
            .unwrap_err();
        assert!(err.retry_policy().is_some());
    }

    /// Story: a resource that vanished is cleaned up by name
    #[tokio::test]
    async fn story_missing_resource_is_deleted_by_name() {
        let mut api = MockPolicyApi::new();
        api.expect_get().returning(|_| Ok(None));
        api.expect_update_status().never();

        let mut backend = MockPolicyBackend::new();
        backend.expect_supports().never();
        backend
            .expect_uids_for_name()
            .withf(|ns, name| ns == "ns1" && name == "web")
            .returning(|_, _| BTreeSet::from(["old-uid".to_string(), "older-uid".to_string()]));
        backend.expect_delete_by_uid().times(2).returning(|_| Ok(()));

        let action = reconcile_key(&key(), &ctx(api, backend, open_namespaces()))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: a vanished key leaves no requeue history behind, even on failure
    #[tokio::test]
    async fn story_vanished_key_forgets_requeue_history() {
        let mut api = MockPolicyApi::new();
        api.expect_get().returning(|_| Ok(None));

        let mut backend = MockPolicyBackend::new();
        backend
            .expect_uids_for_name()
            .returning(|_, _| BTreeSet::from(["old-uid".to_string()]));
        backend.expect_delete_by_uid().returning(|_| {
            Err(Error::backend(
                "delete /infra/x",
                "timeout",
                Some(RetryPolicy::unbounded_default()),
            ))
        });

        let context = ctx(api, backend, open_namespaces());
        let earlier = Error::backend(
            "patch /infra/x",
            "503",
            Some(RetryPolicy::unbounded_default()),
        );
        let _ = context.requeues.action_for(&key(), &earlier);
        let _ = context.requeues.action_for(&key(), &earlier);
        assert_eq!(context.requeues.num_requeues(&key()), 2);

        assert!(reconcile_vanished(&key(), &context).await.is_err());
        assert_eq!(context.requeues.num_requeues(&key()), 0);
    }

    #[tokio::test]
    async fn test_missing_resource_with_nothing_on_backend_is_noop() {
        let mut api = MockPolicyApi::new();
        api.expect_get().returning(|_| Ok(None));

        let mut backend = MockPolicyBackend::new();
        backend
            .expect_uids_for_name()
            .returning(|_, _| BTreeSet::new());
        backend.expect_delete_by_uid().never();

        let action = reconcile_key(&key(), &ctx(api, backend, open_namespaces()))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: the namespace-scoped schema goes through the same state machine
    #[tokio::test]
    async fn story_namespaced_schema_reconciles_through_controller_entry() {
        let mut api = MockPolicyApi::new();
        api.expect_get().returning(|_| {
            let mut p = SecurityPolicy::new("web", SecurityPolicySpec::default());
            p.metadata = meta();
            Ok(Some(p.into()))
        });
        api.expect_update_status()
            .withf(|p| p.schema == PolicySchema::Vpc)
            .returning(|_| Ok(()));

        let mut backend = MockPolicyBackend::new();
        backend
            .expect_supports()
            .withf(|schema| *schema == PolicySchema::Vpc)
            .returning(|_| Ok(true));
        backend.expect_create_or_update().returning(|_| Ok(()));

        let context = Arc::new(ctx(api, backend, open_namespaces()));
        let mut obj = SecurityPolicy::new("web", SecurityPolicySpec::default());
        obj.metadata = meta();
        let _ = context.requeues.action_for(
            &key(),
            &Error::backend("x", "y", Some(RetryPolicy::unbounded_default())),
        );

        let action = reconcile(Arc::new(obj), context.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(context.requeues.num_requeues(&key()), 0);
    }

    #[test]
    fn test_schema_labels() {
        assert_eq!(schema_label(PolicySchema::Legacy), "nsx.vmware.com");
        assert_eq!(schema_label(PolicySchema::Vpc), "crd.nsx.vmware.com");
    }
}
