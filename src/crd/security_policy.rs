//! SecurityPolicy CRDs and their canonical in-memory form
//!
//! Two schemas describe the same policy: the namespace-scoped
//! `crd.nsx.vmware.com` form (realized in per-namespace VPCs) and the legacy
//! `nsx.vmware.com` form (realized in the infra domain). The controller reads
//! either one as a [`PolicyObject`], converts it once into a [`ManagedPolicy`],
//! and converts back only for the status write.

use std::collections::BTreeMap;

use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, LabelSelector, ResourceKey};
use crate::config::PolicySchema;
use crate::{Error, Result};

/// Finalizer older operator releases put on legacy resources
pub const LEGACY_FINALIZER: &str = "securitypolicy.nsx.vmware.com/finalizer";

/// Annotation carrying the last backend error surfaced to the user
pub const ERROR_ANNOTATION: &str = "nsx.vmware.com/last-error";

// =============================================================================
// Spec
// =============================================================================

/// Desired policy for the namespace-scoped schema
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "crd.nsx.vmware.com",
    version = "v1alpha1",
    kind = "SecurityPolicy",
    plural = "securitypolicies",
    namespaced,
    status = "SecurityPolicyStatus",
    printcolumn = r#"{"name":"Priority","type":"integer","jsonPath":".spec.priority"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicySpec {
    /// Policy priority; lower values are evaluated first
    #[serde(default)]
    pub priority: i32,

    /// Workloads the policy applies to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_to: Vec<PolicyTarget>,

    /// Ordered rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<SecurityPolicyRule>,
}

/// Desired policy for the legacy schema; same shape as [`SecurityPolicySpec`]
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "nsx.vmware.com",
    version = "v1alpha1",
    kind = "SecurityPolicy",
    root = "LegacySecurityPolicy",
    plural = "securitypolicies",
    namespaced,
    status = "LegacySecurityPolicyStatus",
    printcolumn = r#"{"name":"Priority","type":"integer","jsonPath":".spec.priority"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LegacySecurityPolicySpec {
    /// Policy priority; lower values are evaluated first
    #[serde(default)]
    pub priority: i32,

    /// Workloads the policy applies to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_to: Vec<PolicyTarget>,

    /// Ordered rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<SecurityPolicyRule>,
}

impl From<LegacySecurityPolicySpec> for SecurityPolicySpec {
    fn from(spec: LegacySecurityPolicySpec) -> Self {
        Self {
            priority: spec.priority,
            applied_to: spec.applied_to,
            rules: spec.rules,
        }
    }
}

/// Selects workloads a policy or rule is enforced on
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTarget {
    /// Pods matching this selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,

    /// VMs matching this selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_selector: Option<LabelSelector>,
}

/// Traffic verdict
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Permit the traffic
    #[default]
    Allow,
    /// Silently discard the traffic
    Drop,
    /// Discard and notify the sender
    Reject,
}

/// Traffic direction relative to the applied-to workloads
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    /// Inbound
    #[default]
    In,
    /// Inbound (Kubernetes spelling)
    Ingress,
    /// Outbound
    Out,
    /// Outbound (Kubernetes spelling)
    Egress,
}

impl RuleDirection {
    /// Whether traffic flows toward the applied-to workloads
    pub fn is_ingress(self) -> bool {
        matches!(self, Self::In | Self::Ingress)
    }
}

/// One rule of a policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicyRule {
    /// Optional rule name; defaults to the policy name and rule index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Verdict for matching traffic
    #[serde(default)]
    pub action: RuleAction,

    /// Direction of matching traffic
    #[serde(default)]
    pub direction: RuleDirection,

    /// Narrows the policy's applied-to set for this rule
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_to: Vec<PolicyTarget>,

    /// Ingress peers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<PolicyPeer>,

    /// Egress peers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<PolicyPeer>,

    /// Ports; empty means any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<SecurityPolicyPort>,
}

/// A traffic peer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPeer {
    /// Pods matching this selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,

    /// VMs matching this selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_selector: Option<LabelSelector>,

    /// Namespaces matching this selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    /// Address blocks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_blocks: Vec<IpBlock>,
}

/// A CIDR with optional carve-outs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpBlock {
    /// Block in CIDR notation
    pub cidr: String,

    /// Sub-blocks excluded from `cidr`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except: Vec<String>,
}

/// Transport protocol
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// TCP
    #[default]
    Tcp,
    /// UDP
    Udp,
    /// SCTP
    Sctp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::Sctp => write!(f, "SCTP"),
        }
    }
}

/// Port number or named port
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(untagged)]
pub enum PortValue {
    /// Numeric port
    Number(i32),
    /// Named container port
    Name(String),
}

/// A port or port range
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicyPort {
    /// Protocol
    #[serde(default)]
    pub protocol: Protocol,

    /// Port; absent means every port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortValue>,

    /// Last port of a range starting at `port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<i32>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of a namespace-scoped SecurityPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicyStatus {
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Last generation the operator acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Status of a legacy SecurityPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacySecurityPolicyStatus {
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// =============================================================================
// Canonical form
// =============================================================================

/// A SecurityPolicy in whichever schema is active
#[derive(Clone, Debug)]
pub enum PolicyObject {
    /// Legacy flat form
    Legacy(LegacySecurityPolicy),
    /// Namespace-scoped form
    Namespaced(SecurityPolicy),
}

impl From<SecurityPolicy> for PolicyObject {
    fn from(policy: SecurityPolicy) -> Self {
        Self::Namespaced(policy)
    }
}

impl From<LegacySecurityPolicy> for PolicyObject {
    fn from(policy: LegacySecurityPolicy) -> Self {
        Self::Legacy(policy)
    }
}

fn key_of<K: Resource>(obj: &K) -> Result<ResourceKey> {
    let name = obj.meta().name.clone().unwrap_or_default();
    let namespace = obj.meta().namespace.clone().ok_or_else(|| {
        Error::validation_for(name.clone(), "SecurityPolicy has no namespace")
    })?;
    Ok(ResourceKey::new(namespace, name))
}

impl PolicyObject {
    /// Schema this object belongs to
    pub fn schema(&self) -> PolicySchema {
        match self {
            Self::Legacy(_) => PolicySchema::Legacy,
            Self::Namespaced(_) => PolicySchema::Vpc,
        }
    }

    /// UID assigned by the API server, if any
    pub fn uid(&self) -> Option<String> {
        match self {
            Self::Legacy(p) => p.uid(),
            Self::Namespaced(p) => p.uid(),
        }
    }

    /// Namespace/name key
    pub fn key(&self) -> Result<ResourceKey> {
        match self {
            Self::Legacy(p) => key_of(p),
            Self::Namespaced(p) => key_of(p),
        }
    }

    /// Convert into the canonical form
    pub fn into_managed(self) -> Result<ManagedPolicy> {
        let key = self.key()?;
        let schema = self.schema();
        let uid = self
            .uid()
            .ok_or_else(|| Error::validation_for(key.to_string(), "SecurityPolicy has no UID"))?;

        let (meta, spec, conditions) = match self {
            Self::Legacy(p) => (
                p.metadata,
                SecurityPolicySpec::from(p.spec),
                p.status.map(|s| s.conditions).unwrap_or_default(),
            ),
            Self::Namespaced(p) => (
                p.metadata,
                p.spec,
                p.status.map(|s| s.conditions).unwrap_or_default(),
            ),
        };

        Ok(ManagedPolicy {
            key,
            uid,
            schema,
            generation: meta.generation,
            deletion_requested: meta.deletion_timestamp.is_some(),
            finalizers: meta.finalizers.unwrap_or_default(),
            annotations: meta.annotations.unwrap_or_default(),
            spec,
            conditions,
        })
    }
}

/// A SecurityPolicy normalized across schemas
#[derive(Clone, Debug, PartialEq)]
pub struct ManagedPolicy {
    /// Namespace/name
    pub key: ResourceKey,
    /// Cluster-unique UID
    pub uid: String,
    /// Schema the object was read from
    pub schema: PolicySchema,
    /// `metadata.generation`
    pub generation: Option<i64>,
    /// Whether a deletion timestamp is set
    pub deletion_requested: bool,
    /// Finalizers currently on the object
    pub finalizers: Vec<String>,
    /// Annotations currently on the object
    pub annotations: BTreeMap<String, String>,
    /// Desired policy
    pub spec: SecurityPolicySpec,
    /// Current status conditions
    pub conditions: Vec<Condition>,
}

impl ManagedPolicy {
    /// Whether the legacy finalizer is still attached
    pub fn has_legacy_finalizer(&self) -> bool {
        self.finalizers.iter().any(|f| f == LEGACY_FINALIZER)
    }

    /// Last recorded error annotation, if any
    pub fn last_error(&self) -> Option<&str> {
        self.annotations.get(ERROR_ANNOTATION).map(String::as_str)
    }

    /// Status body for the active schema
    pub fn status_patch(&self) -> serde_json::Value {
        let status = match self.schema {
            PolicySchema::Legacy => serde_json::to_value(LegacySecurityPolicyStatus {
                conditions: self.conditions.clone(),
            }),
            PolicySchema::Vpc => serde_json::to_value(SecurityPolicyStatus {
                conditions: self.conditions.clone(),
                observed_generation: self.generation,
            }),
        }
        .unwrap_or(serde_json::Value::Null);
        serde_json::json!({ "status": status })
    }

    /// Canonical policy for tests
    #[cfg(test)]
    pub fn for_testing(namespace: &str, name: &str, uid: &str) -> Self {
        Self {
            key: ResourceKey::new(namespace, name),
            uid: uid.to_string(),
            schema: PolicySchema::Legacy,
            generation: Some(1),
            deletion_requested: false,
            finalizers: Vec::new(),
            annotations: BTreeMap::new(),
            spec: SecurityPolicySpec::default(),
            conditions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::ConditionStatus;
    use kube::api::ObjectMeta;
    use kube::CustomResourceExt;

    fn meta(uid: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("ns1".to_string()),
            uid: uid.map(str::to_string),
            generation: Some(3),
            ..Default::default()
        }
    }

    const POLICY_YAML: &str = r#"
priority: 10
appliedTo:
  - podSelector:
      matchLabels:
        app: web
rules:
  - name: allow-frontend
    action: allow
    direction: ingress
    sources:
      - namespaceSelector:
          matchLabels:
            team: frontend
      - ipBlocks:
          - cidr: 10.0.0.0/24
            except: [10.0.0.128/25]
    ports:
      - protocol: TCP
        port: 8080
      - port: http
"#;

    /// Story: a user-written manifest deserializes into the typed spec
    #[test]
    fn story_spec_deserializes_from_manifest() {
        let spec: SecurityPolicySpec = serde_yaml::from_str(POLICY_YAML).unwrap();

        assert_eq!(spec.priority, 10);
        assert_eq!(spec.applied_to.len(), 1);
        let rule = &spec.rules[0];
        assert_eq!(rule.action, RuleAction::Allow);
        assert!(rule.direction.is_ingress());
        assert_eq!(rule.sources[1].ip_blocks[0].except, vec!["10.0.0.128/25"]);
        assert_eq!(rule.ports[0].port, Some(PortValue::Number(8080)));
        assert_eq!(rule.ports[1].port, Some(PortValue::Name("http".to_string())));
        assert_eq!(rule.ports[1].protocol, Protocol::Tcp);
    }

    /// Story: both schemas normalize into the same canonical policy
    #[test]
    fn story_schemas_normalize_to_one_form() {
        let spec: SecurityPolicySpec = serde_yaml::from_str(POLICY_YAML).unwrap();
        let legacy_spec: LegacySecurityPolicySpec = serde_yaml::from_str(POLICY_YAML).unwrap();

        let mut namespaced = SecurityPolicy::new("web", spec.clone());
        namespaced.metadata = meta(Some("uid-1"));
        let mut legacy = LegacySecurityPolicy::new("web", legacy_spec);
        legacy.metadata = meta(Some("uid-1"));
        legacy.metadata.finalizers = Some(vec![LEGACY_FINALIZER.to_string()]);

        let a = PolicyObject::from(namespaced).into_managed().unwrap();
        let b = PolicyObject::from(legacy).into_managed().unwrap();

        assert_eq!(a.spec, b.spec);
        assert_eq!(a.key, b.key);
        assert_eq!(a.schema, PolicySchema::Vpc);
        assert_eq!(b.schema, PolicySchema::Legacy);
        assert!(b.has_legacy_finalizer());
        assert!(!a.has_legacy_finalizer());
    }

    #[test]
    fn test_missing_uid_is_a_validation_error() {
        let mut policy = SecurityPolicy::new("web", SecurityPolicySpec::default());
        policy.metadata = meta(None);
        let err = PolicyObject::from(policy).into_managed().unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    /// Story: status is written back in the shape of the active schema
    #[test]
    fn story_status_patch_follows_schema() {
        let mut policy = ManagedPolicy::for_testing("ns1", "web", "uid-1");
        policy.generation = Some(4);
        policy.conditions = vec![Condition::new(
            "Ready",
            ConditionStatus::True,
            "SuccessfulCreateOrUpdate",
            "",
        )];

        let legacy = policy.status_patch();
        assert_eq!(legacy["status"]["conditions"][0]["type"], "Ready");
        assert!(legacy["status"].get("observedGeneration").is_none());

        policy.schema = PolicySchema::Vpc;
        let vpc = policy.status_patch();
        assert_eq!(vpc["status"]["observedGeneration"], 4);
    }

    #[test]
    fn test_crds_use_distinct_groups() {
        assert_eq!(SecurityPolicy::crd_name(), "securitypolicies.crd.nsx.vmware.com");
        assert_eq!(LegacySecurityPolicy::crd_name(), "securitypolicies.nsx.vmware.com");
    }

    /// Story: both schemas generate manifests with a typed condition timestamp
    #[test]
    fn story_both_crds_render_condition_schema() {
        for crd in [SecurityPolicy::crd(), LegacySecurityPolicy::crd()] {
            let yaml = serde_yaml::to_string(&crd).unwrap();
            assert!(yaml.contains("lastTransitionTime"), "{yaml}");
            assert!(yaml.contains("format: date-time"), "{yaml}");
        }
    }
}
