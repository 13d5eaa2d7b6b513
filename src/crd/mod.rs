//! Custom Resource Definitions served by the operator

mod security_policy;
mod types;

pub use security_policy::{
    IpBlock, LegacySecurityPolicy, LegacySecurityPolicySpec, LegacySecurityPolicyStatus,
    ManagedPolicy, PolicyObject, PolicyPeer, PolicyTarget, PortValue, Protocol, RuleAction,
    RuleDirection, SecurityPolicy, SecurityPolicyPort, SecurityPolicyRule, SecurityPolicySpec,
    SecurityPolicyStatus, ERROR_ANNOTATION, LEGACY_FINALIZER,
};
pub use types::{
    merge_conditions, Condition, ConditionStatus, LabelSelector, LabelSelectorOperator,
    LabelSelectorRequirement, ResourceKey,
};
