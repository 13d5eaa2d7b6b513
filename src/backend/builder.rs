//! Translate a [`ManagedPolicy`] into backend objects
//!
//! One policy yields a policy header, one rule per declared rule, one group per
//! applied-to target set and per peer, and, in VPC placement, a project-level
//! group plus a share for every namespace-selector peer.

use std::collections::BTreeSet;

use super::{
    BackendObject, Expression, Payload, Placement, ServiceEntry, Tag, TAG_SCOPE_CLUSTER,
    TAG_SCOPE_NAMESPACE, TAG_SCOPE_POLICY_NAME, TAG_SCOPE_POLICY_UID, TAG_SCOPE_RULE_UID,
};
use crate::config::PolicySchema;
use crate::crd::{
    LabelSelector, LabelSelectorOperator, ManagedPolicy, PolicyPeer, PolicyTarget, PortValue,
    RuleAction, SecurityPolicyPort, SecurityPolicyRule,
};
use crate::ip_range::Block;
use crate::naming::{
    generate_display_name, generate_id, generate_short_id, normalize_label_key,
    normalize_label_value, sanitize, truncate_with_hash, MAX_DISPLAY_NAME_LENGTH, MAX_ID_LENGTH,
    MAX_TAG_SCOPE_LENGTH, MAX_TAG_VALUE_LENGTH,
};
use crate::{Error, Result};

const ANY: &str = "ANY";
const MEMBER_POD: &str = "SegmentPort";
const MEMBER_VM: &str = "VirtualMachine";
const MEMBER_NAMESPACE: &str = "Segment";
const CATEGORY: &str = "Application";

/// Backend objects realizing one policy
#[derive(Clone, Debug, PartialEq)]
pub struct BuiltPolicy {
    /// Policy header
    pub policy: BackendObject,
    /// Rules, in declaration order
    pub rules: Vec<BackendObject>,
    /// Groups referenced by the policy and its rules
    pub groups: Vec<BackendObject>,
    /// Shares for project-level groups
    pub shares: Vec<BackendObject>,
}

impl BuiltPolicy {
    /// Objects in the order they must be applied: referenced before referencing
    pub fn apply_order(&self) -> impl Iterator<Item = &BackendObject> {
        self.groups
            .iter()
            .chain(self.shares.iter())
            .chain(std::iter::once(&self.policy))
            .chain(self.rules.iter())
    }

    /// Paths of every object
    pub fn paths(&self) -> BTreeSet<String> {
        self.apply_order().map(|o| o.path.clone()).collect()
    }
}

/// Builds backend objects for a cluster and placement
#[derive(Clone, Debug)]
pub struct PolicyBuilder {
    cluster: String,
    placement: Placement,
}

/// Per-policy values threaded through the build
struct BuildContext<'a> {
    policy: &'a ManagedPolicy,
    /// Parent of the policy and its local groups
    parent: String,
    /// VPC root for VPC placement
    vpc_root: Option<String>,
    base_tags: Vec<Tag>,
}

impl BuildContext<'_> {
    fn namespace(&self) -> &str {
        &self.policy.key.namespace
    }

    fn tags_for_rule(&self, rule_uid: &str) -> Vec<Tag> {
        let mut tags = self.base_tags.clone();
        tags.push(Tag::new(TAG_SCOPE_RULE_UID, rule_uid));
        tags
    }
}

impl PolicyBuilder {
    /// Create a builder
    pub fn new(cluster: impl Into<String>, placement: Placement) -> Self {
        Self {
            cluster: cluster.into(),
            placement,
        }
    }

    /// Placement roots used by this builder
    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// VPC ID for a namespace
    pub fn vpc_id(namespace: &str) -> String {
        truncate_with_hash(&sanitize(namespace), MAX_ID_LENGTH)
    }

    /// Build every backend object for `policy`
    pub fn build(&self, policy: &ManagedPolicy) -> Result<BuiltPolicy> {
        let key = &policy.key;
        let (parent, vpc_root) = match policy.schema {
            PolicySchema::Legacy => (self.placement.infra_root(), None),
            PolicySchema::Vpc => {
                let root = self.placement.vpc_root(&Self::vpc_id(&key.namespace));
                (root.clone(), Some(root))
            }
        };

        let ctx = BuildContext {
            policy,
            parent,
            vpc_root,
            base_tags: vec![
                Tag::new(
                    TAG_SCOPE_CLUSTER,
                    truncate_with_hash(&self.cluster, MAX_TAG_VALUE_LENGTH),
                ),
                Tag::new(TAG_SCOPE_NAMESPACE, &key.namespace),
                Tag::new(
                    TAG_SCOPE_POLICY_NAME,
                    truncate_with_hash(&key.name, MAX_TAG_VALUE_LENGTH),
                ),
                Tag::new(TAG_SCOPE_POLICY_UID, &policy.uid),
            ],
        };

        let mut groups = Vec::new();
        let mut shares = Vec::new();

        let policy_base = format!("{}_{}", key.namespace, key.name);
        let policy_id = generate_id(&policy_base, &policy.uid, MAX_ID_LENGTH);
        let policy_path = format!("{}/security-policies/{}", ctx.parent, policy_id);

        let policy_scope = match self.target_group(
            &ctx,
            &format!("{policy_base}_scope"),
            &policy.uid,
            &policy.spec.applied_to,
            ctx.base_tags.clone(),
        )? {
            Some(group) => {
                let path = group.path.clone();
                groups.push(group);
                vec![path]
            }
            None => vec![ANY.to_string()],
        };

        let mut rules = Vec::with_capacity(policy.spec.rules.len());
        for (idx, rule) in policy.spec.rules.iter().enumerate() {
            rules.push(self.build_rule(&ctx, &policy_path, idx, rule, &mut groups, &mut shares)?);
        }

        let policy_obj = BackendObject {
            id: policy_id,
            path: policy_path,
            parent_path: Some(ctx.parent.clone()),
            display_name: generate_display_name(&key.name, &policy.uid, MAX_DISPLAY_NAME_LENGTH),
            tags: ctx.base_tags.clone(),
            payload: Payload::SecurityPolicy {
                sequence_number: policy.spec.priority,
                scope: policy_scope,
                category: CATEGORY.to_string(),
            },
        };

        Ok(BuiltPolicy {
            policy: policy_obj,
            rules,
            groups,
            shares,
        })
    }

    fn build_rule(
        &self,
        ctx: &BuildContext<'_>,
        policy_path: &str,
        idx: usize,
        rule: &SecurityPolicyRule,
        groups: &mut Vec<BackendObject>,
        shares: &mut Vec<BackendObject>,
    ) -> Result<BackendObject> {
        let key = &ctx.policy.key;
        let rule_uid = format!("{}_{}", ctx.policy.uid, idx);
        let rule_name = rule
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", key.name, idx));
        let rule_base = format!("{}_{}", key.namespace, rule_name);
        let ingress = rule.direction.is_ingress();

        let scope = match self.target_group(
            ctx,
            &format!("{rule_base}_scope"),
            &rule_uid,
            &rule.applied_to,
            ctx.tags_for_rule(&rule_uid),
        )? {
            Some(group) => {
                let path = group.path.clone();
                groups.push(group);
                vec![path]
            }
            None => vec![ANY.to_string()],
        };

        let (peers, side) = if ingress {
            (&rule.sources, "src")
        } else {
            (&rule.destinations, "dst")
        };
        let mut peer_paths = Vec::with_capacity(peers.len());
        for (j, peer) in peers.iter().enumerate() {
            let base = format!("{rule_base}_{side}_{j}");
            let (group, share) = self.peer_group(ctx, &base, &rule_uid, peer)?;
            peer_paths.push(group.path.clone());
            groups.push(group);
            shares.extend(share);
        }
        if peer_paths.is_empty() {
            peer_paths.push(ANY.to_string());
        }
        let (source_groups, destination_groups) = if ingress {
            (peer_paths, vec![ANY.to_string()])
        } else {
            (vec![ANY.to_string()], peer_paths)
        };

        let service_entries = rule
            .ports
            .iter()
            .enumerate()
            .map(|(i, port)| service_entry(&key.to_string(), i, port))
            .collect::<Result<Vec<_>>>()?;

        let id = generate_short_id(&rule_base, &rule_uid, MAX_ID_LENGTH);
        Ok(BackendObject {
            path: format!("{policy_path}/rules/{id}"),
            id,
            parent_path: Some(policy_path.to_string()),
            display_name: generate_display_name(&rule_name, &rule_uid, MAX_DISPLAY_NAME_LENGTH),
            tags: ctx.tags_for_rule(&rule_uid),
            payload: Payload::Rule {
                action: match rule.action {
                    RuleAction::Allow => "ALLOW",
                    RuleAction::Drop => "DROP",
                    RuleAction::Reject => "REJECT",
                }
                .to_string(),
                direction: if ingress { "IN" } else { "OUT" }.to_string(),
                sequence_number: i32::try_from(idx).unwrap_or(i32::MAX),
                source_groups,
                destination_groups,
                scope,
                services: vec![ANY.to_string()],
                service_entries,
            },
        })
    }

    /// Group selecting the workloads of `targets`, or `None` when empty
    fn target_group(
        &self,
        ctx: &BuildContext<'_>,
        base: &str,
        owner_uid: &str,
        targets: &[PolicyTarget],
        tags: Vec<Tag>,
    ) -> Result<Option<BackendObject>> {
        if targets.is_empty() {
            return Ok(None);
        }

        let mut criteria = Vec::new();
        for target in targets {
            let resource = ctx.policy.key.to_string();
            if let Some(selector) = &target.pod_selector {
                criteria.push(selector_criterion(
                    &resource,
                    MEMBER_POD,
                    selector,
                    Some(ctx.namespace()),
                )?);
            }
            if let Some(selector) = &target.vm_selector {
                criteria.push(selector_criterion(
                    &resource,
                    MEMBER_VM,
                    selector,
                    Some(ctx.namespace()),
                )?);
            }
        }
        if criteria.is_empty() {
            return Err(Error::validation_for(
                ctx.policy.key.to_string(),
                "appliedTo entry has neither podSelector nor vmSelector",
            ));
        }

        Ok(Some(self.group(
            &ctx.parent,
            base,
            owner_uid,
            join(criteria, "OR"),
            tags,
        )))
    }

    /// Group for one peer, plus a share when it lives at project level
    fn peer_group(
        &self,
        ctx: &BuildContext<'_>,
        base: &str,
        rule_uid: &str,
        peer: &PolicyPeer,
    ) -> Result<(BackendObject, Option<BackendObject>)> {
        let resource = ctx.policy.key.to_string();
        let mut criteria = Vec::new();

        if !peer.ip_blocks.is_empty() {
            let mut addresses = Vec::new();
            for block in &peer.ip_blocks {
                if block.except.is_empty() {
                    Block::parse(&block.cidr)?;
                    addresses.push(block.cidr.clone());
                    continue;
                }
                let excepts = block
                    .except
                    .iter()
                    .map(|e| Block::parse(e.as_str()))
                    .collect::<Result<Vec<_>>>()?;
                addresses.extend(
                    Block::parse(&block.cidr)?
                        .without(&excepts)
                        .iter()
                        .map(ToString::to_string),
                );
            }
            if !addresses.is_empty() {
                criteria.push(vec![Expression::IPAddressExpression {
                    ip_addresses: addresses,
                }]);
            }
        }

        // A namespace selector replaces the implicit own-namespace restriction
        let own_namespace = peer
            .namespace_selector
            .is_none()
            .then_some(ctx.namespace());
        let namespace_terms = match &peer.namespace_selector {
            // Empty namespace selector: every namespace of this cluster
            Some(selector) if selector.is_empty() => vec![condition(
                MEMBER_NAMESPACE,
                "EQUALS",
                TAG_SCOPE_CLUSTER,
                &truncate_with_hash(&self.cluster, MAX_TAG_VALUE_LENGTH),
            )],
            Some(selector) => selector_criterion(&resource, MEMBER_NAMESPACE, selector, None)?,
            None => Vec::new(),
        };

        let mut selected = false;
        for (member, selector) in [(MEMBER_POD, &peer.pod_selector), (MEMBER_VM, &peer.vm_selector)] {
            if let Some(selector) = selector {
                selected = true;
                // Every workload of the selected namespaces
                if selector.is_empty() && !namespace_terms.is_empty() {
                    criteria.push(namespace_terms.clone());
                    continue;
                }
                let mut terms = selector_criterion(&resource, member, selector, own_namespace)?;
                if !namespace_terms.is_empty() {
                    terms = join(vec![terms, namespace_terms.clone()], "AND");
                }
                criteria.push(terms);
            }
        }
        if !selected && !namespace_terms.is_empty() {
            criteria.push(namespace_terms);
        }

        if criteria.is_empty() {
            return Err(Error::validation_for(
                resource,
                "peer selects nothing: set podSelector, vmSelector, namespaceSelector or ipBlocks",
            ));
        }

        let tags = ctx.tags_for_rule(rule_uid);
        let expression = join(criteria, "OR");

        match (&ctx.vpc_root, &peer.namespace_selector) {
            (Some(vpc_root), Some(_)) => {
                let shared_parent = self.placement.project_domain_root();
                let group = self.group(&shared_parent, base, rule_uid, expression, tags.clone());
                let share_id = generate_id(&format!("{base}_share"), rule_uid, MAX_ID_LENGTH);
                let share = BackendObject {
                    path: format!("{}/shares/{}", self.placement.project_root(), share_id),
                    display_name: share_id.clone(),
                    id: share_id,
                    parent_path: Some(self.placement.project_root()),
                    tags,
                    payload: Payload::Share {
                        shared_with: vec![vpc_root.clone()],
                    },
                };
                Ok((group, Some(share)))
            }
            _ => Ok((
                self.group(&ctx.parent, base, rule_uid, expression, tags),
                None,
            )),
        }
    }

    fn group(
        &self,
        parent: &str,
        base: &str,
        owner_uid: &str,
        expression: Vec<Expression>,
        tags: Vec<Tag>,
    ) -> BackendObject {
        let id = generate_id(base, owner_uid, MAX_ID_LENGTH);
        BackendObject {
            path: format!("{parent}/groups/{id}"),
            display_name: generate_display_name(base, owner_uid, MAX_DISPLAY_NAME_LENGTH),
            id,
            parent_path: Some(parent.to_string()),
            tags,
            payload: Payload::Group { expression },
        }
    }
}

fn condition(member_type: &str, operator: &str, scope: &str, value: &str) -> Expression {
    Expression::Condition {
        member_type: member_type.to_string(),
        key: "Tag".to_string(),
        operator: operator.to_string(),
        value: format!("{scope}|{value}"),
    }
}

/// Join criteria with a conjunction between each pair
fn join(criteria: Vec<Vec<Expression>>, conjunction: &str) -> Vec<Expression> {
    let mut out = Vec::new();
    for (i, criterion) in criteria.into_iter().enumerate() {
        if i > 0 {
            out.push(Expression::ConjunctionOperator {
                conjunction_operator: conjunction.to_string(),
            });
        }
        out.extend(criterion);
    }
    out
}

/// Tag conditions for one label selector, ANDed together
fn selector_criterion(
    resource: &str,
    member_type: &str,
    selector: &LabelSelector,
    namespace: Option<&str>,
) -> Result<Vec<Expression>> {
    let mut terms: Vec<Vec<Expression>> = Vec::new();
    if let Some(ns) = namespace {
        terms.push(vec![condition(member_type, "EQUALS", TAG_SCOPE_NAMESPACE, ns)]);
    }

    for (k, v) in &selector.match_labels {
        terms.push(vec![condition(
            member_type,
            "EQUALS",
            &normalize_label_key(k, MAX_TAG_SCOPE_LENGTH),
            &normalize_label_value(v, MAX_TAG_VALUE_LENGTH),
        )]);
    }

    for req in &selector.match_expressions {
        let key = normalize_label_key(&req.key, MAX_TAG_SCOPE_LENGTH);
        let term = match (&req.operator, req.values.as_slice()) {
            (LabelSelectorOperator::In, [value]) => condition(
                member_type,
                "EQUALS",
                &key,
                &normalize_label_value(value, MAX_TAG_VALUE_LENGTH),
            ),
            (LabelSelectorOperator::NotIn, [value]) => condition(
                member_type,
                "NOTEQUALS",
                &key,
                &normalize_label_value(value, MAX_TAG_VALUE_LENGTH),
            ),
            (LabelSelectorOperator::Exists, []) => condition(member_type, "EQUALS", &key, ""),
            (op, values) => {
                return Err(Error::validation_for(
                    resource,
                    format!(
                        "unsupported selector operator {op} with {} value(s) on key {}",
                        values.len(),
                        req.key
                    ),
                ))
            }
        };
        terms.push(vec![term]);
    }

    if terms.is_empty() {
        return Err(Error::validation_for(
            resource,
            "empty selector outside a namespace scope selects nothing",
        ));
    }
    Ok(join(terms, "AND"))
}

fn service_entry(resource: &str, idx: usize, port: &SecurityPolicyPort) -> Result<ServiceEntry> {
    let protocol = port.protocol.to_string();
    let destination_ports = match (&port.port, port.end_port) {
        (None, _) => Vec::new(),
        (Some(PortValue::Name(name)), _) => {
            return Err(Error::validation_for(
                resource,
                format!("named port {name:?} is not supported"),
            ))
        }
        (Some(PortValue::Number(p)), None) => vec![p.to_string()],
        (Some(PortValue::Number(p)), Some(end)) if end >= *p => vec![format!("{p}-{end}")],
        (Some(PortValue::Number(p)), Some(end)) => {
            return Err(Error::validation_for(
                resource,
                format!("endPort {end} is below port {p}"),
            ))
        }
    };

    Ok(ServiceEntry {
        id: format!("{}-{}", protocol.to_lowercase(), idx),
        l4_protocol: protocol,
        destination_ports,
    })
}
