//! Backend object model and transport seam
//!
//! Every object the operator creates on the backend is a [`BackendObject`]: an
//! ID, a path, provenance tags and a typed payload. The transport is the
//! [`Backend`] trait, implemented over HTTP by [`client::NsxClient`].

pub mod builder;
pub mod client;
pub mod service;
pub mod store;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use service::{PolicyBackend, SecurityPolicyService};
pub use store::{IndexedStore, Inventories, Inventory};

// =============================================================================
// Tags
// =============================================================================

/// Tag scope for the owning cluster
pub const TAG_SCOPE_CLUSTER: &str = "nsx-op/cluster";
/// Tag scope for the owning namespace
pub const TAG_SCOPE_NAMESPACE: &str = "nsx-op/namespace";
/// Tag scope for the owning SecurityPolicy name
pub const TAG_SCOPE_POLICY_NAME: &str = "nsx-op/security_policy_name";
/// Tag scope for the owning SecurityPolicy UID
pub const TAG_SCOPE_POLICY_UID: &str = "nsx-op/security_policy_uid";
/// Tag scope for the owning rule's derived UID
pub const TAG_SCOPE_RULE_UID: &str = "nsx-op/rule_uid";

/// Provenance tag
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    /// Key
    pub scope: String,
    /// Value
    pub tag: String,
}

impl Tag {
    /// Build a tag
    pub fn new(scope: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            tag: tag.into(),
        }
    }
}

// =============================================================================
// Objects
// =============================================================================

/// Kinds of backend objects the operator owns
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// Distributed firewall policy
    SecurityPolicy,
    /// Rule inside a policy
    Rule,
    /// Membership group
    Group,
    /// Share of a project-level group with a VPC
    Share,
}

impl ObjectKind {
    /// Every kind, in deletion order
    pub const ALL: [ObjectKind; 4] = [
        ObjectKind::Rule,
        ObjectKind::SecurityPolicy,
        ObjectKind::Share,
        ObjectKind::Group,
    ];

    /// Position in [`ObjectKind::ALL`]
    pub fn index(self) -> usize {
        match self {
            Self::Rule => 0,
            Self::SecurityPolicy => 1,
            Self::Share => 2,
            Self::Group => 3,
        }
    }

    /// `resource_type` as the backend spells it
    pub fn resource_type(self) -> &'static str {
        match self {
            Self::SecurityPolicy => "SecurityPolicy",
            Self::Rule => "Rule",
            Self::Group => "Group",
            Self::Share => "Share",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource_type())
    }
}

/// Ports matched by a rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resource_type", rename = "L4PortSetServiceEntry")]
pub struct ServiceEntry {
    /// Entry ID within the rule
    pub id: String,
    /// TCP, UDP or SCTP
    pub l4_protocol: String,
    /// Single ports or `a-b` ranges
    pub destination_ports: Vec<String>,
}

/// Group membership criterion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resource_type")]
pub enum Expression {
    /// Tag match on a member type
    Condition {
        /// SegmentPort, VirtualMachine or Segment
        member_type: String,
        /// Always `Tag`
        key: String,
        /// EQUALS or NOTEQUALS
        operator: String,
        /// `scope|tag`
        value: String,
    },
    /// Joins the neighbouring expressions
    ConjunctionOperator {
        /// AND or OR
        conjunction_operator: String,
    },
    /// Explicit addresses, CIDRs or ranges
    IPAddressExpression {
        /// Addresses
        ip_addresses: Vec<String>,
    },
}

/// Kind-specific object body
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resource_type")]
pub enum Payload {
    /// Policy header
    SecurityPolicy {
        /// Evaluation order
        sequence_number: i32,
        /// Applied-to group paths, or `ANY`
        scope: Vec<String>,
        /// Firewall category
        category: String,
    },
    /// One firewall rule
    Rule {
        /// ALLOW, DROP or REJECT
        action: String,
        /// IN or OUT
        direction: String,
        /// Evaluation order inside the policy
        sequence_number: i32,
        /// Source group paths, or `ANY`
        source_groups: Vec<String>,
        /// Destination group paths, or `ANY`
        destination_groups: Vec<String>,
        /// Applied-to group paths, or `ANY`
        scope: Vec<String>,
        /// Service paths; `ANY` when ports are given as entries
        services: Vec<String>,
        /// Inline port sets
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        service_entries: Vec<ServiceEntry>,
    },
    /// Membership group
    Group {
        /// Criteria
        expression: Vec<Expression>,
    },
    /// Share of a group with other placements
    Share {
        /// Paths the share grants access to
        shared_with: Vec<String>,
    },
}

impl Payload {
    /// Kind of object this payload belongs to
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::SecurityPolicy { .. } => ObjectKind::SecurityPolicy,
            Self::Rule { .. } => ObjectKind::Rule,
            Self::Group { .. } => ObjectKind::Group,
            Self::Share { .. } => ObjectKind::Share,
        }
    }
}

/// An object realized on the backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendObject {
    /// Backend ID, unique within its parent
    pub id: String,
    /// Absolute path
    pub path: String,
    /// Parent path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    /// Name shown in the backend UI
    pub display_name: String,
    /// Provenance tags
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Kind-specific body
    #[serde(flatten)]
    pub payload: Payload,
}

impl BackendObject {
    /// Kind of this object
    pub fn kind(&self) -> ObjectKind {
        self.payload.kind()
    }

    /// First tag value with `scope`
    pub fn tag(&self, scope: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.scope == scope)
            .map(|t| t.tag.as_str())
    }

    /// Placement the object lives in, derived from its path
    pub fn scope(&self) -> Result<Scope> {
        Scope::of_path(&self.path)
    }
}

// =============================================================================
// Placement
// =============================================================================

/// Which part of the backend tree an object lives in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// `/infra/domains/<domain>`: legacy placement
    Infra,
    /// `/orgs/<org>/projects/<project>/infra`: shared project objects
    Project,
    /// `/orgs/<org>/projects/<project>/vpcs/<vpc>`: per-namespace placement
    Vpc,
}

impl Scope {
    /// Every scope
    pub const ALL: [Scope; 3] = [Scope::Infra, Scope::Project, Scope::Vpc];

    /// Position in [`Scope::ALL`]
    pub fn index(self) -> usize {
        match self {
            Self::Infra => 0,
            Self::Project => 1,
            Self::Vpc => 2,
        }
    }

    /// Classify a path by its prefix
    pub fn of_path(path: &str) -> Result<Scope> {
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        match segments.as_slice() {
            ["infra", ..] => Ok(Scope::Infra),
            ["orgs", _, "projects", _, "infra", ..] => Ok(Scope::Project),
            ["orgs", _, "projects", _, "vpcs", _, ..] => Ok(Scope::Vpc),
            _ => Err(Error::invalid_path(path, "unrecognized placement")),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infra => write!(f, "infra"),
            Self::Project => write!(f, "project"),
            Self::Vpc => write!(f, "vpc"),
        }
    }
}

/// Path roots for the configured org, project and domain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    /// Organization
    pub org: String,
    /// Project
    pub project: String,
    /// Legacy domain
    pub domain: String,
}

impl Placement {
    /// Build from explicit names
    pub fn new(
        org: impl Into<String>,
        project: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            org: org.into(),
            project: project.into(),
            domain: domain.into(),
        }
    }

    /// Legacy domain root
    pub fn infra_root(&self) -> String {
        format!("/infra/domains/{}", self.domain)
    }

    /// Project infra root, home of shared groups
    pub fn project_root(&self) -> String {
        format!("/orgs/{}/projects/{}/infra", self.org, self.project)
    }

    /// Domain under the project infra root that holds shared groups
    pub fn project_domain_root(&self) -> String {
        format!("{}/domains/{}", self.project_root(), self.domain)
    }

    /// Root of one VPC
    pub fn vpc_root(&self, vpc: &str) -> String {
        format!("/orgs/{}/projects/{}/vpcs/{}", self.org, self.project, vpc)
    }
}

/// Where a group lives, parsed back out of its path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupLocation {
    /// Placement
    pub scope: Scope,
    /// Parent path (domain or VPC)
    pub parent_path: String,
    /// Group ID
    pub id: String,
}

impl GroupLocation {
    /// Full path of the group
    pub fn path(&self) -> String {
        format!("{}/groups/{}", self.parent_path, self.id)
    }
}

/// Parse a group path into its placement, parent and ID.
///
/// Accepted shapes:
/// `/infra/domains/<d>/groups/<id>`,
/// `/orgs/<o>/projects/<p>/infra/domains/<d>/groups/<id>`,
/// `/orgs/<o>/projects/<p>/vpcs/<v>/groups/<id>`.
pub fn parse_group_path(path: &str) -> Result<GroupLocation> {
    let scope = Scope::of_path(path)?;
    let (parent, id) = path
        .rsplit_once("/groups/")
        .ok_or_else(|| Error::invalid_path(path, "not a group path"))?;
    if id.is_empty() || id.contains('/') {
        return Err(Error::invalid_path(path, "missing group id"));
    }

    let segments: Vec<&str> = parent.trim_start_matches('/').split('/').collect();
    let well_formed = match scope {
        Scope::Infra => matches!(segments.as_slice(), ["infra", "domains", d] if !d.is_empty()),
        Scope::Project => matches!(
            segments.as_slice(),
            ["orgs", o, "projects", p, "infra", "domains", d]
                if !o.is_empty() && !p.is_empty() && !d.is_empty()
        ),
        Scope::Vpc => matches!(
            segments.as_slice(),
            ["orgs", o, "projects", p, "vpcs", v]
                if !o.is_empty() && !p.is_empty() && !v.is_empty()
        ),
    };
    if !well_formed {
        return Err(Error::invalid_path(path, "unexpected group parent"));
    }

    Ok(GroupLocation {
        scope,
        parent_path: parent.to_string(),
        id: id.to_string(),
    })
}

// =============================================================================
// Version
// =============================================================================

/// `major.minor.patch` backend version
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendVersion {
    /// Major
    pub major: u32,
    /// Minor
    pub minor: u32,
    /// Patch
    pub patch: u32,
}

impl BackendVersion {
    /// Build a version
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for BackendVersion {
    type Err = String;

    /// Parses the leading three numeric components; build suffixes are ignored
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.trim().split('.').map(|p| {
            p.parse::<u32>()
                .map_err(|_| format!("invalid version component {p:?} in {s:?}"))
        });
        let major = parts
            .next()
            .ok_or_else(|| format!("empty version {s:?}"))??;
        let minor = parts.next().transpose()?.unwrap_or(0);
        let patch = parts.next().transpose()?.unwrap_or(0);
        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Raw backend operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend product version
    async fn version(&self) -> Result<BackendVersion>;

    /// Create or replace an object at its path
    async fn apply(&self, object: &BackendObject) -> Result<()>;

    /// Delete the object at `path`
    async fn delete(&self, path: &str) -> Result<()>;

    /// Every object of `kind` tagged with `cluster`, across all placements
    async fn search(&self, kind: ObjectKind, cluster: &str) -> Result<Vec<BackendObject>>;
}
