//! Operator configuration
//!
//! Parsed once in `main` and handed to each component constructor. Every flag
//! can also be set through its environment variable.

use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::backend::BackendVersion;

/// Which SecurityPolicy schema the operator serves
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, ValueEnum)]
pub enum PolicySchema {
    /// Flat `nsx.vmware.com` resources realized in the infra domain
    #[default]
    Legacy,
    /// Namespace-scoped `crd.nsx.vmware.com` resources realized in per-namespace VPCs
    Vpc,
}

impl std::fmt::Display for PolicySchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::Vpc => write!(f, "vpc"),
        }
    }
}

/// Runtime configuration for the operator
#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// Cluster name, recorded on every backend object
    #[arg(long, env = "NSX_CLUSTER_NAME", default_value = "k8scl-one")]
    pub cluster: String,

    /// Backend manager URL, e.g. https://nsx-manager.example.com
    #[arg(long, env = "NSX_API_URL", default_value = "https://localhost")]
    pub nsx_url: String,

    /// Backend API user
    #[arg(long, env = "NSX_API_USER", default_value = "admin")]
    pub nsx_user: String,

    /// Backend API password
    #[arg(long, env = "NSX_API_PASSWORD", default_value = "", hide_env_values = true)]
    pub nsx_password: String,

    /// Skip TLS certificate verification for the backend
    #[arg(long, env = "NSX_INSECURE")]
    pub insecure: bool,

    /// Backend request timeout in seconds
    #[arg(long, env = "NSX_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Active SecurityPolicy schema
    #[arg(long, env = "NSX_POLICY_SCHEMA", value_enum, default_value_t = PolicySchema::Legacy)]
    pub schema: PolicySchema,

    /// Backend organization for project and VPC placement
    #[arg(long, env = "NSX_ORG", default_value = "default")]
    pub org: String,

    /// Backend project for project and VPC placement
    #[arg(long, env = "NSX_PROJECT", default_value = "default")]
    pub project: String,

    /// Backend domain for legacy placement
    #[arg(long, env = "NSX_DOMAIN", default_value = "default")]
    pub domain: String,

    /// Minimum backend version for the legacy schema
    #[arg(long, env = "NSX_MIN_VERSION_LEGACY", default_value = "3.2.0")]
    pub min_version_legacy: BackendVersion,

    /// Minimum backend version for the VPC schema
    #[arg(long, env = "NSX_MIN_VERSION_VPC", default_value = "4.1.1")]
    pub min_version_vpc: BackendVersion,

    /// Concurrent reconcile workers (default: available parallelism)
    #[arg(long, env = "NSX_WORKERS")]
    pub workers: Option<usize>,

    /// Seconds between garbage collection passes
    #[arg(long, env = "NSX_GC_INTERVAL_SECS", default_value_t = 600)]
    pub gc_interval_secs: u64,

    /// Run garbage collection and restore once before starting the controller
    #[arg(long, env = "NSX_RESTORE_ON_START")]
    pub restore_on_start: bool,

    /// Namespace the operator runs in; always protected
    #[arg(long, env = "NSX_OPERATOR_NAMESPACE", default_value = "vmware-system-nsx")]
    pub operator_namespace: String,

    /// Additional protected namespaces (comma separated)
    #[arg(long, env = "NSX_PROTECTED_NAMESPACES", value_delimiter = ',')]
    pub protected_namespaces: Vec<String>,
}

impl OperatorConfig {
    /// Worker count, falling back to the machine's parallelism
    pub fn workers(&self) -> usize {
        self.workers
            .filter(|w| *w > 0)
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
    }

    /// Interval between garbage collection passes
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs.max(1))
    }

    /// Backend request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Minimum backend version required by `schema`
    pub fn min_version(&self, schema: PolicySchema) -> BackendVersion {
        match schema {
            PolicySchema::Legacy => self.min_version_legacy,
            PolicySchema::Vpc => self.min_version_vpc,
        }
    }

    /// Configuration with defaults for tests
    pub fn for_testing() -> Self {
        Self {
            cluster: "k8scl-one".to_string(),
            nsx_url: "https://nsx.test".to_string(),
            nsx_user: "admin".to_string(),
            nsx_password: String::new(),
            insecure: true,
            request_timeout_secs: 5,
            schema: PolicySchema::Legacy,
            org: "default".to_string(),
            project: "default".to_string(),
            domain: "default".to_string(),
            min_version_legacy: BackendVersion::new(3, 2, 0),
            min_version_vpc: BackendVersion::new(4, 1, 1),
            workers: Some(2),
            gc_interval_secs: 600,
            restore_on_start: false,
            operator_namespace: "vmware-system-nsx".to_string(),
            protected_namespaces: Vec::new(),
        }
    }
}
