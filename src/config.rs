//! CSE configuration.
//!
//! Configuration is passed to [`crate::Cse::with_config`] as a plain
//! struct; there is no file-loading layer in the core. The option set
//! follows the recognised options of the service configuration: CSE
//! identity, ACP checking, notification behavior, remote CSE registration
//! and the HTTP binding.

/// CSE deployment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CseType {
    /// Infrastructure node CSE
    In,
    /// Middle node CSE
    Mn,
    /// Application service node CSE
    Asn,
}

/// Registration data for a registrar (remote) CSE.
#[derive(Debug, Clone)]
pub struct RemoteCseConfig {
    /// Point of access of the remote CSE, e.g. `http://host:8080`
    pub address: String,
    /// CSE-ID of the remote CSE, e.g. `/id-in`
    pub csi: String,
    /// Resource name of the remote CSEBase
    pub rn: String,
    /// Originator used for requests towards the remote CSE
    pub originator: String,
    /// Heartbeat / connectivity check interval in seconds
    pub check_interval_secs: u64,
}

/// Static configuration of a CSE instance.
#[derive(Debug, Clone)]
pub struct CseConfig {
    /// CSE-ID including the leading slash, e.g. `/id-in`
    pub csi: String,
    /// Resource name of the CSEBase
    pub rn: String,
    /// Resource identifier of the CSEBase
    pub ri: String,
    /// Service provider identifier (absolute addressing)
    pub spid: String,
    pub cse_type: CseType,
    /// Originator treated as the CSE administrator
    pub originator: String,

    /// Evaluate access control policies; when `false` every access check
    /// succeeds.
    pub enable_acp_checks: bool,
    /// Resource name of the default ACP created at startup
    pub default_acp_rn: String,

    /// Send notifications and verification requests
    pub enable_notifications: bool,
    /// Retries for established-subscription deliveries (verification and
    /// deletion notices are never retried)
    pub notification_retries: u32,
    /// Initial backoff between delivery retries, doubled per attempt
    pub notification_retry_backoff_ms: u64,
    /// Timeout for a single outbound notification request
    pub notification_timeout_ms: u64,

    /// Supported release version indicators
    pub supported_release_versions: Vec<String>,
    /// Release version used for outbound requests
    pub release_version: String,

    /// Default expiration delta in seconds applied when a created
    /// resource carries no `et`
    pub expiration_delta_secs: i64,
    /// Interval of the background expiration sweep
    pub expiration_check_interval_secs: u64,

    /// Registrar CSE, when this CSE registers remotely
    pub remote: Option<RemoteCseConfig>,

    /// HTTP binding listen interface
    pub http_interface: String,
    pub http_port: u16,
    /// Path prefix the binding strips from incoming request paths
    pub http_root: String,

    /// Drop all stored resources at startup
    pub reset_storage_on_startup: bool,
}

impl Default for CseConfig {
    fn default() -> Self {
        Self {
            csi: "/id-in".to_string(),
            rn: "cse-in".to_string(),
            ri: "id-in".to_string(),
            spid: "sp.example".to_string(),
            cse_type: CseType::In,
            originator: "CAdmin".to_string(),
            enable_acp_checks: true,
            default_acp_rn: "acpCreateACPs".to_string(),
            enable_notifications: true,
            notification_retries: 2,
            notification_retry_backoff_ms: 500,
            notification_timeout_ms: 5_000,
            supported_release_versions: vec!["2a".into(), "3".into(), "4".into()],
            release_version: "3".to_string(),
            expiration_delta_secs: 60 * 60 * 24,
            expiration_check_interval_secs: 2,
            remote: None,
            http_interface: "127.0.0.1".to_string(),
            http_port: 8080,
            http_root: String::new(),
            reset_storage_on_startup: false,
        }
    }
}

impl CseConfig {
    /// `csi` without the leading slash, as used in SP-relative paths.
    pub fn csi_stem(&self) -> &str {
        self.csi.strip_prefix('/').unwrap_or(&self.csi)
    }
}
