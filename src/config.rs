//! Configuration for the request replicator.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//! Durations are human-readable strings (`"30s"`, `"2m"`, `"500ms"`).
//!
//! # Quick Start
//!
//! ```rust
//! use cluster_replicator::config::ReplicatorConfig;
//!
//! let config = ReplicatorConfig {
//!     local_node_id: Some("node-1".into()),
//!     max_concurrent_calls: 32,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── local_node_id: Option<String>  # Coordinating node (representative)
//! ├── call_timeout: "30s"            # Per node call
//! ├── operation_deadline: "2m"       # Whole operation
//! ├── claim_timeout: Option<String>  # Claim phase only
//! ├── cancel_grace: "5s"             # Best-effort cancel after abort
//! ├── max_concurrent_calls: 16       # In-flight calls per operation
//! ├── upload: UploadConfig
//! ├── circuit: NodeCircuitConfig
//! ├── rate_limit: DispatchRateLimit
//! └── idempotency: IdempotencyConfig
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local_node_id: "node-1"
//! call_timeout: "10s"
//! operation_deadline: "1m"
//! claim_timeout: "20s"
//! max_concurrent_calls: 32
//!
//! upload:
//!   max_upload_bytes: 536870912
//!   staging_dir: "/var/lib/flow/staging"
//!
//! circuit:
//!   enabled: true
//!   failure_threshold: 5
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::error::{ReplicationError, Result};
use crate::resilience::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplicationEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// The node this engine coordinates from.
    /// Its payload is the representative one when it is a target.
    #[serde(default)]
    pub local_node_id: Option<String>,

    /// Per-call timeout for one node call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout: String,

    /// Deadline for the whole operation, all phases included.
    #[serde(default = "default_operation_deadline")]
    pub operation_deadline: String,

    /// Optional deadline for the claim phase alone.
    /// Expiry fails the pending claims and cancels the operation.
    #[serde(default)]
    pub claim_timeout: Option<String>,

    /// Time allowed for best-effort cancels after the operation deadline fired.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace: String,

    /// Maximum node calls in flight for one operation.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub circuit: NodeCircuitConfig,

    #[serde(default)]
    pub rate_limit: DispatchRateLimit,

    #[serde(default)]
    pub idempotency: IdempotencyConfig,
}

fn default_call_timeout() -> String {
    "30s".to_string()
}

fn default_operation_deadline() -> String {
    "2m".to_string()
}

fn default_cancel_grace() -> String {
    "5s".to_string()
}

fn default_max_concurrent_calls() -> usize {
    16
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            local_node_id: None,
            call_timeout: default_call_timeout(),
            operation_deadline: default_operation_deadline(),
            claim_timeout: None,
            cancel_grace: default_cancel_grace(),
            max_concurrent_calls: default_max_concurrent_calls(),
            upload: UploadConfig::default(),
            circuit: NodeCircuitConfig::default(),
            rate_limit: DispatchRateLimit::default(),
            idempotency: IdempotencyConfig::default(),
        }
    }
}

impl ReplicatorConfig {
    /// Create a config with short timeouts for tests.
    pub fn for_testing(local_node_id: &str) -> Self {
        Self {
            local_node_id: Some(local_node_id.to_string()),
            call_timeout: "1s".to_string(),
            operation_deadline: "5s".to_string(),
            claim_timeout: None,
            cancel_grace: "500ms".to_string(),
            max_concurrent_calls: 8,
            upload: UploadConfig {
                max_upload_bytes: 128 * 1024 * 1024,
                memory_threshold_bytes: 1024 * 1024,
                staging_dir: None,
            },
            circuit: NodeCircuitConfig::default(),
            rate_limit: DispatchRateLimit::default(),
            idempotency: IdempotencyConfig::default(),
        }
    }

    /// Per-call timeout as a Duration.
    pub fn call_timeout_duration(&self) -> Duration {
        parse_or(&self.call_timeout, Duration::from_secs(30))
    }

    /// Operation deadline as a Duration.
    pub fn operation_deadline_duration(&self) -> Duration {
        parse_or(&self.operation_deadline, Duration::from_secs(120))
    }

    /// Claim-phase timeout, if configured.
    pub fn claim_timeout_duration(&self) -> Option<Duration> {
        self.claim_timeout
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
    }

    /// Cancel grace as a Duration.
    pub fn cancel_grace_duration(&self) -> Duration {
        parse_or(&self.cancel_grace, Duration::from_secs(5))
    }

    /// Reject settings the engine cannot run with.
    ///
    /// The `*_duration()` accessors fall back to defaults on bad input;
    /// `ReplicationEngine::new()` calls this first so that never happens silently.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_calls == 0 {
            return Err(ReplicationError::Config(
                "max_concurrent_calls must be at least 1".to_string(),
            ));
        }

        require_duration("call_timeout", &self.call_timeout)?;
        require_duration("operation_deadline", &self.operation_deadline)?;
        require_duration("cancel_grace", &self.cancel_grace)?;
        if let Some(claim) = &self.claim_timeout {
            require_duration("claim_timeout", claim)?;
        }
        require_duration("idempotency.retention", &self.idempotency.retention)?;
        require_duration("circuit.recovery_timeout", &self.circuit.recovery_timeout)?;

        if self.upload.max_upload_bytes == 0 {
            return Err(ReplicationError::Config(
                "upload.max_upload_bytes must be greater than zero".to_string(),
            ));
        }
        if self.circuit.enabled && self.circuit.failure_threshold == 0 {
            return Err(ReplicationError::Config(
                "circuit.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.enabled && (self.rate_limit.per_sec == 0 || self.rate_limit.burst == 0) {
            return Err(ReplicationError::Config(
                "rate_limit.per_sec and rate_limit.burst must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

fn require_duration(field: &str, value: &str) -> Result<Duration> {
    let parsed = humantime::parse_duration(value)
        .map_err(|e| ReplicationError::Config(format!("{field}: invalid duration '{value}': {e}")))?;
    if parsed.is_zero() {
        return Err(ReplicationError::Config(format!("{field} must be greater than zero")));
    }
    Ok(parsed)
}

// ═══════════════════════════════════════════════════════════════════════════════
// UploadConfig: streamed upload staging
// ═══════════════════════════════════════════════════════════════════════════════

/// Streamed upload limits and staging location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Largest upload accepted, in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Single-pass sources up to this size stay in memory; larger ones
    /// spill to a temporary file.
    #[serde(default = "default_memory_threshold_bytes")]
    pub memory_threshold_bytes: u64,

    /// Directory for temporary upload files. System temp dir when unset.
    #[serde(default)]
    pub staging_dir: Option<String>,
}

fn default_max_upload_bytes() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_memory_threshold_bytes() -> u64 {
    8 * 1024 * 1024 // 8 MiB
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
            memory_threshold_bytes: default_memory_threshold_bytes(),
            staging_dir: None,
        }
    }
}

impl UploadConfig {
    /// Staging directory as a path, if configured.
    pub fn staging_path(&self) -> Option<PathBuf> {
        self.staging_dir.as_ref().map(PathBuf::from)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NodeCircuitConfig: per-node circuit breakers
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-node circuit breaker settings. Off by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCircuitConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Failures within the observation window that trip the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Successful half-open calls needed to close it again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// How long an open circuit rejects calls before probing.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: String,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_recovery_timeout() -> String {
    "30s".to_string()
}

impl Default for NodeCircuitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

impl NodeCircuitConfig {
    /// Breaker settings, or `None` when circuits are disabled.
    pub fn circuit_config(&self) -> Option<CircuitConfig> {
        self.enabled.then(|| CircuitConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: parse_or(&self.recovery_timeout, Duration::from_secs(30)),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DispatchRateLimit: global node call rate
// ═══════════════════════════════════════════════════════════════════════════════

/// Global cap on node calls per second across all operations. Off by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRateLimit {
    #[serde(default)]
    pub enabled: bool,

    /// Sustained calls per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub per_sec: u32,

    /// Burst allowance above the sustained rate.
    #[serde(default = "default_rate_limit_burst")]
    pub burst: u32,
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

impl Default for DispatchRateLimit {
    fn default() -> Self {
        Self {
            enabled: false,
            per_sec: default_rate_limit_per_sec(),
            burst: default_rate_limit_burst(),
        }
    }
}

impl DispatchRateLimit {
    /// Limiter settings, or `None` when rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.enabled.then(|| RateLimitConfig {
            burst_size: self.burst,
            refill_rate: self.per_sec,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IdempotencyConfig: phase result ledger
// ═══════════════════════════════════════════════════════════════════════════════

/// Ledger of terminal phase results, answering redelivered phases locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How long a recorded result is kept.
    #[serde(default = "default_retention")]
    pub retention: String,
}

fn default_true() -> bool {
    true
}

fn default_retention() -> String {
    "10m".to_string()
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention: default_retention(),
        }
    }
}

impl IdempotencyConfig {
    /// Retention as a Duration.
    pub fn retention_duration(&self) -> Duration {
        parse_or(&self.retention, Duration::from_secs(600))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
