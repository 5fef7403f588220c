//! Pipeline configuration
//!
//! Tunables for claims, deduplication, caches and the agent queue. Values are
//! loaded from `RFIDGATE_*` environment variables and clamped into their
//! supported ranges; unparseable values fall back to the default.

use crate::error::ConfigError;
use crate::normalize::{normalize_epc_prefix, parse_bool};

pub const DEFAULT_STALE_CLAIM_SECS: u64 = 120;
pub const DEFAULT_PROCESSING_CLAIM_TTL_SECS: u64 = 180;
pub const MAX_PROCESSING_CLAIM_TTL_SECS: u64 = 3600;
pub const DEFAULT_DEDUP_TTL_SECS: u64 = 86_400;
pub const DEFAULT_ANTENNA_TTL_SECS: u64 = 600;
pub const DEFAULT_SCALE_TTL_SECS: u64 = 300;
pub const DEFAULT_AGENT_TTL_SECS: u64 = 60;
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;
pub const MIN_RPC_TIMEOUT_SECS: u64 = 2;
pub const MAX_RPC_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_EPC_PREFIX: &str = "5A42";

/// Runtime tunables shared by every pipeline component.
#[derive(Debug, Clone, PartialEq)]
pub struct RfidConfig {
    /// Age after which a Claimed idempotency record may be taken over.
    pub stale_claim_secs: u64,
    /// Age after which a Processing tag may be reclaimed. 0 disables reclaim.
    pub processing_claim_ttl_secs: u64,
    /// Without antenna rules, only consume on the tag's declared antenna.
    pub consume_requires_ant_match: bool,
    pub dedup_by_ant: bool,
    pub dedup_ttl_secs: u64,
    pub antenna_ttl_secs: u64,
    pub scale_ttl_secs: u64,
    pub agent_ttl_secs: u64,
    pub default_rpc_timeout_secs: u64,
    pub epc_prefix: String,
    pub max_tags_per_ingest: usize,
    pub max_epcs_per_fulfillment: usize,
    /// Create the stock draft when a tag is marked printed.
    pub draft_on_print: bool,
}

impl Default for RfidConfig {
    fn default() -> Self {
        Self {
            stale_claim_secs: DEFAULT_STALE_CLAIM_SECS,
            processing_claim_ttl_secs: DEFAULT_PROCESSING_CLAIM_TTL_SECS,
            consume_requires_ant_match: false,
            dedup_by_ant: true,
            dedup_ttl_secs: DEFAULT_DEDUP_TTL_SECS,
            antenna_ttl_secs: DEFAULT_ANTENNA_TTL_SECS,
            scale_ttl_secs: DEFAULT_SCALE_TTL_SECS,
            agent_ttl_secs: DEFAULT_AGENT_TTL_SECS,
            default_rpc_timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
            epc_prefix: DEFAULT_EPC_PREFIX.to_string(),
            max_tags_per_ingest: 500,
            max_epcs_per_fulfillment: 200,
            draft_on_print: true,
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| if v <= 0.0 { 0 } else { v as u64 })
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|s| parse_bool(&s))
}

impl RfidConfig {
    /// Create RfidConfig from environment variables.
    ///
    /// Environment variables:
    /// - `RFIDGATE_STALE_CLAIM_SECS` (default: 120)
    /// - `RFIDGATE_PROCESSING_TTL_SECS` (default: 180, max 3600, 0 disables)
    /// - `RFIDGATE_CONSUME_REQUIRES_ANT_MATCH` (default: false)
    /// - `RFIDGATE_DEDUP_BY_ANT` (default: true)
    /// - `RFIDGATE_DEDUP_TTL_SECS` (default: 86400, 60..=30 days)
    /// - `RFIDGATE_ANTENNA_TTL_SECS` (default: 600, 30..=1 day)
    /// - `RFIDGATE_SCALE_TTL_SECS` (default: 300, 5..=3600)
    /// - `RFIDGATE_AGENT_TTL_SECS` (default: 60, 10..=3600)
    /// - `RFIDGATE_RPC_TIMEOUT_SECS` (default: 30, 2..=120)
    /// - `RFIDGATE_EPC_PREFIX` (default: 5A42)
    /// - `RFIDGATE_DRAFT_ON_PRINT` (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let epc_prefix = std::env::var("RFIDGATE_EPC_PREFIX")
            .map(|raw| normalize_epc_prefix(&raw))
            .unwrap_or(defaults.epc_prefix.clone());

        Self {
            stale_claim_secs: env_u64("RFIDGATE_STALE_CLAIM_SECS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.stale_claim_secs),
            processing_claim_ttl_secs: env_u64("RFIDGATE_PROCESSING_TTL_SECS")
                .map(|v| v.min(MAX_PROCESSING_CLAIM_TTL_SECS))
                .unwrap_or(defaults.processing_claim_ttl_secs),
            consume_requires_ant_match: env_bool("RFIDGATE_CONSUME_REQUIRES_ANT_MATCH")
                .unwrap_or(defaults.consume_requires_ant_match),
            dedup_by_ant: env_bool("RFIDGATE_DEDUP_BY_ANT").unwrap_or(defaults.dedup_by_ant),
            dedup_ttl_secs: env_u64("RFIDGATE_DEDUP_TTL_SECS")
                .unwrap_or(defaults.dedup_ttl_secs)
                .clamp(60, 30 * 86_400),
            antenna_ttl_secs: env_u64("RFIDGATE_ANTENNA_TTL_SECS")
                .unwrap_or(defaults.antenna_ttl_secs)
                .clamp(30, 86_400),
            scale_ttl_secs: env_u64("RFIDGATE_SCALE_TTL_SECS")
                .unwrap_or(defaults.scale_ttl_secs)
                .clamp(5, 3600),
            agent_ttl_secs: env_u64("RFIDGATE_AGENT_TTL_SECS")
                .unwrap_or(defaults.agent_ttl_secs)
                .clamp(10, 3600),
            default_rpc_timeout_secs: env_u64("RFIDGATE_RPC_TIMEOUT_SECS")
                .unwrap_or(defaults.default_rpc_timeout_secs)
                .clamp(MIN_RPC_TIMEOUT_SECS, MAX_RPC_TIMEOUT_SECS),
            epc_prefix,
            max_tags_per_ingest: defaults.max_tags_per_ingest,
            max_epcs_per_fulfillment: defaults.max_epcs_per_fulfillment,
            draft_on_print: env_bool("RFIDGATE_DRAFT_ON_PRINT").unwrap_or(defaults.draft_on_print),
        }
    }

    /// Reject configurations that would break pipeline invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stale_claim_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "stale_claim_secs".to_string(),
                value: "0".to_string(),
                reason: "stale threshold must be positive".to_string(),
            });
        }
        if self.processing_claim_ttl_secs > MAX_PROCESSING_CLAIM_TTL_SECS {
            return Err(ConfigError::InvalidValue {
                field: "processing_claim_ttl_secs".to_string(),
                value: self.processing_claim_ttl_secs.to_string(),
                reason: format!("must be at most {}", MAX_PROCESSING_CLAIM_TTL_SECS),
            });
        }
        if !(MIN_RPC_TIMEOUT_SECS..=MAX_RPC_TIMEOUT_SECS).contains(&self.default_rpc_timeout_secs) {
            return Err(ConfigError::InvalidValue {
                field: "default_rpc_timeout_secs".to_string(),
                value: self.default_rpc_timeout_secs.to_string(),
                reason: format!(
                    "must be within {}..={}",
                    MIN_RPC_TIMEOUT_SECS, MAX_RPC_TIMEOUT_SECS
                ),
            });
        }
        if self.epc_prefix.len() > 20 || self.epc_prefix.len() % 2 == 1 {
            return Err(ConfigError::InvalidValue {
                field: "epc_prefix".to_string(),
                value: self.epc_prefix.clone(),
                reason: "must be an even-length hex string of at most 20 chars".to_string(),
            });
        }
        if self.max_tags_per_ingest == 0 || self.max_epcs_per_fulfillment == 0 {
            return Err(ConfigError::MissingRequired {
                field: "max_tags_per_ingest".to_string(),
            });
        }
        Ok(())
    }

    /// Clamp a caller-supplied RPC timeout, falling back to the default.
    pub fn rpc_timeout_secs(&self, requested: Option<i64>) -> i64 {
        let value = requested
            .filter(|v| *v > 0)
            .map(|v| v as u64)
            .unwrap_or(self.default_rpc_timeout_secs);
        value.clamp(MIN_RPC_TIMEOUT_SECS, MAX_RPC_TIMEOUT_SECS) as i64
    }
}

// ============================================================================
// TESTS
// ============================================================================
