//! Heartbeat registry of edge agents.

use rfidgate_core::normalize::{clean_text, sanitize_agent_id, value_as_i64, value_as_string};
use rfidgate_core::{AgentInfo, Clock};
use rfidgate_storage::ExpiringMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub const MAX_UI_URLS: usize = 10;
const UNKNOWN_DEVICE: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct RegisterRequest {
    pub agent_id: Option<String>,
    pub device: Option<String>,
    pub hostname: Option<String>,
    /// List of URLs, a JSON-encoded list, or a single URL.
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Vec<String>>))]
    pub ui_urls: Option<Value>,
    pub ui_host: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<i64>))]
    pub ui_port: Option<Value>,
    pub platform: Option<String>,
    pub version: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<i64>))]
    pub pid: Option<Value>,
}

fn ui_urls(raw: Option<&Value>) -> Vec<String> {
    let list = match raw {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => items,
            _ => vec![Value::String(s.clone())],
        },
        Some(other) => vec![other.clone()],
    };
    list.iter()
        .filter_map(value_as_string)
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .take(MAX_UI_URLS)
        .collect()
}

fn text(raw: Option<&str>) -> String {
    raw.and_then(|s| clean_text(s, 140)).unwrap_or_default()
}

#[derive(Clone)]
pub struct AgentRegistry {
    agents: ExpiringMap<AgentInfo>,
    clock: Arc<dyn Clock>,
    ttl_secs: u64,
}

impl AgentRegistry {
    pub fn new(clock: Arc<dyn Clock>, ttl_secs: u64) -> Self {
        Self {
            agents: ExpiringMap::new(),
            clock,
            ttl_secs,
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Store a heartbeat. The agent id falls back to the device name and then
    /// to the caller's address.
    pub fn register(&self, request: RegisterRequest, remote_addr: Option<&str>) -> AgentInfo {
        let device = request
            .device
            .as_deref()
            .or(request.hostname.as_deref())
            .and_then(|s| clean_text(s, 140))
            .unwrap_or_else(|| UNKNOWN_DEVICE.to_string());
        let agent_id = [request.agent_id.as_deref(), Some(device.as_str()), remote_addr]
            .into_iter()
            .flatten()
            .map(sanitize_agent_id)
            .find(|id| !id.is_empty())
            .unwrap_or_else(|| "agent".to_string());

        let now = self.clock.now();
        let info = AgentInfo {
            agent_id: agent_id.clone(),
            device,
            ui_urls: ui_urls(request.ui_urls.as_ref()),
            ui_host: text(request.ui_host.as_deref()),
            ui_port: request.ui_port.as_ref().and_then(value_as_i64),
            platform: text(request.platform.as_deref()),
            version: text(request.version.as_deref()),
            pid: request.pid.as_ref().and_then(value_as_i64),
            remote_addr: remote_addr.map(str::to_string),
            last_seen: now.timestamp_millis(),
        };
        self.agents.insert(agent_id, info.clone(), self.ttl_secs, now);
        debug!(agent_id = %info.agent_id, device = %info.device, "Agent heartbeat");
        info
    }

    /// Agents seen within the TTL, most recent first. Stale entries are
    /// dropped.
    pub fn list(&self) -> Vec<AgentInfo> {
        let now = self.clock.now();
        let evicted = self.agents.purge_expired(now);
        if evicted > 0 {
            debug!(evicted, "Stale agents evicted");
        }
        let mut agents: Vec<AgentInfo> = self
            .agents
            .live_entries(now)
            .into_iter()
            .map(|(_, info)| info)
            .collect();
        agents.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        agents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfidgate_test_utils::ManualClock;
    use serde_json::json;

    #[test]
    fn test_ui_urls_forms() {
        assert_eq!(
            ui_urls(Some(&json!(["http://a:8787/", " ", "http://b"]))),
            vec!["http://a:8787", "http://b"]
        );
        assert_eq!(ui_urls(Some(&json!("[\"http://c/\"]"))), vec!["http://c"]);
        assert_eq!(ui_urls(Some(&json!("http://d/"))), vec!["http://d"]);
        let many: Vec<String> = (0..15).map(|i| format!("http://h{}", i)).collect();
        assert_eq!(ui_urls(Some(&json!(many))).len(), MAX_UI_URLS);
    }

    #[test]
    fn test_heartbeats_expire() {
        let clock = Arc::new(ManualClock::at_t0());
        let registry = AgentRegistry::new(clock.clone(), 60);

        let first = registry.register(
            RegisterRequest {
                device: Some("Packing PC #1".to_string()),
                ui_port: Some(json!("8787")),
                ..Default::default()
            },
            Some("10.0.0.5"),
        );
        assert_eq!(first.agent_id, "packing-pc-1");
        assert_eq!(first.ui_port, Some(8787));

        clock.advance_secs(30);
        registry.register(
            RegisterRequest {
                agent_id: Some("dock".to_string()),
                ..Default::default()
            },
            None,
        );
        let listed: Vec<String> = registry.list().into_iter().map(|a| a.agent_id).collect();
        assert_eq!(listed, vec!["dock", "packing-pc-1"]);

        clock.advance_secs(31);
        let listed: Vec<String> = registry.list().into_iter().map(|a| a.agent_id).collect();
        assert_eq!(listed, vec!["dock"]);
    }

    #[test]
    fn test_anonymous_agent_uses_device_placeholder() {
        let registry = AgentRegistry::new(Arc::new(ManualClock::at_t0()), 60);
        let info = registry.register(RegisterRequest::default(), None);
        assert_eq!(info.device, "unknown");
        assert_eq!(info.agent_id, "unknown");
    }
}
