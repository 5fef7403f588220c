//! Short-lived live data: seen-before markers, per-antenna statistics and
//! the latest scale readings. Everything here expires on its own TTL and is
//! lost on restart.

use rfidgate_core::normalize::sanitize_agent_id;
use rfidgate_core::{AntennaStat, ScaleReading, Timestamp};
use rfidgate_events::AggregatedRead;
use rfidgate_storage::ExpiringMap;
use std::collections::BTreeMap;

/// Cache key for the most recent reading of any scale.
pub const LAST_SCALE_KEY: &str = "last";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct AntennaTally {
    reads: i64,
    last_seen: i64,
}

#[derive(Debug, Clone, Default)]
struct DeviceAntennas {
    device: String,
    ants: BTreeMap<u8, AntennaTally>,
}

#[derive(Clone, Default)]
pub struct LiveReadings {
    seen: ExpiringMap<()>,
    antennas: ExpiringMap<DeviceAntennas>,
    scales: ExpiringMap<ScaleReading>,
}

impl LiveReadings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark (device, antenna, EPC) as seen. Returns true when it was already
    /// seen within `ttl_secs`; every sighting pushes the expiry out again.
    pub fn mark_seen(&self, device: &str, ant: u8, epc: &str, ttl_secs: u64, now: Timestamp) -> bool {
        let device_key = non_empty_or(sanitize_agent_id(device), device);
        let key = format!("{}:{}:{}", device_key, ant, epc);
        self.seen.check_and_mark(key, (), ttl_secs, now)
    }

    /// Add read counts for antennas 1..=31 of one device.
    pub fn record_antennas(
        &self,
        device: &str,
        reads: &[AggregatedRead],
        ts_ms: i64,
        ttl_secs: u64,
        now: Timestamp,
    ) {
        if !reads.iter().any(|r| r.ant_id > 0) {
            return;
        }
        let device_key = non_empty_or(sanitize_agent_id(device), "unknown");
        self.antennas.upsert_with(device_key, ttl_secs, now, |live| {
            let mut entry = live.unwrap_or_default();
            entry.device = device.to_string();
            for read in reads.iter().filter(|r| r.ant_id > 0) {
                let tally = entry.ants.entry(read.ant_id).or_default();
                tally.reads += read.count;
                tally.last_seen = ts_ms;
            }
            entry
        });
    }

    /// Live antenna statistics sorted by (device, antenna). Expired devices
    /// are evicted.
    pub fn antenna_stats(&self, now: Timestamp) -> Vec<AntennaStat> {
        self.antennas.purge_expired(now);
        let mut stats: Vec<AntennaStat> = self
            .antennas
            .live_entries(now)
            .into_iter()
            .flat_map(|(device_key, entry)| {
                let device = if entry.device.is_empty() {
                    device_key.clone()
                } else {
                    entry.device.clone()
                };
                entry
                    .ants
                    .into_iter()
                    .map(move |(ant_id, tally)| AntennaStat {
                        device: device.clone(),
                        device_key: device_key.clone(),
                        ant_id,
                        reads: tally.reads,
                        last_seen: tally.last_seen,
                    })
            })
            .collect();
        stats.sort_by(|a, b| (&a.device, a.ant_id).cmp(&(&b.device, b.ant_id)));
        stats
    }

    /// Cache a reading under its device key and as the last reading.
    pub fn store_scale(&self, reading: &ScaleReading, ttl_secs: u64, now: Timestamp) {
        let device_key = non_empty_or(sanitize_agent_id(&reading.device), "scale");
        self.scales.insert(device_key, reading.clone(), ttl_secs, now);
        self.scales
            .insert(LAST_SCALE_KEY, reading.clone(), ttl_secs, now);
    }

    /// Reading for `device`, falling back to the last reading of any scale.
    pub fn scale(&self, device: Option<&str>, now: Timestamp) -> Option<ScaleReading> {
        device
            .map(sanitize_agent_id)
            .filter(|k| !k.is_empty())
            .and_then(|k| self.scales.get(&k, now))
            .or_else(|| self.scales.get(LAST_SCALE_KEY, now))
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn read(epc: &str, ant: u8, count: i64) -> AggregatedRead {
        AggregatedRead {
            epc_id: epc.to_string(),
            mem_id: String::new(),
            rssi: None,
            ant_id: ant,
            phase_begin: None,
            phase_end: None,
            freq_khz: None,
            dev_name: "Dock 1".to_string(),
            count,
        }
    }

    fn reading(device: &str, weight: f64) -> ScaleReading {
        ScaleReading {
            device: device.to_string(),
            weight,
            unit: "kg".to_string(),
            stable: Some(true),
            port: "/dev/ttyUSB0".to_string(),
            ts: 1,
        }
    }

    #[test]
    fn test_seen_before_is_per_device_and_antenna() {
        let live = LiveReadings::new();
        assert!(!live.mark_seen("Dock 1", 1, "5A42AA", 60, t0()));
        assert!(live.mark_seen("dock-1", 1, "5A42AA", 60, t0()));
        assert!(!live.mark_seen("dock-1", 2, "5A42AA", 60, t0()));
        assert!(!live.mark_seen("dock-2", 1, "5A42AA", 60, t0()));
    }

    #[test]
    fn test_seen_before_slides_with_each_sighting() {
        let live = LiveReadings::new();
        live.mark_seen("dock-1", 1, "5A42AA", 60, t0());
        assert!(live.mark_seen("dock-1", 1, "5A42AA", 60, t0() + Duration::seconds(50)));
        assert!(live.mark_seen("dock-1", 1, "5A42AA", 60, t0() + Duration::seconds(100)));
        assert!(!live.mark_seen("dock-1", 1, "5A42AA", 60, t0() + Duration::seconds(200)));
    }

    #[test]
    fn test_antenna_stats_accumulate_and_sort() {
        let live = LiveReadings::new();
        live.record_antennas("dock-2", &[read("AA", 1, 1)], 10, 600, t0());
        live.record_antennas(
            "dock-1",
            &[read("AA", 2, 3), read("BB", 1, 1), read("CC", 0, 9)],
            20,
            600,
            t0(),
        );
        live.record_antennas("dock-1", &[read("AA", 2, 2)], 30, 600, t0());

        let stats = live.antenna_stats(t0());
        let rows: Vec<(&str, u8, i64, i64)> = stats
            .iter()
            .map(|s| (s.device.as_str(), s.ant_id, s.reads, s.last_seen))
            .collect();
        assert_eq!(
            rows,
            vec![("dock-1", 1, 1, 20), ("dock-1", 2, 5, 30), ("dock-2", 1, 1, 10)]
        );
    }

    #[test]
    fn test_antenna_stats_expire() {
        let live = LiveReadings::new();
        live.record_antennas("dock-1", &[read("AA", 1, 1)], 10, 30, t0());
        assert_eq!(live.antenna_stats(t0() + Duration::seconds(29)).len(), 1);
        assert!(live.antenna_stats(t0() + Duration::seconds(31)).is_empty());
    }

    #[test]
    fn test_scale_falls_back_to_last() {
        let live = LiveReadings::new();
        live.store_scale(&reading("Scale A", 1.5), 300, t0());
        live.store_scale(&reading("scale-b", 2.5), 300, t0());

        assert_eq!(live.scale(Some("scale a"), t0()).map(|r| r.weight), Some(1.5));
        assert_eq!(live.scale(Some("unknown"), t0()).map(|r| r.weight), Some(2.5));
        assert_eq!(live.scale(None, t0()).map(|r| r.weight), Some(2.5));
        assert_eq!(live.scale(None, t0() + Duration::seconds(301)), None);
    }
}
