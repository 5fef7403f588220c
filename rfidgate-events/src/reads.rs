//! Tag-read aggregation.
//!
//! Agents send one JSON object per read. Within a single ingest call, reads
//! of the same EPC on the same antenna collapse into one row whose `count`
//! is the sum of the individual counts.

use rfidgate_core::normalize::{normalize_antenna, normalize_count, normalize_epc, value_as_string};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One (EPC, antenna) row. Serialized with the field names agents and UIs
/// already use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct AggregatedRead {
    pub epc_id: String,
    pub mem_id: String,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<f64>))]
    pub rssi: Option<Value>,
    pub ant_id: u8,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<f64>))]
    pub phase_begin: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<f64>))]
    pub phase_end: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<f64>))]
    pub freq_khz: Option<Value>,
    pub dev_name: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadBatch {
    /// Raw entries handed in, including unusable ones.
    pub received: usize,
    /// Entries dropped for not being an object or having no EPC.
    pub skipped: usize,
    /// Aggregated rows in first-seen order.
    pub reads: Vec<AggregatedRead>,
}

impl ReadBatch {
    /// Antennas that saw each EPC, and its total read count.
    pub fn observations(&self) -> BTreeMap<String, (BTreeSet<u8>, i64)> {
        let mut out: BTreeMap<String, (BTreeSet<u8>, i64)> = BTreeMap::new();
        for read in &self.reads {
            let entry = out.entry(read.epc_id.clone()).or_default();
            if read.ant_id > 0 {
                entry.0.insert(read.ant_id);
            }
            entry.1 += read.count;
        }
        out
    }

    pub fn to_values(&self) -> Vec<Value> {
        self.reads
            .iter()
            .filter_map(|r| serde_json::to_value(r).ok())
            .collect()
    }
}

fn field<'a>(tag: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .find_map(|n| tag.get(*n).filter(|v| !v.is_null()))
}

/// Fold raw reads into one row per (EPC, antenna).
pub fn aggregate_reads(tags: &[Value], device: &str) -> ReadBatch {
    let mut batch = ReadBatch {
        received: tags.len(),
        ..Default::default()
    };
    let mut index: HashMap<(String, u8), usize> = HashMap::new();

    for tag in tags {
        if !tag.is_object() {
            batch.skipped += 1;
            continue;
        }
        let epc = field(tag, &["epcId", "EPC", "epc"])
            .and_then(value_as_string)
            .map(|s| normalize_epc(&s))
            .unwrap_or_default();
        if epc.is_empty() {
            batch.skipped += 1;
            continue;
        }
        let ant = normalize_antenna(field(tag, &["antId", "ANT", "ant"]));
        let count = normalize_count(field(tag, &["count", "reads", "readCount"]));
        let mem_id = field(tag, &["memId", "TID"])
            .and_then(value_as_string)
            .map(|s| normalize_epc(&s));
        let dev_name = field(tag, &["devName"]).and_then(value_as_string);

        match index.get(&(epc.clone(), ant)) {
            Some(&i) => {
                let row = &mut batch.reads[i];
                row.count += count;
                if let Some(mem_id) = mem_id {
                    row.mem_id = mem_id;
                }
                if let Some(v) = field(tag, &["rssi"]) {
                    row.rssi = Some(v.clone());
                }
                if let Some(v) = field(tag, &["phaseBegin"]) {
                    row.phase_begin = Some(v.clone());
                }
                if let Some(v) = field(tag, &["phaseEnd"]) {
                    row.phase_end = Some(v.clone());
                }
                if let Some(v) = field(tag, &["freqKhz"]) {
                    row.freq_khz = Some(v.clone());
                }
                if let Some(name) = dev_name {
                    row.dev_name = name;
                }
            }
            None => {
                index.insert((epc.clone(), ant), batch.reads.len());
                batch.reads.push(AggregatedRead {
                    epc_id: epc,
                    mem_id: mem_id.unwrap_or_default(),
                    rssi: field(tag, &["rssi"]).cloned(),
                    ant_id: ant,
                    phase_begin: field(tag, &["phaseBegin"]).cloned(),
                    phase_end: field(tag, &["phaseEnd"]).cloned(),
                    freq_khz: field(tag, &["freqKhz"]).cloned(),
                    dev_name: dev_name.unwrap_or_else(|| device.to_string()),
                    count,
                });
            }
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_same_epc_and_antenna_collapse() {
        let tags = vec![
            json!({"epcId": "aa-bb", "antId": 1, "rssi": -60}),
            json!({"epcId": "AABB", "antId": 1, "count": 3, "rssi": -55}),
            json!({"epcId": "AABB", "antId": 2}),
            json!({"epcId": "", "antId": 1}),
            json!("junk"),
        ];
        let batch = aggregate_reads(&tags, "dock-1");
        assert_eq!(batch.received, 5);
        assert_eq!(batch.skipped, 2);
        assert_eq!(batch.reads.len(), 2);
        assert_eq!(batch.reads[0].epc_id, "AABB");
        assert_eq!(batch.reads[0].count, 4);
        assert_eq!(batch.reads[0].rssi, Some(json!(-55)));
        assert_eq!(batch.reads[0].dev_name, "dock-1");
        assert_eq!(batch.reads[1].ant_id, 2);
    }

    #[test]
    fn test_invalid_antenna_becomes_zero() {
        let batch = aggregate_reads(&[json!({"EPC": "AA", "ANT": 99})], "d");
        assert_eq!(batch.reads[0].ant_id, 0);
        assert!(batch.observations()["AA"].0.is_empty());
    }

    #[test]
    fn test_observations_group_antennas() {
        let tags = vec![
            json!({"epcId": "AA", "antId": 3}),
            json!({"epcId": "AA", "antId": 1, "reads": 2}),
            json!({"epcId": "BB", "antId": 1}),
        ];
        let obs = aggregate_reads(&tags, "d").observations();
        assert_eq!(obs["AA"].0.iter().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(obs["AA"].1, 3);
        assert_eq!(obs["BB"].1, 1);
    }

    #[test]
    fn test_serialized_field_names() {
        let batch = aggregate_reads(&[json!({"epcId": "AA", "antId": 1, "TID": "e2"})], "d");
        let v = &batch.to_values()[0];
        assert_eq!(v["epcId"], "AA");
        assert_eq!(v["antId"], 1);
        assert_eq!(v["memId"], "E2");
        assert_eq!(v["devName"], "d");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_counts_are_preserved(
            reads in prop::collection::vec(("[0-9A-F]{2,6}", 0u8..4, 1i64..10), 0..40)
        ) {
            let tags: Vec<Value> = reads
                .iter()
                .map(|(epc, ant, count)| json!({"epcId": epc, "antId": ant, "count": count}))
                .collect();
            let batch = aggregate_reads(&tags, "d");
            let total: i64 = reads.iter().map(|r| r.2).sum();
            prop_assert_eq!(batch.reads.iter().map(|r| r.count).sum::<i64>(), total);
            let distinct: BTreeSet<(String, u8)> =
                reads.iter().map(|(e, a, _)| (e.clone(), *a)).collect();
            prop_assert_eq!(batch.reads.len(), distinct.len());
        }
    }
}
