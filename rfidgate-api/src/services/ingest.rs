//! Tag and scale ingestion.
//!
//! `ingest_tags` is the hot path for readers: it logs the call as an edge
//! event (when the agent sends an `event_id`), aggregates the reads, updates
//! the live caches and saved-tag tallies, broadcasts the batch and finally
//! hands the sightings to the fulfillment pipeline. Only validation and
//! event-log conflicts fail the call; everything after the event log is
//! best-effort and logged.

use super::live::LiveReadings;
use super::record_edge_outcome;
use crate::telemetry::with_metrics;
use rfidgate_core::normalize::{
    clean_text, normalize_batch_id, normalize_event_id, normalize_seq, normalize_unit,
    normalize_weight, value_as_bool, value_as_f64, MAX_DEVICE_LEN,
};
use rfidgate_core::{
    AntennaStat, Clock, RealtimeEvent, RealtimePublisher, RfidConfig, RfidResult, ScaleReading,
    ValidationError,
};
use rfidgate_events::{aggregate_reads, BatchOp, EdgeEventInput, EdgeEventLog, IngestOutcome};
use rfidgate_fulfillment::{FulfillmentPipeline, FulfillmentReport, FulfillmentRequest};
use rfidgate_storage::{RecordStore, SavedTagDelta};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_PORT_LEN: usize = 140;

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct IngestTagsRequest {
    pub device: Option<String>,
    #[serde(rename = "devName")]
    pub dev_name: Option<String>,
    /// Raw reads; a JSON-encoded string is accepted too.
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Vec<Object>>))]
    pub tags: Option<Value>,
    /// Agent timestamp in milliseconds.
    #[cfg_attr(feature = "openapi", schema(value_type = Option<i64>))]
    pub ts: Option<Value>,
    pub event_id: Option<String>,
    pub batch_id: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<i64>))]
    pub seq: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct IngestTagsResponse {
    pub ok: bool,
    pub duplicate: bool,
    pub received: usize,
    pub unique: usize,
    pub aggregated: usize,
    pub seen_before: i64,
    pub skipped: usize,
    pub dedup_by_ant: bool,
    pub dedup_ttl_sec: u64,
    pub published: bool,
    pub saved_updated: bool,
    pub saved_count: usize,
    /// Tags consumed by the fulfillment pipeline in this call.
    pub zebra_processed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfillment: Option<FulfillmentReport>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ScaleIngestRequest {
    pub device: Option<String>,
    #[serde(rename = "devName")]
    pub dev_name: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<f64>))]
    pub weight: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<f64>))]
    pub value: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<f64>))]
    pub kg: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<f64>))]
    pub qty: Option<Value>,
    pub unit: Option<String>,
    pub uom: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<bool>))]
    pub stable: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<bool>))]
    pub is_stable: Option<Value>,
    pub port: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<i64>))]
    pub ts: Option<Value>,
    pub event_id: Option<String>,
    pub batch_id: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<i64>))]
    pub seq: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ScaleIngestResponse {
    pub ok: bool,
    pub duplicate: bool,
    pub device: String,
    pub published: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ScaleWeightResponse {
    pub ok: bool,
    pub reading: Option<ScaleReading>,
}

// ============================================================================
// SERVICE
// ============================================================================

#[derive(Clone)]
pub struct IngestService {
    store: Arc<dyn RecordStore>,
    log: EdgeEventLog,
    pipeline: FulfillmentPipeline,
    live: LiveReadings,
    publisher: Arc<dyn RealtimePublisher>,
    clock: Arc<dyn Clock>,
    config: RfidConfig,
}

impl IngestService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        pipeline: FulfillmentPipeline,
        live: LiveReadings,
        publisher: Arc<dyn RealtimePublisher>,
        clock: Arc<dyn Clock>,
        config: RfidConfig,
    ) -> Self {
        Self {
            log: EdgeEventLog::new(store.clone(), clock.clone()),
            store,
            pipeline,
            live,
            publisher,
            clock,
            config,
        }
    }

    pub fn live(&self) -> &LiveReadings {
        &self.live
    }

    pub fn config(&self) -> &RfidConfig {
        &self.config
    }

    pub async fn ingest_tags(&self, request: IngestTagsRequest) -> RfidResult<IngestTagsResponse> {
        let device = device_name(request.device.as_deref(), request.dev_name.as_deref(), "unknown");
        let ts = request.ts.as_ref().and_then(value_as_f64).map(|v| v as i64);
        let event_id = request.event_id.as_deref().and_then(normalize_event_id);
        let batch_id = request.batch_id.as_deref().and_then(normalize_batch_id);
        let seq = normalize_seq(request.seq.as_ref());

        let mut tags = parse_tags(request.tags);
        tags.truncate(self.config.max_tags_per_ingest);

        if let Some(event_id) = &event_id {
            let input = EdgeEventInput {
                event_id: event_id.clone(),
                device_id: device.clone(),
                batch_id: batch_id.clone(),
                seq,
                event_type: "ingest_tags".to_string(),
                payload: json!({
                    "device": device,
                    "batch_id": batch_id,
                    "seq": seq,
                    "ts": ts,
                    "tags": tags,
                }),
            };
            if self.log_event("ingest_tags", input, &batch_id).await?.is_duplicate() {
                return Ok(IngestTagsResponse {
                    ok: true,
                    duplicate: true,
                    dedup_by_ant: self.config.dedup_by_ant,
                    dedup_ttl_sec: self.config.dedup_ttl_secs,
                    ..Default::default()
                });
            }
        }

        let now = self.clock.now();
        let batch = aggregate_reads(&tags, &device);

        let mut seen_before = 0;
        if self.config.dedup_by_ant {
            for read in batch.reads.iter().filter(|r| r.ant_id > 0) {
                if self.live.mark_seen(&device, read.ant_id, &read.epc_id, self.config.dedup_ttl_secs, now) {
                    seen_before += read.count;
                }
            }
        }

        self.live.record_antennas(
            &device,
            &batch.reads,
            ts.unwrap_or_else(|| self.clock.now_ms()),
            self.config.antenna_ttl_secs,
            now,
        );

        let observations = batch.observations();
        let deltas: Vec<SavedTagDelta> = observations
            .iter()
            .map(|(epc, (_, reads))| SavedTagDelta {
                epc: epc.clone(),
                reads: *reads,
            })
            .collect();
        let (saved_updated, saved_count) = if deltas.is_empty() {
            (true, 0)
        } else {
            match self.store.saved_tags_upsert(&deltas, &device, now).await {
                Ok(count) => (true, count),
                Err(e) => {
                    warn!(device_id = %device, error = %e, "Saved tag update failed");
                    (false, 0)
                }
            }
        };

        let published = match self.publisher.publish(RealtimeEvent::TagBatch {
            device: device.clone(),
            ts,
            tags: batch.to_values(),
        }) {
            Ok(_) => true,
            Err(e) => {
                warn!(device_id = %device, error = %e, "Tag batch broadcast failed");
                false
            }
        };

        let fulfillment = FulfillmentRequest {
            device: device.clone(),
            event_id: event_id.clone(),
            batch_id,
            seq,
            sightings: observations
                .into_iter()
                .map(|(epc, (ants, _))| (epc, ants))
                .collect(),
        };
        let report = match self.pipeline.process(&fulfillment).await {
            Ok(report) => {
                with_metrics(|m| m.record_fulfillment(&report));
                Some(report)
            }
            Err(e) => {
                warn!(device_id = %device, event_id = ?event_id, error = %e, "Fulfillment pass failed");
                None
            }
        };
        let zebra_processed = report.as_ref().map(|r| r.processed).unwrap_or(0);

        debug!(
            device_id = %device,
            event_id = ?event_id,
            received = batch.received,
            aggregated = batch.reads.len(),
            seen_before,
            zebra_processed,
            "Tags ingested"
        );

        Ok(IngestTagsResponse {
            ok: true,
            duplicate: false,
            received: batch.received,
            unique: unique_epcs(&batch.reads),
            aggregated: batch.reads.len(),
            seen_before,
            skipped: batch.skipped,
            dedup_by_ant: self.config.dedup_by_ant,
            dedup_ttl_sec: self.config.dedup_ttl_secs,
            published,
            saved_updated,
            saved_count,
            zebra_processed,
            fulfillment: report.filter(|r| !r.epcs.is_empty()),
        })
    }

    pub async fn ingest_scale(&self, request: ScaleIngestRequest) -> RfidResult<ScaleIngestResponse> {
        let device = device_name(request.device.as_deref(), request.dev_name.as_deref(), "scale");
        let weight = [&request.weight, &request.value, &request.kg, &request.qty]
            .into_iter()
            .find_map(|v| v.as_ref().filter(|v| !v.is_null()));
        let weight = normalize_weight(weight).ok_or_else(|| {
            ValidationError::invalid("weight", "missing or outside ±1000000")
        })?;
        let unit = normalize_unit(request.unit.as_deref().or(request.uom.as_deref()).unwrap_or(""));
        let stable = request
            .stable
            .as_ref()
            .or(request.is_stable.as_ref())
            .and_then(value_as_bool);
        let port = request
            .port
            .as_deref()
            .and_then(|p| clean_text(p, MAX_PORT_LEN))
            .unwrap_or_default();
        let ts = request
            .ts
            .as_ref()
            .and_then(value_as_f64)
            .map(|v| v as i64)
            .unwrap_or_else(|| self.clock.now_ms());

        let reading = ScaleReading {
            device: device.clone(),
            weight,
            unit,
            stable,
            port,
            ts,
        };

        let event_id = request.event_id.as_deref().and_then(normalize_event_id);
        if let Some(event_id) = event_id {
            let batch_id = request.batch_id.as_deref().and_then(normalize_batch_id);
            let seq = normalize_seq(request.seq.as_ref());
            let mut payload = serde_json::to_value(&reading).unwrap_or_default();
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("batch_id".to_string(), json!(batch_id));
                obj.insert("seq".to_string(), json!(seq));
            }
            let input = EdgeEventInput {
                event_id,
                device_id: device.clone(),
                batch_id: batch_id.clone(),
                seq,
                event_type: "ingest_scale_weight".to_string(),
                payload,
            };
            if self.log_event("ingest_scale_weight", input, &batch_id).await?.is_duplicate() {
                return Ok(ScaleIngestResponse {
                    ok: true,
                    duplicate: true,
                    device,
                    published: false,
                });
            }
        }

        self.live
            .store_scale(&reading, self.config.scale_ttl_secs, self.clock.now());

        let published = match self.publisher.publish(RealtimeEvent::ScaleWeight { reading }) {
            Ok(_) => true,
            Err(e) => {
                warn!(device_id = %device, error = %e, "Scale weight broadcast failed");
                false
            }
        };

        Ok(ScaleIngestResponse {
            ok: true,
            duplicate: false,
            device,
            published,
        })
    }

    pub fn scale_weight(&self, device: Option<&str>) -> ScaleWeightResponse {
        let reading = self.live.scale(device, self.clock.now());
        ScaleWeightResponse {
            ok: reading.is_some(),
            reading,
        }
    }

    pub fn antenna_stats(&self) -> Vec<AntennaStat> {
        self.live.antenna_stats(self.clock.now())
    }

    async fn log_event(
        &self,
        op: &str,
        input: EdgeEventInput,
        batch_id: &Option<String>,
    ) -> RfidResult<IngestOutcome> {
        let event_id = input.event_id.clone();
        let result = self
            .log
            .ingest(
                input,
                &BatchOp::Ingest {
                    batch_id: batch_id.clone(),
                },
            )
            .await;
        record_edge_outcome(op, result.as_ref().map(IngestOutcome::is_duplicate));
        if let Ok(IngestOutcome::Duplicate { .. }) = &result {
            info!(event_id = %event_id, op, "Duplicate ingest ignored");
        }
        result
    }
}

fn device_name(device: Option<&str>, dev_name: Option<&str>, fallback: &str) -> String {
    device
        .and_then(|d| clean_text(d, MAX_DEVICE_LEN))
        .or_else(|| dev_name.and_then(|d| clean_text(d, MAX_DEVICE_LEN)))
        .unwrap_or_else(|| fallback.to_string())
}

fn parse_tags(raw: Option<Value>) -> Vec<Value> {
    match raw {
        Some(Value::Array(tags)) => tags,
        Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Array(tags)) => tags,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn unique_epcs(reads: &[rfidgate_events::AggregatedRead]) -> usize {
    reads
        .iter()
        .map(|r| r.epc_id.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfidgate_core::TagStatus;
    use rfidgate_fulfillment::{ClaimRegistry, DocumentService};
    use rfidgate_storage::InMemoryStore;
    use rfidgate_test_utils::{fixtures, ManualClock, RecordingPublisher};

    struct Harness {
        store: Arc<InMemoryStore>,
        publisher: Arc<RecordingPublisher>,
        clock: Arc<ManualClock>,
        service: IngestService,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::at_t0());
        let publisher = Arc::new(RecordingPublisher::new());
        let config = RfidConfig::default();
        let catalog = Arc::new(fixtures::seeded_catalog());
        let ledger = Arc::new(rfidgate_storage::InMemoryLedger::new());
        let claims = ClaimRegistry::new(store.clone(), clock.clone(), config.stale_claim_secs);
        let documents = DocumentService::new(catalog, ledger, claims, clock.clone());
        let pipeline = FulfillmentPipeline::new(store.clone(), documents, clock.clone(), config.clone());
        let service = IngestService::new(
            store.clone(),
            pipeline,
            LiveReadings::new(),
            publisher.clone(),
            clock.clone(),
            config,
        );
        Harness {
            store,
            publisher,
            clock,
            service,
        }
    }

    fn tags_request(event_id: Option<&str>, seq: Option<i64>, tags: Value) -> IngestTagsRequest {
        IngestTagsRequest {
            device: Some(fixtures::DEVICE.to_string()),
            tags: Some(tags),
            event_id: event_id.map(str::to_string),
            batch_id: Some("B1".to_string()),
            seq: seq.map(|s| json!(s)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ingest_aggregates_and_counts() {
        let h = harness();
        let tags = json!([
            { "epcId": "5a42-aa", "antId": 1, "count": 2 },
            { "epc": "5A42AA", "ant": 1 },
            { "EPC": "5A42BB", "ANT": 2 },
            "garbage",
            { "rssi": -40 }
        ]);
        let resp = h.service.ingest_tags(tags_request(None, None, tags)).await.unwrap();

        assert!(resp.ok && !resp.duplicate);
        assert_eq!(resp.received, 5);
        assert_eq!(resp.skipped, 2);
        assert_eq!(resp.aggregated, 2);
        assert_eq!(resp.unique, 2);
        assert_eq!(resp.seen_before, 0);
        assert!(resp.published);
        assert!(resp.saved_updated);
        assert_eq!(resp.saved_count, 2);
        assert_eq!(h.publisher.count_of("tag_batch"), 1);
    }

    #[tokio::test]
    async fn test_seen_before_counts_repeat_sightings() {
        let h = harness();
        let tags = json!([{ "epc": "5A42AA", "ant": 1, "count": 3 }, { "epc": "5A42BB", "ant": 0 }]);
        h.service.ingest_tags(tags_request(None, None, tags.clone())).await.unwrap();
        let resp = h.service.ingest_tags(tags_request(None, None, tags)).await.unwrap();
        // Antenna 0 never counts as seen before.
        assert_eq!(resp.seen_before, 3);
    }

    #[tokio::test]
    async fn test_duplicate_event_has_no_side_effects() {
        let h = harness();
        let tags = json!([{ "epc": "5A42AA", "ant": 1 }]);
        h.service
            .ingest_tags(tags_request(Some("e1"), Some(1), tags.clone()))
            .await
            .unwrap();
        let resp = h
            .service
            .ingest_tags(tags_request(Some("e1"), Some(1), tags))
            .await
            .unwrap();

        assert!(resp.duplicate);
        assert_eq!(resp.received, 0);
        assert_eq!(resp.saved_count, 0);
        assert!(!resp.published);
        assert_eq!(h.publisher.count_of("tag_batch"), 1);
        assert_eq!(h.store.edge_event_count(), 1);
    }

    #[tokio::test]
    async fn test_seq_regression_is_a_conflict() {
        let h = harness();
        let tags = json!([{ "epc": "5A42AA", "ant": 1 }]);
        h.service
            .ingest_tags(tags_request(Some("e1"), Some(5), tags.clone()))
            .await
            .unwrap();
        let result = h
            .service
            .ingest_tags(tags_request(Some("e2"), Some(4), tags))
            .await;
        rfidgate_test_utils::assertions::assert_conflict(
            &result,
            rfidgate_core::ConflictCode::SeqRegression,
        );
    }

    #[tokio::test]
    async fn test_ingest_consumes_printed_tag() {
        let h = harness();
        h.store
            .tag_insert(&fixtures::printed_tag("5A42C0FFEE", 1))
            .await
            .unwrap();

        let tags = json!([{ "epc": "5A42C0FFEE", "ant": 1 }]);
        let resp = h
            .service
            .ingest_tags(tags_request(Some("e1"), Some(1), tags))
            .await
            .unwrap();
        assert_eq!(resp.zebra_processed, 1);

        let tag = h.store.tag_get("5A42C0FFEE").await.unwrap().unwrap();
        assert_eq!(tag.status, TagStatus::Consumed);
        assert!(tag.owner_stock_doc.is_some());
    }

    #[tokio::test]
    async fn test_tags_may_arrive_as_json_string() {
        let h = harness();
        let tags = Value::String(r#"[{"epc":"5A42AA","ant":3}]"#.to_string());
        let resp = h.service.ingest_tags(tags_request(None, None, tags)).await.unwrap();
        assert_eq!(resp.aggregated, 1);
        assert_eq!(h.service.live().antenna_stats(h.clock.now()).len(), 1);
    }

    #[tokio::test]
    async fn test_scale_requires_weight() {
        let h = harness();
        let result = h
            .service
            .ingest_scale(ScaleIngestRequest {
                device: Some("scale-1".to_string()),
                weight: Some(json!("heavy")),
                ..Default::default()
            })
            .await;
        rfidgate_test_utils::assertions::assert_validation_error(&result);

        let result = h
            .service
            .ingest_scale(ScaleIngestRequest {
                kg: Some(json!(2_000_000)),
                ..Default::default()
            })
            .await;
        rfidgate_test_utils::assertions::assert_validation_error(&result);
    }

    #[tokio::test]
    async fn test_scale_reading_cached_and_published() {
        let h = harness();
        let resp = h
            .service
            .ingest_scale(ScaleIngestRequest {
                dev_name: Some("Scale A".to_string()),
                value: Some(json!("12.5")),
                uom: Some("KGS".to_string()),
                is_stable: Some(json!("yes")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resp.device, "Scale A");
        assert!(resp.published);

        let weight = h.service.scale_weight(Some("scale-a"));
        assert!(weight.ok);
        let reading = weight.reading.unwrap();
        assert_eq!(reading.weight, 12.5);
        assert_eq!(reading.unit, "kg");
        assert_eq!(reading.stable, Some(true));
        assert_eq!(reading.ts, h.clock.now_ms());
        assert_eq!(h.publisher.count_of("scale_weight"), 1);

        h.clock.advance_secs(301);
        assert!(!h.service.scale_weight(None).ok);
    }
}
