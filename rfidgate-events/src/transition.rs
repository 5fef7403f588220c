//! Batch state transitions driven by accepted edge events.

use rfidgate_core::{BatchState, BatchStatus, ConflictCode, ConflictError, Timestamp};
use serde_json::Value;

/// What an edge event does to its device's batch state.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Open (or reopen) a batch. May reset the seq baseline.
    Start {
        batch_id: String,
        product: Option<String>,
        config: Option<Value>,
    },
    Stop {
        batch_id: String,
    },
    /// Stage a product change; it only lands in `pending_product`.
    ProductSwitch {
        batch_id: String,
        product: String,
    },
    /// Free-form heartbeat. May reset the seq baseline.
    DeviceStatus {
        status: Option<BatchStatus>,
        batch_id: Option<String>,
        current_product: Option<String>,
        pending_product: Option<String>,
        pause_reason: Option<String>,
    },
    Report {
        batch_id: String,
        product: Option<String>,
    },
    /// Tag or scale ingest. Strict seq continuation, batch left untouched.
    Ingest {
        batch_id: Option<String>,
    },
}

impl BatchOp {
    pub fn name(&self) -> &'static str {
        match self {
            BatchOp::Start { .. } => "batch_start",
            BatchOp::Stop { .. } => "batch_stop",
            BatchOp::ProductSwitch { .. } => "product_switch",
            BatchOp::DeviceStatus { .. } => "device_status",
            BatchOp::Report { .. } => "event_report",
            BatchOp::Ingest { .. } => "ingest",
        }
    }

    pub fn batch_id(&self) -> Option<&str> {
        match self {
            BatchOp::Start { batch_id, .. }
            | BatchOp::Stop { batch_id }
            | BatchOp::ProductSwitch { batch_id, .. }
            | BatchOp::Report { batch_id, .. } => Some(batch_id),
            BatchOp::DeviceStatus { batch_id, .. } | BatchOp::Ingest { batch_id } => {
                batch_id.as_deref()
            }
        }
    }

    pub fn allows_reset(&self) -> bool {
        matches!(self, BatchOp::Start { .. } | BatchOp::DeviceStatus { .. })
    }

    /// True when this op opens a batch other than the device's current one.
    pub fn resets(&self, state: &BatchState) -> bool {
        self.allows_reset()
            && self
                .batch_id()
                .is_some_and(|b| state.current_batch_id.as_deref() != Some(b))
    }

    /// Batch and product agreement with the current state.
    pub fn guard(&self, state: &BatchState) -> Result<(), ConflictError> {
        let must_match_batch = matches!(
            self,
            BatchOp::Stop { .. } | BatchOp::ProductSwitch { .. } | BatchOp::Report { .. }
        );
        if must_match_batch {
            if let (Some(current), Some(given)) = (state.current_batch_id.as_deref(), self.batch_id())
            {
                if current != given {
                    return Err(ConflictError::new(
                        ConflictCode::BatchMismatch,
                        format!("Batch mismatch: current {}, got {}", current, given),
                    ));
                }
            }
        }
        if let BatchOp::Report {
            product: Some(product),
            ..
        } = self
        {
            if let Some(current) = state.current_product.as_deref() {
                if current != product {
                    return Err(ConflictError::new(
                        ConflictCode::ProductMismatch,
                        format!("Product mismatch: current {}, got {}", current, product),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Highest seq already consumed for the batch this op targets.
    pub fn baseline_seq(&self, state: &BatchState) -> i64 {
        if self.resets(state) {
            -1
        } else {
            state.last_event_seq
        }
    }

    pub fn check_seq(&self, state: &BatchState, seq: Option<i64>) -> Result<(), ConflictError> {
        let Some(seq) = seq else {
            return Ok(());
        };
        let last = self.baseline_seq(state);
        if seq <= last {
            return Err(ConflictError::new(
                ConflictCode::SeqRegression,
                format!("Event seq regression: {} <= {}", seq, last),
            ));
        }
        Ok(())
    }

    /// Apply the transition. Callers run [`BatchOp::guard`] and
    /// [`BatchOp::check_seq`] first.
    pub fn apply(&self, state: &mut BatchState, seq: Option<i64>, now: Timestamp) {
        if self.resets(state) {
            state.last_event_seq = -1;
        }
        match self {
            BatchOp::Start {
                batch_id,
                product,
                config,
            } => {
                state.status = BatchStatus::Running;
                state.current_batch_id = Some(batch_id.clone());
                state.pause_reason = None;
                if let Some(product) = product {
                    state.current_product = Some(product.clone());
                    state.pending_product = None;
                }
                state.config = config.clone().filter(|c| !is_empty_object(c));
            }
            BatchOp::Stop { .. } => {
                state.status = BatchStatus::Stopped;
                state.current_batch_id = None;
                state.current_product = None;
                state.pending_product = None;
                state.pause_reason = None;
            }
            BatchOp::ProductSwitch { product, .. } => {
                state.pending_product = Some(product.clone());
            }
            BatchOp::DeviceStatus {
                status,
                batch_id,
                current_product,
                pending_product,
                pause_reason,
            } => {
                if let Some(status) = status {
                    state.status = *status;
                }
                if let Some(batch_id) = batch_id {
                    state.current_batch_id = Some(batch_id.clone());
                }
                if let Some(product) = current_product {
                    state.current_product = Some(product.clone());
                }
                if let Some(product) = pending_product {
                    state.pending_product = Some(product.clone());
                }
                if let Some(reason) = pause_reason {
                    state.pause_reason = Some(reason.clone());
                }
            }
            BatchOp::Report { .. } | BatchOp::Ingest { .. } => {}
        }
        if let Some(seq) = seq {
            state.last_event_seq = seq;
        }
        state.last_seen_at = Some(now);
    }
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(|o| o.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn running(batch: &str, last_seq: i64) -> BatchState {
        BatchState {
            status: BatchStatus::Running,
            current_batch_id: Some(batch.to_string()),
            last_event_seq: last_seq,
            ..BatchState::new("dock-1")
        }
    }

    fn start(batch: &str) -> BatchOp {
        BatchOp::Start {
            batch_id: batch.to_string(),
            product: None,
            config: None,
        }
    }

    #[test]
    fn test_start_resets_baseline_for_new_batch() {
        let state = running("b1", 9);
        assert_eq!(start("b2").baseline_seq(&state), -1);
        assert_eq!(start("b1").baseline_seq(&state), 9);
        assert!(start("b2").check_seq(&state, Some(0)).is_ok());
        let err = start("b1").check_seq(&state, Some(9)).unwrap_err();
        assert_eq!(err.code, ConflictCode::SeqRegression);
    }

    #[test]
    fn test_start_after_stop_resets() {
        let mut state = running("b1", 9);
        BatchOp::Stop {
            batch_id: "b1".to_string(),
        }
        .apply(&mut state, Some(10), now());
        assert_eq!(state.current_batch_id, None);
        assert_eq!(state.last_event_seq, 10);
        assert!(start("b2").check_seq(&state, Some(0)).is_ok());
    }

    #[test]
    fn test_strict_ops_never_reset() {
        let state = running("b1", 4);
        let report = BatchOp::Report {
            batch_id: "b1".to_string(),
            product: None,
        };
        assert!(report.check_seq(&state, Some(4)).is_err());
        let ingest = BatchOp::Ingest {
            batch_id: Some("b9".to_string()),
        };
        assert!(!ingest.resets(&state));
        assert!(ingest.check_seq(&state, Some(3)).is_err());
        assert!(ingest.check_seq(&state, None).is_ok());
    }

    #[test]
    fn test_batch_mismatch() {
        let state = running("b1", 4);
        let stop = BatchOp::Stop {
            batch_id: "b2".to_string(),
        };
        assert_eq!(stop.guard(&state).unwrap_err().code, ConflictCode::BatchMismatch);

        let idle = BatchState::new("dock-1");
        assert!(stop.guard(&idle).is_ok());
    }

    #[test]
    fn test_product_mismatch_only_when_current_known() {
        let mut state = running("b1", 4);
        let report = BatchOp::Report {
            batch_id: "b1".to_string(),
            product: Some("P2".to_string()),
        };
        assert!(report.guard(&state).is_ok());
        state.current_product = Some("P1".to_string());
        assert_eq!(
            report.guard(&state).unwrap_err().code,
            ConflictCode::ProductMismatch
        );
    }

    #[test]
    fn test_start_sets_running_and_product() {
        let mut state = BatchState::new("dock-1");
        state.pending_product = Some("OLD".to_string());
        state.pause_reason = Some("jam".to_string());
        BatchOp::Start {
            batch_id: "b1".to_string(),
            product: Some("P1".to_string()),
            config: Some(json!({"line": 2})),
        }
        .apply(&mut state, Some(0), now());
        assert_eq!(state.status, BatchStatus::Running);
        assert_eq!(state.current_batch_id.as_deref(), Some("b1"));
        assert_eq!(state.current_product.as_deref(), Some("P1"));
        assert_eq!(state.pending_product, None);
        assert_eq!(state.pause_reason, None);
        assert_eq!(state.config, Some(json!({"line": 2})));
        assert_eq!(state.last_event_seq, 0);
        assert_eq!(state.last_seen_at, Some(now()));
    }

    #[test]
    fn test_product_switch_is_staged() {
        let mut state = running("b1", 1);
        state.current_product = Some("P1".to_string());
        BatchOp::ProductSwitch {
            batch_id: "b1".to_string(),
            product: "P2".to_string(),
        }
        .apply(&mut state, Some(2), now());
        assert_eq!(state.current_product.as_deref(), Some("P1"));
        assert_eq!(state.pending_product.as_deref(), Some("P2"));
    }

    #[test]
    fn test_device_status_batch_change_without_seq_clears_baseline() {
        let mut state = running("b1", 7);
        BatchOp::DeviceStatus {
            status: Some(BatchStatus::Paused),
            batch_id: Some("b2".to_string()),
            current_product: None,
            pending_product: None,
            pause_reason: Some("jam".to_string()),
        }
        .apply(&mut state, None, now());
        assert_eq!(state.status, BatchStatus::Paused);
        assert_eq!(state.current_batch_id.as_deref(), Some("b2"));
        assert_eq!(state.last_event_seq, -1);
        assert_eq!(state.pause_reason.as_deref(), Some("jam"));
    }
}
