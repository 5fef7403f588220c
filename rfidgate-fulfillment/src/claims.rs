//! Idempotency claim registry.
//!
//! A claim is a row keyed by `"{kind}:{raw_key}"` that asserts ownership of
//! one document creation. The insert is the race: whoever inserts first owns
//! the key. Losers branch on the stored record instead of catching errors.

use rfidgate_core::normalize::{
    claim_key, truncate_chars, MAX_EPC_LEN, MAX_ERROR_LEN, MAX_RAW_KEY_LEN,
};
use rfidgate_core::{
    Clock, ClaimStatus, DocumentKind, FulfillmentError, IdempotencyClaim, RfidError, RfidResult,
    StorageError,
};
use rfidgate_storage::RecordStore;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a claim attempt found.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This caller owns the key: freshly inserted or taken over from a stale
    /// holder. It must create the document and finish the claim.
    Acquired { claim: IdempotencyClaim },
    /// A previous attempt finished and produced `owner`. Reuse it.
    Owned {
        claim: IdempotencyClaim,
        owner: String,
    },
    /// Another attempt holds a fresh claim.
    InProgress { claim: IdempotencyClaim },
    /// A previous attempt failed. Not retried automatically.
    Failed { claim: IdempotencyClaim },
}

impl ClaimOutcome {
    pub fn created(&self) -> bool {
        matches!(self, ClaimOutcome::Acquired { .. })
    }

    pub fn record(&self) -> &IdempotencyClaim {
        match self {
            ClaimOutcome::Acquired { claim }
            | ClaimOutcome::Owned { claim, .. }
            | ClaimOutcome::InProgress { claim }
            | ClaimOutcome::Failed { claim } => claim,
        }
    }
}

/// Document name returned by [`ClaimRegistry::create_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedDocument {
    pub name: String,
    /// False when an earlier claim's document was reused.
    pub created: bool,
}

impl ClaimedDocument {
    fn fresh(name: String) -> Self {
        Self {
            name,
            created: true,
        }
    }
}

/// Input to a claim attempt.
#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest<'a> {
    pub raw_key: &'a str,
    pub kind: DocumentKind,
    pub payload_hash: &'a str,
    pub epc: Option<&'a str>,
}

#[derive(Clone)]
pub struct ClaimRegistry {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    stale_claim_secs: u64,
}

impl ClaimRegistry {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, stale_claim_secs: u64) -> Self {
        Self {
            store,
            clock,
            stale_claim_secs,
        }
    }

    /// Try to own `"{kind}:{raw_key}"`. Returns `None` for a blank key, in
    /// which case no claim is tracked at all.
    pub async fn claim(&self, request: ClaimRequest<'_>) -> RfidResult<Option<ClaimOutcome>> {
        let kind = request.kind.claim_kind();
        let Some(key) = claim_key(kind, request.raw_key) else {
            return Ok(None);
        };
        let now = self.clock.now();
        let fresh = IdempotencyClaim {
            key: key.clone(),
            raw_key: truncate_chars(request.raw_key.trim(), MAX_RAW_KEY_LEN),
            kind: kind.to_string(),
            status: ClaimStatus::Claimed,
            owner_doc_type: None,
            owner_doc_name: None,
            payload_hash: request.payload_hash.to_string(),
            epc: request.epc.map(|e| truncate_chars(e, MAX_EPC_LEN)),
            claimed_at: now,
            created_at: now,
            last_error: None,
        };

        match self.store.claim_insert(&fresh).await {
            Ok(()) => {
                debug!(claim_key = %key, "Claim acquired");
                return Ok(Some(ClaimOutcome::Acquired { claim: fresh }));
            }
            Err(RfidError::Storage(StorageError::DuplicateKey { .. })) => {}
            Err(e) => return Err(e),
        }

        let Some(existing) = self.store.claim_get(&key).await? else {
            // Released between our insert and read. Treat as contended.
            return Ok(Some(ClaimOutcome::InProgress { claim: fresh }));
        };

        let outcome = match existing.status {
            ClaimStatus::Done => match existing.owner().map(str::to_string) {
                Some(owner) => ClaimOutcome::Owned {
                    claim: existing,
                    owner,
                },
                None => {
                    warn!(claim_key = %key, "Claim finished without an owner document");
                    ClaimOutcome::InProgress { claim: existing }
                }
            },
            ClaimStatus::Failed => ClaimOutcome::Failed { claim: existing },
            ClaimStatus::Claimed => {
                if existing.age_secs(now) >= self.stale_claim_secs as i64
                    && self
                        .store
                        .claim_take_over(&key, existing.claimed_at, now)
                        .await?
                {
                    info!(
                        claim_key = %key,
                        age_secs = existing.age_secs(now),
                        "Took over stale claim"
                    );
                    ClaimOutcome::Acquired {
                        claim: IdempotencyClaim {
                            claimed_at: now,
                            last_error: None,
                            ..existing
                        },
                    }
                } else {
                    ClaimOutcome::InProgress { claim: existing }
                }
            }
        };
        Ok(Some(outcome))
    }

    /// Record the terminal state of an acquired claim.
    pub async fn finish(
        &self,
        claim: &IdempotencyClaim,
        kind: DocumentKind,
        result: Result<&str, &str>,
    ) -> RfidResult<()> {
        match result {
            Ok(owner) => {
                self.store
                    .claim_finish(&claim.key, ClaimStatus::Done, kind, Some(owner), None)
                    .await
            }
            Err(error) => {
                let error = truncate_chars(error, MAX_ERROR_LEN);
                self.store
                    .claim_finish(&claim.key, ClaimStatus::Failed, kind, None, Some(&error))
                    .await
            }
        }
    }

    /// Drop a Failed claim so the key can be claimed again.
    pub async fn release_failed(&self, kind: DocumentKind, raw_key: &str) -> RfidResult<bool> {
        match claim_key(kind.claim_kind(), raw_key) {
            Some(key) => self.store.claim_release_failed(&key).await,
            None => Ok(false),
        }
    }

    /// Run `create` at most once per key and return the owning document name,
    /// flagged with whether this call created it.
    ///
    /// Without a key, `create` runs unguarded. A key held elsewhere yields
    /// `ClaimInProgress`; a key whose creation failed yields `ClaimFailed`.
    pub async fn create_once<F, Fut>(
        &self,
        request: Option<ClaimRequest<'_>>,
        create: F,
    ) -> RfidResult<ClaimedDocument>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RfidResult<String>>,
    {
        let Some(request) = request else {
            return create().await.map(ClaimedDocument::fresh);
        };
        let Some(outcome) = self.claim(request).await? else {
            return create().await.map(ClaimedDocument::fresh);
        };
        let kind = request.kind;

        match outcome {
            ClaimOutcome::Acquired { claim } => match create().await {
                Ok(name) => {
                    self.finish(&claim, kind, Ok(&name)).await?;
                    Ok(ClaimedDocument::fresh(name))
                }
                Err(e) => {
                    let message = e.to_string();
                    if let Err(finish_err) = self.finish(&claim, kind, Err(&message)).await {
                        warn!(claim_key = %claim.key, error = %finish_err, "Failed to record claim failure");
                    }
                    Err(e)
                }
            },
            ClaimOutcome::Owned { owner, claim } => {
                debug!(claim_key = %claim.key, owner = %owner, "Reusing document from earlier claim");
                Ok(ClaimedDocument {
                    name: owner,
                    created: false,
                })
            }
            ClaimOutcome::InProgress { claim } => {
                Err(FulfillmentError::ClaimInProgress { key: claim.key }.into())
            }
            ClaimOutcome::Failed { claim } => Err(FulfillmentError::ClaimFailed {
                reason: claim.last_error.clone().unwrap_or_default(),
                key: claim.key,
            }
            .into()),
        }
    }
}
