//! Shared application state for Axum routers.

use std::sync::Arc;

use rfidgate_agents::{AgentQueue, AgentRegistry};
use rfidgate_core::{Clock, RandomTokens, RealtimePublisher, RfidConfig, SystemClock, TokenSource};
use rfidgate_events::{BatchService, EdgeEventLog};
use rfidgate_fulfillment::{
    ClaimRegistry, DocumentService, FulfillmentPipeline, RuleService, TagRegistry,
};
use rfidgate_storage::{
    DocumentLedger, InMemoryCatalog, InMemoryLedger, InMemoryStore, ItemCatalog, RecordStore,
};

use crate::config::ApiConfig;
use crate::db::PgStore;
use crate::middleware::IngestAuthState;
use crate::services::{IngestService, LiveReadings, SavedTagService, TagNoteService};
use crate::ws::WsState;

/// The three storage seams the pipeline runs against.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn RecordStore>,
    pub catalog: Arc<dyn ItemCatalog>,
    pub ledger: Arc<dyn DocumentLedger>,
}

impl Backends {
    /// Process-local backends with an empty catalog.
    pub fn in_memory() -> Self {
        Self::in_memory_with_catalog(InMemoryCatalog::new())
    }

    pub fn in_memory_with_catalog(catalog: InMemoryCatalog) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            catalog: Arc::new(catalog),
            ledger: Arc::new(InMemoryLedger::new()),
        }
    }

    /// One Postgres pool serving all three seams.
    pub fn postgres(store: PgStore) -> Self {
        let store = Arc::new(store);
        Self {
            store: store.clone(),
            catalog: store.clone(),
            ledger: store,
        }
    }
}

/// Time and randomness sources. Tests swap in deterministic ones.
#[derive(Clone)]
pub struct Seams {
    pub clock: Arc<dyn Clock>,
    pub tokens: Arc<dyn TokenSource>,
}

impl Default for Seams {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            tokens: Arc::new(RandomTokens),
        }
    }
}

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub catalog: Arc<dyn ItemCatalog>,
    pub batches: BatchService,
    pub ingest: IngestService,
    pub saved_tags: SavedTagService,
    pub tag_notes: TagNoteService,
    pub tags: TagRegistry,
    pub rules: RuleService,
    pub agents: AgentRegistry,
    pub queue: AgentQueue,
    pub ws: Arc<WsState>,
    pub ingest_auth: IngestAuthState,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wire every service over `backends`. Realtime events from all
    /// components go to the shared WebSocket channel.
    pub fn new(backends: Backends, seams: Seams, api: &ApiConfig, config: RfidConfig) -> Self {
        let Backends {
            store,
            catalog,
            ledger,
        } = backends;
        let Seams { clock, tokens } = seams;

        let ws = Arc::new(WsState::new(api.realtime_capacity));
        let publisher: Arc<dyn RealtimePublisher> = ws.clone();

        let claims = ClaimRegistry::new(store.clone(), clock.clone(), config.stale_claim_secs);
        let documents = DocumentService::new(catalog.clone(), ledger, claims, clock.clone());
        let pipeline = FulfillmentPipeline::new(
            store.clone(),
            documents.clone(),
            clock.clone(),
            config.clone(),
        );

        let batches = BatchService::new(
            EdgeEventLog::new(store.clone(), clock.clone()),
            catalog.clone(),
            publisher.clone(),
        );
        let ingest = IngestService::new(
            store.clone(),
            pipeline,
            LiveReadings::new(),
            publisher.clone(),
            clock.clone(),
            config.clone(),
        );
        let tags = TagRegistry::new(
            store.clone(),
            catalog.clone(),
            documents,
            clock.clone(),
            tokens.clone(),
            config.clone(),
        );
        let queue = AgentQueue::new(store.clone(), clock.clone(), tokens, publisher, config.clone());
        let agents = AgentRegistry::new(clock.clone(), config.agent_ttl_secs);

        Self {
            saved_tags: SavedTagService::new(store.clone()),
            tag_notes: TagNoteService::new(store.clone(), clock),
            rules: RuleService::new(store.clone()),
            store,
            catalog,
            batches,
            ingest,
            tags,
            agents,
            queue,
            ws,
            ingest_auth: IngestAuthState::new(api.ingest_token.clone()),
            start_time: std::time::Instant::now(),
        }
    }
}

crate::impl_from_ref!(Arc<dyn RecordStore>, store);
crate::impl_from_ref!(BatchService, batches);
crate::impl_from_ref!(IngestService, ingest);
crate::impl_from_ref!(Arc<dyn ItemCatalog>, catalog);
crate::impl_from_ref!(SavedTagService, saved_tags);
crate::impl_from_ref!(TagNoteService, tag_notes);
crate::impl_from_ref!(TagRegistry, tags);
crate::impl_from_ref!(RuleService, rules);
crate::impl_from_ref!(AgentRegistry, agents);
crate::impl_from_ref!(AgentQueue, queue);
crate::impl_from_ref!(Arc<WsState>, ws);
crate::impl_from_ref!(IngestAuthState, ingest_auth);
crate::impl_from_ref!(std::time::Instant, start_time);
