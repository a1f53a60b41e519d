//! Wiring of the stateful components behind one handle.
//!
//! Constructed once at startup and shared (`Arc<FlowService>`) by every
//! request handler. Each component keeps its own lock; no operation here holds
//! one component's lock across another's I/O.

use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::ingest::{IngestEnvelope, IngestGateway};
use crate::models::{
    Flow, FlowFilter, FlowQuery, FlowSummary, ReplayOpenRequest, ReplayResponse, ReplaySpec,
    ReplayTicket, RepeatRequest, RepeatResponse, ResponseBody, ScopeDecision, ScopeSettings,
};
use crate::replay::{self, ReplayCache, UpstreamClient};
use crate::scope::ScopeMatcher;
use crate::storage::FlowStore;

pub struct FlowService {
    config: ServiceConfig,
    store: Arc<FlowStore>,
    scope: Arc<ScopeMatcher>,
    replay: Arc<ReplayCache>,
    bus: EventBus,
    gateway: IngestGateway,
    upstream: UpstreamClient,
}

impl FlowService {
    /// Open storage and load the persisted scope into the matcher.
    pub async fn open(config: ServiceConfig) -> CoreResult<Self> {
        let store = Arc::new(FlowStore::new(&config.storage_path, config.max_rows)?);
        let settings = store.get_scope().await?;
        let scope = Arc::new(ScopeMatcher::new(settings));
        let bus = EventBus::new(config.subscriber_capacity, config.keepalive_interval);
        let gateway = IngestGateway::new(Arc::clone(&store), bus.clone());
        let replay = Arc::new(ReplayCache::new(config.replay_ttl));
        let upstream = UpstreamClient::new(config.upstream_timeout)?;

        tracing::info!(
            "Flow service ready (storage={}, scope v{})",
            config.storage_path.display(),
            scope.version()
        );

        Ok(Self {
            config,
            store,
            scope,
            replay,
            bus,
            gateway,
            upstream,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<FlowStore> {
        &self.store
    }

    pub fn scope_matcher(&self) -> &Arc<ScopeMatcher> {
        &self.scope
    }

    pub fn replay_cache(&self) -> &Arc<ReplayCache> {
        &self.replay
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn ingest(&self, envelope: IngestEnvelope) -> CoreResult<FlowSummary> {
        self.gateway.ingest(envelope).await
    }

    pub async fn ingest_json(&self, raw: &[u8]) -> CoreResult<FlowSummary> {
        self.gateway.ingest_json(raw).await
    }

    pub async fn list_flows(&self, query: &FlowQuery) -> CoreResult<Vec<FlowSummary>> {
        self.store.query(query).await
    }

    pub async fn count_flows(&self, filter: &FlowFilter) -> CoreResult<u64> {
        self.store.count(filter).await
    }

    pub async fn match_flows(&self, predicate: &str, ids: Vec<String>) -> CoreResult<Vec<String>> {
        self.store.match_ids(predicate, ids).await
    }

    pub async fn get_flow(&self, id: &str) -> CoreResult<Flow> {
        self.store
            .get_full(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("flow {id}")))
    }

    pub async fn get_response_body(&self, id: &str) -> CoreResult<ResponseBody> {
        self.store
            .get_response_body(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("response body for {id}")))
    }

    pub async fn clear_flows(&self) -> CoreResult<u64> {
        self.store.clear().await
    }

    pub async fn get_scope(&self) -> CoreResult<ScopeSettings> {
        self.store.get_scope().await
    }

    /// Persist, read back, then swap the matcher to what was actually stored.
    pub async fn set_scope(&self, settings: ScopeSettings) -> CoreResult<ScopeSettings> {
        self.store.set_scope(settings).await?;
        let saved = self.store.get_scope().await?;
        self.scope.replace(saved.clone());
        Ok(saved)
    }

    pub fn check_scope(&self, url: &str) -> ScopeDecision {
        self.scope.decide(url)
    }

    pub fn open_replay(&self, request: ReplayOpenRequest) -> CoreResult<ReplayTicket> {
        self.replay.open_request(request)
    }

    pub fn replay_spec(&self, token: &str) -> CoreResult<ReplaySpec> {
        let entry = self.replay.resolve(token)?;
        Ok(ReplaySpec::from(&entry))
    }

    pub async fn execute_replay(&self, token: &str) -> CoreResult<ReplayResponse> {
        self.replay.fetch(token, &self.upstream).await
    }

    pub async fn repeat(&self, request: RepeatRequest) -> CoreResult<RepeatResponse> {
        replay::repeat(&self.upstream, request).await
    }
}
