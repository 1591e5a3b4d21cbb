//! Collector orchestration: config, per-query pipeline, persistence rules and run summary.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use camfish_adapters::{
    extract_place, fetch_page_text, search_urls, DuckDuckGoSearch, GeminiClient, LanguageModel, PageSource,
    SearchProvider, DEFAULT_SEARCH_REGION,
};
use camfish_core::{
    ExtractedPlace, GeoPoint, LocationSpeciesMap, NearbyPlaceDraft, NewFishSpecies, NewPlace, QueryCatalog,
    AMENITY_JITTER_DEGREES,
};
use camfish_storage::{
    HttpClientConfig, HttpFetcher, MemoryPlaceStore, PgPlaceStore, PlaceStore, RestPlaceStore, StoreError,
    DEFAULT_ACCEPT_LANGUAGE, DEFAULT_USER_AGENT,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "camfish-sync";

const GEMINI_API_KEY_VARS: [&str; 2] = ["VITE_GEMINI_API_KEY", "GEMINI_API_KEY"];
const SUPABASE_URL_VARS: [&str; 2] = ["VITE_SUPABASE_URL", "SUPABASE_URL"];
const SUPABASE_KEY_VARS: [&str; 2] = ["VITE_SUPABASE_KEY", "SUPABASE_KEY"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing credential: set {primary} or {fallback}")]
    MissingCredential {
        primary: &'static str,
        fallback: &'static str,
    },
    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },
}

/// A credential that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Rest { url: String, api_key: Secret },
    Postgres { database_url: Secret },
    /// In-process tables, used for dry runs.
    Memory,
}

impl BackendConfig {
    pub fn describe(&self) -> String {
        match self {
            Self::Rest { url, .. } => format!("supabase rest ({url})"),
            Self::Postgres { .. } => "postgres".to_string(),
            Self::Memory => "memory (dry run)".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmenityPlacement {
    /// Parent coordinates plus an independent offset of up to ±0.01° per axis.
    #[default]
    Jitter,
    /// Amenities are stored without a location.
    Omit,
}

impl AmenityPlacement {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jitter" => Some(Self::Jitter),
            "omit" | "none" => Some(Self::Omit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub max_search_results: usize,
    pub pages_per_query: usize,
    pub fetch_delay: Duration,
    pub query_delay: Duration,
    pub amenity_placement: AmenityPlacement,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_search_results: 5,
            pages_per_query: 3,
            fetch_delay: Duration::from_millis(1_000),
            query_delay: Duration::from_millis(2_000),
            amenity_placement: AmenityPlacement::Jitter,
        }
    }
}

impl PipelineSettings {
    /// No throttling; used by tests and fakes.
    pub fn without_delays() -> Self {
        Self {
            fetch_delay: Duration::ZERO,
            query_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub gemini_api_key: Secret,
    pub gemini_model: String,
    pub model_timeout: Duration,
    pub backend: BackendConfig,
    pub user_agent: String,
    pub http_timeout: Duration,
    pub search_region: String,
    pub pipeline: PipelineSettings,
}

impl CollectorConfig {
    /// Reads the process environment. With `require_backend == false` the memory store is used
    /// and no storage credentials are needed.
    pub fn from_env(require_backend: bool) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok(), require_backend)
    }

    pub fn from_lookup<F>(lookup: F, require_backend: bool) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let first_of = |names: [&'static str; 2]| -> Result<String, ConfigError> {
            names
                .iter()
                .find_map(|name| var(*name))
                .ok_or(ConfigError::MissingCredential {
                    primary: names[0],
                    fallback: names[1],
                })
        };

        let gemini_api_key = Secret::new(first_of(GEMINI_API_KEY_VARS)?);

        let backend = if !require_backend {
            BackendConfig::Memory
        } else if let Some(database_url) = var("DATABASE_URL") {
            BackendConfig::Postgres {
                database_url: Secret::new(database_url),
            }
        } else {
            BackendConfig::Rest {
                url: first_of(SUPABASE_URL_VARS)?,
                api_key: Secret::new(first_of(SUPABASE_KEY_VARS)?),
            }
        };

        let defaults = PipelineSettings::default();
        let pipeline = PipelineSettings {
            max_search_results: parse_var(&var, "CAMFISH_MAX_SEARCH_RESULTS", defaults.max_search_results)?,
            pages_per_query: parse_var(&var, "CAMFISH_PAGES_PER_QUERY", defaults.pages_per_query)?,
            fetch_delay: Duration::from_millis(parse_var(&var, "CAMFISH_FETCH_DELAY_MS", 1_000)?),
            query_delay: Duration::from_millis(parse_var(&var, "CAMFISH_QUERY_DELAY_MS", 2_000)?),
            amenity_placement: match var("CAMFISH_AMENITY_PLACEMENT") {
                None => AmenityPlacement::default(),
                Some(value) => AmenityPlacement::parse(&value).ok_or(ConfigError::Invalid {
                    name: "CAMFISH_AMENITY_PLACEMENT",
                    value,
                })?,
            },
        };

        Ok(Self {
            gemini_api_key,
            gemini_model: var("CAMFISH_GEMINI_MODEL").unwrap_or_else(|| GeminiClient::DEFAULT_MODEL.to_string()),
            model_timeout: Duration::from_secs(parse_var(&var, "CAMFISH_MODEL_TIMEOUT_SECS", 60)?),
            backend,
            user_agent: var("CAMFISH_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout: Duration::from_secs(parse_var(&var, "CAMFISH_HTTP_TIMEOUT_SECS", 10)?),
            search_region: var("CAMFISH_SEARCH_REGION").unwrap_or_else(|| DEFAULT_SEARCH_REGION.to_string()),
            pipeline,
        })
    }
}

fn parse_var<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { name, value }),
    }
}

/// Loads a `queries: [...]` YAML file.
pub fn load_query_catalog(path: &Path) -> Result<QueryCatalog> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let catalog: QueryCatalog =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing query catalog {}", path.display()))?;
    if catalog.is_empty() {
        anyhow::bail!("query catalog {} has no queries", path.display());
    }
    Ok(catalog)
}

/// Joins page texts into one extraction document. `sources[i]` is the text of the i-th fetched
/// URL; failed fetches are `None` but keep their position in the numbering.
pub fn aggregate_sources(sources: &[Option<String>]) -> Option<String> {
    let mut document = String::new();
    for (idx, text) in sources.iter().enumerate() {
        if let Some(text) = text {
            document.push_str(&format!("\n\n---source {}---\n{}", idx + 1, text));
        }
    }
    (!document.is_empty()).then_some(document)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PersistOutcome {
    Saved {
        place_id: Uuid,
        species_linked: usize,
        amenities_created: usize,
    },
    MissingName,
    AlreadyExists,
    Failed,
}

impl PersistOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved { .. })
    }
}

/// Writes one extracted record with the dedup, species and amenity rules.
#[derive(Clone)]
pub struct PersistenceGateway {
    store: Arc<dyn PlaceStore>,
    placement: AmenityPlacement,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn PlaceStore>, placement: AmenityPlacement) -> Self {
        Self { store, placement }
    }

    /// Only a failed main-place insert turns into `Failed`; species and amenity errors are
    /// logged and skipped.
    pub async fn persist(&self, record: &ExtractedPlace) -> PersistOutcome {
        let new_place = NewPlace::from_extracted(record);
        let name = new_place.name.as_str();
        if name.is_empty() {
            warn!("extracted record has no place name; skipping");
            return PersistOutcome::MissingName;
        }
        if self.place_exists(name).await {
            info!(place = name, "place already stored; skipping");
            return PersistOutcome::AlreadyExists;
        }

        let place = match self.store.insert_place(&new_place).await {
            Ok(place) => place,
            Err(err) => {
                warn!(place = name, error = %err, "failed to insert place");
                return PersistOutcome::Failed;
            }
        };
        info!(place = %place.name, place_id = %place.id, place_type = %place.place_type, "saved place");

        let mut species_linked = 0;
        for species in &record.fish_species {
            let species = species.trim();
            if species.is_empty() {
                continue;
            }
            match self.link_species(place.id, species).await {
                Ok(()) => species_linked += 1,
                Err(err) => warn!(place = %place.name, species, error = %err, "failed to link species"),
            }
        }

        let mut amenities_created = 0;
        for nearby in &record.nearby_places {
            match self.save_amenity(nearby, place.location).await {
                Ok(true) => amenities_created += 1,
                Ok(false) => {}
                Err(err) => warn!(amenity = %nearby.name, error = %err, "failed to insert nearby place"),
            }
        }

        PersistOutcome::Saved {
            place_id: place.id,
            species_linked,
            amenities_created,
        }
    }

    async fn place_exists(&self, name: &str) -> bool {
        match self.store.find_place_by_name(name).await {
            Ok(found) => found.is_some(),
            Err(err) => {
                warn!(place = name, error = %err, "existence check failed; treating as absent");
                false
            }
        }
    }

    async fn link_species(&self, place_id: Uuid, korean_name: &str) -> Result<(), StoreError> {
        let species_id = match self.store.find_species_by_korean_name(korean_name).await? {
            Some(id) => id,
            None => {
                let created = self.store.insert_species(&NewFishSpecies::first_sighting(korean_name)).await?;
                debug!(species = korean_name, species_id = %created.id, "registered new species");
                created.id
            }
        };
        self.store
            .upsert_species_map(&LocationSpeciesMap::year_round(place_id, species_id))
            .await
    }

    /// Returns `Ok(false)` when the amenity was skipped.
    async fn save_amenity(&self, nearby: &NearbyPlaceDraft, parent: Option<GeoPoint>) -> Result<bool, StoreError> {
        let location = match self.placement {
            AmenityPlacement::Jitter => parent.map(|p| p.jittered(&mut rand::thread_rng(), AMENITY_JITTER_DEGREES)),
            AmenityPlacement::Omit => None,
        };
        let amenity = NewPlace::amenity(nearby, location);
        if amenity.name.is_empty() || self.place_exists(&amenity.name).await {
            return Ok(false);
        }
        let place = self.store.insert_place(&amenity).await?;
        debug!(amenity = %place.name, place_id = %place.id, "saved nearby place");
        Ok(true)
    }
}

/// Cooperative stop flag shared between the signal listener and the run loop.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptState>,
}

#[derive(Debug, Default)]
struct InterruptState {
    triggered: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Triggers on the first Ctrl-C. Must be called inside a tokio runtime.
    pub fn listen_for_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let interrupt = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("interrupt received; stopping before the next query");
                    interrupt.trigger();
                }
                Err(err) => warn!(error = %err, "could not listen for ctrl-c"),
            }
        })
    }

    /// Sleeps for `duration` unless triggered first. Returns `false` when interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.inner.notify.notified();
        if self.is_triggered() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_triggered(),
            _ = notified => false,
        }
    }
}

/// What happened to a single query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryReport {
    pub urls_found: usize,
    pub pages_with_text: usize,
    pub extracted_place: Option<String>,
    pub outcome: Option<PersistOutcome>,
}

impl QueryReport {
    pub fn saved(&self) -> usize {
        usize::from(self.outcome.as_ref().is_some_and(PersistOutcome::is_saved))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub queries_total: usize,
    pub queries_processed: usize,
    pub queries_failed: usize,
    pub saved_places: usize,
    pub interrupted: bool,
}

pub struct CollectorPipeline {
    settings: PipelineSettings,
    search: Box<dyn SearchProvider>,
    pages: Box<dyn PageSource>,
    model: Box<dyn LanguageModel>,
    gateway: PersistenceGateway,
}

impl CollectorPipeline {
    pub fn new(
        settings: PipelineSettings,
        search: Box<dyn SearchProvider>,
        pages: Box<dyn PageSource>,
        model: Box<dyn LanguageModel>,
        store: Arc<dyn PlaceStore>,
    ) -> Self {
        let gateway = PersistenceGateway::new(store, settings.amenity_placement);
        Self {
            settings,
            search,
            pages,
            model,
            gateway,
        }
    }

    /// search → fetch → aggregate → extract → persist for one query.
    pub async fn process_query(&self, query: &str) -> QueryReport {
        let mut report = QueryReport::default();

        let urls = search_urls(self.search.as_ref(), query, self.settings.max_search_results).await;
        report.urls_found = urls.len();
        if urls.is_empty() {
            info!("no search results");
            return report;
        }

        let mut sources = Vec::with_capacity(self.settings.pages_per_query);
        for (idx, url) in urls.iter().take(self.settings.pages_per_query).enumerate() {
            debug!(source = idx + 1, url = %url, "fetching page");
            let text = fetch_page_text(self.pages.as_ref(), url).await;
            if text.is_some() {
                report.pages_with_text += 1;
                tokio::time::sleep(self.settings.fetch_delay).await;
            }
            sources.push(text);
        }

        let Some(document) = aggregate_sources(&sources) else {
            info!("no usable page content; skipping extraction");
            return report;
        };

        let Some(record) = extract_place(self.model.as_ref(), &document, query).await else {
            return report;
        };
        report.extracted_place = Some(record.place_name.clone());

        let outcome = self.gateway.persist(&record).await;
        report.outcome = Some(outcome);
        report
    }

    /// Processes queries in order. A panic inside one query is logged and counted as a failure;
    /// the run continues with the next query.
    pub async fn run(&self, catalog: &QueryCatalog, interrupt: &Interrupt) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let queries_total = catalog.len();
        let mut queries_processed = 0;
        let mut queries_failed = 0;
        let mut saved_places = 0;
        let mut interrupted = false;

        info!(%run_id, queries = queries_total, "collector run started");

        for (idx, query) in catalog.iter().enumerate() {
            if interrupt.is_triggered() {
                interrupted = true;
                break;
            }

            let span = info_span!("query", index = idx + 1, total = queries_total, query);
            let result = AssertUnwindSafe(self.process_query(query).instrument(span))
                .catch_unwind()
                .await;
            queries_processed += 1;
            match result {
                Ok(report) => saved_places += report.saved(),
                Err(panic) => {
                    queries_failed += 1;
                    warn!(query, error = %panic_message(panic.as_ref()), "query processing aborted");
                }
            }

            let remaining = idx + 1 < queries_total;
            if remaining && !interrupt.sleep(self.settings.query_delay).await {
                interrupted = true;
                break;
            }
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            queries_total,
            queries_processed,
            queries_failed,
            saved_places,
            interrupted,
        };
        info!(
            %run_id,
            processed = summary.queries_processed,
            failed = summary.queries_failed,
            saved = summary.saved_places,
            interrupted = summary.interrupted,
            "collector run finished"
        );
        summary
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Wires the live search, page, model and storage clients for `config`.
pub async fn build_pipeline(config: &CollectorConfig) -> Result<CollectorPipeline> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout,
        user_agent: Some(config.user_agent.clone()),
        accept_language: Some(DEFAULT_ACCEPT_LANGUAGE.to_string()),
    })?;

    let store: Arc<dyn PlaceStore> = match &config.backend {
        BackendConfig::Rest { url, api_key } => {
            Arc::new(RestPlaceStore::new(http.client().clone(), url.clone(), api_key.expose()))
        }
        BackendConfig::Postgres { database_url } => Arc::new(
            PgPlaceStore::connect(database_url.expose())
                .await
                .context("connecting to DATABASE_URL")?,
        ),
        BackendConfig::Memory => Arc::new(MemoryPlaceStore::new()),
    };
    info!(backend = %config.backend.describe(), model = %config.gemini_model, "collector wired");

    let search = DuckDuckGoSearch::new(&http, config.search_region.clone());
    let model = GeminiClient::new(&http, config.gemini_api_key.expose(), config.gemini_model.clone())
        .with_timeout(config.model_timeout);

    Ok(CollectorPipeline::new(
        config.pipeline.clone(),
        Box::new(search),
        Box::new(http),
        Box::new(model),
        store,
    ))
}

/// Applies the bundled schema migrations to `database_url`.
pub async fn run_migrations(database_url: &str) -> Result<()> {
    let store = PgPlaceStore::connect(database_url)
        .await
        .context("connecting to DATABASE_URL")?;
    store.migrate().await.context("applying migrations")?;
    Ok(())
}
