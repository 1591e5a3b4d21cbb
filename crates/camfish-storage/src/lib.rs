//! HTTP transport and place-store backends for CamFish.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use camfish_core::{FishSpecies, LocationSpeciesMap, NewFishSpecies, NewPlace, Place};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "camfish-storage";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "ko-KR,ko;q=0.9,en-US;q=0.8,en;q=0.7";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            accept_language: Some(DEFAULT_ACCEPT_LANGUAGE.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Browser-identified HTTP client shared by page fetches, search and model calls.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        if let Some(language) = &config.accept_language {
            headers.insert(
                ACCEPT_LANGUAGE,
                HeaderValue::from_str(language).context("invalid Accept-Language header")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// GET `url` and decode the body as UTF-8 (lossy). Non-2xx is an error.
    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let bytes = resp.bytes().await?;
            debug!(bytes = bytes.len(), "fetched page");
            Ok(FetchedResponse {
                status,
                final_url,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            })
        }
        .instrument(info_span!("http_fetch", url))
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status} for {table}: {body}")]
    Status {
        table: &'static str,
        status: u16,
        body: String,
    },
    #[error("backend returned no row for insert into {table}")]
    EmptyResponse { table: &'static str },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Table-style persistence backend for places, species and their links.
///
/// There are no transactions across calls; callers own ordering.
#[async_trait]
pub trait PlaceStore: Send + Sync {
    async fn find_place_by_name(&self, name: &str) -> Result<Option<Uuid>, StoreError>;

    async fn insert_place(&self, place: &NewPlace) -> Result<Place, StoreError>;

    async fn find_species_by_korean_name(&self, korean_name: &str) -> Result<Option<Uuid>, StoreError>;

    async fn insert_species(&self, species: &NewFishSpecies) -> Result<FishSpecies, StoreError>;

    /// Insert or overwrite the row keyed by `(place_id, species_id)`.
    async fn upsert_species_map(&self, mapping: &LocationSpeciesMap) -> Result<(), StoreError>;
}

const PLACES: &str = "places";
const FISH_SPECIES: &str = "fish_species";
const LOCATION_SPECIES_MAP: &str = "location_species_map";

#[derive(Debug, Deserialize)]
struct IdRow {
    id: Uuid,
}

/// PostgREST (Supabase) table API.
#[derive(Debug, Clone)]
pub struct RestPlaceStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RestPlaceStore {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url.trim_end_matches('/'), table)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header(ACCEPT, "application/json")
    }

    async fn select_id(
        &self,
        table: &'static str,
        column: &str,
        value: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        let resp = self
            .authed(self.client.get(self.table_url(table)))
            .query(&[("select", "id".to_string()), (column, format!("eq.{value}"))])
            .send()
            .await?;
        let rows: Vec<IdRow> = read_rows(table, resp).await?;
        Ok(rows.into_iter().next().map(|row| row.id))
    }

    async fn insert_returning_id<T: Serialize + Sync>(
        &self,
        table: &'static str,
        body: &T,
    ) -> Result<Uuid, StoreError> {
        let resp = self
            .authed(self.client.post(self.table_url(table)))
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;
        let rows: Vec<IdRow> = read_rows(table, resp).await?;
        rows.into_iter()
            .next()
            .map(|row| row.id)
            .ok_or(StoreError::EmptyResponse { table })
    }
}

async fn read_rows<T: DeserializeOwned>(table: &'static str, resp: Response) -> Result<Vec<T>, StoreError> {
    let resp = ensure_success(table, resp).await?;
    Ok(resp.json().await?)
}

async fn ensure_success(table: &'static str, resp: Response) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Status {
        table,
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl PlaceStore for RestPlaceStore {
    async fn find_place_by_name(&self, name: &str) -> Result<Option<Uuid>, StoreError> {
        self.select_id(PLACES, "name", name).await
    }

    async fn insert_place(&self, place: &NewPlace) -> Result<Place, StoreError> {
        let id = self.insert_returning_id(PLACES, place).await?;
        Ok(place.clone().into_place(id))
    }

    async fn find_species_by_korean_name(&self, korean_name: &str) -> Result<Option<Uuid>, StoreError> {
        self.select_id(FISH_SPECIES, "korean_name", korean_name).await
    }

    async fn insert_species(&self, species: &NewFishSpecies) -> Result<FishSpecies, StoreError> {
        let id = self.insert_returning_id(FISH_SPECIES, species).await?;
        Ok(species.clone().into_species(id))
    }

    async fn upsert_species_map(&self, mapping: &LocationSpeciesMap) -> Result<(), StoreError> {
        let resp = self
            .authed(self.client.post(self.table_url(LOCATION_SPECIES_MAP)))
            .query(&[("on_conflict", "place_id,species_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(mapping)
            .send()
            .await?;
        ensure_success(LOCATION_SPECIES_MAP, resp).await?;
        Ok(())
    }
}

/// Direct Postgres/PostGIS backend.
#[derive(Debug, Clone)]
pub struct PgPlaceStore {
    pool: PgPool,
}

impl PgPlaceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The collector is sequential, so a single connection is enough.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl PlaceStore for PgPlaceStore {
    async fn find_place_by_name(&self, name: &str) -> Result<Option<Uuid>, StoreError> {
        let id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM places WHERE name = $1 LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn insert_place(&self, place: &NewPlace) -> Result<Place, StoreError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO places (name, type, address, description, location)
            VALUES ($1, $2, $3, $4, $5::text::geography)
            RETURNING id
            "#,
        )
        .bind(&place.name)
        .bind(place.place_type.as_str())
        .bind(&place.address)
        .bind(&place.description)
        .bind(place.location.map(|p| p.to_ewkt()))
        .fetch_one(&self.pool)
        .await?;
        debug!(%id, name = %place.name, "inserted place row");
        Ok(place.clone().into_place(id))
    }

    async fn find_species_by_korean_name(&self, korean_name: &str) -> Result<Option<Uuid>, StoreError> {
        let id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM fish_species WHERE korean_name = $1 LIMIT 1")
            .bind(korean_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn insert_species(&self, species: &NewFishSpecies) -> Result<FishSpecies, StoreError> {
        let months = species
            .active_months
            .iter()
            .map(|m| i32::from(*m))
            .collect::<Vec<i32>>();
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO fish_species (korean_name, scientific_name, habitat, active_months)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&species.korean_name)
        .bind(&species.scientific_name)
        .bind(species.habitat.as_str())
        .bind(months)
        .fetch_one(&self.pool)
        .await?;
        Ok(species.clone().into_species(id))
    }

    async fn upsert_species_map(&self, mapping: &LocationSpeciesMap) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO location_species_map (place_id, species_id, season_specific)
            VALUES ($1, $2, $3)
            ON CONFLICT (place_id, species_id)
            DO UPDATE SET season_specific = EXCLUDED.season_specific
            "#,
        )
        .bind(mapping.place_id)
        .bind(mapping.species_id)
        .bind(&mapping.season_specific)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryTables {
    places: Vec<Place>,
    species: Vec<FishSpecies>,
    species_maps: HashMap<(Uuid, Uuid), LocationSpeciesMap>,
}

/// Process-local tables with the same lookup semantics as the real backends.
#[derive(Debug, Default)]
pub struct MemoryPlaceStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryPlaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn places(&self) -> Vec<Place> {
        self.tables.lock().await.places.clone()
    }

    pub async fn species(&self) -> Vec<FishSpecies> {
        self.tables.lock().await.species.clone()
    }

    pub async fn species_maps(&self) -> Vec<LocationSpeciesMap> {
        let tables = self.tables.lock().await;
        let mut rows = tables.species_maps.values().cloned().collect::<Vec<_>>();
        rows.sort_by_key(|row| (row.place_id, row.species_id));
        rows
    }
}

#[async_trait]
impl PlaceStore for MemoryPlaceStore {
    async fn find_place_by_name(&self, name: &str) -> Result<Option<Uuid>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.places.iter().find(|p| p.name == name).map(|p| p.id))
    }

    async fn insert_place(&self, place: &NewPlace) -> Result<Place, StoreError> {
        let row = place.clone().into_place(Uuid::new_v4());
        self.tables.lock().await.places.push(row.clone());
        Ok(row)
    }

    async fn find_species_by_korean_name(&self, korean_name: &str) -> Result<Option<Uuid>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .species
            .iter()
            .find(|s| s.korean_name == korean_name)
            .map(|s| s.id))
    }

    async fn insert_species(&self, species: &NewFishSpecies) -> Result<FishSpecies, StoreError> {
        let row = species.clone().into_species(Uuid::new_v4());
        self.tables.lock().await.species.push(row.clone());
        Ok(row)
    }

    async fn upsert_species_map(&self, mapping: &LocationSpeciesMap) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .species_maps
            .insert((mapping.place_id, mapping.species_id), mapping.clone());
        Ok(())
    }
}
