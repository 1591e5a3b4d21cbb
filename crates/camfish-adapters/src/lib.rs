//! Contracts for the search, page and model collaborators, their HTTP-backed
//! implementations, and the stage wrappers that turn collaborator failures
//! into empty results.

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use camfish_core::ExtractedPlace;
use camfish_storage::{FetchError, HttpFetcher};
use regex::Regex;
use reqwest::header::ACCEPT;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "camfish-adapters";

/// Cleaned page text is cut to this many characters to bound prompt size.
pub const MAX_PAGE_CHARS: usize = 8_000;

/// Cleaned page text must be longer than this to count as content.
pub const MIN_PAGE_CHARS: usize = 100;

pub const DEFAULT_SEARCH_REGION: &str = "kr-kr";

const STRIPPED_ELEMENTS: &[&str] = &["script", "style", "nav", "footer", "header", "aside"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    /// Ranked result URLs for `query`, at most `max_results`.
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<String>, AdapterError>;
}

/// Never fails: provider errors are logged and read as "no results".
pub async fn search_urls(provider: &dyn SearchProvider, query: &str, max_results: usize) -> Vec<String> {
    match provider.search(query, max_results).await {
        Ok(urls) => {
            info!(provider = provider.provider_id(), query, found = urls.len(), "search finished");
            urls
        }
        Err(err) => {
            warn!(provider = provider.provider_id(), query, error = %err, "search failed");
            Vec::new()
        }
    }
}

/// DuckDuckGo's HTML endpoint, scraped with CSS selectors.
#[derive(Debug, Clone)]
pub struct DuckDuckGoSearch {
    client: reqwest::Client,
    endpoint: String,
    region: String,
}

impl DuckDuckGoSearch {
    pub const ENDPOINT: &'static str = "https://html.duckduckgo.com/html/";

    pub fn new(http: &HttpFetcher, region: impl Into<String>) -> Self {
        Self {
            client: http.client().clone(),
            endpoint: Self::ENDPOINT.to_string(),
            region: region.into(),
        }
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    fn provider_id(&self) -> &'static str {
        "duckduckgo"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<String>, AdapterError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .form(&[("q", query), ("kl", self.region.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::Message(format!(
                "duckduckgo search returned {status}"
            )));
        }

        let body = resp.text().await?;
        Ok(parse_duckduckgo_results(&body, max_results))
    }
}

/// Result links from a DuckDuckGo HTML page in rank order, ads skipped,
/// redirect wrappers unwrapped and duplicates dropped.
pub fn parse_duckduckgo_results(html: &str, max_results: usize) -> Vec<String> {
    let Ok(link_sel) = Selector::parse(".result:not(.result--ad) a.result__a") else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    document
        .select(&link_sel)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(unwrap_duckduckgo_href)
        .filter(|url| seen.insert(url.clone()))
        .take(max_results)
        .collect()
}

fn unwrap_duckduckgo_href(href: &str) -> Option<String> {
    let base = Url::parse("https://duckduckgo.com/").ok()?;
    let resolved = base.join(href.trim()).ok()?;
    let is_redirect = resolved
        .host_str()
        .is_some_and(|host| host.ends_with("duckduckgo.com"))
        && resolved.path().starts_with("/l/");

    let target = if is_redirect {
        let (_, uddg) = resolved.query_pairs().find(|(key, _)| key == "uddg")?;
        Url::parse(&uddg).ok()?
    } else {
        resolved
    };

    if target.host_str().is_some_and(|host| host.ends_with("duckduckgo.com")) {
        return None;
    }
    matches!(target.scheme(), "http" | "https").then(|| target.to_string())
}

#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_html(&self, url: &str) -> Result<String, AdapterError>;
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_html(&self, url: &str) -> Result<String, AdapterError> {
        let page = self.fetch_text(url).await?;
        if page.final_url != url {
            debug!(url, final_url = %page.final_url, status = %page.status, "page redirected");
        }
        Ok(page.body)
    }
}

/// Cleaned text for `url`, or `None` on any transport error or when the page
/// has too little content.
pub async fn fetch_page_text(source: &dyn PageSource, url: &str) -> Option<String> {
    let html = match source.fetch_html(url).await {
        Ok(html) => html,
        Err(err) => {
            warn!(url, error = %err, "page fetch failed");
            return None;
        }
    };

    let text = clean_page_text(&html);
    if text.is_none() {
        debug!(url, "page has too little content");
    }
    text
}

/// Visible text of the page's primary content region (or the whole page),
/// one text run per line, with script/style/nav/footer/header/aside removed.
pub fn clean_page_text(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let root = primary_content(&document).unwrap_or_else(|| document.root_element());

    let mut runs = Vec::new();
    collect_text_runs(root, &mut runs);

    let text = collapse_blank_lines(&runs.join("\n"));
    let text = truncate_chars(&text, MAX_PAGE_CHARS);
    (text.chars().count() > MIN_PAGE_CHARS).then_some(text)
}

fn primary_content(document: &Html) -> Option<ElementRef<'_>> {
    first_unstripped(document, "article")
        .or_else(|| first_unstripped(document, "main"))
        .or_else(|| {
            let sel = Selector::parse("div[class]").ok()?;
            document.select(&sel).find(|el| {
                !inside_stripped(*el) && el.value().classes().any(|class| content_class_re().is_match(class))
            })
        })
}

fn first_unstripped<'a>(document: &'a Html, css: &str) -> Option<ElementRef<'a>> {
    let sel = Selector::parse(css).ok()?;
    document.select(&sel).find(|el| !inside_stripped(*el))
}

fn inside_stripped(element: ElementRef<'_>) -> bool {
    element.ancestors().any(|node| {
        node.value()
            .as_element()
            .is_some_and(|el| STRIPPED_ELEMENTS.contains(&el.name()))
    })
}

fn collect_text_runs(element: ElementRef<'_>, out: &mut Vec<String>) {
    for child in element.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            if !STRIPPED_ELEMENTS.contains(&child_el.value().name()) {
                collect_text_runs(child_el, out);
            }
        } else if let Some(text) = child.value().as_text() {
            let run = text.trim();
            if !run.is_empty() {
                out.push(run.to_string());
            }
        }
    }
}

fn content_class_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"content|post|entry").expect("content class pattern is valid"))
}

fn collapse_blank_lines(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\n{3,}").expect("blank line pattern is valid"));
    re.replace_all(text, "\n\n").into_owned()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_id(&self) -> &str;

    /// Single-prompt, single-completion call.
    async fn generate(&self, prompt: &str) -> Result<String, AdapterError>;
}

/// Gemini `generateContent` over REST.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_base: String,
    timeout: Duration,
}

impl GeminiClient {
    pub const DEFAULT_MODEL: &'static str = "gemini-1.5-flash";
    pub const API_BASE: &'static str = "https://generativelanguage.googleapis.com/v1beta";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(http: &HttpFetcher, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: http.client().clone(),
            api_key: api_key.into(),
            model: model.into(),
            api_base: Self::API_BASE.to_string(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Completions are slower than page fetches; this overrides the shared client timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    text: Option<String>,
}

#[async_trait]
impl LanguageModel for GeminiClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, AdapterError> {
        let body = serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }]
        });
        let resp = self
            .client
            .post(self.endpoint())
            .timeout(self.timeout)
            .header("x-goog-api-key", &self.api_key)
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Message(format!("gemini returned {status}: {detail}")));
        }

        let parsed: GenerateContentResponse = resp.json().await?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(AdapterError::Message("gemini returned no text".to_string()));
        }
        Ok(text)
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("model invocation failed: {0}")]
    Model(#[from] AdapterError),
    #[error("model response is not valid JSON: {0}")]
    Syntax(#[source] serde_json::Error),
    #[error("model response does not match the place schema: {0}")]
    Schema(#[source] serde_json::Error),
}

const EXTRACTION_PROMPT: &str = r#"You analyse Korean web pages about fishing spots and campsites.
Extract the following fields from the text below and answer with a single JSON object.
Keep names, addresses and descriptions in Korean exactly as the text writes them.

Fields:
1. place_name: name of the place (e.g. "을왕리 선녀바위", "몽산포 해수욕장")
2. place_type: "FISHING" or "CAMPING" (FISHING for fishing content, CAMPING for camping content)
3. address: street address, or "" when unknown
4. lat: estimated latitude as a number, or null
5. lng: estimated longitude as a number, or null
6. description: short description of the place, at most 50 characters
7. fish_species: main fish species, fishing spots only (e.g. ["우럭", "광어", "노래미"])
8. recommended_baits: recommended baits, fishing spots only (e.g. ["갯지렁이", "크릴새우"])
9. nearby_places: nearby shops and facilities as [{"name", "type", "address"}] where type is "BAIT_SHOP", "RESTAURANT" or "CONVENIENCE_STORE"

Return valid JSON only, without markdown code fences.
Use an empty value or null for anything the text does not mention.

Text:
---
{text}
---

JSON:
"#;

pub fn build_extraction_prompt(document: &str) -> String {
    EXTRACTION_PROMPT.replace("{text}", document)
}

/// Removes a leading/trailing markdown code fence, with or without a language tag.
pub fn strip_code_fence(raw: &str) -> &str {
    static OPEN: OnceLock<Regex> = OnceLock::new();
    static CLOSE: OnceLock<Regex> = OnceLock::new();

    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let open = OPEN.get_or_init(|| Regex::new(r"^```[A-Za-z0-9_-]*[ \t]*\r?\n?").expect("fence pattern is valid"));
    let close = CLOSE.get_or_init(|| Regex::new(r"\r?\n?```$").expect("fence pattern is valid"));

    let start = open.find(trimmed).map(|m| m.end()).unwrap_or(0);
    let body = &trimmed[start..];
    let end = close.find(body).map(|m| m.start()).unwrap_or(body.len());
    body[..end].trim()
}

/// Parses a model response into a place record. A missing or blank
/// `place_name` falls back to the first word of `query`.
pub fn parse_model_response(raw: &str, query: &str) -> Result<ExtractedPlace, ExtractionError> {
    let value: serde_json::Value =
        serde_json::from_str(strip_code_fence(raw)).map_err(ExtractionError::Syntax)?;
    let mut record: ExtractedPlace = serde_json::from_value(value).map_err(ExtractionError::Schema)?;

    if record.place_name.trim().is_empty() {
        record.place_name = query.split_whitespace().next().unwrap_or_default().to_string();
    }
    Ok(record)
}

async fn try_extract_place(
    model: &dyn LanguageModel,
    document: &str,
    query: &str,
) -> Result<ExtractedPlace, ExtractionError> {
    let raw = model.generate(&build_extraction_prompt(document)).await?;
    parse_model_response(&raw, query)
}

/// Never fails: model, syntax and schema errors are logged and read as "nothing extracted".
pub async fn extract_place(model: &dyn LanguageModel, document: &str, query: &str) -> Option<ExtractedPlace> {
    match try_extract_place(model, document, query).await {
        Ok(record) => {
            debug!(
                model = model.model_id(),
                place = %record.place_name,
                species = record.fish_species.len(),
                baits = ?record.recommended_baits,
                nearby = record.nearby_places.len(),
                "extracted place record"
            );
            Some(record)
        }
        Err(err) => {
            let kind = match &err {
                ExtractionError::Model(_) => "model",
                ExtractionError::Syntax(_) => "syntax",
                ExtractionError::Schema(_) => "schema",
            };
            warn!(model = model.model_id(), query, kind, error = %err, "extraction failed");
            None
        }
    }
}
