use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use camfish_adapters::{AdapterError, LanguageModel, PageSource, SearchProvider};
use camfish_core::{PlaceType, QueryCatalog, DEFAULT_SEASON_NOTE};
use camfish_storage::MemoryPlaceStore;
use camfish_sync::{CollectorPipeline, Interrupt, PersistOutcome, PipelineSettings};

struct FixedSearch {
    urls: Vec<String>,
}

#[async_trait]
impl SearchProvider for FixedSearch {
    fn provider_id(&self) -> &'static str {
        "fixed"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<String>, AdapterError> {
        if query.contains("panic") {
            panic!("search exploded for {query}");
        }
        Ok(self.urls.iter().take(max_results).cloned().collect())
    }
}

/// Serves canned HTML per URL; unknown URLs fail like a dead host.
struct CannedPages {
    pages: HashMap<String, String>,
}

#[async_trait]
impl PageSource for CannedPages {
    async fn fetch_html(&self, url: &str) -> Result<String, AdapterError> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| AdapterError::Message(format!("connection refused: {url}")))
    }
}

struct CannedModel {
    reply: String,
    calls: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<String>>>,
    /// Stands in for a Ctrl-C arriving while the model is busy.
    interrupt: Option<Interrupt>,
}

#[async_trait]
impl LanguageModel for CannedModel {
    fn model_id(&self) -> &str {
        "canned"
    }

    async fn generate(&self, prompt: &str) -> Result<String, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(interrupt) = &self.interrupt {
            interrupt.trigger();
        }
        Ok(self.reply.clone())
    }
}

const MONGSANPO_REPLY: &str = r#"```json
{
  "place_name": "몽산포 해수욕장",
  "place_type": "FISHING",
  "address": "충청남도 태안군 남면 몽산포길 65-27",
  "lat": 36.6725,
  "lng": 126.2806,
  "description": "넓은 백사장과 갯벌에서 원투 낚시를 즐길 수 있는 해변",
  "fish_species": ["우럭", "노래미"],
  "recommended_baits": ["갯지렁이"],
  "nearby_places": [
    {"name": "몽산포 낚시점", "type": "BAIT_SHOP", "address": "몽산포길 10"}
  ]
}
```"#;

fn article(body: &str) -> String {
    format!("<html><body><nav>메뉴</nav><article><p>{}</p></article></body></html>", body.repeat(20))
}

fn urls() -> Vec<String> {
    (1..=5).map(|i| format!("https://blog.example.kr/post/{i}")).collect()
}

struct Fixture {
    pipeline: CollectorPipeline,
    store: Arc<MemoryPlaceStore>,
    model_calls: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<String>>>,
}

fn fixture(pages: HashMap<String, String>) -> Fixture {
    fixture_with_interrupt(pages, None)
}

fn fixture_with_interrupt(pages: HashMap<String, String>, interrupt: Option<Interrupt>) -> Fixture {
    let store = Arc::new(MemoryPlaceStore::new());
    let model_calls = Arc::new(AtomicUsize::new(0));
    let prompts = Arc::new(Mutex::new(Vec::new()));
    let pipeline = CollectorPipeline::new(
        PipelineSettings::without_delays(),
        Box::new(FixedSearch { urls: urls() }),
        Box::new(CannedPages { pages }),
        Box::new(CannedModel {
            reply: MONGSANPO_REPLY.to_string(),
            calls: model_calls.clone(),
            prompts: prompts.clone(),
            interrupt,
        }),
        store.clone(),
    );
    Fixture {
        pipeline,
        store,
        model_calls,
        prompts,
    }
}

fn mongsanpo_pages() -> HashMap<String, String> {
    let urls = urls();
    HashMap::from([
        (urls[0].clone(), article("몽산포 해수욕장은 우럭과 노래미가 잘 잡히는 곳입니다. ")),
        // urls[1] is unreachable
        (urls[2].clone(), article("근처 몽산포 낚시점에서 갯지렁이를 팝니다. ")),
        // pages beyond the top three are never fetched
        (urls[3].clone(), article("네 번째 결과")),
    ])
}

#[tokio::test]
async fn single_query_saves_place_species_and_amenity() {
    let fx = fixture(mongsanpo_pages());
    let catalog = QueryCatalog {
        queries: vec!["태안 몽산포 해변 낚시".to_string()],
    };

    let summary = fx.pipeline.run(&catalog, &Interrupt::new()).await;
    assert_eq!(summary.queries_total, 1);
    assert_eq!(summary.queries_processed, 1);
    assert_eq!(summary.queries_failed, 0);
    assert_eq!(summary.saved_places, 1);
    assert!(!summary.interrupted);
    assert!(summary.finished_at >= summary.started_at);

    let places = fx.store.places().await;
    assert_eq!(places.len(), 2);
    let beach = places.iter().find(|p| p.name == "몽산포 해수욕장").unwrap();
    assert_eq!(beach.place_type, PlaceType::Fishing);
    let beach_location = beach.location.unwrap();
    assert_eq!((beach_location.lat, beach_location.lng), (36.6725, 126.2806));

    let shop = places.iter().find(|p| p.name == "몽산포 낚시점").unwrap();
    assert_eq!(shop.place_type, PlaceType::Amenity);
    assert_eq!(shop.address, "몽산포길 10");
    let shop_location = shop.location.unwrap();
    assert!((shop_location.lat - 36.6725).abs() <= 0.01 + 1e-9);
    assert!((shop_location.lng - 126.2806).abs() <= 0.01 + 1e-9);

    let species = fx.store.species().await;
    let mut names: Vec<_> = species.iter().map(|s| s.korean_name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["노래미", "우럭"]);

    let maps = fx.store.species_maps().await;
    assert_eq!(maps.len(), 2);
    assert!(maps.iter().all(|m| m.place_id == beach.id && m.season_specific == DEFAULT_SEASON_NOTE));

    assert_eq!(fx.model_calls.load(Ordering::SeqCst), 1);
    let prompts = fx.prompts.lock().unwrap();
    assert!(prompts[0].contains("---source 1---"));
    assert!(!prompts[0].contains("---source 2---"));
    assert!(prompts[0].contains("---source 3---"));
    assert!(!prompts[0].contains("네 번째 결과"));
}

#[tokio::test]
async fn rerunning_a_query_does_not_duplicate_rows() {
    let fx = fixture(mongsanpo_pages());
    let catalog = QueryCatalog {
        queries: vec!["태안 몽산포 해변 낚시".to_string(), "태안 몽산포 캠핑".to_string()],
    };

    let summary = fx.pipeline.run(&catalog, &Interrupt::new()).await;
    assert_eq!(summary.queries_processed, 2);
    assert_eq!(summary.saved_places, 1);
    assert_eq!(fx.store.places().await.len(), 2);
    assert_eq!(fx.store.species().await.len(), 2);
    assert_eq!(fx.store.species_maps().await.len(), 2);

    let report = fx.pipeline.process_query("태안 몽산포 해변 낚시").await;
    assert_eq!(report.outcome, Some(PersistOutcome::AlreadyExists));
    assert_eq!(report.saved(), 0);
}

#[tokio::test]
async fn thin_pages_skip_the_model() {
    let short = "<html><body><article><p>짧은 글</p></article></body></html>".to_string();
    let pages = urls().into_iter().map(|u| (u, short.clone())).collect();
    let fx = fixture(pages);

    let report = fx.pipeline.process_query("대천해수욕장 낚시").await;
    assert_eq!(report.urls_found, 5);
    assert_eq!(report.pages_with_text, 0);
    assert_eq!(report.outcome, None);
    assert_eq!(fx.model_calls.load(Ordering::SeqCst), 0);
    assert!(fx.store.places().await.is_empty());
}

#[tokio::test]
async fn a_panicking_query_does_not_stop_the_run() {
    let fx = fixture(mongsanpo_pages());
    let catalog = QueryCatalog {
        queries: vec!["panic please".to_string(), "태안 몽산포 해변 낚시".to_string()],
    };

    let summary = fx.pipeline.run(&catalog, &Interrupt::new()).await;
    assert_eq!(summary.queries_processed, 2);
    assert_eq!(summary.queries_failed, 1);
    assert_eq!(summary.saved_places, 1);
}

#[tokio::test]
async fn interrupt_before_run_processes_nothing() {
    let fx = fixture(mongsanpo_pages());
    let interrupt = Interrupt::new();
    interrupt.trigger();

    let summary = fx.pipeline.run(&QueryCatalog::builtin(), &interrupt).await;
    assert!(summary.interrupted);
    assert_eq!(summary.queries_total, 15);
    assert_eq!(summary.queries_processed, 0);
    assert!(fx.store.places().await.is_empty());
}

#[tokio::test]
async fn interrupt_during_a_query_finishes_it_and_stops() {
    let interrupt = Interrupt::new();
    let fx = fixture_with_interrupt(mongsanpo_pages(), Some(interrupt.clone()));
    let catalog = QueryCatalog {
        queries: vec![
            "태안 몽산포 해변 낚시".to_string(),
            "시화방조제 낚시 포인트".to_string(),
            "가평 자라섬 캠핑장".to_string(),
        ],
    };

    let summary = fx.pipeline.run(&catalog, &interrupt).await;
    assert!(summary.interrupted);
    assert_eq!(summary.queries_total, 3);
    assert_eq!(summary.queries_processed, 1);
    assert_eq!(summary.queries_failed, 0);
    assert_eq!(summary.saved_places, 1);
    assert_eq!(fx.model_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.store.places().await.len(), 2);
}
