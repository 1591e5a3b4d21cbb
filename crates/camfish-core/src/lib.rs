//! Core domain model and extraction handoff types for the CamFish collector.

use std::collections::BTreeSet;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

pub const CRATE_NAME: &str = "camfish-core";

/// Spatial reference id used for every stored point (WGS 84).
pub const SRID_WGS84: u32 = 4326;

/// Maximum offset, in degrees, applied per axis when positioning an amenity near its parent.
pub const AMENITY_JITTER_DEGREES: f64 = 0.01;

/// Seasonal note written for every place/species link created by the collector ("year-round").
pub const DEFAULT_SEASON_NOTE: &str = "연중";

/// Description used for an amenity whose sub-type is unknown ("amenity").
pub const GENERIC_AMENITY_LABEL: &str = "편의시설";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaceType {
    /// Extraction records without a type are treated as fishing spots.
    #[default]
    Fishing,
    Camping,
    Amenity,
}

impl PlaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaceType::Fishing => "FISHING",
            PlaceType::Camping => "CAMPING",
            PlaceType::Amenity => "AMENITY",
        }
    }
}

impl fmt::Display for PlaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Habitat {
    #[default]
    Saltwater,
    Freshwater,
    Brackish,
}

impl Habitat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Habitat::Saltwater => "SALTWATER",
            Habitat::Freshwater => "FRESHWATER",
            Habitat::Brackish => "BRACKISH",
        }
    }
}

/// WGS 84 point. Stored as EWKT: `SRID=4326;POINT(<lng> <lat>)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn to_ewkt(&self) -> String {
        format!("SRID={};POINT({} {})", SRID_WGS84, self.lng, self.lat)
    }

    /// Returns a point offset from `self` by an independent uniform amount in
    /// `[-max_offset, max_offset]` on each axis.
    pub fn jittered<R: Rng + ?Sized>(&self, rng: &mut R, max_offset: f64) -> Self {
        let max_offset = max_offset.abs();
        Self {
            lat: self.lat + rng.gen_range(-max_offset..=max_offset),
            lng: self.lng + rng.gen_range(-max_offset..=max_offset),
        }
    }
}

/// A persisted location row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub place_type: PlaceType,
    pub address: String,
    pub description: String,
    pub location: Option<GeoPoint>,
}

/// Insert payload for a place; the backend assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewPlace {
    pub name: String,
    #[serde(rename = "type")]
    pub place_type: PlaceType,
    pub address: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_ewkt")]
    pub location: Option<GeoPoint>,
}

impl NewPlace {
    pub fn from_extracted(record: &ExtractedPlace) -> Self {
        Self {
            name: record.place_name.trim().to_string(),
            place_type: record.place_type,
            address: record.address.clone(),
            description: record.description.clone(),
            location: record.location(),
        }
    }

    pub fn amenity(nearby: &NearbyPlaceDraft, location: Option<GeoPoint>) -> Self {
        Self {
            name: nearby.name.trim().to_string(),
            place_type: PlaceType::Amenity,
            address: nearby.address.clone(),
            description: nearby.description().to_string(),
            location,
        }
    }

    pub fn into_place(self, id: Uuid) -> Place {
        Place {
            id,
            name: self.name,
            place_type: self.place_type,
            address: self.address,
            description: self.description,
            location: self.location,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FishSpecies {
    pub id: Uuid,
    pub korean_name: String,
    pub scientific_name: String,
    pub habitat: Habitat,
    pub active_months: BTreeSet<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewFishSpecies {
    pub korean_name: String,
    pub scientific_name: String,
    pub habitat: Habitat,
    pub active_months: BTreeSet<u8>,
}

impl NewFishSpecies {
    /// Catalog entry for a species the collector has not seen before:
    /// saltwater, active all year.
    pub fn first_sighting(korean_name: impl Into<String>) -> Self {
        Self {
            korean_name: korean_name.into(),
            scientific_name: String::new(),
            habitat: Habitat::Saltwater,
            active_months: all_months(),
        }
    }

    pub fn into_species(self, id: Uuid) -> FishSpecies {
        FishSpecies {
            id,
            korean_name: self.korean_name,
            scientific_name: self.scientific_name,
            habitat: self.habitat,
            active_months: self.active_months,
        }
    }
}

pub fn all_months() -> BTreeSet<u8> {
    (1..=12).collect()
}

/// Place/species association keyed by `(place_id, species_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSpeciesMap {
    pub place_id: Uuid,
    pub species_id: Uuid,
    pub season_specific: String,
}

impl LocationSpeciesMap {
    pub fn year_round(place_id: Uuid, species_id: Uuid) -> Self {
        Self {
            place_id,
            species_id,
            season_specific: DEFAULT_SEASON_NOTE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NearbyKind {
    BaitShop,
    Restaurant,
    ConvenienceStore,
    #[serde(other)]
    Other,
}

impl NearbyKind {
    pub fn label(&self) -> &'static str {
        match self {
            NearbyKind::BaitShop => "BAIT_SHOP",
            NearbyKind::Restaurant => "RESTAURANT",
            NearbyKind::ConvenienceStore => "CONVENIENCE_STORE",
            NearbyKind::Other => GENERIC_AMENITY_LABEL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NearbyPlaceDraft {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<NearbyKind>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub address: String,
}

impl NearbyPlaceDraft {
    pub fn description(&self) -> &'static str {
        self.kind.map(|k| k.label()).unwrap_or(GENERIC_AMENITY_LABEL)
    }
}

/// Structured record produced by the extraction stage and consumed by the
/// persistence gateway. Every field has a default; `null` reads as the default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExtractedPlace {
    #[serde(default, deserialize_with = "null_as_default")]
    pub place_name: String,
    /// Only `FISHING` and `CAMPING` are honoured; anything else reads as `FISHING`.
    #[serde(default, deserialize_with = "extracted_place_type")]
    pub place_type: PlaceType,
    #[serde(default, deserialize_with = "null_as_default")]
    pub address: String,
    #[serde(default, deserialize_with = "lenient_coordinate")]
    pub lat: Option<f64>,
    #[serde(default, deserialize_with = "lenient_coordinate")]
    pub lng: Option<f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "list_without_nulls")]
    pub fish_species: Vec<String>,
    #[serde(default, deserialize_with = "list_without_nulls")]
    pub recommended_baits: Vec<String>,
    #[serde(default, deserialize_with = "list_without_nulls")]
    pub nearby_places: Vec<NearbyPlaceDraft>,
}

impl ExtractedPlace {
    /// Both coordinates must be present and non-zero.
    pub fn location(&self) -> Option<GeoPoint> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) if is_usable_coordinate(lat) && is_usable_coordinate(lng) => {
                Some(GeoPoint::new(lat, lng))
            }
            _ => None,
        }
    }
}

fn is_usable_coordinate(value: f64) -> bool {
    value.is_finite() && value != 0.0
}

fn serialize_ewkt<S>(location: &Option<GeoPoint>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match location {
        Some(point) => serializer.serialize_str(&point.to_ewkt()),
        None => serializer.serialize_none(),
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn extracted_place_type<'de, D>(deserializer: D) -> Result<PlaceType, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    Ok(match raw.trim().to_ascii_uppercase().as_str() {
        "CAMPING" => PlaceType::Camping,
        _ => PlaceType::Fishing,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCoordinate {
    Number(f64),
    Text(String),
}

/// Numbers and numeric strings are kept; `null`, `""` and other text read as absent.
fn lenient_coordinate<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<RawCoordinate>::deserialize(deserializer)? {
        Some(RawCoordinate::Number(value)) => Some(value),
        Some(RawCoordinate::Text(text)) => text.trim().parse().ok(),
        None => None,
    })
}

fn list_without_nulls<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let items = Option::<Vec<Option<T>>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(items.into_iter().flatten().collect())
}

/// Ordered list of search seed terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCatalog {
    pub queries: Vec<String>,
}

const BUILTIN_QUERIES: &[&str] = &[
    // fishing spots
    "송정 해수욕장 낚시 포인트",
    "태안 몽산포 해변 낚시",
    "시화방조제 낚시 포인트",
    "을왕리 선녀바위 우럭 낚시",
    "궁평항 피싱피어 망둥어",
    "강릉 주문진 방파제 낚시",
    "부산 기장 갯바위 낚시",
    "여수 돌산도 감성돔",
    "제주 서귀포 낚시 포인트",
    "대천해수욕장 낚시",
    // campsites
    "가평 자라섬 캠핑장",
    "태안 몽산포 캠핑",
    "강릉 경포대 오토캠핑",
    "속초 영랑호 캠핑",
    "양양 서피비치 캠핑",
];

impl QueryCatalog {
    pub fn builtin() -> Self {
        Self {
            queries: BUILTIN_QUERIES.iter().map(|q| q.to_string()).collect(),
        }
    }

    pub fn limited(mut self, limit: Option<usize>) -> Self {
        if let Some(limit) = limit {
            self.queries.truncate(limit);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.queries.iter().map(String::as_str)
    }
}

impl Default for QueryCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn ewkt_puts_longitude_first() {
        let point = GeoPoint::new(36.7, 126.28);
        assert_eq!(point.to_ewkt(), "SRID=4326;POINT(126.28 36.7)");
    }

    #[test]
    fn jitter_stays_within_offset_on_both_axes() {
        let base = GeoPoint::new(36.7, 126.28);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            let p = base.jittered(&mut rng, AMENITY_JITTER_DEGREES);
            assert!((p.lat - base.lat).abs() <= AMENITY_JITTER_DEGREES + f64::EPSILON);
            assert!((p.lng - base.lng).abs() <= AMENITY_JITTER_DEGREES + f64::EPSILON);
        }
    }

    #[test]
    fn extracted_record_tolerates_nulls_and_missing_fields() {
        let record: ExtractedPlace = serde_json::from_str(
            r#"{"place_name": "몽산포 해수욕장", "address": null, "lat": null, "fish_species": null}"#,
        )
        .unwrap();
        assert_eq!(record.place_name, "몽산포 해수욕장");
        assert_eq!(record.place_type, PlaceType::Fishing);
        assert_eq!(record.address, "");
        assert!(record.fish_species.is_empty());
        assert!(record.nearby_places.is_empty());
        assert_eq!(record.location(), None);
    }

    #[test]
    fn zero_coordinates_are_not_a_location() {
        let record = ExtractedPlace {
            lat: Some(0.0),
            lng: Some(126.1),
            ..Default::default()
        };
        assert_eq!(record.location(), None);

        let record = ExtractedPlace {
            lat: Some(36.7),
            lng: Some(126.1),
            ..Default::default()
        };
        assert_eq!(record.location(), Some(GeoPoint::new(36.7, 126.1)));
    }

    #[test]
    fn empty_place_type_and_coordinates_keep_the_record() {
        let record: ExtractedPlace = serde_json::from_str(
            r#"{"place_name": "궁평항", "place_type": "", "lat": "", "lng": ""}"#,
        )
        .unwrap();
        assert_eq!(record.place_type, PlaceType::Fishing);
        assert_eq!((record.lat, record.lng), (None, None));
        assert_eq!(record.location(), None);

        let record: ExtractedPlace =
            serde_json::from_str(r#"{"place_type": "camping", "lat": "37.81", "lng": 127}"#).unwrap();
        assert_eq!(record.place_type, PlaceType::Camping);
        assert_eq!(record.location(), Some(GeoPoint::new(37.81, 127.0)));

        let record: ExtractedPlace = serde_json::from_str(r#"{"lat": "약 37도", "lng": 127.5}"#).unwrap();
        assert_eq!(record.lat, None);
        assert_eq!(record.location(), None);
    }

    #[test]
    fn amenity_is_not_a_valid_extracted_place_type() {
        let record: ExtractedPlace = serde_json::from_str(r#"{"place_type": "AMENITY"}"#).unwrap();
        assert_eq!(record.place_type, PlaceType::Fishing);
        let record: ExtractedPlace = serde_json::from_str(r#"{"place_type": "BEACH"}"#).unwrap();
        assert_eq!(record.place_type, PlaceType::Fishing);
    }

    #[test]
    fn null_list_entries_are_dropped() {
        let record: ExtractedPlace = serde_json::from_str(
            r#"{
                "fish_species": ["우럭", null, "노래미"],
                "recommended_baits": [null],
                "nearby_places": [null, {"name": "몽산포 낚시점", "type": "BAIT_SHOP"}]
            }"#,
        )
        .unwrap();
        assert_eq!(record.fish_species, vec!["우럭", "노래미"]);
        assert!(record.recommended_baits.is_empty());
        assert_eq!(record.nearby_places.len(), 1);
        assert_eq!(record.nearby_places[0].name, "몽산포 낚시점");
    }

    #[test]
    fn insert_payloads_trim_names() {
        let record = ExtractedPlace {
            place_name: " 몽산포 해수욕장 ".to_string(),
            ..Default::default()
        };
        assert_eq!(NewPlace::from_extracted(&record).name, "몽산포 해수욕장");

        let nearby = NearbyPlaceDraft {
            name: "\t몽산포 낚시점 ".to_string(),
            ..Default::default()
        };
        assert_eq!(NewPlace::amenity(&nearby, None).name, "몽산포 낚시점");
    }

    #[test]
    fn unknown_nearby_type_becomes_generic_amenity() {
        let nearby: NearbyPlaceDraft =
            serde_json::from_str(r#"{"name": "몽산포 민박", "type": "LODGING"}"#).unwrap();
        assert_eq!(nearby.kind, Some(NearbyKind::Other));
        assert_eq!(nearby.description(), GENERIC_AMENITY_LABEL);

        let nearby: NearbyPlaceDraft =
            serde_json::from_str(r#"{"name": "몽산포 낚시점", "type": "BAIT_SHOP"}"#).unwrap();
        assert_eq!(nearby.description(), "BAIT_SHOP");
        assert_eq!(nearby.address, "");
    }

    #[test]
    fn new_place_serializes_type_and_ewkt_location() {
        let place = NewPlace {
            name: "몽산포 낚시점".into(),
            place_type: PlaceType::Amenity,
            address: String::new(),
            description: "BAIT_SHOP".into(),
            location: Some(GeoPoint::new(36.7, 126.28)),
        };
        let json = serde_json::to_value(&place).unwrap();
        assert_eq!(json["type"], "AMENITY");
        assert_eq!(json["location"], "SRID=4326;POINT(126.28 36.7)");

        let unplaced = NewPlace {
            location: None,
            ..place
        };
        let json = serde_json::to_value(&unplaced).unwrap();
        assert!(json.get("location").is_none());
    }

    #[test]
    fn first_sighting_species_is_saltwater_all_year() {
        let species = NewFishSpecies::first_sighting("우럭");
        assert_eq!(species.habitat, Habitat::Saltwater);
        assert_eq!(species.active_months.len(), 12);
        assert_eq!(species.active_months.iter().next(), Some(&1));
        assert_eq!(species.active_months.iter().last(), Some(&12));
    }

    #[test]
    fn builtin_catalog_can_be_limited() {
        let catalog = QueryCatalog::builtin();
        assert_eq!(catalog.len(), 15);
        assert_eq!(catalog.iter().nth(1), Some("태안 몽산포 해변 낚시"));
        assert_eq!(QueryCatalog::builtin().limited(Some(2)).len(), 2);
        assert_eq!(QueryCatalog::builtin().limited(None).len(), 15);
    }
}
