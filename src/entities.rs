//! Entity Layer (spec.md §4.4): value records with eager and lazy fields.
//!
//! Lazy cross-references are modeled as an explicit `LazyRef<T>` rather than
//! graph pointers, so cyclic relationships (Stop.parent ↔ children,
//! Route.agency) never require materializing the whole graph at load time —
//! recast per spec.md §9's design note on lazy-property mixins.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use sqlx::Row;
use tokio::sync::OnceCell;

use crate::error::Result;
use crate::store::FeedStore;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The canonical public type of an entity, ignoring provider-specific
/// subtypes — used to key indexes and dispatch (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    Agency,
    Stop,
    Route,
    Arrival,
}

/// A single attribute value in an entity's read-only mapping view.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// A lazy cross-reference with atomic "once" resolution semantics: the first
/// `.get()` runs the resolver against the Feed Store; later calls replay the
/// memoized value.
pub struct LazyRef<T> {
    cache: Arc<OnceCell<Option<T>>>,
    resolver: Arc<dyn Fn() -> BoxFuture<Option<T>> + Send + Sync>,
}

impl<T: Clone + Send + Sync + 'static> LazyRef<T> {
    pub fn new<F>(resolver: F) -> Self
    where
        F: Fn() -> BoxFuture<Option<T>> + Send + Sync + 'static,
    {
        Self {
            cache: Arc::new(OnceCell::new()),
            resolver: Arc::new(resolver),
        }
    }

    /// A reference that resolves to nothing, for optional ids absent on the row.
    pub fn absent() -> Self {
        Self::new(|| Box::pin(async { None }))
    }

    /// Resolve (once) and return a clone of the cached value. A failed
    /// resolution yields `None`, never an error (spec.md §4.4).
    pub async fn get(&self) -> Option<T> {
        self.cache
            .get_or_init(|| (self.resolver)())
            .await
            .clone()
    }
}

impl<T> Clone for LazyRef<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

impl<T> std::fmt::Debug for LazyRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyRef")
            .field("resolved", &self.cache.initialized())
            .finish()
    }
}

/// Bikes-allowed tri-state (GTFS `bikes_allowed`: 1 = yes, 2 = no, else unknown).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BikesAllowed {
    Unknown,
    Yes,
    No,
}

impl From<Option<i64>> for BikesAllowed {
    fn from(value: Option<i64>) -> Self {
        match value {
            Some(1) => BikesAllowed::Yes,
            Some(2) => BikesAllowed::No,
            _ => BikesAllowed::Unknown,
        }
    }
}

/// Common behavior of a value-typed record backed by a feed row.
pub trait Entity {
    fn entity_type(&self) -> EntityType;
    fn feed_id(&self) -> i64;
    fn id(&self) -> &str;
    /// Non-null eager attributes plus a synthetic `provider` key, used by
    /// JSON serialization and query-by-attribute.
    fn attributes(&self) -> BTreeMap<String, AttributeValue>;
}

#[derive(Debug, Clone)]
pub struct Agency {
    pub feed_id: i64,
    pub id: String,
    pub name: Option<String>,
    pub url: Option<String>,
    pub timezone: Option<String>,
    pub language: Option<String>,
    pub phone: Option<String>,
    pub fare_url: Option<String>,
}

impl Agency {
    /// Best-effort E.164 rendering when the agency's language hints at a
    /// known country code. Not a general phone-number validator.
    pub fn phone_e164(&self) -> Option<String> {
        let phone = self.phone.as_deref()?;
        let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return None;
        }
        let country_code = match self.language.as_deref() {
            Some("en-US") | Some("en") => "1",
            Some("fr") => "33",
            Some("de") => "49",
            Some("en-GB") => "44",
            _ => return None,
        };
        Some(format!("+{country_code}{digits}"))
    }
}

impl PartialEq for Agency {
    fn eq(&self, other: &Self) -> bool {
        self.feed_id == other.feed_id && self.id == other.id
    }
}

impl Entity for Agency {
    fn entity_type(&self) -> EntityType {
        EntityType::Agency
    }
    fn feed_id(&self) -> i64 {
        self.feed_id
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn attributes(&self) -> BTreeMap<String, AttributeValue> {
        let mut map = BTreeMap::new();
        map.insert("provider".into(), AttributeValue::Int(self.feed_id));
        map.insert("id".into(), AttributeValue::Text(self.id.clone()));
        insert_opt_text(&mut map, "name", &self.name);
        insert_opt_text(&mut map, "url", &self.url);
        insert_opt_text(&mut map, "timezone", &self.timezone);
        insert_opt_text(&mut map, "language", &self.language);
        insert_opt_text(&mut map, "phone", &self.phone);
        insert_opt_text(&mut map, "fare_url", &self.fare_url);
        map
    }
}

#[derive(Clone)]
pub struct Stop {
    pub feed_id: i64,
    pub id: String,
    pub code: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub zone: Option<String>,
    pub url: Option<String>,
    pub parent: LazyRef<Stop>,
    pub children: LazyRef<Vec<Stop>>,
    /// Falls back to any agency's timezone in the same feed when unset.
    pub timezone: Option<String>,
    pub wheelchair_boarding: Option<i64>,
}

impl std::fmt::Debug for Stop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stop")
            .field("feed_id", &self.feed_id)
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Stop {
    fn eq(&self, other: &Self) -> bool {
        self.feed_id == other.feed_id && self.id == other.id
    }
}

impl Entity for Stop {
    fn entity_type(&self) -> EntityType {
        EntityType::Stop
    }
    fn feed_id(&self) -> i64 {
        self.feed_id
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn attributes(&self) -> BTreeMap<String, AttributeValue> {
        let mut map = BTreeMap::new();
        map.insert("provider".into(), AttributeValue::Int(self.feed_id));
        map.insert("id".into(), AttributeValue::Text(self.id.clone()));
        insert_opt_text(&mut map, "code", &self.code);
        insert_opt_text(&mut map, "name", &self.name);
        insert_opt_text(&mut map, "description", &self.description);
        if let Some(v) = self.latitude {
            map.insert("latitude".into(), AttributeValue::Float(v));
        }
        if let Some(v) = self.longitude {
            map.insert("longitude".into(), AttributeValue::Float(v));
        }
        insert_opt_text(&mut map, "zone", &self.zone);
        insert_opt_text(&mut map, "url", &self.url);
        insert_opt_text(&mut map, "timezone", &self.timezone);
        if let Some(v) = self.wheelchair_boarding {
            map.insert("wheelchair_boarding".into(), AttributeValue::Int(v));
        }
        map
    }
}

#[derive(Clone)]
pub struct Route {
    pub feed_id: i64,
    pub id: String,
    pub agency: LazyRef<Agency>,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub description: Option<String>,
    pub route_type: Option<i64>,
    pub url: Option<String>,
    pub color: Option<String>,
    pub text_color: Option<String>,
}

impl Route {
    /// If `name` is absent, fall back to `short_name` (spec.md §3 invariant).
    pub fn name(&self) -> Option<&str> {
        self.long_name.as_deref().or(self.short_name.as_deref())
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("feed_id", &self.feed_id)
            .field("id", &self.id)
            .field("short_name", &self.short_name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.feed_id == other.feed_id && self.id == other.id
    }
}

impl Entity for Route {
    fn entity_type(&self) -> EntityType {
        EntityType::Route
    }
    fn feed_id(&self) -> i64 {
        self.feed_id
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn attributes(&self) -> BTreeMap<String, AttributeValue> {
        let mut map = BTreeMap::new();
        map.insert("provider".into(), AttributeValue::Int(self.feed_id));
        map.insert("id".into(), AttributeValue::Text(self.id.clone()));
        insert_opt_text(&mut map, "short_name", &self.short_name);
        if let Some(name) = self.name() {
            map.insert("name".into(), AttributeValue::Text(name.to_string()));
        }
        insert_opt_text(&mut map, "description", &self.description);
        if let Some(v) = self.route_type {
            map.insert("route_type".into(), AttributeValue::Int(v));
        }
        insert_opt_text(&mut map, "url", &self.url);
        insert_opt_text(&mut map, "color", &self.color);
        insert_opt_text(&mut map, "text_color", &self.text_color);
        map
    }
}

/// A derived, ephemeral arrival — never cached, exists only for an
/// iteration's duration (spec.md §3).
#[derive(Debug, Clone)]
pub struct Arrival {
    pub feed_id: i64,
    pub trip_id: String,
    pub stop_id: String,
    pub route_id: String,
    pub time: chrono::DateTime<chrono_tz::Tz>,
    pub departure_time: Option<chrono::DateTime<chrono_tz::Tz>>,
    pub headsign: Option<String>,
    pub short_name: Option<String>,
    pub bikes_allowed: BikesAllowed,
    pub realtime: bool,
}

impl PartialEq for Arrival {
    fn eq(&self, other: &Self) -> bool {
        self.feed_id == other.feed_id && self.trip_id == other.trip_id
    }
}

impl Entity for Arrival {
    fn entity_type(&self) -> EntityType {
        EntityType::Arrival
    }
    fn feed_id(&self) -> i64 {
        self.feed_id
    }
    fn id(&self) -> &str {
        &self.trip_id
    }
    fn attributes(&self) -> BTreeMap<String, AttributeValue> {
        let mut map = BTreeMap::new();
        map.insert("provider".into(), AttributeValue::Int(self.feed_id));
        map.insert("id".into(), AttributeValue::Text(self.trip_id.clone()));
        map.insert("stop_id".into(), AttributeValue::Text(self.stop_id.clone()));
        map.insert("route_id".into(), AttributeValue::Text(self.route_id.clone()));
        map.insert("time".into(), AttributeValue::Int(self.time.timestamp()));
        if let Some(dep) = self.departure_time {
            map.insert("departure_time".into(), AttributeValue::Int(dep.timestamp()));
        }
        insert_opt_text(&mut map, "headsign", &self.headsign);
        insert_opt_text(&mut map, "short_name", &self.short_name);
        map.insert(
            "realtime".into(),
            AttributeValue::Bool(self.realtime),
        );
        map
    }
}

fn insert_opt_text(map: &mut BTreeMap<String, AttributeValue>, key: &str, value: &Option<String>) {
    if let Some(v) = value {
        map.insert(key.to_string(), AttributeValue::Text(v.clone()));
    }
}

/// Fetch a Stop by id, wiring its `parent` and `children` lazy references.
pub async fn fetch_stop(store: &FeedStore, feed_id: i64, stop_id: &str) -> Result<Option<Stop>> {
    let row = sqlx::query(
        "SELECT stop_code, stop_name, stop_desc, stop_lat, stop_lon, zone_id, stop_url, parent_station, stop_timezone, wheelchair_boarding
         FROM stops WHERE _feed = ?1 AND stop_id = ?2",
    )
    .bind(feed_id)
    .bind(stop_id)
    .fetch_optional(store.pool())
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let parent_station: Option<String> = row.get(7);
    let parent = match parent_station.clone() {
        Some(parent_id) => {
            let store = store.clone();
            LazyRef::new(move || {
                let store = store.clone();
                let parent_id = parent_id.clone();
                Box::pin(async move { fetch_stop(&store, feed_id, &parent_id).await.ok().flatten() })
            })
        }
        None => LazyRef::absent(),
    };

    let children = {
        let store = store.clone();
        let stop_id = stop_id.to_string();
        LazyRef::new(move || {
            let store = store.clone();
            let stop_id = stop_id.clone();
            Box::pin(async move { fetch_children(&store, feed_id, &stop_id).await.ok() })
        })
    };

    let stop_timezone: Option<String> = row.get(8);
    let timezone = match stop_timezone {
        Some(tz) => Some(tz),
        None => any_agency_timezone(store, feed_id).await?,
    };

    Ok(Some(Stop {
        feed_id,
        id: stop_id.to_string(),
        code: row.get(0),
        name: row.get(1),
        description: row.get(2),
        latitude: row.get(3),
        longitude: row.get(4),
        zone: row.get(5),
        url: row.get(6),
        parent,
        children,
        timezone,
        wheelchair_boarding: row.get(9),
    }))
}

/// The set of stops whose `parent_station` equals `stop_id` — a Stop's
/// `children` is derived, never stored (spec.md §3).
pub async fn fetch_children(store: &FeedStore, feed_id: i64, stop_id: &str) -> Result<Vec<Stop>> {
    let ids: Vec<String> = sqlx::query("SELECT stop_id FROM stops WHERE _feed = ?1 AND parent_station = ?2")
        .bind(feed_id)
        .bind(stop_id)
        .fetch_all(store.pool())
        .await?
        .into_iter()
        .map(|r| r.get(0))
        .collect();

    let mut children = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(stop) = fetch_stop(store, feed_id, &id).await? {
            children.push(stop);
        }
    }
    Ok(children)
}

/// Fetch an Agency by id.
pub async fn fetch_agency(store: &FeedStore, feed_id: i64, agency_id: &str) -> Result<Option<Agency>> {
    let row = sqlx::query(
        "SELECT agency_name, agency_url, agency_timezone, agency_lang, agency_phone, agency_fare_url
         FROM agency WHERE _feed = ?1 AND agency_id = ?2",
    )
    .bind(feed_id)
    .bind(agency_id)
    .fetch_optional(store.pool())
    .await?;

    Ok(row.map(|row| Agency {
        feed_id,
        id: agency_id.to_string(),
        name: row.get(0),
        url: row.get(1),
        timezone: row.get(2),
        language: row.get(3),
        phone: row.get(4),
        fare_url: row.get(5),
    }))
}

/// Any agency's timezone in the feed, used as a Stop's timezone fallback.
pub async fn any_agency_timezone(store: &FeedStore, feed_id: i64) -> Result<Option<String>> {
    let row = sqlx::query("SELECT agency_timezone FROM agency WHERE _feed = ?1 AND agency_timezone IS NOT NULL LIMIT 1")
        .bind(feed_id)
        .fetch_optional(store.pool())
        .await?;
    Ok(row.map(|r| r.get(0)))
}

/// Fetch a Route by id, wiring its `agency` lazy reference.
pub async fn fetch_route(store: &FeedStore, feed_id: i64, route_id: &str) -> Result<Option<Route>> {
    let row = sqlx::query(
        "SELECT agency_id, route_short_name, route_long_name, route_desc, route_type, route_url, route_color, route_text_color
         FROM routes WHERE _feed = ?1 AND route_id = ?2",
    )
    .bind(feed_id)
    .bind(route_id)
    .fetch_optional(store.pool())
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let agency_id: Option<String> = row.get(0);
    let agency = match agency_id {
        Some(agency_id) => {
            let store = store.clone();
            LazyRef::new(move || {
                let store = store.clone();
                let agency_id = agency_id.clone();
                Box::pin(async move { fetch_agency(&store, feed_id, &agency_id).await.ok().flatten() })
            })
        }
        None => LazyRef::absent(),
    };

    Ok(Some(Route {
        feed_id,
        id: route_id.to_string(),
        agency,
        short_name: row.get(1),
        long_name: row.get(2),
        description: row.get(3),
        route_type: row.get(4),
        url: row.get(5),
        color: row.get(6),
        text_color: row.get(7),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_name_falls_back_to_short_name() {
        let route = Route {
            feed_id: 1,
            id: "R1".into(),
            agency: LazyRef::absent(),
            short_name: Some("10".into()),
            long_name: None,
            description: None,
            route_type: Some(3),
            url: None,
            color: None,
            text_color: None,
        };
        assert_eq!(route.name(), Some("10"));
    }

    #[test]
    fn bikes_allowed_tri_state() {
        assert_eq!(BikesAllowed::from(Some(1)), BikesAllowed::Yes);
        assert_eq!(BikesAllowed::from(Some(2)), BikesAllowed::No);
        assert_eq!(BikesAllowed::from(None), BikesAllowed::Unknown);
        assert_eq!(BikesAllowed::from(Some(0)), BikesAllowed::Unknown);
    }

    #[test]
    fn agency_phone_e164_best_effort() {
        let agency = Agency {
            feed_id: 1,
            id: "DTA".into(),
            name: Some("Demo Transit".into()),
            url: None,
            timezone: Some("America/Los_Angeles".into()),
            language: Some("en".into()),
            phone: Some("(555) 123-4567".into()),
            fare_url: None,
        };
        assert_eq!(agency.phone_e164(), Some("+15551234567".into()));
    }

    #[test]
    fn entity_attributes_include_synthetic_provider_key() {
        let agency = Agency {
            feed_id: 7,
            id: "DTA".into(),
            name: Some("Demo Transit".into()),
            url: None,
            timezone: None,
            language: None,
            phone: None,
            fare_url: None,
        };
        let attrs = agency.attributes();
        assert_eq!(attrs.get("provider"), Some(&AttributeValue::Int(7)));
        assert!(!attrs.contains_key("url"));
    }

    #[tokio::test]
    async fn fetch_stop_falls_back_to_agency_timezone() {
        let store = FeedStore::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "INSERT INTO agency (_feed, agency_id, agency_name, agency_timezone) VALUES (1, 'DTA', 'Demo Transit', 'America/Los_Angeles')",
        )
        .execute(store.pool())
        .await
        .unwrap();
        sqlx::query("INSERT INTO stops (_feed, stop_id, stop_name) VALUES (1, 'S1', 'Stop One')")
            .execute(store.pool())
            .await
            .unwrap();

        let stop = fetch_stop(&store, 1, "S1").await.unwrap().unwrap();
        assert_eq!(stop.timezone, Some("America/Los_Angeles".into()));
    }

    #[tokio::test]
    async fn lazy_ref_resolves_once() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let lazy: LazyRef<i32> = LazyRef::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Some(42) })
        });
        assert_eq!(lazy.get().await, Some(42));
        assert_eq!(lazy.get().await, Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
