//! A GTFS schedule cache: ingest zipped transit feeds into a durable
//! relational store, then answer stop/route/agency lookups and generate
//! time-windowed, realtime-fusable arrival streams.
//!
//! The out-of-scope HTTP server, CLI wiring, and provider URL strings are
//! external collaborators; this crate exposes [`Provider`] as the
//! composition root those layers drive.

pub mod arrivals;
pub mod config;
pub mod csv_reader;
pub mod entities;
pub mod error;
pub mod http_client;
pub mod query;
pub mod store;
pub mod time;

use std::time::Duration;

use chrono::DateTime;
use chrono_tz::Tz;

use arrivals::{realtime::RealtimeArrivalIter, scheduled::ScheduledArrivalIter, RealtimeGenerator, ScheduledGenerator};
use entities::{fetch_agency, fetch_route, fetch_stop, Agency, EntityType, Route, Stop};
use error::{Error, Result};
use http_client::HttpClient;
use query::Queryable;
use store::FeedStore;
use time::default_window_end;

/// A single loaded feed plus optional realtime overlay — the composition
/// root named in spec.md §9: provider-specific behavior is a plug value
/// (the realtime generator and its URLs), not a class hierarchy.
pub struct Provider {
    store: FeedStore,
    feed_id: i64,
    timezone: Tz,
    realtime: Option<RealtimeGenerator>,
    credit: Option<String>,
    country: Option<String>,
    polling_interval: Option<Duration>,
}

/// The entity an `id` lookup resolved to, matching `get(EntityType, id)`
/// from spec.md §6.
#[derive(Debug, Clone)]
pub enum AnyEntity {
    Agency(Agency),
    Stop(Stop),
    Route(Route),
}

/// Unifies the two concrete arrival iterator types behind one `Iterator`.
pub enum ArrivalIter {
    Scheduled(ScheduledArrivalIter),
    Realtime(RealtimeArrivalIter),
}

impl Iterator for ArrivalIter {
    type Item = entities::Arrival;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            ArrivalIter::Scheduled(iter) => iter.next(),
            ArrivalIter::Realtime(iter) => iter.next(),
        }
    }
}

impl Provider {
    /// Connect to the feed store and ingest `feed_url`, returning a
    /// schedule-only provider. Chain [`Provider::with_realtime`] to add
    /// realtime capability.
    pub async fn load(store_url: &str, feed_url: &str, http: &HttpClient, timezone: Tz) -> Result<Self> {
        let store = FeedStore::connect(store_url).await?;
        let feed_id = store.load_feed(feed_url, http).await?;
        Ok(Self {
            store,
            feed_id,
            timezone,
            realtime: None,
            credit: None,
            country: None,
            polling_interval: None,
        })
    }

    pub fn with_metadata(mut self, credit: Option<String>, country: Option<String>, polling_interval: Option<Duration>) -> Self {
        self.credit = credit;
        self.country = country;
        self.polling_interval = polling_interval;
        self
    }

    /// Attach realtime capability: `by_route_url`/`by_stop_url` are URL
    /// templates with `{route_id}`/`{stop_id}` placeholders.
    pub fn with_realtime(mut self, by_route_url: String, by_stop_url: String, http: HttpClient) -> Self {
        let generator = RealtimeGenerator::new(self.scheduled_generator(), http, by_route_url, by_stop_url);
        self.realtime = Some(generator);
        self
    }

    pub fn feed_id(&self) -> i64 {
        self.feed_id
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn credit(&self) -> Option<&str> {
        self.credit.as_deref()
    }

    pub fn country(&self) -> Option<&str> {
        self.country.as_deref()
    }

    pub fn polling_interval(&self) -> Option<Duration> {
        self.polling_interval
    }

    fn scheduled_generator(&self) -> ScheduledGenerator {
        ScheduledGenerator::new(self.store.clone(), self.feed_id, self.timezone)
    }

    pub async fn agencies(&self) -> Result<Queryable<Agency>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT agency_id FROM agency WHERE _feed = ?1")
            .bind(self.feed_id)
            .fetch_all(self.store.pool())
            .await?;
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(agency) = fetch_agency(&self.store, self.feed_id, &id).await? {
                items.push(agency);
            }
        }
        Ok(Queryable::new(items))
    }

    pub async fn stops(&self) -> Result<Queryable<Stop>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT stop_id FROM stops WHERE _feed = ?1")
            .bind(self.feed_id)
            .fetch_all(self.store.pool())
            .await?;
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(stop) = fetch_stop(&self.store, self.feed_id, &id).await? {
                items.push(stop);
            }
        }
        Ok(Queryable::new(items))
    }

    pub async fn routes(&self) -> Result<Queryable<Route>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT route_id FROM routes WHERE _feed = ?1")
            .bind(self.feed_id)
            .fetch_all(self.store.pool())
            .await?;
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(route) = fetch_route(&self.store, self.feed_id, &id).await? {
                items.push(route);
            }
        }
        Ok(Queryable::new(items))
    }

    /// `get(EntityType, id) -> Entity | null` (spec.md §6). Arrivals are
    /// derived, not persisted, so they have no stable id to look up by;
    /// requesting `EntityType::Arrival` is a caller error.
    pub async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<AnyEntity>> {
        match entity_type {
            EntityType::Agency => Ok(fetch_agency(&self.store, self.feed_id, id).await?.map(AnyEntity::Agency)),
            EntityType::Stop => Ok(fetch_stop(&self.store, self.feed_id, id).await?.map(AnyEntity::Stop)),
            EntityType::Route => Ok(fetch_route(&self.store, self.feed_id, id).await?.map(AnyEntity::Route)),
            EntityType::Arrival => Err(Error::InvalidQuery(
                "arrivals are derived and have no stable id to look up by".into(),
            )),
        }
    }

    /// Generate arrivals for `(stops?, routes?, start?, end?)`, selecting the
    /// scheduled or realtime generator per spec.md §4.7's cross-generator
    /// selection rule.
    pub async fn arrivals(
        &self,
        stops: Option<Vec<String>>,
        routes: Option<Vec<String>>,
        start: Option<DateTime<Tz>>,
        end: Option<DateTime<Tz>>,
        realtime: Option<bool>,
    ) -> Result<ArrivalIter> {
        let start = start.unwrap_or_else(|| chrono::Utc::now().with_timezone(&self.timezone));
        let end = end.unwrap_or_else(|| default_window_end(&start));

        let use_realtime = realtime.unwrap_or_else(|| self.realtime.is_some());

        if use_realtime {
            let generator = self.realtime.as_ref().ok_or_else(|| {
                Error::InvalidQuery("realtime requested but this provider has no realtime capability".into())
            })?;
            let iter = generator.arrivals(stops, routes, start, end).await?;
            Ok(ArrivalIter::Realtime(iter))
        } else {
            let generator = self.scheduled_generator();
            let iter = generator.arrivals(stops, routes, start, end).await?;
            Ok(ArrivalIter::Scheduled(iter))
        }
    }
}
