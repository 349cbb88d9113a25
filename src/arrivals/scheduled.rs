//! Scheduled Arrival Generator (spec.md §4.6): per-(stop,route) SQL scan,
//! per-row expansion across service-valid days and frequency windows, merged
//! by a stable k-way min-heap keyed on time with insertion-order tie-break.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration};
use chrono_tz::Tz;
use sqlx::Row;

use crate::entities::{fetch_children, fetch_stop, Arrival, BikesAllowed};
use crate::error::{Error, Result};
use crate::store::FeedStore;
use crate::time::{expand_days, noon_of, Service};

/// Generates scheduled arrivals for a normalized (stops, routes, window).
#[derive(Clone)]
pub struct ScheduledGenerator {
    store: FeedStore,
    feed_id: i64,
    timezone: Tz,
}

struct TripRow {
    trip_id: String,
    service_id: String,
    headsign: Option<String>,
    short_name: Option<String>,
    bikes_allowed: BikesAllowed,
    min_arrival_time: Option<i32>,
    arrival: i32,
    departure: Option<i32>,
}

struct FrequencyRow {
    start_time: i32,
    end_time: i32,
    headway_secs: i32,
}

impl ScheduledGenerator {
    pub fn new(store: FeedStore, feed_id: i64, timezone: Tz) -> Self {
        Self {
            store,
            feed_id,
            timezone,
        }
    }

    /// Normalize stops/routes per spec.md §4.6 input-normalization rules,
    /// then run the per-(stop,route) scan and expansion, returning an
    /// iterator already in its Draining state.
    pub async fn arrivals(
        &self,
        stops: Option<Vec<String>>,
        routes: Option<Vec<String>>,
        start: DateTime<Tz>,
        end: DateTime<Tz>,
    ) -> Result<ScheduledArrivalIter> {
        let (stops, routes) = self.normalize_inputs(stops, routes).await?;
        let pairs = self.relevant_pairs(&stops, &routes).await?;

        let mut services: HashMap<String, Service> = HashMap::new();
        let mut frequencies_cache: HashMap<String, Vec<FrequencyRow>> = HashMap::new();
        let mut sequenced: Vec<(i64, u64, Arrival)> = Vec::new();
        let mut seq: u64 = 0;

        for (stop_id, route_id) in pairs {
            let trip_rows = self.scan_pair(&stop_id, &route_id).await?;
            for trip in trip_rows {
                if !services.contains_key(&trip.service_id) {
                    let service = self.load_service(&trip.service_id).await?;
                    services.insert(trip.service_id.clone(), service);
                }
                let service = &services[&trip.service_id];

                if !frequencies_cache.contains_key(&trip.trip_id) {
                    let freqs = self.load_frequencies(&trip.trip_id).await?;
                    frequencies_cache.insert(trip.trip_id.clone(), freqs);
                }
                let frequencies = &frequencies_cache[&trip.trip_id];

                for day in expand_days(&start, &end) {
                    if !service.is_valid_on(day) {
                        continue;
                    }
                    let Some(noon) = noon_of(day, &self.timezone) else {
                        continue;
                    };

                    if frequencies.is_empty() {
                        let time = noon + ChronoDuration::seconds(trip.arrival as i64);
                        if time >= start && time <= end {
                            let departure = trip
                                .departure
                                .map(|d| noon + ChronoDuration::seconds(d as i64));
                            sequenced.push((
                                time.timestamp(),
                                seq,
                                self.build_arrival(&trip, &route_id, &stop_id, time, departure, false),
                            ));
                            seq += 1;
                        }
                        continue;
                    }

                    for freq in frequencies {
                        let freq_start_abs = noon + ChronoDuration::seconds(freq.start_time as i64);
                        let freq_end_abs = noon + ChronoDuration::seconds(freq.end_time as i64);
                        let min_arrival = trip.min_arrival_time.unwrap_or(trip.arrival);
                        let rel = freq.start_time - min_arrival;

                        let mut offset = 0i64;
                        loop {
                            let candidate_abs =
                                freq_start_abs + ChronoDuration::seconds(offset);
                            if candidate_abs > freq_end_abs {
                                break;
                            }
                            let time = noon
                                + ChronoDuration::seconds(trip.arrival as i64 + offset + rel as i64);
                            if time >= start && time <= end {
                                let departure = trip.departure.map(|d| {
                                    noon + ChronoDuration::seconds(d as i64 + offset + rel as i64)
                                });
                                sequenced.push((
                                    time.timestamp(),
                                    seq,
                                    self.build_arrival(&trip, &route_id, &stop_id, time, departure, false),
                                ));
                                seq += 1;
                            }
                            offset += freq.headway_secs as i64;
                        }
                    }
                }
            }
        }

        sequenced.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        let heap = sequenced
            .into_iter()
            .map(|(time, seq, arrival)| HeapEntry { time, seq, arrival })
            .collect::<BinaryHeap<_>>();

        Ok(ScheduledArrivalIter {
            heap,
            state: IterState::Draining,
        })
    }

    fn build_arrival(
        &self,
        trip: &TripRow,
        route_id: &str,
        stop_id: &str,
        time: DateTime<Tz>,
        departure_time: Option<DateTime<Tz>>,
        realtime: bool,
    ) -> Arrival {
        Arrival {
            feed_id: self.feed_id,
            trip_id: trip.trip_id.clone(),
            stop_id: stop_id.to_string(),
            route_id: route_id.to_string(),
            time,
            departure_time,
            headsign: trip.headsign.clone(),
            short_name: trip.short_name.clone(),
            bikes_allowed: trip.bikes_allowed,
            realtime,
        }
    }

    pub(crate) async fn normalize_inputs(
        &self,
        stops: Option<Vec<String>>,
        routes: Option<Vec<String>>,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let stops = match stops {
            Some(ids) => self.add_children(ids).await?,
            None => Vec::new(),
        };

        match (stops.is_empty(), routes) {
            (true, None) => {
                let all_stops = self.all_stop_ids().await?;
                let all_routes = self.all_route_ids().await?;
                let all_stops = self.add_children(all_stops).await?;
                Ok((all_stops, all_routes))
            }
            (false, None) => {
                let routes = self.routes_for_stops(&stops).await?;
                Ok((stops, routes))
            }
            (true, Some(routes)) => {
                let stops = self.stops_for_routes(&routes).await?;
                let stops = self.add_children(stops).await?;
                Ok((stops, routes))
            }
            (false, Some(routes)) => Ok((stops, routes)),
        }
    }

    /// BFS expanding each stop id to include all descendants under the
    /// parent relation, deduplicated by id (spec.md §4.6).
    async fn add_children(&self, seed: Vec<String>) -> Result<Vec<String>> {
        let mut seen: HashSet<String> = seed.iter().cloned().collect();
        let mut out: Vec<String> = seed.clone();
        let mut frontier = seed;

        while !frontier.is_empty() {
            let mut next_frontier = Vec::new();
            for stop_id in frontier {
                let children = fetch_children(&self.store, self.feed_id, &stop_id).await?;
                for child in children {
                    if seen.insert(child.id.clone()) {
                        out.push(child.id.clone());
                        next_frontier.push(child.id);
                    }
                }
            }
            frontier = next_frontier;
        }
        Ok(out)
    }

    async fn all_stop_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT stop_id FROM stops WHERE _feed = ?1")
            .bind(self.feed_id)
            .fetch_all(self.store.pool())
            .await?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    async fn all_route_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT route_id FROM routes WHERE _feed = ?1")
            .bind(self.feed_id)
            .fetch_all(self.store.pool())
            .await?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    async fn routes_for_stops(&self, stops: &[String]) -> Result<Vec<String>> {
        let placeholders = placeholder_list(stops.len());
        let sql = format!(
            "SELECT DISTINCT route_id FROM _stops_routes WHERE _feed = ? AND stop_id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(self.feed_id);
        for stop_id in stops {
            query = query.bind(stop_id);
        }
        Ok(query
            .fetch_all(self.store.pool())
            .await?
            .into_iter()
            .map(|r| r.get(0))
            .collect())
    }

    async fn stops_for_routes(&self, routes: &[String]) -> Result<Vec<String>> {
        let placeholders = placeholder_list(routes.len());
        let sql = format!(
            "SELECT DISTINCT stop_id FROM _stops_routes WHERE _feed = ? AND route_id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(self.feed_id);
        for route_id in routes {
            query = query.bind(route_id);
        }
        Ok(query
            .fetch_all(self.store.pool())
            .await?
            .into_iter()
            .map(|r| r.get(0))
            .collect())
    }

    /// The (stop, route) pairs actually worth scanning — derived from the
    /// stops×routes reverse index rather than a naive cartesian product.
    pub(crate) async fn relevant_pairs(&self, stops: &[String], routes: &[String]) -> Result<Vec<(String, String)>> {
        if stops.is_empty() || routes.is_empty() {
            return Ok(Vec::new());
        }
        let stop_placeholders = placeholder_list(stops.len());
        let route_placeholders = placeholder_list(routes.len());
        let sql = format!(
            "SELECT DISTINCT stop_id, route_id FROM _stops_routes
             WHERE _feed = ? AND stop_id IN ({stop_placeholders}) AND route_id IN ({route_placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(self.feed_id);
        for stop_id in stops {
            query = query.bind(stop_id);
        }
        for route_id in routes {
            query = query.bind(route_id);
        }
        Ok(query
            .fetch_all(self.store.pool())
            .await?
            .into_iter()
            .map(|r| (r.get(0), r.get(1)))
            .collect())
    }

    async fn scan_pair(&self, stop_id: &str, route_id: &str) -> Result<Vec<TripRow>> {
        let rows = sqlx::query(
            "SELECT t.trip_id, t.service_id, t.trip_headsign, t.trip_short_name, t.bikes_allowed, t._min_arrival_time,
                    COALESCE(st.arrival_time, st._arrival_interpolate) AS arrival, st.departure_time
             FROM stop_times st
             JOIN trips t ON t._feed = st._feed AND t.trip_id = st.trip_id
             WHERE st._feed = ?1 AND st.stop_id = ?2 AND t.route_id = ?3
             ORDER BY arrival ASC",
        )
        .bind(self.feed_id)
        .bind(stop_id)
        .bind(route_id)
        .fetch_all(self.store.pool())
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let arrival: Option<i32> = row.get(6);
                arrival.map(|arrival| TripRow {
                    trip_id: row.get(0),
                    service_id: row.get(1),
                    headsign: row.get(2),
                    short_name: row.get(3),
                    bikes_allowed: BikesAllowed::from(row.get::<Option<i64>, _>(4)),
                    min_arrival_time: row.get(5),
                    arrival,
                    departure: row.get(7),
                })
            })
            .collect())
    }

    async fn load_service(&self, service_id: &str) -> Result<Service> {
        let calendar_row = sqlx::query(
            "SELECT monday, tuesday, wednesday, thursday, friday, saturday, sunday, start_date, end_date
             FROM calendar WHERE _feed = ?1 AND service_id = ?2",
        )
        .bind(self.feed_id)
        .bind(service_id)
        .fetch_optional(self.store.pool())
        .await?;

        let range = match &calendar_row {
            Some(row) => {
                let start: String = row.get(7);
                let end: String = row.get(8);
                Some((parse_sql_date(&start)?, parse_sql_date(&end)?))
            }
            None => None,
        };
        let weekdays = match &calendar_row {
            Some(row) => {
                let mut mask = [false; 7];
                for (i, mask_slot) in mask.iter_mut().enumerate() {
                    *mask_slot = row.get::<i64, _>(i as usize) != 0;
                }
                mask
            }
            None => [false; 7],
        };

        let exception_rows = sqlx::query(
            "SELECT date, exception_type FROM calendar_dates WHERE _feed = ?1 AND service_id = ?2",
        )
        .bind(self.feed_id)
        .bind(service_id)
        .fetch_all(self.store.pool())
        .await?;

        let mut added_dates = HashSet::new();
        let mut removed_dates = HashSet::new();
        for row in exception_rows {
            let date: String = row.get(0);
            let exception_type: i64 = row.get(1);
            let date = parse_sql_date(&date)?;
            match exception_type {
                1 => {
                    added_dates.insert(date);
                }
                2 => {
                    removed_dates.insert(date);
                }
                _ => {}
            }
        }

        Ok(Service {
            service_id: service_id.to_string(),
            range,
            weekdays,
            added_dates,
            removed_dates,
        })
    }

    async fn load_frequencies(&self, trip_id: &str) -> Result<Vec<FrequencyRow>> {
        let rows = sqlx::query(
            "SELECT start_time, end_time, headway_secs FROM frequencies WHERE _feed = ?1 AND trip_id = ?2",
        )
        .bind(self.feed_id)
        .bind(trip_id)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| FrequencyRow {
                start_time: r.get(0),
                end_time: r.get(1),
                headway_secs: r.get(2),
            })
            .collect())
    }

    /// Resolve a trip actually serving (`stop_id`) in the schedule, used by
    /// the realtime by-stop strategy to drop mismatched predictions.
    pub async fn trip_serves_stop(&self, trip_id: &str, stop_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM stop_times WHERE _feed = ?1 AND trip_id = ?2 AND stop_id = ?3 LIMIT 1",
        )
        .bind(self.feed_id)
        .bind(trip_id)
        .bind(stop_id)
        .fetch_optional(self.store.pool())
        .await?;
        Ok(row.is_some())
    }

    pub async fn stop_exists(&self, stop_id: &str) -> Result<bool> {
        Ok(fetch_stop(&self.store, self.feed_id, stop_id).await?.is_some())
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn feed_id(&self) -> i64 {
        self.feed_id
    }

    pub fn store(&self) -> &FeedStore {
        &self.store
    }
}

fn placeholder_list(count: usize) -> String {
    std::iter::repeat("?").take(count).collect::<Vec<_>>().join(", ")
}

fn parse_sql_date(s: &str) -> Result<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| Error::InternalInvariant(format!("stored date {s} is unparsable: {e}")))
}

struct HeapEntry {
    time: i64,
    seq: u64,
    arrival: Arrival,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest (time, seq) pops first.
        other.time.cmp(&self.time).then(other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterState {
    Draining,
    Exhausted,
}

/// Scheduled arrival stream. Building runs eagerly inside
/// `ScheduledGenerator::arrivals`; this type only models Draining/Exhausted
/// (spec.md §4.6's state machine, minus the async Fresh→Building edge which
/// cannot be expressed by a synchronous `Iterator`).
pub struct ScheduledArrivalIter {
    heap: BinaryHeap<HeapEntry>,
    state: IterState,
}

impl Iterator for ScheduledArrivalIter {
    type Item = Arrival;

    fn next(&mut self) -> Option<Arrival> {
        if self.state == IterState::Exhausted {
            return None;
        }
        match self.heap.pop() {
            Some(entry) => Some(entry.arrival),
            None => {
                self.state = IterState::Exhausted;
                None
            }
        }
    }
}
