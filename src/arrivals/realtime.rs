//! Realtime Arrival Generator (spec.md §4.7): fetches provider predictions
//! by route or by stop, keys them by trip id, and overlays them onto the
//! scheduled generator's output with replacement semantics.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::entities::Arrival;
use crate::error::{Error, Result};

use super::scheduled::ScheduledGenerator;

struct Prediction {
    pre_dt: i64,
    trip_headsign: Option<String>,
    route_id: Option<String>,
}

/// Fetches realtime predictions and overlays them onto a
/// [`ScheduledGenerator`]'s output.
pub struct RealtimeGenerator {
    scheduled: ScheduledGenerator,
    http: crate::http_client::HttpClient,
    /// URL template containing a `{route_id}` placeholder.
    by_route_url: String,
    /// URL template containing a `{stop_id}` placeholder.
    by_stop_url: String,
}

impl RealtimeGenerator {
    pub fn new(
        scheduled: ScheduledGenerator,
        http: crate::http_client::HttpClient,
        by_route_url: String,
        by_stop_url: String,
    ) -> Self {
        Self {
            scheduled,
            http,
            by_route_url,
            by_stop_url,
        }
    }

    pub async fn arrivals(
        &self,
        stops: Option<Vec<String>>,
        routes: Option<Vec<String>>,
        start: DateTime<Tz>,
        end: DateTime<Tz>,
    ) -> Result<RealtimeArrivalIter> {
        if stops.is_none() && routes.is_none() {
            return Err(Error::InvalidQuery(
                "realtime requires at least one of stops or routes".into(),
            ));
        }

        let by_stop_strategy = routes.is_none();
        let (norm_stops, norm_routes) = self
            .scheduled
            .normalize_inputs(stops.clone(), routes.clone())
            .await?;
        let wanted_stops: HashSet<String> = norm_stops.iter().cloned().collect();

        let predictions = if by_stop_strategy {
            self.fetch_by_stop(stops.as_deref().unwrap_or(&[])).await
        } else {
            self.fetch_by_route(routes.as_deref().unwrap_or(&[]), &wanted_stops)
                .await
        };

        let pairs = self.scheduled.relevant_pairs(&norm_stops, &norm_routes).await?;
        let mut all: Vec<Arrival> = Vec::new();

        for (stop_id, route_id) in pairs {
            let scheduled_arrivals = self
                .scheduled
                .arrivals(Some(vec![stop_id.clone()]), Some(vec![route_id.clone()]), start, end)
                .await?;

            let mut by_trip: BTreeMap<String, Arrival> = BTreeMap::new();
            for arrival in scheduled_arrivals {
                by_trip.entry(arrival.trip_id.clone()).or_insert(arrival);
            }

            if let Some(trip_predictions) = predictions.get(&stop_id) {
                for (trip_id, prediction) in trip_predictions {
                    if let Some(predicted_route) = &prediction.route_id {
                        if predicted_route != &route_id {
                            continue;
                        }
                    }
                    if by_stop_strategy
                        && !self.scheduled.trip_serves_stop(trip_id, &stop_id).await?
                    {
                        continue; // dropped: by-stop strategy requires a verified schedule match
                    }

                    let time = DateTime::<Utc>::from_timestamp(prediction.pre_dt, 0)
                        .map(|dt| dt.with_timezone(&self.scheduled.timezone()));
                    let Some(time) = time else { continue };

                    let previous = by_trip.get(trip_id);
                    let arrival = Arrival {
                        feed_id: self.scheduled.feed_id(),
                        trip_id: trip_id.clone(),
                        stop_id: stop_id.clone(),
                        route_id: route_id.clone(),
                        time,
                        departure_time: Some(time),
                        headsign: prediction
                            .trip_headsign
                            .clone()
                            .or_else(|| previous.and_then(|p| p.headsign.clone())),
                        short_name: previous.and_then(|p| p.short_name.clone()),
                        bikes_allowed: previous
                            .map(|p| p.bikes_allowed)
                            .unwrap_or(crate::entities::BikesAllowed::Unknown),
                        realtime: true,
                    };
                    by_trip.insert(trip_id.clone(), arrival);
                }
            }

            for arrival in by_trip.into_values() {
                if arrival.time >= start && arrival.time <= end {
                    all.push(arrival);
                }
            }
        }

        all.sort_by_key(|a| a.time);
        Ok(RealtimeArrivalIter {
            items: all.into_iter(),
        })
    }

    async fn fetch_by_route(
        &self,
        routes: &[String],
        wanted_stops: &HashSet<String>,
    ) -> HashMap<String, HashMap<String, Prediction>> {
        let mut out: HashMap<String, HashMap<String, Prediction>> = HashMap::new();
        for route_id in routes {
            let url = self.by_route_url.replace("{route_id}", route_id);
            match self.http.get_json(&url).await {
                Ok(Some(body)) => merge_predictions(&mut out, parse_predictions(&body, wanted_stops)),
                Ok(None) => {}
                Err(e) => warn!(%route_id, error = %e, "realtime by-route fetch failed, treating as no predictions"),
            }
        }
        out
    }

    async fn fetch_by_stop(&self, stops: &[String]) -> HashMap<String, HashMap<String, Prediction>> {
        let mut out: HashMap<String, HashMap<String, Prediction>> = HashMap::new();
        for stop_id in stops {
            let url = self.by_stop_url.replace("{stop_id}", stop_id);
            let wanted: HashSet<String> = std::iter::once(stop_id.clone()).collect();
            match self.http.get_json(&url).await {
                Ok(Some(body)) => merge_predictions(&mut out, parse_predictions(&body, &wanted)),
                Ok(None) => {}
                Err(e) => warn!(%stop_id, error = %e, "realtime by-stop fetch failed, treating as no predictions"),
            }
        }
        out
    }
}

fn merge_predictions(
    into: &mut HashMap<String, HashMap<String, Prediction>>,
    from: HashMap<String, HashMap<String, Prediction>>,
) {
    for (stop_id, trips) in from {
        into.entry(stop_id).or_default().extend(trips);
    }
}

/// Parse an MBTA-style `predictionsbyroute`/`predictionsbystop` JSON body
/// into `stop_id -> trip_id -> Prediction`, keeping only stops in
/// `wanted_stops` (when non-empty) with a non-zero `stop_sequence`
/// (spec.md §4.7(a)).
fn parse_predictions(
    json: &serde_json::Value,
    wanted_stops: &HashSet<String>,
) -> HashMap<String, HashMap<String, Prediction>> {
    let mut out: HashMap<String, HashMap<String, Prediction>> = HashMap::new();

    let Some(directions) = json.get("direction").and_then(|v| v.as_array()) else {
        return out;
    };

    for direction in directions {
        let Some(trips) = direction.get("trip").and_then(|v| v.as_array()) else {
            continue;
        };
        for trip in trips {
            let Some(trip_id) = trip.get("trip_id").and_then(|v| v.as_str()) else {
                continue;
            };
            let trip_headsign = trip.get("trip_headsign").and_then(|v| v.as_str()).map(String::from);
            let route_id = trip.get("route_id").and_then(|v| v.as_str()).map(String::from);

            let Some(stops) = trip.get("stop").and_then(|v| v.as_array()) else {
                continue;
            };
            for stop in stops {
                let stop_sequence = stop.get("stop_sequence").and_then(json_as_i64).unwrap_or(0);
                if stop_sequence == 0 {
                    continue;
                }
                let Some(stop_id) = stop.get("stop_id").and_then(|v| v.as_str()) else {
                    continue;
                };
                if !wanted_stops.is_empty() && !wanted_stops.contains(stop_id) {
                    continue;
                }
                let Some(pre_dt) = stop.get("pre_dt").and_then(json_as_i64) else {
                    continue;
                };

                out.entry(stop_id.to_string()).or_default().insert(
                    trip_id.to_string(),
                    Prediction {
                        pre_dt,
                        trip_headsign: trip_headsign.clone(),
                        route_id: route_id.clone(),
                    },
                );
            }
        }
    }
    out
}

fn json_as_i64(value: &serde_json::Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

pub struct RealtimeArrivalIter {
    items: std::vec::IntoIter<Arrival>,
}

impl Iterator for RealtimeArrivalIter {
    type Item = Arrival;

    fn next(&mut self) -> Option<Arrival> {
        self.items.next()
    }
}
