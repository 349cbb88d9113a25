//! Bundled schema DDL, versioned by `PRAGMA user_version`.
//!
//! Every data table but `_feeds` carries a `_feed` discriminator column so a
//! single store can hold multiple feeds side by side (spec.md §3).

pub const SCHEMA_VERSION: i64 = 1;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _feeds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    sha256sum TEXT NOT NULL,
    UNIQUE(url, sha256sum)
);

CREATE TABLE IF NOT EXISTS agency (
    _feed INTEGER NOT NULL,
    agency_id TEXT NOT NULL,
    agency_name TEXT,
    agency_url TEXT,
    agency_timezone TEXT,
    agency_lang TEXT,
    agency_phone TEXT,
    agency_fare_url TEXT,
    PRIMARY KEY (_feed, agency_id)
);

CREATE TABLE IF NOT EXISTS stops (
    _feed INTEGER NOT NULL,
    stop_id TEXT NOT NULL,
    stop_code TEXT,
    stop_name TEXT,
    stop_desc TEXT,
    stop_lat REAL,
    stop_lon REAL,
    zone_id TEXT,
    stop_url TEXT,
    parent_station TEXT,
    stop_timezone TEXT,
    wheelchair_boarding INTEGER,
    PRIMARY KEY (_feed, stop_id)
);

CREATE TABLE IF NOT EXISTS routes (
    _feed INTEGER NOT NULL,
    route_id TEXT NOT NULL,
    agency_id TEXT,
    route_short_name TEXT,
    route_long_name TEXT,
    route_desc TEXT,
    route_type INTEGER,
    route_url TEXT,
    route_color TEXT,
    route_text_color TEXT,
    PRIMARY KEY (_feed, route_id)
);

CREATE TABLE IF NOT EXISTS calendar (
    _feed INTEGER NOT NULL,
    service_id TEXT NOT NULL,
    monday INTEGER NOT NULL DEFAULT 0,
    tuesday INTEGER NOT NULL DEFAULT 0,
    wednesday INTEGER NOT NULL DEFAULT 0,
    thursday INTEGER NOT NULL DEFAULT 0,
    friday INTEGER NOT NULL DEFAULT 0,
    saturday INTEGER NOT NULL DEFAULT 0,
    sunday INTEGER NOT NULL DEFAULT 0,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    PRIMARY KEY (_feed, service_id)
);

CREATE TABLE IF NOT EXISTS calendar_dates (
    _feed INTEGER NOT NULL,
    service_id TEXT NOT NULL,
    date TEXT NOT NULL,
    exception_type INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS trips (
    _feed INTEGER NOT NULL,
    trip_id TEXT NOT NULL,
    route_id TEXT NOT NULL,
    service_id TEXT NOT NULL,
    trip_headsign TEXT,
    trip_short_name TEXT,
    direction_id INTEGER,
    bikes_allowed INTEGER,
    _min_arrival_time INTEGER,
    PRIMARY KEY (_feed, trip_id)
);

CREATE TABLE IF NOT EXISTS stop_times (
    _feed INTEGER NOT NULL,
    trip_id TEXT NOT NULL,
    stop_sequence INTEGER NOT NULL,
    stop_id TEXT NOT NULL,
    arrival_time INTEGER,
    departure_time INTEGER,
    pickup_type INTEGER,
    drop_off_type INTEGER,
    _arrival_interpolate INTEGER,
    PRIMARY KEY (_feed, trip_id, stop_sequence)
);

CREATE TABLE IF NOT EXISTS frequencies (
    _feed INTEGER NOT NULL,
    trip_id TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    headway_secs INTEGER NOT NULL,
    exact_times INTEGER
);

CREATE TABLE IF NOT EXISTS _stops_routes (
    _feed INTEGER NOT NULL,
    stop_id TEXT NOT NULL,
    route_id TEXT NOT NULL,
    PRIMARY KEY (_feed, stop_id, route_id)
);

CREATE INDEX IF NOT EXISTS idx_stop_times_trip ON stop_times (_feed, trip_id, stop_sequence);
CREATE INDEX IF NOT EXISTS idx_stop_times_stop ON stop_times (_feed, stop_id);
CREATE INDEX IF NOT EXISTS idx_trips_route ON trips (_feed, route_id);
CREATE INDEX IF NOT EXISTS idx_frequencies_trip ON frequencies (_feed, trip_id);
CREATE INDEX IF NOT EXISTS idx_calendar_dates_service ON calendar_dates (_feed, service_id);
CREATE INDEX IF NOT EXISTS idx_stops_routes_stop ON _stops_routes (_feed, stop_id);
CREATE INDEX IF NOT EXISTS idx_stops_routes_route ON _stops_routes (_feed, route_id);
"#;

/// Every GTFS data table name carrying a `_feed` column — used when
/// reconciling a feed replacement (spec.md §4.3 step 3b).
pub const DATA_TABLES: &[&str] = &[
    "agency",
    "stops",
    "routes",
    "calendar",
    "calendar_dates",
    "trips",
    "stop_times",
    "frequencies",
    "_stops_routes",
];
