//! CSV-to-SQL ingestion: hash-based reuse, transactional load, and the
//! derived work pass (stop-time interpolation, min-arrival precomputation,
//! the stops×routes reverse index).

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::csv_reader::FeedTable;
use crate::error::{Error, Result};
use crate::http_client::Bundle;
use crate::time::{parse_gtfs_date, parse_gtfs_time};

use super::schema::DATA_TABLES;

/// Ingest a fetched bundle, reusing the existing `feed_id` when its content
/// hash already matches what is on record for this URL (spec.md §4.3).
pub async fn ingest_feed(pool: &SqlitePool, url: &str, bundle: &Bundle) -> Result<i64> {
    if let Some(row) = sqlx::query("SELECT id FROM _feeds WHERE url = ?1 AND sha256sum = ?2")
        .bind(url)
        .bind(&bundle.sha256)
        .fetch_optional(pool)
        .await?
    {
        return Ok(row.try_get::<i64, _>(0)?);
    }

    let zip_bytes = tokio::fs::read(&bundle.path).await?;
    let feed_id = load_transaction(pool, url, &bundle.sha256, zip_bytes).await?;
    derived_work(pool, feed_id).await?;
    Ok(feed_id)
}

async fn load_transaction(
    pool: &SqlitePool,
    url: &str,
    sha256: &str,
    zip_bytes: Vec<u8>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;

    let old_ids: Vec<i64> = sqlx::query("SELECT id FROM _feeds WHERE url = ?1")
        .bind(url)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|r| r.get(0))
        .collect();

    for old_id in &old_ids {
        for table in DATA_TABLES {
            sqlx::query(&format!("DELETE FROM {table} WHERE _feed = ?1"))
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
        }
    }
    sqlx::query("DELETE FROM _feeds WHERE url = ?1")
        .bind(url)
        .execute(&mut *tx)
        .await?;

    let feed_id = sqlx::query("INSERT INTO _feeds (url, sha256sum) VALUES (?1, ?2)")
        .bind(url)
        .bind(sha256)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

    let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes))?;

    if let Some(bytes) = read_table(&mut archive, "agency.txt")? {
        ingest_agency(&mut tx, feed_id, bytes).await?;
    }
    if let Some(bytes) = read_table(&mut archive, "stops.txt")? {
        ingest_stops(&mut tx, feed_id, bytes).await?;
    }
    if let Some(bytes) = read_table(&mut archive, "routes.txt")? {
        ingest_routes(&mut tx, feed_id, bytes).await?;
    }
    if let Some(bytes) = read_table(&mut archive, "calendar.txt")? {
        ingest_calendar(&mut tx, feed_id, bytes).await?;
    }
    if let Some(bytes) = read_table(&mut archive, "calendar_dates.txt")? {
        ingest_calendar_dates(&mut tx, feed_id, bytes).await?;
    }
    if let Some(bytes) = read_table(&mut archive, "trips.txt")? {
        ingest_trips(&mut tx, feed_id, bytes).await?;
    }
    if let Some(bytes) = read_table(&mut archive, "stop_times.txt")? {
        ingest_stop_times(&mut tx, feed_id, bytes).await?;
    }
    if let Some(bytes) = read_table(&mut archive, "frequencies.txt")? {
        ingest_frequencies(&mut tx, feed_id, bytes).await?;
    }

    tx.commit().await?;
    Ok(feed_id)
}

fn read_table(archive: &mut zip::ZipArchive<Cursor<Vec<u8>>>, name: &str) -> Result<Option<Vec<u8>>> {
    match archive.by_name(name) {
        Ok(mut file) => {
            let mut buf = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut buf)?;
            Ok(Some(buf))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(Error::from(e)),
    }
}

/// An empty string is null; everything else is coerced to `i32` per the
/// `integer`/`boolean` declared-type rule (spec.md §4.3).
fn coerce_int(s: Option<&str>) -> Option<i64> {
    s.and_then(|v| v.parse::<i64>().ok())
}

fn coerce_float(s: Option<&str>) -> Option<f64> {
    s.and_then(|v| v.parse::<f64>().ok())
}

fn coerce_date(s: Option<&str>) -> Option<String> {
    s.and_then(parse_gtfs_date).map(|d| d.format("%Y-%m-%d").to_string())
}

fn coerce_time(s: Option<&str>) -> Option<i32> {
    s.and_then(parse_gtfs_time)
}

async fn ingest_agency(tx: &mut Transaction<'_, Sqlite>, feed_id: i64, bytes: Vec<u8>) -> Result<()> {
    let mut table = FeedTable::new(Cursor::new(bytes))?;
    for row in table.rows() {
        let row = row?;
        sqlx::query(
            "INSERT INTO agency (_feed, agency_id, agency_name, agency_url, agency_timezone, agency_lang, agency_phone, agency_fare_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(feed_id)
        .bind(row.get("agency_id").unwrap_or_default())
        .bind(row.get("agency_name"))
        .bind(row.get("agency_url"))
        .bind(row.get("agency_timezone"))
        .bind(row.get("agency_lang"))
        .bind(row.get("agency_phone"))
        .bind(row.get("agency_fare_url"))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn ingest_stops(tx: &mut Transaction<'_, Sqlite>, feed_id: i64, bytes: Vec<u8>) -> Result<()> {
    let mut table = FeedTable::new(Cursor::new(bytes))?;
    for row in table.rows() {
        let row = row?;
        sqlx::query(
            "INSERT INTO stops (_feed, stop_id, stop_code, stop_name, stop_desc, stop_lat, stop_lon, zone_id, stop_url, parent_station, stop_timezone, wheelchair_boarding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(feed_id)
        .bind(row.get("stop_id").unwrap_or_default())
        .bind(row.get("stop_code"))
        .bind(row.get("stop_name"))
        .bind(row.get("stop_desc"))
        .bind(coerce_float(row.get("stop_lat")))
        .bind(coerce_float(row.get("stop_lon")))
        .bind(row.get("zone_id"))
        .bind(row.get("stop_url"))
        .bind(row.get("parent_station"))
        .bind(row.get("stop_timezone"))
        .bind(coerce_int(row.get("wheelchair_boarding")))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn ingest_routes(tx: &mut Transaction<'_, Sqlite>, feed_id: i64, bytes: Vec<u8>) -> Result<()> {
    let mut table = FeedTable::new(Cursor::new(bytes))?;
    for row in table.rows() {
        let row = row?;
        sqlx::query(
            "INSERT INTO routes (_feed, route_id, agency_id, route_short_name, route_long_name, route_desc, route_type, route_url, route_color, route_text_color)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(feed_id)
        .bind(row.get("route_id").unwrap_or_default())
        .bind(row.get("agency_id"))
        .bind(row.get("route_short_name"))
        .bind(row.get("route_long_name"))
        .bind(row.get("route_desc"))
        .bind(coerce_int(row.get("route_type")))
        .bind(row.get("route_url"))
        .bind(row.get("route_color"))
        .bind(row.get("route_text_color"))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn ingest_calendar(tx: &mut Transaction<'_, Sqlite>, feed_id: i64, bytes: Vec<u8>) -> Result<()> {
    let mut table = FeedTable::new(Cursor::new(bytes))?;
    for row in table.rows() {
        let row = row?;
        let bit = |col: &str| -> i64 { coerce_int(row.get(col)).unwrap_or(0) };
        sqlx::query(
            "INSERT INTO calendar (_feed, service_id, monday, tuesday, wednesday, thursday, friday, saturday, sunday, start_date, end_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(feed_id)
        .bind(row.get("service_id").unwrap_or_default())
        .bind(bit("monday"))
        .bind(bit("tuesday"))
        .bind(bit("wednesday"))
        .bind(bit("thursday"))
        .bind(bit("friday"))
        .bind(bit("saturday"))
        .bind(bit("sunday"))
        .bind(
            coerce_date(row.get("start_date"))
                .ok_or_else(|| Error::MalformedFeed("calendar.txt row missing valid start_date".into()))?,
        )
        .bind(
            coerce_date(row.get("end_date"))
                .ok_or_else(|| Error::MalformedFeed("calendar.txt row missing valid end_date".into()))?,
        )
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn ingest_calendar_dates(tx: &mut Transaction<'_, Sqlite>, feed_id: i64, bytes: Vec<u8>) -> Result<()> {
    let mut table = FeedTable::new(Cursor::new(bytes))?;
    for row in table.rows() {
        let row = row?;
        let date = coerce_date(row.get("date"))
            .ok_or_else(|| Error::MalformedFeed("calendar_dates.txt row missing valid date".into()))?;
        let exception_type = coerce_int(row.get("exception_type"))
            .ok_or_else(|| Error::MalformedFeed("calendar_dates.txt row missing exception_type".into()))?;
        sqlx::query(
            "INSERT INTO calendar_dates (_feed, service_id, date, exception_type) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(feed_id)
        .bind(row.get("service_id").unwrap_or_default())
        .bind(date)
        .bind(exception_type)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn ingest_trips(tx: &mut Transaction<'_, Sqlite>, feed_id: i64, bytes: Vec<u8>) -> Result<()> {
    let mut table = FeedTable::new(Cursor::new(bytes))?;
    for row in table.rows() {
        let row = row?;
        sqlx::query(
            "INSERT INTO trips (_feed, trip_id, route_id, service_id, trip_headsign, trip_short_name, direction_id, bikes_allowed, _min_arrival_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
        )
        .bind(feed_id)
        .bind(row.get("trip_id").unwrap_or_default())
        .bind(row.get("route_id").unwrap_or_default())
        .bind(row.get("service_id").unwrap_or_default())
        .bind(row.get("trip_headsign"))
        .bind(row.get("trip_short_name"))
        .bind(coerce_int(row.get("direction_id")))
        .bind(coerce_int(row.get("bikes_allowed")))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn ingest_stop_times(tx: &mut Transaction<'_, Sqlite>, feed_id: i64, bytes: Vec<u8>) -> Result<()> {
    let mut table = FeedTable::new(Cursor::new(bytes))?;
    for row in table.rows() {
        let row = row?;
        let arrival = coerce_time(row.get("arrival_time"));
        let departure = coerce_time(row.get("departure_time"));
        // A departure equal to arrival carries no information; store null
        // (spec.md §3 StopTime invariant).
        let departure = if departure == arrival { None } else { departure };
        sqlx::query(
            "INSERT INTO stop_times (_feed, trip_id, stop_sequence, stop_id, arrival_time, departure_time, pickup_type, drop_off_type, _arrival_interpolate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
        )
        .bind(feed_id)
        .bind(row.get("trip_id").unwrap_or_default())
        .bind(coerce_int(row.get("stop_sequence")).ok_or_else(|| {
            Error::MalformedFeed("stop_times.txt row missing stop_sequence".into())
        })?)
        .bind(row.get("stop_id").unwrap_or_default())
        .bind(arrival)
        .bind(departure)
        .bind(coerce_int(row.get("pickup_type")))
        .bind(coerce_int(row.get("drop_off_type")))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn ingest_frequencies(tx: &mut Transaction<'_, Sqlite>, feed_id: i64, bytes: Vec<u8>) -> Result<()> {
    let mut table = FeedTable::new(Cursor::new(bytes))?;
    for row in table.rows() {
        let row = row?;
        let start = coerce_time(row.get("start_time"))
            .ok_or_else(|| Error::MalformedFeed("frequencies.txt row missing start_time".into()))?;
        let end = coerce_time(row.get("end_time"))
            .ok_or_else(|| Error::MalformedFeed("frequencies.txt row missing end_time".into()))?;
        let headway = coerce_int(row.get("headway_secs"))
            .ok_or_else(|| Error::MalformedFeed("frequencies.txt row missing headway_secs".into()))?;
        sqlx::query(
            "INSERT INTO frequencies (_feed, trip_id, start_time, end_time, headway_secs, exact_times)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(feed_id)
        .bind(row.get("trip_id").unwrap_or_default())
        .bind(start)
        .bind(end)
        .bind(headway)
        .bind(coerce_int(row.get("exact_times")))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Second transaction: stop-time interpolation, min-arrival precomputation,
/// and the stops×routes reverse index (spec.md §4.3 step 5).
async fn derived_work(pool: &SqlitePool, feed_id: i64) -> Result<()> {
    let mut tx = pool.begin().await?;

    interpolate_stop_times(&mut tx, feed_id).await?;
    precompute_min_arrival(&mut tx, feed_id).await?;
    build_stops_routes_index(&mut tx, feed_id).await?;

    tx.commit().await?;
    Ok(())
}

struct StopTimeRow {
    stop_sequence: i64,
    arrival_time: Option<i32>,
    departure_time: Option<i32>,
}

async fn interpolate_stop_times(tx: &mut Transaction<'_, Sqlite>, feed_id: i64) -> Result<()> {
    let trip_ids: Vec<String> = sqlx::query("SELECT DISTINCT trip_id FROM stop_times WHERE _feed = ?1")
        .bind(feed_id)
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .map(|r| r.get(0))
        .collect();

    for trip_id in trip_ids {
        let rows = sqlx::query(
            "SELECT stop_sequence, arrival_time, departure_time FROM stop_times
             WHERE _feed = ?1 AND trip_id = ?2 ORDER BY stop_sequence ASC",
        )
        .bind(feed_id)
        .bind(&trip_id)
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .map(|r| StopTimeRow {
            stop_sequence: r.get(0),
            arrival_time: r.get(1),
            departure_time: r.get(2),
        })
        .collect::<Vec<_>>();

        if rows.iter().all(|r| r.arrival_time.is_none()) {
            continue; // frequency-only trip, nothing to interpolate against
        }

        let known: BTreeMap<i64, (i32, i32)> = rows
            .iter()
            .filter_map(|r| {
                r.arrival_time
                    .map(|a| (r.stop_sequence, (a, r.departure_time.unwrap_or(a))))
            })
            .collect();

        let mut unknown_run: Vec<i64> = Vec::new();
        let mut prev_known_seq: Option<i64> = None;

        for row in &rows {
            if row.arrival_time.is_some() {
                if !unknown_run.is_empty() {
                    apply_interpolation(tx, feed_id, &trip_id, &unknown_run, prev_known_seq, row.stop_sequence, &known).await?;
                    unknown_run.clear();
                }
                prev_known_seq = Some(row.stop_sequence);
            } else {
                unknown_run.push(row.stop_sequence);
            }
        }
        // A trailing unknown run (no right-known neighbor) cannot be
        // interpolated and is left as-is.
    }
    Ok(())
}

async fn apply_interpolation(
    tx: &mut Transaction<'_, Sqlite>,
    feed_id: i64,
    trip_id: &str,
    unknown_run: &[i64],
    left_seq: Option<i64>,
    right_seq: i64,
    known: &BTreeMap<i64, (i32, i32)>,
) -> Result<()> {
    let Some(left_seq) = left_seq else {
        return Ok(()); // a leading unknown run has no left-known neighbor
    };
    let (_, left_departure_or_arrival) = known[&left_seq];
    let (right_arrival, _) = known[&right_seq];
    let gap = right_arrival - left_departure_or_arrival;
    let count = unknown_run.len() as i32 + 1;

    for (i, seq) in unknown_run.iter().enumerate() {
        let interpolated = left_departure_or_arrival
            + (gap as i64 * (i as i64 + 1) / count as i64) as i32;
        sqlx::query(
            "UPDATE stop_times SET _arrival_interpolate = ?1 WHERE _feed = ?2 AND trip_id = ?3 AND stop_sequence = ?4",
        )
        .bind(interpolated)
        .bind(feed_id)
        .bind(trip_id)
        .bind(seq)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn precompute_min_arrival(tx: &mut Transaction<'_, Sqlite>, feed_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE trips SET _min_arrival_time = (
            SELECT MIN(COALESCE(st.arrival_time, st._arrival_interpolate))
            FROM stop_times st
            WHERE st._feed = trips._feed AND st.trip_id = trips.trip_id
        )
        WHERE _feed = ?1",
    )
    .bind(feed_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn build_stops_routes_index(tx: &mut Transaction<'_, Sqlite>, feed_id: i64) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO _stops_routes (_feed, stop_id, route_id)
         SELECT DISTINCT ?1, st.stop_id, t.route_id
         FROM stop_times st
         JOIN trips t ON t._feed = st._feed AND t.trip_id = st.trip_id
         WHERE st._feed = ?1",
    )
    .bind(feed_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::{SCHEMA_SQL, SCHEMA_VERSION};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::io::Write;
    use zip::write::FileOptions;

    async fn fresh_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for statement in SCHEMA_SQL.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&pool).await.unwrap();
            }
        }
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    fn sample_zip() -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            let opts: FileOptions<()> = FileOptions::default();

            writer.start_file("agency.txt", opts).unwrap();
            writer
                .write_all(b"agency_id,agency_name,agency_url,agency_timezone\nDTA,Demo Transit,http://example.com,America/Los_Angeles\n")
                .unwrap();

            writer.start_file("stops.txt", opts).unwrap();
            writer
                .write_all(b"stop_id,stop_name,stop_lat,stop_lon\nS1,Stop One,48.1,7.1\nS2,Stop Two,48.2,7.2\nS3,Stop Three,48.3,7.3\n")
                .unwrap();

            writer.start_file("routes.txt", opts).unwrap();
            writer
                .write_all(b"route_id,agency_id,route_short_name,route_type\nR1,DTA,1,3\n")
                .unwrap();

            writer.start_file("calendar.txt", opts).unwrap();
            writer
                .write_all(b"service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\nFULLW,1,1,1,1,1,1,1,20070101,20071231\n")
                .unwrap();

            writer.start_file("trips.txt", opts).unwrap();
            writer
                .write_all(b"trip_id,route_id,service_id\nT1,R1,FULLW\n")
                .unwrap();

            writer.start_file("stop_times.txt", opts).unwrap();
            writer
                .write_all(
                    b"trip_id,stop_sequence,stop_id,arrival_time,departure_time\n\
                      T1,1,S1,06:00:00,06:00:00\n\
                      T1,2,S2,,\n\
                      T1,3,S3,06:20:00,06:20:00\n",
                )
                .unwrap();

            writer.finish().unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn ingests_feed_and_interpolates() {
        let pool = fresh_pool().await;
        let dir = std::env::temp_dir().join(format!("gtfs-cache-ingest-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let zip_path = dir.join("feed.zip");
        std::fs::write(&zip_path, sample_zip()).unwrap();

        let bundle = Bundle {
            path: zip_path,
            sha256: "deadbeef".into(),
            from_cache: false,
        };

        let feed_id = ingest_feed(&pool, "http://example.com/feed.zip", &bundle)
            .await
            .unwrap();
        assert_eq!(feed_id, 1);

        let stop_count: i64 = sqlx::query("SELECT COUNT(*) FROM stops WHERE _feed = ?1")
            .bind(feed_id)
            .fetch_one(&pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(stop_count, 3);

        let interpolated: Option<i32> = sqlx::query(
            "SELECT _arrival_interpolate FROM stop_times WHERE _feed = ?1 AND trip_id = 'T1' AND stop_sequence = 2",
        )
        .bind(feed_id)
        .fetch_one(&pool)
        .await
        .unwrap()
        .get(0);
        // 06:00 -> noon-relative -6*3600; 06:20 -> -6*3600+1200; midpoint.
        assert_eq!(interpolated, Some(-6 * 3600 + 600));

        let min_arrival: Option<i32> = sqlx::query("SELECT _min_arrival_time FROM trips WHERE _feed = ?1 AND trip_id = 'T1'")
            .bind(feed_id)
            .fetch_one(&pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(min_arrival, Some(-6 * 3600));

        let stops_routes: i64 = sqlx::query("SELECT COUNT(*) FROM _stops_routes WHERE _feed = ?1")
            .bind(feed_id)
            .fetch_one(&pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(stops_routes, 3);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn reingesting_same_hash_reuses_feed_id() {
        let pool = fresh_pool().await;
        let dir = std::env::temp_dir().join(format!("gtfs-cache-ingest-reuse-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let zip_path = dir.join("feed.zip");
        std::fs::write(&zip_path, sample_zip()).unwrap();

        let bundle = Bundle {
            path: zip_path,
            sha256: "samehash".into(),
            from_cache: false,
        };

        let first = ingest_feed(&pool, "http://example.com/feed.zip", &bundle).await.unwrap();
        let second = ingest_feed(&pool, "http://example.com/feed.zip", &bundle).await.unwrap();
        assert_eq!(first, second);

        let feed_rows: i64 = sqlx::query("SELECT COUNT(*) FROM _feeds")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(feed_rows, 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
