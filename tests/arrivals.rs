//! End-to-end scenarios against a fixture modeled on the canonical GTFS
//! sample feed (agency DTA; stops STAGECOACH/BEATTY_AIRPORT/AMV; routes
//! STBA/AAMV/CITY; service FULLW with a calendar_dates removal), exercising
//! [`gtfs_cache::Provider`] the way an outer HTTP layer would drive it.

use std::io::Write;

use chrono::TimeZone;
use chrono_tz::Tz;
use zip::write::FileOptions;

use gtfs_cache::config::HttpClientConfig;
use gtfs_cache::http_client::HttpClient;
use gtfs_cache::Provider;

fn http_client(test_name: &str) -> HttpClient {
    let cfg = HttpClientConfig {
        cache_dir: std::env::temp_dir()
            .join(format!("gtfs-cache-it-{test_name}-{}", std::process::id()))
            .to_string_lossy()
            .to_string(),
        min_interval_ms: 0,
        per_url_interval_ms: 0,
        request_timeout_secs: 10,
    };
    HttpClient::new(&cfg).unwrap()
}

/// A fixture modeled on the sample feed's STAGECOACH/BEATTY_AIRPORT/AMV
/// stops and STBA/AAMV/CITY routes, with STBA running on a 30-minute
/// frequency between 06:00 and 09:00 and FULLW pulled for 2007-06-04.
fn sample_feed_zip() -> Vec<u8> {
    let mut buf = Vec::new();
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
    let opts: FileOptions<()> = FileOptions::default();

    writer.start_file("agency.txt", opts).unwrap();
    writer
        .write_all(b"agency_id,agency_name,agency_url,agency_timezone\nDTA,Demo Transit Authority,http://example.com,America/Los_Angeles\n")
        .unwrap();

    writer.start_file("stops.txt", opts).unwrap();
    writer
        .write_all(
            b"stop_id,stop_name,stop_lat,stop_lon\n\
              STAGECOACH,Stagecoach Hotel & Casino,36.915682,-116.751677\n\
              BEATTY_AIRPORT,Nye County Airport,36.868446,-116.784582\n\
              AMV,Amargosa Valley,36.641496,-116.40094\n",
        )
        .unwrap();

    writer.start_file("routes.txt", opts).unwrap();
    writer
        .write_all(
            b"route_id,agency_id,route_short_name,route_long_name,route_type\n\
              STBA,DTA,30,Stagecoach - Airport Shuttle,3\n\
              AAMV,DTA,50,Airport - Amargosa Valley,3\n\
              CITY,DTA,40,City,3\n",
        )
        .unwrap();

    writer.start_file("calendar.txt", opts).unwrap();
    writer
        .write_all(b"service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\nFULLW,1,1,1,1,1,1,1,20070101,20071231\n")
        .unwrap();

    writer.start_file("calendar_dates.txt", opts).unwrap();
    writer
        .write_all(b"service_id,date,exception_type\nFULLW,20070604,2\n")
        .unwrap();

    writer.start_file("trips.txt", opts).unwrap();
    writer
        .write_all(
            b"route_id,service_id,trip_id,trip_headsign\n\
              STBA,FULLW,STBA1,Shuttle\n\
              AAMV,FULLW,AAMV1,to Amargosa Valley\n\
              CITY,FULLW,CITY1,City Loop\n",
        )
        .unwrap();

    writer.start_file("stop_times.txt", opts).unwrap();
    writer
        .write_all(
            b"trip_id,stop_sequence,stop_id,arrival_time,departure_time\n\
              STBA1,1,STAGECOACH,6:00:00,6:00:00\n\
              STBA1,2,BEATTY_AIRPORT,6:20:00,6:20:00\n\
              AAMV1,1,BEATTY_AIRPORT,8:00:00,8:00:00\n\
              AAMV1,2,AMV,9:00:00,9:00:00\n\
              CITY1,1,STAGECOACH,6:56:00,6:58:00\n\
              CITY1,2,BEATTY_AIRPORT,7:10:00,7:10:00\n",
        )
        .unwrap();

    writer.start_file("frequencies.txt", opts).unwrap();
    writer
        .write_all(b"trip_id,start_time,end_time,headway_secs\nSTBA1,6:00:00,9:00:00,1800\n")
        .unwrap();

    writer.finish().unwrap();
    buf
}

async fn load_sample_provider(test_name: &str, store_url: &str) -> (Provider, mockito::ServerGuard) {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/feed.zip")
        .with_status(200)
        .with_body(sample_feed_zip())
        .create_async()
        .await;

    let http = http_client(test_name);
    let url = format!("{}/feed.zip", server.url());
    let provider = Provider::load(store_url, &url, &http, chrono_tz::America::Los_Angeles)
        .await
        .unwrap();
    (provider, server)
}

fn la(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> chrono::DateTime<Tz> {
    chrono_tz::America::Los_Angeles
        .with_ymd_and_hms(y, mo, d, h, mi, s)
        .unwrap()
}

/// S1 — all routes at STAGECOACH on a Sunday FULLW is active: STBA's
/// frequency contributes 5 departures in [06:45,09:45), CITY's single
/// scheduled trip contributes 1 more.
#[tokio::test]
async fn s1_all_routes_at_stop_sunday() {
    let (provider, _server) = load_sample_provider("s1", "sqlite::memory:").await;
    let start = la(2007, 6, 3, 6, 45, 0);
    let end = la(2007, 6, 3, 9, 45, 0);
    let arrivals: Vec<_> = provider
        .arrivals(Some(vec!["STAGECOACH".into()]), None, Some(start), Some(end), Some(false))
        .await
        .unwrap()
        .collect();
    assert_eq!(arrivals.len(), 6);
}

/// S2 — same stop and window, but on the Monday FULLW was pulled for via
/// calendar_dates: no service is valid, so no trip is ever scanned.
#[tokio::test]
async fn s2_service_exception_removes_all_arrivals() {
    let (provider, _server) = load_sample_provider("s2", "sqlite::memory:").await;
    let start = la(2007, 6, 4, 6, 45, 0);
    let end = la(2007, 6, 4, 9, 45, 0);
    let arrivals: Vec<_> = provider
        .arrivals(Some(vec!["STAGECOACH".into()]), None, Some(start), Some(end), Some(false))
        .await
        .unwrap()
        .collect();
    assert!(arrivals.is_empty());
}

/// S3 — AMV is only served by AAMV1's single scheduled arrival at 09:00,
/// which falls inside the window.
#[tokio::test]
async fn s3_single_arrival_at_amv() {
    let (provider, _server) = load_sample_provider("s3", "sqlite::memory:").await;
    let start = la(2007, 6, 3, 6, 45, 0);
    let end = la(2007, 6, 3, 9, 45, 0);
    let arrivals: Vec<_> = provider
        .arrivals(Some(vec!["AMV".into()]), None, Some(start), Some(end), Some(false))
        .await
        .unwrap()
        .collect();
    assert_eq!(arrivals.len(), 1);
    assert_eq!(arrivals[0].trip_id, "AAMV1");
}

/// S4 — filtering to route=STBA at STAGECOACH drops CITY's single trip,
/// leaving just the 5 frequency-expanded STBA departures.
#[tokio::test]
async fn s4_route_filter_narrows_to_frequency_trip() {
    let (provider, _server) = load_sample_provider("s4", "sqlite::memory:").await;
    let start = la(2007, 6, 3, 6, 45, 0);
    let arrivals: Vec<_> = provider
        .arrivals(
            Some(vec!["STAGECOACH".into()]),
            Some(vec!["STBA".into()]),
            Some(start),
            None,
            Some(false),
        )
        .await
        .unwrap()
        .collect();
    assert_eq!(arrivals.len(), 5);
    assert!(arrivals.iter().all(|a| a.trip_id == "STBA1"));
}

/// S5 — an end before start yields no calendar days to expand, hence no
/// arrivals regardless of what the feed contains.
#[tokio::test]
async fn s5_end_before_start_is_empty() {
    let (provider, _server) = load_sample_provider("s5", "sqlite::memory:").await;
    let start = la(2007, 6, 3, 6, 45, 0);
    let end = la(2007, 6, 3, 3, 45, 0);
    let arrivals: Vec<_> = provider
        .arrivals(Some(vec!["STAGECOACH".into()]), None, Some(start), Some(end), Some(false))
        .await
        .unwrap()
        .collect();
    assert!(arrivals.is_empty());
}

/// S6 — ingesting the same feed bundle twice against the same persistent
/// store reuses the existing feed id instead of duplicating rows.
#[tokio::test]
async fn s6_reingesting_same_feed_reuses_feed_id() {
    let dir = std::env::temp_dir().join(format!("gtfs-cache-it-s6-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let db_path = dir.join("feeds.db");
    let store_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let (first, server) = load_sample_provider("s6a", &store_url).await;
    let first_feed_id = first.feed_id();

    let http = http_client("s6b");
    let url = format!("{}/feed.zip", server.url());
    let second = Provider::load(&store_url, &url, &http, chrono_tz::America::Los_Angeles)
        .await
        .unwrap();

    assert_eq!(second.feed_id(), first_feed_id);
    assert_eq!(second.agencies().await.unwrap().count(), 1);
    assert_eq!(second.stops().await.unwrap().count(), 3);
    assert_eq!(second.routes().await.unwrap().count(), 3);

    let _ = std::fs::remove_dir_all(&dir);
}

/// A fixture serving stop 8750 on route 39: one trip (T39A) whose scheduled
/// arrival is near the query's start and for which a realtime prediction
/// exists, and a second trip (T39B) later in the window with no realtime
/// coverage.
fn realtime_feed_zip() -> Vec<u8> {
    let mut buf = Vec::new();
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
    let opts: FileOptions<()> = FileOptions::default();

    writer.start_file("agency.txt", opts).unwrap();
    writer
        .write_all(b"agency_id,agency_name,agency_url,agency_timezone\nMBTA,MassDOT,http://example.com,America/Chicago\n")
        .unwrap();

    writer.start_file("stops.txt", opts).unwrap();
    writer.write_all(b"stop_id,stop_name\n8750,Example Stop\n").unwrap();

    writer.start_file("routes.txt", opts).unwrap();
    writer
        .write_all(b"route_id,agency_id,route_short_name,route_type\n39,MBTA,39,3\n")
        .unwrap();

    writer.start_file("calendar.txt", opts).unwrap();
    writer
        .write_all(b"service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\nALLDAYS,1,1,1,1,1,1,1,20150101,20151231\n")
        .unwrap();

    writer.start_file("trips.txt", opts).unwrap();
    writer
        .write_all(
            b"route_id,service_id,trip_id,trip_headsign\n\
              39,ALLDAYS,T39A,Early\n\
              39,ALLDAYS,T39B,Later\n",
        )
        .unwrap();

    writer.start_file("stop_times.txt", opts).unwrap();
    writer
        .write_all(
            b"trip_id,stop_sequence,stop_id,arrival_time,departure_time\n\
              T39A,1,8750,15:11:00,15:11:00\n\
              T39B,1,8750,17:45:00,17:45:00\n",
        )
        .unwrap();

    writer.finish().unwrap();
    buf
}

/// S7 — a prerecorded `predictionsbyroute` response overlays T39A with a
/// realtime timestamp matching `pre_dt`; T39B, absent from predictions,
/// surfaces as the plain scheduled arrival.
#[tokio::test]
async fn s7_realtime_overlay_replaces_matching_trip_only() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/feed.zip")
        .with_status(200)
        .with_body(realtime_feed_zip())
        .create_async()
        .await;
    server
        .mock("GET", "/predictionsbyroute?route=39")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"direction":[{"trip":[{"trip_id":"T39A","trip_headsign":"Early","route_id":"39",
                "stop":[{"stop_id":"8750","stop_sequence":1,"pre_dt":1430511060}]}]}]}"#,
        )
        .create_async()
        .await;

    let http = http_client("s7");
    let feed_url = format!("{}/feed.zip", server.url());
    let by_route_url = format!("{}/predictionsbyroute?route={{route_id}}", server.url());
    let by_stop_url = format!("{}/predictionsbystop?stop={{stop_id}}", server.url());

    let provider = Provider::load(
        "sqlite::memory:",
        &feed_url,
        &http,
        chrono_tz::America::Chicago,
    )
    .await
    .unwrap()
    .with_realtime(by_route_url, by_stop_url, http.clone());

    let start = chrono_tz::America::Chicago
        .with_ymd_and_hms(2015, 5, 1, 15, 10, 23)
        .unwrap();
    let arrivals: Vec<_> = provider
        .arrivals(Some(vec!["8750".into()]), Some(vec!["39".into()]), Some(start), None, Some(true))
        .await
        .unwrap()
        .collect();

    assert_eq!(arrivals.len(), 2);
    assert!(arrivals[0].realtime);
    assert_eq!(arrivals[0].time.timestamp(), 1_430_511_060);
    assert!(!arrivals[1].realtime);
    assert_eq!(arrivals[1].trip_id, "T39B");
}
