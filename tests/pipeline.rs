//! Stage-level integration tests
//!
//! Every stage runs against a real queue directory. External collaborators
//! (feed source, image tool, disc drive) are in-process mocks; media
//! downloads go through a local axum server.

use async_trait::async_trait;
use audrey::feed::{
    ConditionalRequest, FeedEndpoint, FeedError, FeedResponse, FeedSource, FeedState, RawEntry,
};
use audrey::queue::{DirQueue, Stage};
use audrey::stages::{
    BatchLimits, Build, Burn, DriveState, FeedCheck, FeedCheckSettings, Fetch, FetchDescriptor,
};
use audrey::tools::{DiscDrive, ImageAuthor, ImageEntry, MediaStatus, ToolError};
use audrey::worker::http::{HttpClient, HttpConfig};
use audrey::worker::{ControlEvent, Step, channel};
use axum::{Router, http::header, routing::get};
use chrono::{DateTime, TimeZone, Utc};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, 7, 45, 0).unwrap()
}

fn entry(day: u32) -> RawEntry {
    RawEntry {
        published: Some(at(day)),
        title: Some(format!("Episode {}", day)),
        enclosure: Some(format!("https://cdn.example.com/ep{}.mp3", day)),
    }
}

/// Feed source answering every request from a script
struct MockFeed {
    response: Mutex<Result<FeedResponse, FeedError>>,
    requests: Mutex<Vec<ConditionalRequest>>,
}

impl MockFeed {
    fn new(response: Result<FeedResponse, FeedError>) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(response),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn entries(entries: Vec<RawEntry>) -> Arc<Self> {
        Self::new(Ok(FeedResponse {
            status: 200,
            etag: Some("\"v1\"".to_string()),
            title: Some("Mock feed".to_string()),
            entries,
            ..FeedResponse::default()
        }))
    }
}

#[async_trait]
impl FeedSource for MockFeed {
    async fn fetch(&self, request: &ConditionalRequest) -> Result<FeedResponse, FeedError> {
        self.requests.lock().unwrap().push(request.clone());
        match &*self.response.lock().unwrap() {
            Ok(response) => Ok(response.clone()),
            Err(FeedError::Status { status, url }) => Err(FeedError::Status {
                status: *status,
                url: url.clone(),
            }),
            Err(_) => Err(FeedError::Timeout(request.url.clone())),
        }
    }
}

fn feed_settings() -> FeedCheckSettings {
    FeedCheckSettings {
        interval: Duration::from_secs(3600),
        max_new_per_poll: 3,
        prime_on_first_poll: true,
        feed_title_len: 16,
        entry_title_len: 15,
    }
}

/// Endpoint that has already been polled once, up to `day`
fn seed_endpoint(queue: &DirQueue, name: &str, seen_day: u32) {
    FeedEndpoint::seed(queue, name, "https://example.com/rss").unwrap();
    let endpoint = FeedEndpoint {
        name: name.to_string(),
        url: "https://example.com/rss".to_string(),
        state: FeedState {
            last_entry: Some(at(seen_day)),
            ..FeedState::default()
        },
    };
    endpoint.save_state(queue).unwrap();
}

#[tokio::test]
async fn test_feed_check_publishes_three_most_recent() {
    let temp_dir = TempDir::new().unwrap();
    let queue = DirQueue::open(temp_dir.path()).unwrap();
    seed_endpoint(&queue, "news", 1);

    // Newest first, the way feeds list them
    let source = MockFeed::entries((2..=6).rev().map(entry).collect());
    let mut stage = FeedCheck::new(
        DirQueue::open(temp_dir.path()).unwrap(),
        source.clone(),
        feed_settings(),
    );
    let (mut ctx, mut link) = channel("FeedCheck");

    stage.step(&mut ctx).await.unwrap();

    let names = queue.list_pending(Stage::FetchDescriptor).unwrap();
    assert_eq!(names.len(), 3);
    let titles: Vec<String> = names
        .iter()
        .map(|n| queue.read_json::<FetchDescriptor>(n).unwrap().title)
        .collect();
    assert_eq!(
        titles,
        vec![
            "2024-05-04-0745 Mock feed - Episode 4",
            "2024-05-05-0745 Mock feed - Episode 5",
            "2024-05-06-0745 Mock feed - Episode 6",
        ]
    );

    let endpoint = FeedEndpoint::load(&queue, "news").unwrap();
    assert_eq!(endpoint.state.last_entry, Some(at(6)));
    assert_eq!(endpoint.state.etag.as_deref(), Some("\"v1\""));

    let logs = link.drain_logs();
    assert!(logs.iter().any(|l| l == "Got 5 seeming to be new"));

    // Same feed again: nothing at or before the cursor is republished
    stage.step(&mut ctx).await.unwrap();
    assert_eq!(queue.list_pending(Stage::FetchDescriptor).unwrap().len(), 3);

    let requests = source.requests.lock().unwrap();
    assert_eq!(requests[1].etag.as_deref(), Some("\"v1\""));
}

#[tokio::test]
async fn test_feed_check_error_leaves_state_untouched() {
    let temp_dir = TempDir::new().unwrap();
    let queue = DirQueue::open(temp_dir.path()).unwrap();
    seed_endpoint(&queue, "news", 1);
    let before = queue.read("feedchk-status-news").unwrap();

    let source = MockFeed::new(Err(FeedError::Status {
        status: 503,
        url: "https://example.com/rss".to_string(),
    }));
    let mut stage = FeedCheck::new(
        DirQueue::open(temp_dir.path()).unwrap(),
        source,
        feed_settings(),
    );
    let (mut ctx, mut link) = channel("FeedCheck");

    stage.step(&mut ctx).await.unwrap();

    assert_eq!(queue.read("feedchk-status-news").unwrap(), before);
    assert!(queue.list_pending(Stage::FetchDescriptor).unwrap().is_empty());
    assert!(link.drain_logs().iter().any(|l| l.starts_with("Error with news - ")));
}

#[tokio::test]
async fn test_feed_check_follows_permanent_redirect() {
    let temp_dir = TempDir::new().unwrap();
    let queue = DirQueue::open(temp_dir.path()).unwrap();
    seed_endpoint(&queue, "news", 1);

    let source = MockFeed::new(Ok(FeedResponse {
        status: 200,
        permanent_redirect: Some("https://new.example.com/rss".to_string()),
        entries: vec![entry(2)],
        ..FeedResponse::default()
    }));
    let mut stage = FeedCheck::new(
        DirQueue::open(temp_dir.path()).unwrap(),
        source,
        feed_settings(),
    );
    let (mut ctx, _link) = channel("FeedCheck");

    stage.step(&mut ctx).await.unwrap();

    let endpoint = FeedEndpoint::load(&queue, "news").unwrap();
    assert_eq!(endpoint.url, "https://new.example.com/rss");
    assert_eq!(queue.list_pending(Stage::FetchDescriptor).unwrap().len(), 1);
}

async fn start_media_server() -> String {
    let app = Router::new()
        .route("/media/episode.mp3", get(|| async { b"ID3 fake mp3 body".to_vec() }))
        .route(
            "/media/stream",
            get(|| async { ([(header::CONTENT_TYPE, "audio/ogg")], b"OggS".to_vec()) }),
        );

    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let bound_addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", bound_addr)
}

fn fetch_stage(dir: &Path) -> Fetch {
    let client = HttpClient::new(HttpConfig {
        max_retries: 1,
        ..HttpConfig::default()
    })
    .unwrap();
    Fetch::new(DirQueue::open(dir).unwrap(), client, Duration::from_secs(1))
}

fn publish_descriptor(queue: &DirQueue, url: String, title: &str) -> String {
    queue
        .publish(
            Stage::FetchDescriptor,
            "news",
            &FetchDescriptor {
                url,
                title: title.to_string(),
            },
        )
        .unwrap()
}

#[tokio::test]
async fn test_fetch_keeps_mp3_extension() {
    let base = start_media_server().await;
    let temp_dir = TempDir::new().unwrap();
    let queue = DirQueue::open(temp_dir.path()).unwrap();
    publish_descriptor(
        &queue,
        format!("{}/media/episode.mp3", base),
        "2024-05-06-0745 Mock feed - Episode 6",
    );

    let mut stage = fetch_stage(temp_dir.path());
    let (mut ctx, _link) = channel("Fetch");
    stage.step(&mut ctx).await.unwrap();

    let items = queue.list_pending(Stage::BuildItem).unwrap();
    assert_eq!(items, vec!["isobuild-item-2024-05-06-0745 Mock feed - Episode 6.mp3"]);
    assert_eq!(queue.read(&items[0]).unwrap(), b"ID3 fake mp3 body");
    assert!(queue.list_pending(Stage::FetchDescriptor).unwrap().is_empty());
}

#[tokio::test]
async fn test_fetch_resolves_name_collisions() {
    let base = start_media_server().await;
    let temp_dir = TempDir::new().unwrap();
    let queue = DirQueue::open(temp_dir.path()).unwrap();
    for _ in 0..2 {
        publish_descriptor(&queue, format!("{}/media/episode.mp3", base), "Same title");
    }

    let mut stage = fetch_stage(temp_dir.path());
    let (mut ctx, _link) = channel("Fetch");
    stage.step(&mut ctx).await.unwrap();

    assert_eq!(
        queue.list_pending(Stage::BuildItem).unwrap(),
        vec!["isobuild-item-Same title 001.mp3", "isobuild-item-Same title.mp3"]
    );
}

#[tokio::test]
async fn test_fetch_falls_back_to_content_type() {
    let base = start_media_server().await;
    let temp_dir = TempDir::new().unwrap();
    let queue = DirQueue::open(temp_dir.path()).unwrap();
    publish_descriptor(&queue, format!("{}/media/stream", base), "Live");

    let mut stage = fetch_stage(temp_dir.path());
    let (mut ctx, _link) = channel("Fetch");
    stage.step(&mut ctx).await.unwrap();

    assert_eq!(
        queue.list_pending(Stage::BuildItem).unwrap(),
        vec!["isobuild-item-Live.ogg"]
    );
}

/// Image tool that writes a listing of its inputs, or fails
struct ListingAuthor {
    fail: bool,
    runs: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl ImageAuthor for ListingAuthor {
    async fn author(&self, output: &Path, entries: &[ImageEntry]) -> audrey::tools::Result<()> {
        let names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        self.runs.lock().unwrap().push(names.clone());
        if self.fail {
            // Partial output, as a crashed tool would leave
            std::fs::write(output, b"garbage").unwrap();
            return Err(ToolError::Failed {
                program: "genisoimage".to_string(),
                code: Some(1),
                output: "boom".to_string(),
            });
        }
        std::fs::write(output, names.join("\n")).unwrap();
        Ok(())
    }
}

fn small_limits() -> BatchLimits {
    BatchLimits {
        soft_age: Duration::from_secs(7 * 24 * 3600),
        soft_size: 400,
        hard_age: Duration::from_secs(14 * 24 * 3600),
        hard_size: 500,
        max_size: 1000,
    }
}

#[tokio::test]
async fn test_build_hard_size_triggers_for_new_items() {
    let temp_dir = TempDir::new().unwrap();
    let queue = DirQueue::open(temp_dir.path()).unwrap();
    queue.publish_bytes(Stage::BuildItem, "a", &[1u8; 300]).unwrap();
    queue.publish_bytes(Stage::BuildItem, "b", &[2u8; 250]).unwrap();
    // Would push the batch to the limit, so stays behind
    let big = queue.publish_bytes(Stage::BuildItem, "c", &[3u8; 450]).unwrap();

    let author = Arc::new(ListingAuthor {
        fail: false,
        runs: Mutex::new(Vec::new()),
    });
    let mut stage = Build::new(
        DirQueue::open(temp_dir.path()).unwrap(),
        author.clone(),
        small_limits(),
        Duration::from_secs(1),
    );
    let (mut ctx, _link) = channel("Build");
    stage.step(&mut ctx).await.unwrap();

    let jobs = queue.list_pending(Stage::BurnJob).unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].ends_with(".iso"));
    assert_eq!(author.runs.lock().unwrap()[0].len(), 2);
    assert_eq!(queue.list_pending(Stage::BuildItem).unwrap(), vec![big]);
}

#[tokio::test]
async fn test_build_failure_keeps_every_item() {
    let temp_dir = TempDir::new().unwrap();
    let queue = DirQueue::open(temp_dir.path()).unwrap();
    queue.publish_bytes(Stage::BuildItem, "a", &[1u8; 300]).unwrap();
    queue.publish_bytes(Stage::BuildItem, "b", &[2u8; 250]).unwrap();

    let author = Arc::new(ListingAuthor {
        fail: true,
        runs: Mutex::new(Vec::new()),
    });
    let mut stage = Build::new(
        DirQueue::open(temp_dir.path()).unwrap(),
        author,
        small_limits(),
        Duration::from_secs(1),
    );
    let (mut ctx, mut link) = channel("Build");
    stage.step(&mut ctx).await.unwrap();

    assert_eq!(queue.list_pending(Stage::BuildItem).unwrap().len(), 2);
    assert!(queue.list_pending(Stage::BurnJob).unwrap().is_empty());
    // The partial image was cleaned up
    assert_eq!(queue.recover().unwrap(), 0);
    assert!(link.drain_logs().iter().any(|l| l.starts_with("Image build failed")));
}

/// Drive whose tray contents the test changes between cycles
struct MockDrive {
    media: Mutex<MediaStatus>,
    calls: Mutex<Vec<&'static str>>,
}

impl MockDrive {
    fn set_media(&self, media: MediaStatus) {
        *self.media.lock().unwrap() = media;
    }

    fn take_calls(&self) -> Vec<&'static str> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }
}

#[async_trait]
impl DiscDrive for MockDrive {
    async fn probe(&self) -> audrey::tools::Result<MediaStatus> {
        self.calls.lock().unwrap().push("probe");
        Ok(*self.media.lock().unwrap())
    }

    async fn eject(&self) {
        self.calls.lock().unwrap().push("eject");
    }

    async fn retract(&self) {
        self.calls.lock().unwrap().push("retract");
    }

    async fn burn(&self, _image: &Path) -> audrey::tools::Result<()> {
        self.calls.lock().unwrap().push("burn");
        Ok(())
    }
}

#[tokio::test]
async fn test_disc_loaded_event_forces_reprobe() {
    let temp_dir = TempDir::new().unwrap();
    let queue = DirQueue::open(temp_dir.path()).unwrap();
    let job = queue.publish_bytes(Stage::BurnJob, "", b"image").unwrap();

    let drive = Arc::new(MockDrive {
        media: Mutex::new(MediaStatus::NonBlank),
        calls: Mutex::new(Vec::new()),
    });
    let mut stage = Burn::new(
        DirQueue::open(temp_dir.path()).unwrap(),
        drive.clone(),
        Duration::ZERO,
        Duration::from_millis(500),
    );
    let (mut ctx, link) = channel("Burn");

    stage.step(&mut ctx).await.unwrap();
    assert_eq!(stage.state(), DriveState::NotFed);
    drive.take_calls();

    // Without the event, a known state is not re-verified by retracting
    stage.step(&mut ctx).await.unwrap();
    assert!(!drive.take_calls().contains(&"retract"));

    // User loads a blank disc and confirms
    drive.set_media(MediaStatus::Blank);
    link.send_event(ControlEvent::DiscLoaded);
    stage.step(&mut ctx).await.unwrap();

    assert_eq!(drive.take_calls(), vec!["retract", "probe", "burn", "eject"]);
    assert_eq!(stage.state(), DriveState::NotFed);
    assert!(!queue.path_of(&job).exists());
}

#[tokio::test]
async fn test_burn_never_runs_without_blank_disc() {
    let temp_dir = TempDir::new().unwrap();
    let queue = DirQueue::open(temp_dir.path()).unwrap();
    queue.publish_bytes(Stage::BurnJob, "", b"image").unwrap();

    let drive = Arc::new(MockDrive {
        media: Mutex::new(MediaStatus::NoMedium),
        calls: Mutex::new(Vec::new()),
    });
    let mut stage = Burn::new(
        DirQueue::open(temp_dir.path()).unwrap(),
        drive.clone(),
        Duration::ZERO,
        Duration::from_millis(500),
    );
    let (mut ctx, _link) = channel("Burn");

    for media in [MediaStatus::NoMedium, MediaStatus::NonBlank, MediaStatus::NoMedium] {
        drive.set_media(media);
        stage.step(&mut ctx).await.unwrap();
        assert_ne!(stage.state(), DriveState::Fed);
    }

    assert!(!drive.take_calls().contains(&"burn"));
    assert_eq!(queue.list_pending(Stage::BurnJob).unwrap().len(), 1);
}
