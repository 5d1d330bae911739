//! End-to-end segment delivery against a simulated transcoder.
//!
//! The mock launcher reads the HLS muxer arguments it is given and writes
//! segment files plus playlist entries the way ffmpeg would.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use surge_core::SurgeConfig;
use surge_core::encoding::{BaseEncodingJobOptions, HardwareCapabilities, Platform};
use surge_core::media::{MediaSourceInfo, MediaSourceProvider, MediaStream, MediaStreamType, ProbeError};
use surge_core::streaming::service::SEGMENT_PREFIX;
use surge_core::streaming::{HlsService, StreamingError};
use surge_core::transcoding::files::segment_path;
use surge_core::transcoding::{
    ProcessLauncher, ProcessSpec, SpawnedProcess, TranscodeManager, TranscoderChild,
    TranscodingError,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const QUERY: &str = "VideoCodec=h264&AudioCodec=aac&DeviceId=dev&PlaySessionId=s1\
                     &SegmentContainer=ts&SegmentLength=3";

/// Mock media source provider with one movie.
struct MockProvider;

#[async_trait]
impl MediaSourceProvider for MockProvider {
    async fn media_source(&self, item_id: &str) -> Result<MediaSourceInfo, ProbeError> {
        if item_id != "movie" {
            return Err(ProbeError::NotFound {
                item_id: item_id.to_string(),
            });
        }
        Ok(MediaSourceInfo {
            id: "movie".to_string(),
            path: "/media/movie.mkv".to_string(),
            container: Some("mkv".to_string()),
            run_time_ticks: Some(120 * 10_000_000),
            media_streams: vec![
                MediaStream {
                    index: 0,
                    stream_type: MediaStreamType::Video,
                    codec: Some("h264".to_string()),
                    profile: Some("High".to_string()),
                    level: Some(41.0),
                    width: Some(1920),
                    height: Some(1080),
                    bit_rate: Some(8_000_000),
                    bit_depth: Some(8),
                    real_frame_rate: Some(23.976),
                    is_avc: Some(true),
                    ..Default::default()
                },
                MediaStream {
                    index: 1,
                    stream_type: MediaStreamType::Audio,
                    codec: Some("aac".to_string()),
                    channels: Some(2),
                    sample_rate: Some(48_000),
                    ..Default::default()
                },
            ],
            ..Default::default()
        })
    }
}

struct MockChild {
    done: CancellationToken,
}

#[async_trait]
impl TranscoderChild for MockChild {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.done.cancelled().await;
        Ok(Some(0))
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.done.cancel();
        Ok(())
    }

    fn id(&self) -> Option<u32> {
        None
    }
}

/// Writes `segment_count` segments, one every `segment_delay`, then exits.
///
/// A segment shows up in the playlist `listing_delay` after its file is
/// created. Tracks how many simulated processes run at once.
struct MockLauncher {
    segment_delay: Duration,
    listing_delay: Duration,
    segment_count: i64,
    spawned: AtomicUsize,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl MockLauncher {
    fn new(segment_delay: Duration, segment_count: i64) -> Self {
        Self {
            segment_delay,
            listing_delay: Duration::ZERO,
            segment_count,
            spawned: AtomicUsize::new(0),
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn with_listing_delay(mut self, listing_delay: Duration) -> Self {
        self.listing_delay = listing_delay;
        self
    }
}

fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

#[async_trait]
impl ProcessLauncher for MockLauncher {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<SpawnedProcess, TranscodingError> {
        let start_number: i64 = arg_after(&spec.args, "-start_number")
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| TranscodingError::StartFailed {
                reason: "missing -start_number".to_string(),
            })?;
        let pattern = arg_after(&spec.args, "-hls_segment_filename")
            .map(String::from)
            .ok_or_else(|| TranscodingError::StartFailed {
                reason: "missing -hls_segment_filename".to_string(),
            })?;
        let playlist = spec.args.last().map(PathBuf::from).ok_or_else(|| {
            TranscodingError::StartFailed {
                reason: "missing output".to_string(),
            }
        })?;

        self.spawned.fetch_add(1, Ordering::SeqCst);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);

        let (stdin_writer, mut stdin_reader) = tokio::io::duplex(64);
        let done = CancellationToken::new();

        // Quit on 'q'
        let quit = CancellationToken::new();
        {
            let quit = quit.clone();
            tokio::spawn(async move {
                let mut byte = [0u8; 1];
                while let Ok(1) = stdin_reader.read(&mut byte).await {
                    if byte[0] == b'q' {
                        break;
                    }
                }
                quit.cancel();
            });
        }

        {
            let done = done.clone();
            let running = Arc::clone(&self.running);
            let delay = self.segment_delay;
            let listing_delay = self.listing_delay;
            let count = self.segment_count;
            tokio::spawn(async move {
                for index in start_number..start_number + count {
                    tokio::select! {
                        _ = quit.cancelled() => break,
                        _ = done.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    let segment = PathBuf::from(pattern.replace("%d", &index.to_string()));
                    if tokio::fs::write(&segment, vec![0x47u8; 188]).await.is_err() {
                        break;
                    }
                    if !listing_delay.is_zero() {
                        tokio::time::sleep(listing_delay).await;
                    }
                    let name = segment
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let mut file = match tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&playlist)
                        .await
                    {
                        Ok(file) => file,
                        Err(_) => break,
                    };
                    let _ = file
                        .write_all(format!("#EXTINF:3.000000,\n{name}\n").as_bytes())
                        .await;
                }
                running.fetch_sub(1, Ordering::SeqCst);
                done.cancel();
            });
        }

        Ok(SpawnedProcess {
            child: Box::new(MockChild { done }),
            stdin: Some(Box::new(stdin_writer)),
            stderr: None,
        })
    }
}

fn setup_service(dir: &TempDir, launcher: Arc<MockLauncher>) -> HlsService {
    let config = SurgeConfig::for_testing(dir.path());
    let manager = TranscodeManager::new(&config, launcher);
    HlsService::new(
        config,
        Arc::new(MockProvider),
        manager,
        HardwareCapabilities::default(),
        Platform::Linux,
    )
}

#[tokio::test]
async fn test_first_segment_starts_transcode_and_is_served() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new(Duration::from_millis(20), 5));
    let service = setup_service(&dir, launcher.clone());

    let response = service
        .segment("movie", "0.ts", QUERY, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.index, 0);
    assert_eq!(response.content_type, "video/mp2t");
    assert!(response.path.exists());
    assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);

    let job = response.job().unwrap();
    assert_eq!(job.start_number(), 0);
    assert_eq!(job.active_request_count(), 1);
    assert_eq!(job.download_position_ticks(), Some(3 * 10_000_000));
    assert_eq!(job.bytes_downloaded(), 188);
    assert_eq!(service.active_jobs().len(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_transcoder() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new(Duration::from_millis(80), 5));
    let service = setup_service(&dir, launcher.clone());

    let first = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .segment("movie", "0.ts", QUERY, &CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .segment("movie", "1.ts", QUERY, &CancellationToken::new())
                .await
        })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.index, 0);
    assert_eq!(second.index, 1);
    assert!(first.job().unwrap().is_same(second.job().unwrap()));
    assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);
    assert_eq!(launcher.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_seek_past_gap_restarts_single_transcoder() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new(Duration::from_millis(20), 50));
    let service = setup_service(&dir, launcher.clone());

    let first = service
        .segment("movie", "0.ts", QUERY, &CancellationToken::new())
        .await
        .unwrap();
    let first_job = first.job().cloned().unwrap();
    drop(first);

    // 24s gap at 3s segments is 8 segments
    let far = service
        .segment("movie", "20.ts", QUERY, &CancellationToken::new())
        .await
        .unwrap();
    let far_job = far.job().unwrap();

    assert!(!far_job.is_same(&first_job));
    assert_eq!(far_job.start_number(), 20);
    assert!(first_job.has_exited());
    assert_eq!(launcher.spawned.load(Ordering::SeqCst), 2);
    assert_eq!(launcher.max_running.load(Ordering::SeqCst), 1);
    assert_eq!(service.manager().job_count(), 1);
}

#[tokio::test]
async fn test_cancelled_request_releases_path_lock() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new(Duration::from_secs(30), 1));
    let service = setup_service(&dir, launcher.clone());

    let cancel = CancellationToken::new();
    let request = {
        let service = service.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { service.segment("movie", "0.ts", QUERY, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), request)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(StreamingError::Cancelled)));

    let state = service
        .build_state("movie", surge_core::encoding::BaseEncodingJobOptions::from_query_string(QUERY))
        .await
        .unwrap();
    let guard = tokio::time::timeout(
        Duration::from_secs(1),
        service.manager().lock(state.output_path(), &CancellationToken::new()),
    )
    .await
    .unwrap();
    assert!(guard.is_ok());
}

#[tokio::test]
async fn test_unknown_item_is_user_error() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new(Duration::from_millis(20), 1));
    let service = setup_service(&dir, launcher.clone());

    let error = service
        .segment("missing", "0.ts", QUERY, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(error.is_user_error());
    assert_eq!(launcher.spawned.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stop_kills_and_removes_output() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new(Duration::from_millis(20), 50));
    let service = setup_service(&dir, launcher.clone());

    let response = service
        .segment("movie", "0.ts", QUERY, &CancellationToken::new())
        .await
        .unwrap();
    let segment = response.path.clone();
    let job = response.job().cloned().unwrap();
    drop(response);

    assert_eq!(service.stop("dev", Some("s1")).await, 1);
    assert!(job.has_exited());
    assert!(!segment.exists());
    assert!(service.active_jobs().is_empty());
}

#[tokio::test]
async fn test_stale_next_segment_does_not_complete_restarted_segment() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(
        MockLauncher::new(Duration::from_millis(20), 5)
            .with_listing_delay(Duration::from_millis(300)),
    );
    let service = setup_service(&dir, launcher.clone());

    // Left behind by an earlier run of the same output
    let state = service
        .build_state("movie", BaseEncodingJobOptions::from_query_string(QUERY))
        .await
        .unwrap();
    let playlist = state.output_path().to_path_buf();
    std::fs::create_dir_all(playlist.parent().unwrap()).unwrap();
    std::fs::write(segment_path(&playlist, 1, ".ts"), b"stale").unwrap();

    let response = service
        .segment("movie", "0.ts", QUERY, &CancellationToken::new())
        .await
        .unwrap();

    // Served only once the transcoder listed it, not when the stale file was seen
    let name = response
        .path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    let listed = std::fs::read_to_string(&playlist).unwrap();
    assert!(listed.lines().any(|line| line == name));
    assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_playlist_segment_urls_reach_same_transcode() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(MockLauncher::new(Duration::from_millis(20), 10));
    let service = setup_service(&dir, launcher.clone());
    let query = "VideoCodec=hevc,h264&AudioCodec=aac&DeviceId=dev&PlaySessionId=s1\
                 &SegmentContainer=ts&SegmentLength=3&Width=1280";

    let playlist = service.main_playlist("movie", query).await.unwrap();
    let first_url = playlist
        .lines()
        .find(|line| line.starts_with(SEGMENT_PREFIX))
        .unwrap();
    let (file, segment_query) = first_url
        .strip_prefix(SEGMENT_PREFIX)
        .and_then(|rest| rest.split_once('?'))
        .unwrap();
    assert_eq!(file, "0.ts");

    // The URL carries what the client asked for, not the negotiated narrowing
    let reparsed = BaseEncodingJobOptions::from_query_string(segment_query);
    assert_eq!(reparsed.video_codec.as_deref(), Some("hevc,h264"));
    assert_eq!(reparsed.width, Some(1280));

    let from_client = service
        .build_state("movie", BaseEncodingJobOptions::from_query_string(query))
        .await
        .unwrap();
    let from_url = service.build_state("movie", reparsed).await.unwrap();
    assert_eq!(from_client.output_path(), from_url.output_path());
    assert_eq!(
        from_client.job.output_video_codec,
        from_url.job.output_video_codec
    );
    assert_eq!(
        from_client.job.output_audio_codec,
        from_url.job.output_audio_codec
    );
    assert_eq!(from_client.job.segment_container, from_url.job.segment_container);

    let first = service
        .segment("movie", file, segment_query, &CancellationToken::new())
        .await
        .unwrap();
    let second = service
        .segment("movie", "1.ts", segment_query, &CancellationToken::new())
        .await
        .unwrap();
    assert!(first.job().unwrap().is_same(second.job().unwrap()));
    assert_eq!(first.path, segment_path(from_client.output_path(), 0, ".ts"));
    assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);
}
