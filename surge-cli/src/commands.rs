//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Subcommand;
use surge_core::{SurgeConfig, SurgeError};
use surge_core::encoding::{HardwareCapabilities, Platform};
use surge_core::keyframes::extract_keyframes;
use surge_core::media::{ProbingMediaSourceProvider, probe_media_source};
use surge_core::playlist::{CreateMainPlaylistRequest, create_main_playlist, is_extraction_allowed_for_file};
use surge_core::streaming::HlsService;
use surge_core::streaming::service::SEGMENT_PREFIX;
use surge_core::ticks::ticks_to_seconds;
use surge_core::transcoding::TranscodeManager;
use tracing::info;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the HLS server
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
        /// Directory item ids are resolved against
        #[arg(long)]
        media_dir: Option<PathBuf>,
        /// Directory receiving playlists and segments
        #[arg(long)]
        transcode_dir: Option<PathBuf>,
    },
    /// Print probed source metadata as JSON
    Probe {
        /// Media file
        file: PathBuf,
    },
    /// List keyframe timestamps of a file
    Keyframes {
        /// Media file
        file: PathBuf,
    },
    /// Print the media playlist for a file
    Playlist {
        /// Media file
        file: PathBuf,
        /// Desired segment length in milliseconds
        #[arg(long, default_value = "6000")]
        segment_length_ms: i64,
        /// Segment container (ts or mp4)
        #[arg(long, default_value = "ts")]
        container: String,
        /// Cut at source keyframes as a stream copy would
        #[arg(long)]
        remux: bool,
    },
    /// Print the ffmpeg command a request would launch
    Command {
        /// Media file
        file: PathBuf,
        /// Request query string, e.g. "VideoCodec=h264&AudioCodec=aac"
        query: Option<String>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let config = SurgeConfig::from_env();
    match command {
        Commands::Serve {
            host,
            port,
            media_dir,
            transcode_dir,
        } => serve(config, host, port, media_dir, transcode_dir).await,
        Commands::Probe { file } => probe(&config, &file).await,
        Commands::Keyframes { file } => keyframes(&config, &file).await,
        Commands::Playlist {
            file,
            segment_length_ms,
            container,
            remux,
        } => playlist(&config, &file, segment_length_ms, &container, remux).await,
        Commands::Command { file, query } => command_line(config, &file, query.as_deref()).await,
    }
}

async fn serve(
    mut config: SurgeConfig,
    host: Option<String>,
    port: Option<u16>,
    media_dir: Option<PathBuf>,
    transcode_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(dir) = media_dir {
        config.server.media_dir = dir;
    }
    if let Some(dir) = transcode_dir {
        config.encoding.transcode_dir = dir;
    }

    info!(
        "Serving {} with transcodes in {}",
        config.server.media_dir.display(),
        config.encoding.transcode_dir.display()
    );
    surge_web::run_server(config).await.context("Server failed")
}

async fn probe(config: &SurgeConfig, file: &Path) -> anyhow::Result<()> {
    let source = probe_media_source(&config.encoding.ffprobe_path, file)
        .await
        .map_err(SurgeError::from)
        .with_context(|| format!("Failed to probe {}", file.display()))?;
    println!("{}", serde_json::to_string_pretty(&source)?);
    Ok(())
}

async fn keyframes(config: &SurgeConfig, file: &Path) -> anyhow::Result<()> {
    let data = extract_keyframes(&config.encoding.ffprobe_path, file)
        .await
        .map_err(SurgeError::from)
        .with_context(|| format!("Failed to extract keyframes from {}", file.display()))?;
    for ticks in &data.keyframe_ticks {
        println!("{:.3}", ticks_to_seconds(*ticks));
    }
    println!(
        "{} keyframes, duration {:.3}s",
        data.keyframe_ticks.len(),
        ticks_to_seconds(data.total_duration_ticks)
    );
    Ok(())
}

async fn playlist(
    config: &SurgeConfig,
    file: &Path,
    segment_length_ms: i64,
    container: &str,
    remux: bool,
) -> anyhow::Result<()> {
    let source = probe_media_source(&config.encoding.ffprobe_path, file)
        .await
        .map_err(SurgeError::from)
        .with_context(|| format!("Failed to probe {}", file.display()))?;
    let Some(total_runtime_ticks) = source.run_time_ticks.filter(|ticks| *ticks > 0) else {
        bail!("{} has no known duration", file.display());
    };

    let file_path = file.to_string_lossy().into_owned();
    let keyframes = if remux
        && is_extraction_allowed_for_file(&file_path, &config.encoding.keyframe_extraction_extensions)
    {
        Some(
            extract_keyframes(&config.encoding.ffprobe_path, file)
                .await
                .map_err(SurgeError::from)
                .with_context(|| format!("Failed to extract keyframes from {}", file.display()))?,
        )
    } else {
        None
    };

    let request = CreateMainPlaylistRequest {
        file_path,
        desired_segment_length_ms: segment_length_ms,
        total_runtime_ticks,
        segment_container: container.to_string(),
        endpoint_prefix: SEGMENT_PREFIX.to_string(),
        query_string: String::new(),
        is_remuxing_video: remux,
    };
    let playlist = create_main_playlist(&request, keyframes.as_ref()).map_err(SurgeError::from)?;
    print!("{playlist}");
    Ok(())
}

async fn command_line(config: SurgeConfig, file: &Path, query: Option<&str>) -> anyhow::Result<()> {
    let (Some(dir), Some(name)) = (file.parent(), file.file_name()) else {
        bail!("{} is not a file path", file.display());
    };
    let item_id = name.to_string_lossy().into_owned();

    let capabilities = HardwareCapabilities::probe(&config.encoding.ffmpeg_path).await;
    let provider = Arc::new(ProbingMediaSourceProvider::new(
        config.encoding.ffprobe_path.clone(),
        dir.to_path_buf(),
    ));
    let manager = TranscodeManager::with_ffmpeg(&config);
    let service = HlsService::new(config, provider, manager, capabilities, Platform::current());

    let (mut state, args) = service
        .negotiated_command(&item_id, query.unwrap_or_default())
        .await
        .map_err(SurgeError::from)?;
    println!("# output: {}", state.output_path().display());
    println!("{} {}", service.config().encoding.ffmpeg_path.display(), args);
    state.dispose().await;
    Ok(())
}
