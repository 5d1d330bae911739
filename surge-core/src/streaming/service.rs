//! HLS facade used by the HTTP layer.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::StreamingError;
use super::segment_delivery::{SegmentDelivery, SegmentRequest, SegmentResponse};
use super::state::{LiveStreamHandle, StreamState};
use crate::config::SurgeConfig;
use crate::encoding::{
    BaseEncodingJobOptions, CommandLineBuilder, FfmpegArgs, HardwareCapabilities, NegotiationContext,
    Platform, TranscodingJobType, negotiate,
};
use crate::keyframes::KeyframeCache;
use crate::media::MediaSourceProvider;
use crate::playlist::{
    CreateMainPlaylistRequest, MasterPlaylistOptions, create_main_playlist, create_master_playlist,
    is_extraction_allowed_for_file,
};
use crate::transcoding::files::output_path_for;
use crate::transcoding::{ActiveEncodingInfo, TranscodeManager};

/// Relative URL of the media playlist, as seen from the master playlist.
pub const MAIN_PLAYLIST: &str = "main.m3u8";

/// Relative prefix of segment URLs, as seen from the media playlist.
pub const SEGMENT_PREFIX: &str = "hls1/main/";

/// Entry point for playlist and segment requests.
#[derive(Clone)]
pub struct HlsService {
    config: Arc<SurgeConfig>,
    provider: Arc<dyn MediaSourceProvider>,
    manager: TranscodeManager,
    keyframes: KeyframeCache,
    capabilities: Arc<HardwareCapabilities>,
    platform: Platform,
    delivery: SegmentDelivery,
    live_streams: Option<Arc<dyn LiveStreamHandle>>,
}

impl HlsService {
    pub fn new(
        config: SurgeConfig,
        provider: Arc<dyn MediaSourceProvider>,
        manager: TranscodeManager,
        capabilities: HardwareCapabilities,
        platform: Platform,
    ) -> Self {
        let capabilities = Arc::new(capabilities);
        let keyframes = KeyframeCache::new(
            config.encoding.ffprobe_path.clone(),
            KeyframeCache::DEFAULT_CAPACITY,
        );
        let delivery = SegmentDelivery::new(manager.clone(), Arc::clone(&capabilities), platform);
        Self {
            config: Arc::new(config),
            provider,
            manager,
            keyframes,
            capabilities,
            platform,
            delivery,
            live_streams: None,
        }
    }

    pub fn with_live_streams(mut self, handle: Arc<dyn LiveStreamHandle>) -> Self {
        self.live_streams = Some(handle);
        self
    }

    pub fn config(&self) -> &SurgeConfig {
        &self.config
    }

    pub fn manager(&self) -> &TranscodeManager {
        &self.manager
    }

    pub fn keyframes(&self) -> &KeyframeCache {
        &self.keyframes
    }

    /// Resolves `item_id` and negotiates `options` against it.
    ///
    /// Every request of a session negotiates against the media playlist URL
    /// so playlists and segments agree on the plan.
    ///
    /// # Errors
    /// - `StreamingError::Probe` - Source could not be resolved
    /// - `StreamingError::Encoding` - Request cannot be satisfied
    pub async fn build_state(
        &self,
        item_id: &str,
        options: BaseEncodingJobOptions,
    ) -> Result<StreamState, StreamingError> {
        let source = self.provider.media_source(item_id).await?;
        let ctx = NegotiationContext {
            options: &self.config.encoding,
            hls: &self.config.hls,
            capabilities: &self.capabilities,
            platform: self.platform,
        };
        let requested_url = format!("/videos/{item_id}/{MAIN_PLAYLIST}");
        let job = negotiate(&ctx, options, TranscodingJobType::Hls, source, &requested_url)?;

        let request = &job.base_request;
        let video_bitrate = job.output_video_bitrate.map(|b| b.to_string()).unwrap_or_default();
        let output_path = output_path_for(
            &self.config.encoding.transcode_dir,
            &[
                job.media_path.as_str(),
                request.device_id.as_deref().unwrap_or_default(),
                request.play_session_id.as_deref().unwrap_or_default(),
                job.segment_container.as_str(),
                job.output_video_codec.as_deref().unwrap_or_default(),
                job.output_audio_codec.as_deref().unwrap_or_default(),
                video_bitrate.as_str(),
            ],
            ".m3u8",
        );

        let state = StreamState::new(job, output_path, &self.config.hls);
        Ok(match &self.live_streams {
            Some(handle) => state.with_live_stream(Arc::clone(handle)),
            None => state,
        })
    }

    /// # Errors
    /// See [`HlsService::build_state`].
    pub async fn master_playlist(&self, item_id: &str, query: &str) -> Result<String, StreamingError> {
        let mut state = self
            .build_state(item_id, BaseEncodingJobOptions::from_query_string(query))
            .await?;
        let playlist = create_master_playlist(
            &state.job,
            &MasterPlaylistOptions {
                media_playlist: MAIN_PLAYLIST,
                enable_adaptive_bitrate_streaming: self.config.hls.enable_adaptive_bitrate_streaming,
                enable_sdr_variant: self.config.encoding.enable_tonemapping
                    || self.config.encoding.allow_hevc_encoding,
                subtitle_uri_prefix: "",
            },
        );
        state.dispose().await;
        Ok(playlist)
    }

    /// # Errors
    /// - `StreamingError::UnknownRuntime` - Source has no duration to lay out
    /// - See [`HlsService::build_state`]
    pub async fn main_playlist(&self, item_id: &str, query: &str) -> Result<String, StreamingError> {
        let mut state = self
            .build_state(item_id, BaseEncodingJobOptions::from_query_string(query))
            .await?;
        let result = self.render_main_playlist(item_id, &state).await;
        state.dispose().await;
        result
    }

    async fn render_main_playlist(
        &self,
        item_id: &str,
        state: &StreamState,
    ) -> Result<String, StreamingError> {
        let total_runtime_ticks = state
            .run_time_ticks()
            .filter(|ticks| *ticks > 0)
            .ok_or_else(|| StreamingError::UnknownRuntime {
                item_id: item_id.to_string(),
            })?;

        let is_remuxing_video = state.job.is_video_copy();
        let keyframes = if is_remuxing_video
            && is_extraction_allowed_for_file(
                &state.job.media_path,
                &self.config.encoding.keyframe_extraction_extensions,
            ) {
            self.keyframes
                .get_or_extract(std::path::Path::new(&state.job.media_path))
                .await
        } else {
            None
        };

        let request = CreateMainPlaylistRequest {
            file_path: state.job.media_path.clone(),
            desired_segment_length_ms: i64::from(state.segment_length) * 1000,
            total_runtime_ticks,
            segment_container: state.job.segment_container.clone(),
            endpoint_prefix: SEGMENT_PREFIX.to_string(),
            query_string: state.job.url_query(),
            is_remuxing_video,
        };
        Ok(create_main_playlist(&request, keyframes.as_deref())?)
    }

    /// Serves `segment_file` (e.g. `12.ts`) of the stream described by `query`.
    ///
    /// # Errors
    /// - `StreamingError::InvalidSegment` - File name carries no index
    /// - See [`SegmentDelivery::get_segment`]
    pub async fn segment(
        &self,
        item_id: &str,
        segment_file: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<SegmentResponse, StreamingError> {
        let index = parse_segment_index(segment_file)?;
        let options = BaseEncodingJobOptions::from_query_string(query);
        let request = SegmentRequest {
            index,
            runtime_ticks: options.current_runtime_ticks,
            actual_segment_length_ticks: options.actual_segment_length_ticks,
        };

        let mut state = self.build_state(item_id, options).await?;
        debug!(
            "Segment {} of {} requested for {}",
            index,
            item_id,
            state.output_path().display()
        );
        let result = self.delivery.get_segment(&state, &request, cancel).await;
        state.dispose().await;
        result
    }

    /// The ffmpeg command a segment request for `query` would launch.
    ///
    /// # Errors
    /// See [`HlsService::build_state`].
    pub async fn negotiated_command(
        &self,
        item_id: &str,
        query: &str,
    ) -> Result<(StreamState, FfmpegArgs), StreamingError> {
        let state = self
            .build_state(item_id, BaseEncodingJobOptions::from_query_string(query))
            .await?;
        let start_index = state
            .job
            .base_request
            .start_time_ticks
            .map(|ticks| ticks / state.segment_length_ticks())
            .unwrap_or(0);
        let args = CommandLineBuilder::new(
            &state.job,
            &self.config.encoding,
            &self.capabilities,
            self.platform,
        )
        .hls_command_line(state.output_path(), state.segment_length, start_index);
        Ok((state, args))
    }

    pub fn ping(&self, play_session_id: &str) -> bool {
        self.manager.ping_transcoding_job(play_session_id)
    }

    /// Stops a device's transcodes and deletes their output.
    pub async fn stop(&self, device_id: &str, play_session_id: Option<&str>) -> usize {
        self.manager
            .kill_transcoding_jobs(device_id, play_session_id, true)
            .await
    }

    pub fn active_jobs(&self) -> Vec<ActiveEncodingInfo> {
        self.manager.active_jobs()
    }
}

/// Index from a segment file name such as `12.ts` or `-1.mp4`.
pub fn parse_segment_index(segment_file: &str) -> Result<i64, StreamingError> {
    let stem = segment_file
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(segment_file);
    stem.parse::<i64>()
        .ok()
        .filter(|index| *index >= -1)
        .ok_or_else(|| StreamingError::InvalidSegment {
            reason: format!("no segment index in {segment_file:?}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_segment_index() {
        assert_eq!(parse_segment_index("12.ts").unwrap(), 12);
        assert_eq!(parse_segment_index("-1.mp4").unwrap(), -1);
        assert_eq!(parse_segment_index("0.mp4").unwrap(), 0);
        assert!(parse_segment_index("abc.ts").is_err());
        assert!(parse_segment_index("-2.ts").is_err());
    }
}
