//! Encoding request and progress types.

use serde::{Deserialize, Serialize};

use crate::stage::MediaRef;
use crate::worker::HardwareAccel;

/// Target video codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    Hevc,
    H264,
    Av1,
}

impl VideoCodec {
    /// ffmpeg encoder name for this codec on the given acceleration.
    pub fn encoder(&self, accel: HardwareAccel) -> &'static str {
        match (self, accel) {
            (VideoCodec::Hevc, HardwareAccel::Software) => "libx265",
            (VideoCodec::Hevc, HardwareAccel::Nvenc) => "hevc_nvenc",
            (VideoCodec::Hevc, HardwareAccel::Qsv) => "hevc_qsv",
            (VideoCodec::Hevc, HardwareAccel::Amf) => "hevc_amf",
            (VideoCodec::H264, HardwareAccel::Software) => "libx264",
            (VideoCodec::H264, HardwareAccel::Nvenc) => "h264_nvenc",
            (VideoCodec::H264, HardwareAccel::Qsv) => "h264_qsv",
            (VideoCodec::H264, HardwareAccel::Amf) => "h264_amf",
            (VideoCodec::Av1, HardwareAccel::Software) => "libsvtav1",
            (VideoCodec::Av1, HardwareAccel::Nvenc) => "av1_nvenc",
            (VideoCodec::Av1, HardwareAccel::Qsv) => "av1_qsv",
            (VideoCodec::Av1, HardwareAccel::Amf) => "av1_amf",
        }
    }
}

/// Target audio codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    Aac,
    Opus,
    Copy,
}

impl AudioCodec {
    pub fn ffmpeg_codec(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Opus => "libopus",
            AudioCodec::Copy => "copy",
        }
    }
}

/// Output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Container {
    Mkv,
    Mp4,
    Webm,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mkv => "mkv",
            Container::Mp4 => "mp4",
            Container::Webm => "webm",
        }
    }
}

/// How to encode a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeParams {
    #[serde(default = "default_video_codec")]
    pub video_codec: VideoCodec,
    /// Constant quality; takes precedence over `video_bitrate_kbps`.
    #[serde(default = "default_crf")]
    pub crf: Option<u8>,
    #[serde(default)]
    pub video_bitrate_kbps: Option<u32>,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: AudioCodec,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate_kbps: u32,
    #[serde(default = "default_container")]
    pub container: Container,
}

fn default_video_codec() -> VideoCodec {
    VideoCodec::Hevc
}

fn default_crf() -> Option<u8> {
    Some(23)
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_audio_codec() -> AudioCodec {
    AudioCodec::Aac
}

fn default_audio_bitrate() -> u32 {
    192
}

fn default_container() -> Container {
    Container::Mkv
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            video_codec: default_video_codec(),
            crf: default_crf(),
            video_bitrate_kbps: None,
            preset: default_preset(),
            audio_codec: default_audio_codec(),
            audio_bitrate_kbps: default_audio_bitrate(),
            container: default_container(),
        }
    }
}

impl EncodeParams {
    /// Output file name for an input with the given stem.
    pub fn output_file_name(&self, stem: &str) -> String {
        format!("{}.{}", stem, self.container.extension())
    }
}

/// One encode to run on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeRequest {
    pub job_id: String,
    pub input: MediaRef,
    pub params: EncodeParams,
    pub accel: HardwareAccel,
}

impl EncodeRequest {
    pub fn output_file_name(&self) -> String {
        let stem = self
            .input
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.job_id.clone());
        self.params.output_file_name(&stem)
    }
}

/// Acceleration to request from a worker: the required one if any,
/// otherwise the first hardware encoder the worker offers.
pub fn pick_accel(required: Option<HardwareAccel>, capabilities: &[HardwareAccel]) -> HardwareAccel {
    required.unwrap_or_else(|| {
        capabilities
            .iter()
            .copied()
            .find(|a| *a != HardwareAccel::Software)
            .unwrap_or(HardwareAccel::Software)
    })
}

/// Worker-side reference to a submitted encode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeHandle {
    pub worker_id: String,
    /// Job id on the worker.
    pub job_ref: String,
    /// Job-scoped credential returned at registration (remote only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub output_name: String,
}

/// State of a submitted encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeStatus {
    Running,
    Succeeded,
    Failed,
}

/// Result of polling a submitted encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodePoll {
    pub status: EncodeStatus,
    #[serde(default)]
    pub progress_percent: f32,
    #[serde(default)]
    pub eta_secs: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl EncodePoll {
    pub fn running(progress_percent: f32, eta_secs: Option<u64>) -> Self {
        Self {
            status: EncodeStatus::Running,
            progress_percent,
            eta_secs,
            message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_names() {
        assert_eq!(VideoCodec::Hevc.encoder(HardwareAccel::Software), "libx265");
        assert_eq!(VideoCodec::Hevc.encoder(HardwareAccel::Nvenc), "hevc_nvenc");
        assert_eq!(VideoCodec::H264.encoder(HardwareAccel::Qsv), "h264_qsv");
        assert_eq!(VideoCodec::Av1.encoder(HardwareAccel::Software), "libsvtav1");
    }

    #[test]
    fn test_default_params() {
        let params = EncodeParams::default();
        assert_eq!(params.video_codec, VideoCodec::Hevc);
        assert_eq!(params.crf, Some(23));
        assert_eq!(params.preset, "medium");
        assert_eq!(params.audio_bitrate_kbps, 192);
        assert_eq!(params.output_file_name("movie"), "movie.mkv");
    }

    #[test]
    fn test_params_deserialize_partial() {
        let params: EncodeParams =
            serde_json::from_str(r#"{"video_codec":"h264","container":"mp4"}"#).unwrap();
        assert_eq!(params.video_codec, VideoCodec::H264);
        assert_eq!(params.container, Container::Mp4);
        assert_eq!(params.crf, Some(23));
    }

    #[test]
    fn test_pick_accel() {
        let caps = [HardwareAccel::Software, HardwareAccel::Nvenc];
        assert_eq!(pick_accel(None, &caps), HardwareAccel::Nvenc);
        assert_eq!(
            pick_accel(Some(HardwareAccel::Software), &caps),
            HardwareAccel::Software
        );
        assert_eq!(pick_accel(None, &[]), HardwareAccel::Software);
    }

    #[test]
    fn test_request_output_name() {
        let request = EncodeRequest {
            job_id: "job".into(),
            input: MediaRef::new("/in/Heat.1995.avi"),
            params: EncodeParams::default(),
            accel: HardwareAccel::Software,
        };
        assert_eq!(request.output_file_name(), "Heat.1995.mkv");
    }
}
