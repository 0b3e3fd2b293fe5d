use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use log::warn;
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tokio::{process::Command, time::timeout};

use crate::playlist::{TrackInfo, TrackSet};

/// Upper bound on any probe or thumbnail subprocess.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Could not spawn {0}")]
    Spawn(&'static str),
    #[error("Probe timed out")]
    Timeout,
    #[error("Probe exited with an error")]
    Failed,
    #[error("Probe output was not parseable")]
    Parse,
}

/// What the server consumes from a track probe.
#[derive(Debug, Default, Clone)]
pub struct ProbedMedia {
    pub tracks: TrackSet,
    pub uses_hevc: bool,
    pub has_video: bool,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Thumbnail {
    /// The generated JPEG, if one could be produced.
    pub file: Option<PathBuf>,
    pub is_audio: bool,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    #[serde(default)]
    tags: Option<FfprobeTags>,
    #[serde(default)]
    disposition: Option<FfprobeDisposition>,
}

#[derive(Debug, Deserialize)]
struct FfprobeTags {
    language: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeDisposition {
    #[serde(default)]
    default: i32,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Probes a media file's streams. Failures of any kind collapse to an
/// empty track set so a playlist update never fails on a bad file.
pub async fn probe_media(path: &Path) -> ProbedMedia {
    match run_ffprobe(path).await {
        Ok(output) => collect_media(output),
        Err(err) => {
            warn!("Probe of {} failed: {}", path.display(), err);
            ProbedMedia::default()
        }
    }
}

async fn run_ffprobe(path: &Path) -> Result<FfprobeOutput, ProbeError> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg("--")
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = timeout(PROBE_TIMEOUT, output)
        .await
        .map_err(|_| ProbeError::Timeout)?
        .map_err(|_| ProbeError::Spawn("ffprobe"))?;

    if !output.status.success() {
        return Err(ProbeError::Failed);
    }

    serde_json::from_slice(&output.stdout).map_err(|_| ProbeError::Parse)
}

fn collect_media(output: FfprobeOutput) -> ProbedMedia {
    let mut media = ProbedMedia::default();

    for stream in &output.streams {
        let codec = stream.codec_name.clone().unwrap_or_default();

        match stream.codec_type.as_deref() {
            Some("audio") => {
                let index = media.tracks.audio.len() as i32;
                media.tracks.audio.push(track_info(index, codec, stream));
            }
            Some("subtitle") => {
                let index = media.tracks.subtitles.len() as i32;
                media.tracks.subtitles.push(track_info(index, codec, stream));
            }
            Some("video") => {
                media.has_video = true;
                media.uses_hevc |= matches!(codec.as_str(), "hevc" | "h265");
            }
            _ => {}
        }
    }

    media.duration = output
        .format
        .and_then(|format| format.duration)
        .and_then(|duration| duration.parse().ok());

    media
}

fn track_info(index: i32, codec: String, stream: &FfprobeStream) -> TrackInfo {
    let tags = stream.tags.as_ref();

    TrackInfo {
        index,
        codec,
        language: tags.and_then(|t| t.language.clone()),
        title: tags.and_then(|t| t.title.clone()),
        default: stream
            .disposition
            .as_ref()
            .map(|d| d.default == 1)
            .unwrap_or_default(),
    }
}

/// Generates (or reuses) a thumbnail for a media file.
///
/// Video files get a 720p JPEG sampled at a random position in the first
/// third of their duration. Audio files fall back to embedded cover art,
/// and to `file: None` when there is none.
pub async fn generate_thumbnail(
    media_path: &Path,
    cache_dir: &Path,
    filename: &str,
) -> Result<Thumbnail, ProbeError> {
    let target = cache_dir.join(format!("{}.jpg", filename));

    let media = probe_media(media_path).await;
    let is_audio = !media.has_video;

    if target.exists() {
        return Ok(Thumbnail {
            file: Some(target),
            is_audio,
        });
    }

    let result = if media.has_video {
        let duration = media.duration.unwrap_or_default().max(0.0);
        let position = rand::thread_rng().gen_range(0.0..=(duration / 3.0).max(0.1));

        extract_frame(media_path, &target, position).await
    } else {
        extract_cover_art(media_path, &target).await
    };

    match result {
        Ok(()) => Ok(Thumbnail {
            file: Some(target),
            is_audio,
        }),
        Err(err) if is_audio => {
            warn!("No cover art in {}: {}", media_path.display(), err);
            Ok(Thumbnail {
                file: None,
                is_audio: true,
            })
        }
        Err(err) => Err(err),
    }
}

async fn extract_frame(input: &Path, output: &Path, position: f64) -> Result<(), ProbeError> {
    let mut command = Command::new("ffmpeg");

    command
        .arg("-hide_banner")
        .args(["-loglevel", "error"])
        .args(["-ss", &format!("{:.2}", position)])
        .arg("-i")
        .arg(input)
        .args(["-frames:v", "1"])
        .args(["-vf", "scale=-2:720"])
        .args(["-q:v", "3"])
        .arg("-y")
        .arg(output);

    run_ffmpeg(command).await
}

async fn extract_cover_art(input: &Path, output: &Path) -> Result<(), ProbeError> {
    let mut command = Command::new("ffmpeg");

    command
        .arg("-hide_banner")
        .args(["-loglevel", "error"])
        .arg("-i")
        .arg(input)
        .arg("-an")
        .args(["-c:v", "copy"])
        .arg("-y")
        .arg(output);

    run_ffmpeg(command).await
}

async fn run_ffmpeg(mut command: Command) -> Result<(), ProbeError> {
    let output = command
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = timeout(PROBE_TIMEOUT, output)
        .await
        .map_err(|_| ProbeError::Timeout)?
        .map_err(|_| ProbeError::Spawn("ffmpeg"))?;

    if !output.status.success() {
        return Err(ProbeError::Failed);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ProbedMedia {
        collect_media(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn collects_audio_and_subtitle_tracks() {
        let media = parse(
            r#"{
                "streams": [
                    {"codec_type": "video", "codec_name": "h264"},
                    {"codec_type": "audio", "codec_name": "aac",
                     "tags": {"language": "eng", "title": "Stereo"},
                     "disposition": {"default": 1}},
                    {"codec_type": "audio", "codec_name": "ac3", "tags": {"language": "jpn"}},
                    {"codec_type": "subtitle", "codec_name": "subrip", "tags": {"language": "eng"}}
                ],
                "format": {"duration": "1234.56"}
            }"#,
        );

        assert_eq!(media.tracks.audio.len(), 2);
        assert_eq!(media.tracks.subtitles.len(), 1);
        assert!(media.has_video);
        assert!(!media.uses_hevc);

        let first = &media.tracks.audio[0];
        assert_eq!(first.index, 0);
        assert_eq!(first.language.as_deref(), Some("eng"));
        assert!(first.default);

        assert_eq!(media.tracks.audio[1].index, 1);
        assert!((media.duration.unwrap() - 1234.56).abs() < 1e-9);
    }

    #[test]
    fn detects_hevc() {
        let media = parse(r#"{"streams": [{"codec_type": "video", "codec_name": "hevc"}]}"#);

        assert!(media.uses_hevc);
        assert!(media.tracks.audio.is_empty());
    }

    #[test]
    fn audio_only_has_no_video() {
        let media = parse(r#"{"streams": [{"codec_type": "audio", "codec_name": "mp3"}]}"#);

        assert!(!media.has_video);
        assert_eq!(media.tracks.audio.len(), 1);
    }

    #[test]
    fn empty_output_collapses_to_defaults() {
        let media = parse(r#"{"streams": []}"#);

        assert!(media.tracks.audio.is_empty());
        assert!(media.tracks.subtitles.is_empty());
        assert!(media.duration.is_none());
    }
}
