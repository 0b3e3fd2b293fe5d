use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::BslMode;

/// How far apart the reported and on-disk sizes may be for the size
/// criterion, in bytes (1.5 MiB).
pub const SIZE_TOLERANCE_BYTES: u64 = 1_572_864;

/// A file descriptor reported by a client from its local folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientFile {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default, rename = "type")]
    pub mime: Option<String>,
}

/// One playlist entry as seen by the matcher.
#[derive(Debug, Clone)]
pub struct ServerFile {
    pub filename: String,
    /// On-disk size, if the file exists in the media directory.
    pub size: Option<u64>,
}

/// A successful substitution of a local file for a playlist entry.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchedVideo {
    pub playlist_index: usize,
    pub playlist_filename: String,
    pub client_filename: String,
    pub score: u32,
    pub manual: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct MatcherOptions {
    pub advanced: bool,
    pub threshold: u32,
}

/// Matches a reported folder against the playlist.
///
/// Manual matches (lowercased client name to lowercased playlist name) win
/// outright. Otherwise the advanced matcher scores name, extension, size
/// and MIME, and falls back to exact name equality when disabled.
pub fn match_folder(
    playlist: &[ServerFile],
    files: &[ClientFile],
    manual: &HashMap<String, String>,
    options: MatcherOptions,
) -> Vec<MatchedVideo> {
    let mut matched = Vec::new();

    for (index, entry) in playlist.iter().enumerate() {
        let mut best: Option<(u32, bool, &ClientFile)> = None;

        for file in files {
            let manual_hit = manual
                .get(&file.name.to_lowercase())
                .is_some_and(|target| *target == entry.filename.to_lowercase());

            if manual_hit {
                best = Some((u32::MAX, true, file));
                break;
            }

            let score = score_pair(file, entry);
            let hit = if options.advanced {
                score >= options.threshold
            } else {
                names_equal(&file.name, &entry.filename)
            };

            if hit && best.map_or(true, |(prev, _, _)| score > prev) {
                best = Some((score, false, file));
            }
        }

        if let Some((score, manual, file)) = best {
            matched.push(MatchedVideo {
                playlist_index: index,
                playlist_filename: entry.filename.clone(),
                client_filename: file.name.clone(),
                score: if manual { 0 } else { score },
                manual,
            });
        }
    }

    matched
}

/// Scores one (client file, playlist entry) pair over the four criteria.
pub fn score_pair(file: &ClientFile, entry: &ServerFile) -> u32 {
    let mut score = 0;

    if names_equal(&file.name, &entry.filename) {
        score += 1;
    }

    let client_ext = extension(&file.name);
    let server_ext = extension(&entry.filename);

    if client_ext.is_some() && client_ext == server_ext {
        score += 1;
    }

    if let (Some(reported), Some(on_disk)) = (file.size, entry.size) {
        if reported.abs_diff(on_disk) <= SIZE_TOLERANCE_BYTES {
            score += 1;
        }
    }

    if let (Some(mime), Some(ext)) = (file.mime.as_deref(), server_ext.as_deref()) {
        if mime_matches(mime, ext) {
            score += 1;
        }
    }

    score
}

/// Aggregates per-member matches into the per-index "BSL active" flags.
pub fn aggregate_active(
    mode: BslMode,
    playlist_len: usize,
    member_matches: &[HashSet<usize>],
) -> Vec<bool> {
    (0..playlist_len)
        .map(|index| match mode {
            BslMode::Any => member_matches.iter().any(|m| m.contains(&index)),
            BslMode::All => {
                !member_matches.is_empty() && member_matches.iter().all(|m| m.contains(&index))
            }
        })
        .collect()
}

fn names_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn extension(name: &str) -> Option<String> {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

fn mime_matches(reported: &str, ext: &str) -> bool {
    let reported = reported.to_ascii_lowercase();

    match canonical_mime(ext) {
        Some(canonical) => {
            reported == canonical
                || family(&reported)
                    .zip(family(canonical))
                    .is_some_and(|(a, b)| a == b)
        }
        None => false,
    }
}

fn family(mime: &str) -> Option<&str> {
    let prefix = mime.split('/').next()?;

    matches!(prefix, "video" | "audio" | "image").then_some(prefix)
}

/// The canonical MIME type for a known media extension. Doubling as the
/// media-directory extension allow-list.
pub fn canonical_mime(ext: &str) -> Option<&'static str> {
    let mime = match ext {
        "mkv" => "video/x-matroska",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "ts" | "m2ts" => "video/mp2t",
        "ogv" => "video/ogg",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "ogg" | "oga" => "audio/ogg",
        "opus" => "audio/opus",
        "wav" => "audio/x-wav",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => return None,
    };

    Some(mime)
}
