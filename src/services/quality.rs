//! Quality extraction from release-style filenames
//!
//! Parses names like `Movie.2160p.BluRay.HDR.x265.DTS.mkv` into a scored
//! [QualityInfo]. Matching is token based: the lowercased name is split on
//! anything that is not a letter or digit, so `hdtv` never reads as `hd`.

use serde::{Deserialize, Serialize};

use crate::services::classifier::filter_media_files;
use crate::services::fs::FileEntry;

/// Video frame size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const UHD: Resolution = Resolution { width: 3840, height: 2160 };
    pub const FHD: Resolution = Resolution { width: 1920, height: 1080 };
    pub const HD: Resolution = Resolution { width: 1280, height: 720 };
    pub const SD: Resolution = Resolution { width: 720, height: 480 };

    pub fn display_name(&self) -> &'static str {
        match self.width {
            w if w >= 3840 => "4K/UHD",
            w if w >= 1920 => "1080p",
            w if w >= 1280 => "720p",
            w if w >= 720 => "480p/DVD",
            _ => "Low Quality",
        }
    }
}

/// Quality of a single media file, derived from its name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hdr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_profile: Option<String>,
    /// BluRay, WEB-DL, WEB-RIP, DVD
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub quality_score: i32,
}

impl QualityInfo {
    /// Profile if set, else the resolution tier, else "Unknown"
    pub fn display_name(&self) -> String {
        if let Some(profile) = &self.quality_profile {
            return profile.clone();
        }
        match &self.resolution {
            Some(res) => res.display_name().to_string(),
            None => "Unknown".to_string(),
        }
    }

    /// Strictly higher score wins. Any quality beats a missing one.
    pub fn is_better_than(&self, other: Option<&QualityInfo>) -> bool {
        is_better(Some(self), other)
    }
}

/// Ranking used when picking the best version of an item.
///
/// A missing candidate never wins, a present one always beats a missing
/// current, and equal scores keep the current.
pub fn is_better(candidate: Option<&QualityInfo>, current: Option<&QualityInfo>) -> bool {
    match (candidate, current) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(a), Some(b)) => a.quality_score > b.quality_score,
    }
}

/// Lowercased alphanumeric tokens of a filename
pub(crate) struct Tokens(Vec<String>);

impl Tokens {
    pub(crate) fn new(filename: &str) -> Self {
        Self(
            filename
                .to_lowercase()
                .split(|c: char| !c.is_ascii_alphanumeric())
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// True when any of `words` is a token, or two adjacent tokens joined
    /// (so `web-dl` and `dolby.vision` match `webdl` and `dolbyvision`)
    pub(crate) fn any(&self, words: &[&str]) -> bool {
        let single = self.0.iter().any(|t| words.contains(&t.as_str()));
        single
            || self
                .0
                .windows(2)
                .any(|pair| words.contains(&format!("{}{}", pair[0], pair[1]).as_str()))
    }
}

fn profile(info: &mut QualityInfo, name: &str, score: i32) {
    info.quality_profile = Some(name.to_string());
    info.quality_score = score;
}

/// Derive quality from a filename and optional extension. Never fails: a
/// name without recognizable tokens yields a zero score.
pub fn extract_quality(filename: &str, extension: Option<&str>) -> QualityInfo {
    let tokens = Tokens::new(filename);
    let mut info = QualityInfo::default();

    if tokens.any(&["2160p", "4k", "uhd"]) {
        info.resolution = Some(Resolution::UHD);
        profile(&mut info, "4K/UHD", 100);
    } else if tokens.any(&["1080p", "fhd"]) {
        info.resolution = Some(Resolution::FHD);
        profile(&mut info, "1080p", 80);
    } else if tokens.any(&["720p"]) {
        info.resolution = Some(Resolution::HD);
        profile(&mut info, "720p", 60);
    } else if tokens.any(&["480p", "dvd", "dvdrip"]) {
        info.resolution = Some(Resolution::SD);
        profile(&mut info, "480p/DVD", 40);
    }

    if tokens.any(&["bluray", "brrip", "bdrip"]) {
        info.source = Some("BluRay".into());
        info.quality_score += 10;
    } else if tokens.any(&["webdl"]) {
        info.source = Some("WEB-DL".into());
        info.quality_score += 5;
    } else if tokens.any(&["webrip"]) {
        info.source = Some("WEB-RIP".into());
    } else if tokens.any(&["dvd", "dvdrip"]) {
        info.source = Some("DVD".into());
    }

    if tokens.any(&["x265", "h265", "hevc"]) {
        info.video_codec = Some("H.265/HEVC".into());
        info.quality_score += 5;
    } else if tokens.any(&["x264", "h264", "avc"]) {
        info.video_codec = Some("H.264/AVC".into());
    }

    if tokens.any(&["dts"]) {
        info.audio_codec = Some("DTS".into());
        info.quality_score += 5;
    } else if tokens.any(&["flac"]) {
        info.audio_codec = Some("FLAC".into());
    } else if tokens.any(&["aac"]) {
        info.audio_codec = Some("AAC".into());
    } else if tokens.any(&["ac3"]) {
        info.audio_codec = Some("AC3".into());
    }

    if tokens.any(&["hdr", "hdr10", "dolbyvision", "dv"]) {
        info.hdr = true;
        info.quality_score += 10;
    }

    // Audio formats replace any video-derived score
    let ext = extension.map(|e| e.to_lowercase());
    match ext.as_deref() {
        Some(lossless @ (".flac" | ".wav")) => {
            if info.audio_codec.is_none() {
                let codec = if lossless == ".flac" { "FLAC" } else { "PCM" };
                info.audio_codec = Some(codec.to_string());
            }
            profile(&mut info, "Audio_Lossless", 90);
        }
        Some(".mp3") | Some(".m4a") | Some(".aac") | Some(".ogg") | Some(".wma")
            if tokens.any(&["320", "320k", "320kbps"]) =>
        {
            info.bitrate = Some(320);
            profile(&mut info, "Audio_320k", 70);
        }
        Some(".mp3") => profile(&mut info, "Audio_128k", 50),
        _ => {}
    }

    info
}

/// Summary of the qualities present among a directory's media files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityAnalysis {
    pub available_qualities: Vec<String>,
    pub best_quality: Option<QualityInfo>,
    pub total_files: usize,
    pub total_size: u64,
}

/// Score every media file of `media_type` in `files` and keep the best.
/// Ties keep the first file seen.
pub fn analyze_quality(files: &[FileEntry], media_type: &str) -> QualityAnalysis {
    let media_files = filter_media_files(files, media_type);
    let mut analysis = QualityAnalysis {
        total_files: media_files.len(),
        ..Default::default()
    };

    for file in &media_files {
        analysis.total_size += file.size;
        let quality = extract_quality(&file.name, file.extension.as_deref());
        let name = quality.display_name();
        if !analysis.available_qualities.contains(&name) {
            analysis.available_qualities.push(name);
        }
        if is_better(Some(&quality), analysis.best_quality.as_ref()) {
            analysis.best_quality = Some(quality);
        }
    }

    analysis
}
