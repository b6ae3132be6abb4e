//! Media type detection for a directory of files
//!
//! Each media type is scored from three signals: the share of files whose
//! extension belongs to the type, glob patterns from the `media_types`
//! table matched against file and directory names, and structural hints
//! (season folders for TV, disc folders for music).

use std::collections::BTreeMap;

use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::MediaType;
use crate::services::fs::{FileEntry, file_name};
use crate::services::quality::Tokens;

const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".mkv", ".avi", ".mov", ".wmv", ".flv", ".m4v"];

/// Extensions that count as media for each known type
pub fn media_extensions(media_type: &str) -> Option<&'static [&'static str]> {
    let exts: &'static [&'static str] = match media_type {
        "movie" | "tv_show" | "anime" | "documentary" => VIDEO_EXTENSIONS,
        "music" => &[".mp3", ".flac", ".wav", ".m4a", ".aac", ".ogg", ".wma"],
        "audiobook" => &[".mp3", ".m4a", ".m4b", ".aac", ".ogg"],
        "podcast" => &[".mp3", ".m4a", ".aac", ".ogg"],
        "comic" => &[".cbr", ".cbz", ".cb7", ".cbt", ".pdf", ".epub"],
        "ebook" => &[".epub", ".pdf", ".mobi", ".azw3"],
        "software" => &[
            ".exe", ".msi", ".dmg", ".pkg", ".iso", ".img", ".deb", ".rpm", ".apk", ".appimage",
        ],
        "game" => &[".exe", ".iso", ".img", ".bin", ".rom", ".nes", ".sfc", ".gba", ".nds"],
        _ => return None,
    };
    Some(exts)
}

const KNOWN_TYPES: &[&str] = &[
    "movie", "music", "audiobook", "podcast", "comic", "ebook", "software", "game",
];

/// Whether a file name carries an extension some media type claims
pub fn is_media_file(name: &str) -> bool {
    let Some(ext) = crate::services::fs::file_extension(name) else {
        return false;
    };
    KNOWN_TYPES
        .iter()
        .filter_map(|t| media_extensions(t))
        .any(|exts| exts.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
}

/// Files relevant to `media_type`.
///
/// For a known type this drops directories and keeps files whose extension
/// is in the type's set (case-insensitive). An unknown type gets the input
/// back unchanged.
pub fn filter_media_files<'a>(files: &'a [FileEntry], media_type: &str) -> Vec<&'a FileEntry> {
    let Some(extensions) = media_extensions(media_type) else {
        return files.iter().collect();
    };
    files
        .iter()
        .filter(|f| !f.is_directory)
        .filter(|f| {
            f.extension
                .as_deref()
                .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        })
        .collect()
}

/// Detailed signals recorded alongside a directory analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisData {
    pub matched_patterns: Vec<String>,
    /// Extension -> file count
    pub file_types: BTreeMap<String, usize>,
    /// Size bucket -> total bytes
    pub size_distribution: BTreeMap<String, u64>,
    pub detected_languages: Vec<String>,
    pub quality_indicators: Vec<String>,
    pub structure_score: f64,
    pub filename_score: f64,
    pub metadata_score: f64,
    pub alternative_titles: Vec<String>,
}

/// Outcome of classifying one directory
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub media_type_id: i64,
    pub media_type: String,
    pub confidence: f64,
    /// "hybrid", "filename_pattern", "file_extension" or "directory_structure"
    pub method: String,
    pub matched_patterns: Vec<String>,
    pub suggested_title: String,
    pub suggested_year: Option<i32>,
    pub quality_hints: Vec<String>,
    pub analysis_data: AnalysisData,
}

impl DetectionResult {
    /// Whether the result is strong enough to act on
    pub fn is_valid(&self) -> bool {
        self.confidence >= 0.1 && !self.matched_patterns.is_empty()
    }
}

struct DetectionRule {
    media_type_id: i64,
    media_type: String,
    patterns: Vec<(String, Regex)>,
    extensions: &'static [&'static str],
}

/// Case-insensitive, anchored regex for a `*`/`?` glob
pub fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::from("(?i)^");
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

static SEASON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bseason[\s._-]*\d+|\bs\d{1,2}(e\d{1,3})?\b").unwrap());
static DISC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(disc|cd)[\s._-]*\d+$").unwrap());
static YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d{4})\)|\[(\d{4})\]|\b(\d{4})\b").unwrap());
static RELEASE_TOKENS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(bluray|brrip|bdrip|dvdrip|webrip|web\s?dl|hdtv|remux|480p|720p|1080p|2160p|4k|uhd|x264|x265|h264|h265|hevc|hdr|aac|dts|ac3|complete|season|series|proper|repack)\b",
    )
    .unwrap()
});
static SEASON_DIR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(season|series|s)[\s._-]*\d{1,2}$").unwrap());
static SEPARATORS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[._\-\s]+").unwrap());

/// Scores directories against the configured media types
pub struct Classifier {
    rules: Vec<DetectionRule>,
}

impl Classifier {
    /// Build rules from media type rows, in the order given. Invalid globs
    /// are skipped.
    pub fn new(media_types: &[MediaType]) -> Self {
        let rules = media_types
            .iter()
            .map(|mt| DetectionRule {
                media_type_id: mt.id,
                media_type: mt.name.clone(),
                patterns: mt
                    .detection_patterns
                    .iter()
                    .filter_map(|glob| match glob_to_regex(glob) {
                        Ok(re) => Some((glob.clone(), re)),
                        Err(e) => {
                            warn!(media_type = %mt.name, pattern = %glob, error = %e, "Skipping invalid detection pattern");
                            None
                        }
                    })
                    .collect(),
                extensions: media_extensions(&mt.name).unwrap_or(&[]),
            })
            .collect();
        Self { rules }
    }

    pub fn media_type_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.media_type.as_str())
    }

    /// Pick the best media type for `directory_path`. Ties go to the type
    /// listed first. `None` when no type scores at all.
    pub fn classify_directory(
        &self,
        directory_path: &str,
        files: &[FileEntry],
    ) -> Option<DetectionResult> {
        let regular: Vec<&FileEntry> = files.iter().filter(|f| !f.is_directory).collect();
        let dir_name = file_name(directory_path);
        let mut best: Option<(f64, &DetectionRule, Scores)> = None;

        for rule in &self.rules {
            let scores = score_rule(rule, dir_name, files, &regular);
            let confidence = scores.confidence();
            if confidence <= 0.0 {
                continue;
            }
            if best.as_ref().is_none_or(|(c, _, _)| confidence > *c) {
                best = Some((confidence, rule, scores));
            }
        }

        let (confidence, rule, scores) = best?;
        let (title, year) = extract_title_and_year(directory_path, &regular);
        let quality_hints = extract_quality_hints(directory_path, files);

        let analysis_data = AnalysisData {
            matched_patterns: scores.matched.clone(),
            file_types: file_types(&regular),
            size_distribution: size_distribution(&regular),
            quality_indicators: quality_hints.clone(),
            filename_score: scores.pattern,
            structure_score: scores.structure,
            metadata_score: scores.extension,
            ..Default::default()
        };

        debug!(
            path = %directory_path,
            media_type = %rule.media_type,
            confidence = confidence,
            "Classified directory"
        );

        Some(DetectionResult {
            media_type_id: rule.media_type_id,
            media_type: rule.media_type.clone(),
            confidence,
            method: scores.method().to_string(),
            matched_patterns: scores.matched,
            suggested_title: title,
            suggested_year: year,
            quality_hints,
            analysis_data,
        })
    }
}

#[derive(Debug, Default)]
struct Scores {
    extension: f64,
    pattern: f64,
    structure: f64,
    matched: Vec<String>,
}

impl Scores {
    fn confidence(&self) -> f64 {
        (self.extension + self.pattern + self.structure).min(1.0)
    }

    fn method(&self) -> &'static str {
        match (self.extension > 0.0, self.pattern > 0.0 || self.structure > 0.0) {
            (true, true) => "hybrid",
            (true, false) => "file_extension",
            (false, _) if self.pattern > 0.0 => "filename_pattern",
            _ => "directory_structure",
        }
    }
}

fn score_rule(
    rule: &DetectionRule,
    dir_name: &str,
    all: &[FileEntry],
    regular: &[&FileEntry],
) -> Scores {
    let mut scores = Scores::default();

    if !regular.is_empty() && !rule.extensions.is_empty() {
        let mut matched_exts: Vec<&str> = Vec::new();
        let hits = regular
            .iter()
            .filter(|f| match f.extension.as_deref() {
                Some(ext) if rule.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)) => {
                    if !matched_exts.contains(&ext) {
                        matched_exts.push(ext);
                    }
                    true
                }
                _ => false,
            })
            .count();
        scores.extension = hits as f64 / regular.len() as f64 * 0.6;
        scores
            .matched
            .extend(matched_exts.into_iter().map(|e| format!("ext:{}", e)));
    }

    for (glob, re) in &rule.patterns {
        let hit = re.is_match(dir_name) || all.iter().any(|f| re.is_match(&f.name));
        if hit {
            scores.matched.push(glob.clone());
        }
    }
    if scores.matched.iter().any(|p| !p.starts_with("ext:")) {
        scores.pattern = 0.4;
    }

    if let Some(hint) = structure_hint(&rule.media_type, dir_name, all) {
        scores.structure = 0.2;
        scores.matched.push(hint.to_string());
    }

    scores
}

fn structure_hint(media_type: &str, dir_name: &str, files: &[FileEntry]) -> Option<&'static str> {
    match media_type {
        "tv_show" => {
            let seasonal = SEASON_RE.is_match(dir_name)
                || files.iter().any(|f| SEASON_RE.is_match(&f.name));
            seasonal.then_some("structure:season")
        }
        "music" => {
            let discs = files
                .iter()
                .any(|f| f.is_directory && DISC_RE.is_match(&f.name));
            let audio = media_extensions("music").unwrap_or(&[]);
            let tracks = files
                .iter()
                .filter(|f| !f.is_directory)
                .filter(|f| f.extension.as_deref().is_some_and(|e| audio.contains(&e)))
                .count();
            (discs || DISC_RE.is_match(dir_name) && tracks > 0).then_some("structure:disc")
        }
        _ => None,
    }
}

/// Title and year from a release-style directory name, falling back to the
/// first file's name when the directory yields nothing.
pub fn extract_title_and_year(directory_path: &str, files: &[&FileEntry]) -> (String, Option<i32>) {
    let mut dir_name = file_name(directory_path);
    if SEASON_DIR_RE.is_match(dir_name) {
        // "Show/Season 1" is titled by the show folder
        dir_name = file_name(parent_of(directory_path));
    }
    let (title, year) = title_and_year_from(dir_name);
    if !title.is_empty() {
        return (title, year);
    }
    match files.first() {
        Some(file) => {
            let stem = file
                .name
                .rsplit_once('.')
                .map(|(stem, _)| stem)
                .unwrap_or(&file.name);
            let (title, file_year) = title_and_year_from(stem);
            (title, year.or(file_year))
        }
        None => (String::new(), year),
    }
}

fn title_and_year_from(name: &str) -> (String, Option<i32>) {
    let max_year = Utc::now().year() + 5;
    let mut year = None;
    let mut year_span = None;

    // Bracketed years win over bare ones; among bare years the last wins
    for caps in YEAR_RE.captures_iter(name) {
        let bracketed = caps.get(1).or_else(|| caps.get(2));
        let Some(m) = bracketed.or_else(|| caps.get(3)) else {
            continue;
        };
        let Ok(y) = m.as_str().parse::<i32>() else {
            continue;
        };
        if y <= 1900 || y > max_year {
            continue;
        }
        let Some(whole) = caps.get(0) else { continue };
        year = Some(y);
        year_span = Some(whole.range());
        if bracketed.is_some() {
            break;
        }
    }

    let mut title = name.to_string();
    if let Some(span) = year_span {
        // Everything after a release year is release noise
        title.truncate(span.start);
        if title.trim().is_empty() {
            title = name[span.end..].to_string();
        }
    }

    let title = SEPARATORS_RE.replace_all(&title, " ");
    let title = RELEASE_TOKENS_RE.replace_all(&title, " ");
    let title = SEPARATORS_RE.replace_all(&title, " ");
    (title.trim().to_string(), year)
}

fn parent_of(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit_once('/')
        .map(|(parent, _)| parent)
        .unwrap_or("")
}

/// Quality indicators present in the directory or file names
pub fn extract_quality_hints(directory_path: &str, files: &[FileEntry]) -> Vec<String> {
    let mut text = directory_path.to_string();
    for file in files {
        text.push(' ');
        text.push_str(&file.name);
    }
    let tokens = Tokens::new(&text);

    const HINTS: &[(&str, &[&str])] = &[
        ("4K", &["4k", "uhd", "2160p"]),
        ("1080p", &["1080p", "fullhd", "fhd"]),
        ("720p", &["720p"]),
        ("BluRay", &["bluray", "brrip", "bdrip"]),
        ("WEB-DL", &["webdl", "webrip"]),
        ("HDR", &["hdr", "hdr10", "dolbyvision"]),
        ("Lossless", &["flac", "lossless", "dtshd"]),
        ("Remux", &["remux"]),
    ];

    HINTS
        .iter()
        .filter(|(_, words)| tokens.any(words))
        .map(|(hint, _)| hint.to_string())
        .collect()
}

fn file_types(files: &[&FileEntry]) -> BTreeMap<String, usize> {
    let mut types = BTreeMap::new();
    for ext in files.iter().filter_map(|f| f.extension.as_ref()) {
        *types.entry(ext.clone()).or_insert(0) += 1;
    }
    types
}

fn size_distribution(files: &[&FileEntry]) -> BTreeMap<String, u64> {
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * MB;
    let mut buckets = BTreeMap::new();
    for file in files {
        let bucket = match file.size {
            s if s > 10 * GB => "very_large",
            s if s > GB => "large",
            s if s > 100 * MB => "medium",
            s if s > 10 * MB => "small",
            _ => "tiny",
        };
        *buckets.entry(bucket.to_string()).or_insert(0) += file.size;
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_is_media_file() {
        assert!(is_media_file("Heat.1995.1080p.MKV"));
        assert!(is_media_file("01 - Airbag.flac"));
        assert!(is_media_file("Dune.epub"));
        assert!(!is_media_file("cover.jpg"));
        assert!(!is_media_file("README"));
    }

    fn media_type(id: i64, name: &str, patterns: &[&str]) -> MediaType {
        MediaType {
            id,
            name: name.to_string(),
            description: None,
            detection_patterns: patterns.iter().map(|p| p.to_string()).collect(),
            metadata_providers: Vec::new(),
        }
    }

    fn classifier() -> Classifier {
        Classifier::new(&[
            media_type(1, "movie", &["*(19??)*", "*(20??)*"]),
            media_type(2, "tv_show", &["*s??e??*", "*season*"]),
            media_type(3, "anime", &["*[subsplease]*"]),
            media_type(4, "music", &["*album*"]),
            media_type(5, "other", &[]),
        ])
    }

    // ===== Extension filter =====

    #[test]
    fn test_filter_partitions_by_extension() {
        let files = vec![
            FileEntry::file("/d/a.MKV", 1),
            FileEntry::file("/d/b.mp3", 1),
            FileEntry::file("/d/c.nfo", 1),
            FileEntry::directory("/d/extras.mkv"),
        ];
        let video: Vec<&str> = filter_media_files(&files, "movie")
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(video, vec!["a.MKV"]);

        let music: Vec<&str> = filter_media_files(&files, "music")
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(music, vec!["b.mp3"]);

        assert_eq!(filter_media_files(&files, "hologram").len(), 4);
    }

    // ===== Globs =====

    #[test]
    fn test_glob_to_regex_escapes_literals() {
        let re = glob_to_regex("*[subsplease]*").unwrap();
        assert!(re.is_match("[SubsPlease] Frieren - 01.mkv"));
        assert!(!re.is_match("subsplease frieren.mkv"));

        let re = glob_to_regex("*s??e??*").unwrap();
        assert!(re.is_match("Show.S01E02.mkv"));
        assert!(!re.is_match("Show.mkv"));
    }

    // ===== Classification =====

    #[test]
    fn test_plain_video_directory_is_movie() {
        let files = vec![FileEntry::file("/Movie/Movie.1080p.WEB-DL.AAC.x264.mkv", 1024)];
        let result = classifier().classify_directory("/Movie", &files).unwrap();
        assert_eq!(result.media_type, "movie");
        assert_eq!(result.method, "file_extension");
        assert_eq!(result.matched_patterns, vec!["ext:.mkv"]);
        assert!((result.confidence - 0.6).abs() < 1e-9);
        assert!(result.is_valid());
        assert_eq!(result.suggested_title, "Movie");
    }

    #[test]
    fn test_season_directory_is_tv() {
        let files = vec![
            FileEntry::file("/Show/Season 1/Show.S01E01.720p.mkv", 10),
            FileEntry::file("/Show/Season 1/Show.S01E02.720p.mkv", 10),
        ];
        let result = classifier()
            .classify_directory("/Show/Season 1", &files)
            .unwrap();
        assert_eq!(result.media_type, "tv_show");
        assert_eq!(result.method, "hybrid");
        assert!((result.confidence - 1.0).abs() < 1e-9);
        assert!(result.matched_patterns.contains(&"structure:season".to_string()));
        assert_eq!(result.suggested_title, "Show");
    }

    #[test]
    fn test_disc_folders_favour_music() {
        let files = vec![
            FileEntry::directory("/Album/CD1"),
            FileEntry::directory("/Album/CD2"),
            FileEntry::file("/Album/cover.jpg", 10),
        ];
        let result = classifier().classify_directory("/Album", &files).unwrap();
        assert_eq!(result.media_type, "music");
    }

    #[tokio::test]
    async fn test_seeded_types_keep_subtitled_movie_as_movie() {
        let cipher = crate::db::FieldCipher::from_base64_key(
            &crate::db::FieldCipher::generate_key(),
        )
        .unwrap();
        let db = crate::db::Database::in_memory(cipher).await.unwrap();
        let seeded = Classifier::new(&db.media_types().all().await.unwrap());

        let files = vec![
            FileEntry::file("/Heat/Heat.1080p.BluRay.x264.mkv", 8 * 1024 * 1024 * 1024),
            FileEntry::file("/Heat/Heat.eng.srt", 80 * 1024),
        ];
        let result = seeded.classify_directory("/Heat", &files).unwrap();
        assert_eq!(result.media_type, "movie");
        assert_eq!(result.matched_patterns, vec!["ext:.mkv"]);

        let episodes = vec![FileEntry::file("/Show/Show.S02E05.720p.mkv", 10)];
        let result = seeded.classify_directory("/Show", &episodes).unwrap();
        assert_eq!(result.media_type, "tv_show");
    }

    #[test]
    fn test_cd_glob_needs_a_separated_number() {
        let re = glob_to_regex("*cd ?*").unwrap();
        assert!(re.is_match("Album CD 1"));
        assert!(!re.is_match("ABCDE.mkv"));
        assert!(!re.is_match("Encdoc"));
    }

    #[test]
    fn test_nothing_scores() {
        let files = vec![FileEntry::file("/x/readme.txt", 10)];
        assert!(classifier().classify_directory("/x", &files).is_none());
    }

    #[test]
    fn test_analysis_data_buckets() {
        let files = vec![
            FileEntry::file("/m/Movie.2160p.HDR.mkv", 20 * 1024 * 1024 * 1024),
            FileEntry::file("/m/sample.mkv", 1024),
        ];
        let result = classifier().classify_directory("/m", &files).unwrap();
        let data = &result.analysis_data;
        assert_eq!(data.file_types.get(".mkv"), Some(&2));
        assert_eq!(data.size_distribution.get("tiny"), Some(&1024));
        assert!(data.size_distribution.contains_key("very_large"));
        assert_eq!(data.quality_indicators, vec!["4K", "HDR"]);

        let json = serde_json::to_string(data).unwrap();
        let back: AnalysisData = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, data);
    }

    // ===== Title and year =====

    #[test]
    fn test_title_and_year() {
        assert_eq!(title_and_year_from("Heat (1995)"), ("Heat".to_string(), Some(1995)));
        assert_eq!(
            title_and_year_from("The.Matrix.1999.1080p.BluRay.x264"),
            ("The Matrix".to_string(), Some(1999))
        );
        assert_eq!(
            title_and_year_from("Blade Runner 2049 (2017)"),
            ("Blade Runner 2049".to_string(), Some(2017))
        );
        assert_eq!(
            title_and_year_from("Some_Show-Complete_Series"),
            ("Some Show".to_string(), None)
        );
        assert_eq!(title_and_year_from("Movie.1080p"), ("Movie".to_string(), None));
        assert_eq!(title_and_year_from("1850 Archive"), ("1850 Archive".to_string(), None));
    }

    #[test]
    fn test_title_falls_back_to_file() {
        let file = FileEntry::file("/Heat.1995.720p.mkv", 1);
        assert_eq!(
            extract_title_and_year("/", &[&file]),
            ("Heat".to_string(), Some(1995))
        );
    }
}
