//! Pre-seed data for initial catalog setup.
//!
//! Runs after schema sync to insert the media type catalog and the standard
//! quality tiers. Uses INSERT OR IGNORE so re-runs are idempotent (existing
//! rows are preserved).

use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::db::sqlite_helpers::vec_to_json;
use crate::services::providers::providers_for_type;

/// Result of running seed operations.
#[derive(Debug, Default)]
pub struct SeedResult {
    pub tables_seeded: Vec<String>,
    pub errors: Vec<String>,
}

struct MediaTypeSeed {
    name: &'static str,
    description: &'static str,
    /// Globs matched case-insensitively against file and directory names
    patterns: &'static [&'static str],
}

const MEDIA_TYPES: &[MediaTypeSeed] = &[
    MediaTypeSeed {
        name: "movie",
        description: "Feature films and movies",
        patterns: &["*(19??)*", "*(20??)*", "*.19??.*", "*.20??.*", "*remux*"],
    },
    MediaTypeSeed {
        name: "tv_show",
        description: "Television series and episodes",
        patterns: &["*s??e??*", "*season*", "*episode*"],
    },
    MediaTypeSeed {
        name: "anime",
        description: "Japanese animation series and films",
        patterns: &["*[subsplease]*", "*[horriblesubs]*", "*[erai-raws]*", "*anime*"],
    },
    MediaTypeSeed {
        name: "documentary",
        description: "Documentary films and series",
        patterns: &["*documentary*", "*docu*"],
    },
    MediaTypeSeed {
        name: "music",
        description: "Music albums and tracks",
        patterns: &["*disc ?*", "*cd ?*", "*album*", "*discography*"],
    },
    MediaTypeSeed {
        name: "audiobook",
        description: "Narrated books",
        patterns: &["*audiobook*", "*unabridged*", "*narrated*", "*chapter*"],
    },
    MediaTypeSeed {
        name: "podcast",
        description: "Podcast episodes",
        patterns: &["*podcast*"],
    },
    MediaTypeSeed {
        name: "ebook",
        description: "Electronic books",
        patterns: &["*ebook*"],
    },
    MediaTypeSeed {
        name: "comic",
        description: "Comics and graphic novels",
        patterns: &["*comic*", "*manga*", "*vol.*", "*issue*"],
    },
    MediaTypeSeed {
        name: "game",
        description: "Video games",
        patterns: &["*setup*", "*-codex*", "*-gog*", "*roms*"],
    },
    MediaTypeSeed {
        name: "software",
        description: "Applications and utilities",
        patterns: &["*installer*", "*portable*", "*x64*", "*x86*"],
    },
    MediaTypeSeed {
        name: "training",
        description: "Educational and training content",
        patterns: &["*course*", "*tutorial*", "*lesson*", "*training*"],
    },
    MediaTypeSeed {
        name: "other",
        description: "Unclassified content",
        patterns: &[],
    },
];

/// (name, min width, min height, score)
const QUALITY_PROFILES: &[(&str, Option<i64>, Option<i64>, i64)] = &[
    ("4K/UHD", Some(3840), Some(2160), 100),
    ("1080p", Some(1920), Some(1080), 80),
    ("720p", Some(1280), Some(720), 60),
    ("480p/DVD", Some(720), Some(480), 40),
    ("360p", Some(640), Some(360), 20),
    ("Audio_Lossless", None, None, 90),
    ("Audio_320k", None, None, 70),
    ("Audio_256k", None, None, 60),
    ("Audio_192k", None, None, 50),
    ("Audio_128k", None, None, 30),
];

async fn seed_media_types(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let mut inserted = 0;
    for seed in MEDIA_TYPES {
        let providers = providers_for_type(seed.name);
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO media_types (name, description, detection_patterns, metadata_providers)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(seed.name)
        .bind(seed.description)
        .bind(vec_to_json(seed.patterns))
        .bind(vec_to_json(providers))
        .execute(pool)
        .await?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

async fn seed_quality_profiles(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let mut inserted = 0;
    for (name, width, height, score) in QUALITY_PROFILES {
        let codecs: &[&str] = if name.starts_with("Audio_") {
            &[]
        } else {
            &["H.265/HEVC", "H.264/AVC"]
        };
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO quality_profiles
                (name, min_resolution_width, min_resolution_height, preferred_codecs, quality_score)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(width)
        .bind(height)
        .bind(vec_to_json(codecs))
        .bind(score)
        .execute(pool)
        .await?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

/// Run all seeds. Errors are collected rather than aborting the rest.
pub async fn run_seeds(pool: &SqlitePool) -> SeedResult {
    let mut result = SeedResult::default();

    match seed_media_types(pool).await {
        Ok(0) => debug!("media_types already seeded"),
        Ok(n) => {
            info!(rows = n, "Seeded media_types");
            result.tables_seeded.push("media_types".to_string());
        }
        Err(e) => {
            warn!(error = %e, "Failed to seed media_types");
            result.errors.push(format!("media_types: {}", e));
        }
    }

    match seed_quality_profiles(pool).await {
        Ok(0) => debug!("quality_profiles already seeded"),
        Ok(n) => {
            info!(rows = n, "Seeded quality_profiles");
            result.tables_seeded.push("quality_profiles".to_string());
        }
        Err(e) => {
            warn!(error = %e, "Failed to seed quality_profiles");
            result.errors.push(format!("quality_profiles: {}", e));
        }
    }

    result
}
