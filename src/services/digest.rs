//! Content digests and duplicate grouping
//!
//! Files are hashed with SHA-256 through a fixed-size buffer, so memory use
//! does not depend on file size. Files sharing a digest form a
//! [DuplicateGroup].

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::db::MediaFile;
use crate::error::{CatalogError, Result};
use crate::services::fs::ShareFileSystem;
use crate::services::quality::is_better;

const CHUNK_SIZE: usize = 64 * 1024;

/// Hex SHA-256 of everything `reader` yields
pub async fn digest_reader<R>(mut reader: R, cancel: &CancellationToken) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Err(CatalogError::Cancelled);
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Digest a file on a share
pub async fn digest_file(
    fs: &dyn ShareFileSystem,
    smb_root: &str,
    path: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    let reader = fs.open_for_read(smb_root, path).await?;
    digest_reader(reader, cancel).await
}

/// Files on one share with identical content
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub digest: String,
    pub size: i64,
    /// Ordered by path
    pub files: Vec<DuplicateFile>,
    /// Id of the best version: highest quality score, first path on ties
    pub canonical: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateFile {
    pub id: i64,
    pub media_item_id: i64,
    pub file_path: String,
    pub quality_score: Option<i32>,
}

/// Group files by digest. Files without a digest or with zero size are left
/// out, as are digests held by a single file.
pub fn group_duplicates(mut files: Vec<MediaFile>) -> Vec<DuplicateGroup> {
    files.retain(|f| f.file_size > 0 && f.checksum.is_some());
    files.sort_by(|a, b| (&a.checksum, &a.file_path).cmp(&(&b.checksum, &b.file_path)));

    let mut groups = Vec::new();
    for chunk in files.chunk_by(|a, b| a.checksum == b.checksum) {
        if chunk.len() < 2 {
            continue;
        }
        let mut canonical = &chunk[0];
        for file in &chunk[1..] {
            if is_better(file.quality_info.as_ref(), canonical.quality_info.as_ref()) {
                canonical = file;
            }
        }
        groups.push(DuplicateGroup {
            digest: chunk[0].checksum.clone().unwrap_or_default(),
            size: chunk[0].file_size,
            canonical: canonical.id,
            files: chunk
                .iter()
                .map(|f| DuplicateFile {
                    id: f.id,
                    media_item_id: f.media_item_id,
                    file_path: f.file_path.clone(),
                    quality_score: f.quality_info.as_ref().map(|q| q.quality_score),
                })
                .collect(),
        });
    }
    groups
}
