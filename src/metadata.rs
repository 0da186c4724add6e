use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

/// Closed tag set for document types, derived from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Text,
    Markdown,
    Code,
    Json,
    Csv,
    Html,
    Xml,
    Pdf,
    Docx,
    Other,
}

impl FileType {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "txt" | "rtf" => FileType::Text,
            "md" | "mdx" | "markdown" => FileType::Markdown,
            "rs" | "py" | "js" | "ts" | "go" | "java" | "c" | "cpp" | "h" => FileType::Code,
            "json" => FileType::Json,
            "csv" => FileType::Csv,
            "html" | "htm" => FileType::Html,
            "xml" => FileType::Xml,
            "pdf" => FileType::Pdf,
            "docx" | "doc" => FileType::Docx,
            _ => FileType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Text => "text",
            FileType::Markdown => "markdown",
            FileType::Code => "code",
            FileType::Json => "json",
            FileType::Csv => "csv",
            FileType::Html => "html",
            FileType::Xml => "xml",
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Other => "other",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity and change-detection attributes of one file.
///
/// `file_id` is derived from the absolute path, never from content, so a
/// file edited in place keeps its id. `hash` covers the bytes and drives
/// change detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: String,
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub file_type: FileType,
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Width (hex chars) of truncated sha256 identifiers.
const ID_WIDTH: usize = 16;

/// sha256 of the input, truncated to a stable width. Same input always
/// yields the same id.
pub fn stable_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..ID_WIDTH].to_string()
}

/// Path-derived file identity.
pub fn file_id_for_path(path: &Path) -> String {
    stable_hash(&path.to_string_lossy())
}

/// Chunk identity: stable over `(fileId, chunkIndex)`.
pub fn chunk_id(file_id: &str, chunk_index: usize) -> String {
    stable_hash(&format!("{}:{}", file_id, chunk_index))
}

/// sha256 over raw bytes, full width. Used for change detection only.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compute the full metadata record for a file on disk.
///
/// Fails with `FileUnreadable` when the path cannot be stat-ed or opened;
/// never substitutes zeros for missing attributes.
pub fn extract(path: &Path) -> AppResult<FileMetadata> {
    let meta = std::fs::metadata(path).map_err(|e| AppError::FileUnreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let bytes = std::fs::read(path).map_err(|e| AppError::FileUnreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let modified_at: DateTime<Utc> = meta
        .modified()
        .map(DateTime::from)
        .map_err(|e| AppError::FileUnreadable {
            path: path.display().to_string(),
            reason: format!("no modification time: {}", e),
        })?;

    // Creation time is unavailable on some filesystems; fall back to mtime.
    let created_at: DateTime<Utc> = meta
        .created()
        .map(DateTime::from)
        .unwrap_or(modified_at);

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let ext = path
        .extension()
        .unwrap_or_default()
        .to_string_lossy()
        .to_lowercase();

    Ok(FileMetadata {
        file_id: file_id_for_path(path),
        path: path.to_path_buf(),
        name,
        size: meta.len(),
        file_type: FileType::from_extension(&ext),
        hash: content_hash(&bytes),
        created_at,
        modified_at,
    })
}

/// Read a document as text. Non-UTF-8 byte sequences are replaced rather
/// than failing the whole file.
pub fn read_text(path: &Path) -> AppResult<String> {
    let bytes = std::fs::read(path).map_err(|e| AppError::FileUnreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_id_is_path_stable() {
        let a = file_id_for_path(Path::new("/docs/notes.md"));
        let b = file_id_for_path(Path::new("/docs/notes.md"));
        let c = file_id_for_path(Path::new("/docs/other.md"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), ID_WIDTH);
    }

    #[test]
    fn chunk_ids_are_dense_and_distinct() {
        let file_id = "abcd1234abcd1234";
        let ids: Vec<String> = (0..4).map(|i| chunk_id(file_id, i)).collect();
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(*id, chunk_id(file_id, i));
        }
        let unique: std::collections::HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn extension_maps_into_closed_tag_set() {
        assert_eq!(FileType::from_extension("MD"), FileType::Markdown);
        assert_eq!(FileType::from_extension("txt"), FileType::Text);
        assert_eq!(FileType::from_extension("docx"), FileType::Docx);
        assert_eq!(FileType::from_extension("weird"), FileType::Other);
    }

    #[test]
    fn extract_reads_size_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"hello world").unwrap();
        drop(f);

        let meta = extract(&path).unwrap();
        assert_eq!(meta.size, 11);
        assert_eq!(meta.file_type, FileType::Text);
        assert_eq!(meta.hash, content_hash(b"hello world"));
        assert_eq!(meta.name, "a.txt");
    }

    #[test]
    fn extract_missing_file_is_unreadable() {
        let err = extract(Path::new("/definitely/not/here.txt")).unwrap_err();
        assert!(matches!(err, AppError::FileUnreadable { .. }));
    }
}
