//! Built-in filesystem collaborators used by the server binary.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info};

use crate::job::ErrorKind;

use super::config::LibraryConfig;
use super::traits::{AcquireService, ExtractService, IdentifyService, OrganizeService};
use super::types::{MediaRef, StageOutcome, StagePayload};

const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "rar", "7z", "tar", "gz"];

static TITLE_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<title>.+?)[\s(\[]+(?P<year>(?:19|20)\d{2})(?:[\s)\]]|$)")
        .unwrap_or_else(|e| panic!("invalid title regex: {}", e))
});

/// Treats the source reference as a path on the local filesystem.
pub struct LocalFileAcquirer;

#[async_trait]
impl AcquireService for LocalFileAcquirer {
    async fn fetch(&self, source_ref: &str) -> StageOutcome {
        let path = PathBuf::from(source_ref.strip_prefix("file://").unwrap_or(source_ref));
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {
                StageOutcome::succeeded(StagePayload::Media(MediaRef::new(path).with_size(meta.len())))
            }
            Ok(_) => StageOutcome::fatal(
                ErrorKind::AcquireError,
                format!("{} is not a regular file", path.display()),
            ),
            Err(e) => StageOutcome::failed(
                ErrorKind::AcquireError,
                format!("cannot read {}: {}", path.display(), e),
            ),
        }
    }
}

/// Passes plain media files through unchanged.
///
/// Archives are rejected; a real extractor has to be plugged in for them.
pub struct PassthroughExtractor;

#[async_trait]
impl ExtractService for PassthroughExtractor {
    async fn extract(&self, item: &MediaRef, _password_candidates: &[String]) -> StageOutcome {
        let is_archive = item
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| ARCHIVE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);

        if is_archive {
            return StageOutcome::fatal(
                ErrorKind::ExtractionError,
                format!("no archive extractor configured for {}", item.file_name()),
            );
        }
        StageOutcome::succeeded(StagePayload::Media(item.clone()))
    }
}

/// Derives title and year from the file name, e.g. `Heat.1995.1080p.mkv`.
pub struct FileNameIdentifier;

impl FileNameIdentifier {
    pub fn parse(file_stem: &str) -> Option<(String, u16)> {
        let normalized = file_stem.replace(['.', '_'], " ");
        let caps = TITLE_YEAR.captures(normalized.trim())?;
        let title = caps.name("title")?.as_str().trim().to_string();
        let year = caps.name("year")?.as_str().parse().ok()?;
        if title.is_empty() {
            return None;
        }
        Some((title, year))
    }
}

#[async_trait]
impl IdentifyService for FileNameIdentifier {
    async fn identify(&self, media: &MediaRef) -> StageOutcome {
        let stem = media
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        match Self::parse(&stem) {
            Some((title, year)) => StageOutcome::succeeded(StagePayload::Metadata(
                serde_json::json!({ "title": title, "year": year }),
            )),
            None => StageOutcome::fatal(
                ErrorKind::IdentifyAmbiguous,
                format!("no title/year match for {:?}", stem),
            ),
        }
    }
}

/// Moves media into `<root>/<Title> (<Year>)/<Title> (<Year>).<ext>`.
pub struct FsOrganizer {
    config: LibraryConfig,
}

impl FsOrganizer {
    pub fn new(config: LibraryConfig) -> Self {
        Self { config }
    }

    fn destination(
        root: &Path,
        media: &MediaRef,
        metadata: Option<&serde_json::Value>,
    ) -> PathBuf {
        let title = metadata.and_then(|m| m.get("title")).and_then(|t| t.as_str());
        let year = metadata.and_then(|m| m.get("year")).and_then(|y| y.as_u64());

        match (title, year) {
            (Some(title), Some(year)) => {
                let name = sanitize(&format!("{} ({})", title, year));
                let file = match media.path.extension().and_then(|e| e.to_str()) {
                    Some(ext) => format!("{}.{}", name, ext),
                    None => name.clone(),
                };
                root.join(name).join(file)
            }
            _ => root.join(media.file_name()),
        }
    }

    /// Rename, falling back to copy + remove across filesystems.
    async fn move_file(&self, source: &Path, destination: &Path) -> std::io::Result<u64> {
        match fs::rename(source, destination).await {
            Ok(()) => return Ok(fs::metadata(destination).await?.len()),
            Err(e)
                if e.kind() == std::io::ErrorKind::CrossesDevices
                    || e.raw_os_error() == Some(18) =>
            {
                debug!("Cross-device move, copying {}", source.display());
            }
            Err(e) => return Err(e),
        }

        let mut reader = BufReader::with_capacity(self.config.buffer_size, File::open(source).await?);
        let mut writer =
            BufWriter::with_capacity(self.config.buffer_size, File::create(destination).await?);
        let mut buffer = vec![0u8; self.config.buffer_size];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n]).await?;
            total += n as u64;
        }
        writer.flush().await?;
        fs::remove_file(source).await?;
        Ok(total)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

#[async_trait]
impl OrganizeService for FsOrganizer {
    async fn place(
        &self,
        media: &MediaRef,
        metadata: Option<&serde_json::Value>,
        dest_dir: Option<&Path>,
    ) -> StageOutcome {
        let root = dest_dir.unwrap_or(&self.config.root);
        let destination = Self::destination(root, media, metadata);

        if fs::try_exists(&destination).await.unwrap_or(false) {
            return StageOutcome::fatal(
                ErrorKind::OrganizeError,
                format!("destination already exists: {}", destination.display()),
            );
        }
        if let Some(parent) = destination.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return StageOutcome::failed(
                    ErrorKind::OrganizeError,
                    format!("cannot create {}: {}", parent.display(), e),
                );
            }
        }

        match self.move_file(&media.path, &destination).await {
            Ok(size) => {
                info!(
                    "Placed {} at {}",
                    media.path.display(),
                    destination.display()
                );
                StageOutcome::succeeded(StagePayload::Media(
                    MediaRef::new(destination).with_size(size),
                ))
            }
            Err(e) => StageOutcome::failed(
                ErrorKind::OrganizeError,
                format!("failed to move {}: {}", media.path.display(), e),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_title_and_year() {
        assert_eq!(
            FileNameIdentifier::parse("Heat.1995.1080p.BluRay"),
            Some(("Heat".to_string(), 1995))
        );
        assert_eq!(
            FileNameIdentifier::parse("The Thing (1982)"),
            Some(("The Thing".to_string(), 1982))
        );
        assert_eq!(
            FileNameIdentifier::parse("Alien_1979_remastered"),
            Some(("Alien".to_string(), 1979))
        );
        assert_eq!(FileNameIdentifier::parse("home video"), None);
    }

    #[tokio::test]
    async fn test_identify_without_year_is_ambiguous() {
        let outcome = FileNameIdentifier
            .identify(&MediaRef::new("/in/holiday.mkv"))
            .await;
        assert_eq!(outcome.error_kind, Some(ErrorKind::IdentifyAmbiguous));
        assert!(!outcome.retryable);
    }

    #[tokio::test]
    async fn test_acquire_local_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("in.mkv");
        std::fs::write(&path, b"data").unwrap();

        let outcome = LocalFileAcquirer.fetch(path.to_str().unwrap()).await;
        match outcome.output {
            StagePayload::Media(media) => assert_eq!(media.size_bytes, Some(4)),
            other => panic!("unexpected payload {:?}", other),
        }

        let missing = LocalFileAcquirer.fetch("/definitely/not/here.mkv").await;
        assert!(missing.retryable);
        assert_eq!(missing.error_kind, Some(ErrorKind::AcquireError));
    }

    #[tokio::test]
    async fn test_passthrough_rejects_archives() {
        let outcome = PassthroughExtractor
            .extract(&MediaRef::new("/in/pack.RAR"), &[])
            .await;
        assert_eq!(outcome.error_kind, Some(ErrorKind::ExtractionError));
        let ok = PassthroughExtractor
            .extract(&MediaRef::new("/in/movie.mkv"), &[])
            .await;
        assert!(ok.success);
    }

    #[tokio::test]
    async fn test_organize_moves_into_title_folder() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("Heat.1995.mkv");
        std::fs::write(&source, b"movie").unwrap();
        let library = dir.path().join("library");

        let organizer = FsOrganizer::new(LibraryConfig {
            root: library.clone(),
            ..Default::default()
        });
        let metadata = serde_json::json!({ "title": "Heat", "year": 1995 });
        let outcome = organizer
            .place(&MediaRef::new(&source), Some(&metadata), None)
            .await;

        let expected = library.join("Heat (1995)").join("Heat (1995).mkv");
        assert!(outcome.success, "{:?}", outcome.message);
        assert!(expected.exists());
        assert!(!source.exists());

        std::fs::write(&source, b"again").unwrap();
        let clash = organizer
            .place(&MediaRef::new(&source), Some(&metadata), None)
            .await;
        assert!(!clash.retryable);
    }
}
