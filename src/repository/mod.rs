// src/repository/mod.rs

//! Package sources, downloads and reporting
//!
//! This module provides functionality for:
//! - Managing package sources (HTTP(S) URLs or local directories)
//! - Synchronizing source indexes into the database
//! - Downloading archives with retry support and checksum verification
//! - Reporting installed manifests to a remote endpoint

use crate::db::models::{Repository, RepositoryPackage};
use crate::error::{Error, Result};
use crate::packages::archive::{file_sha256, PackageArchive};
use crate::packages::metadata::{Manifest, Metadata};
use crate::packages::traits::{Fetcher, Reporter};
use reqwest::blocking::Client;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum retry attempts for failed downloads
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Index file every source serves at its root
pub const INDEX_FILE: &str = "metadata.json";

/// Source index format
#[derive(Debug, Serialize, Deserialize)]
pub struct SourceIndex {
    pub name: String,
    pub packages: Vec<IndexEntry>,
}

/// One archive offered by a source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(flatten)]
    pub metadata: Metadata,
    /// SHA-256 of the whole archive file
    pub checksum: String,
    pub size: i64,
}

/// Whether a source location is remote
pub fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn join_location(base: &str, file: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, file)
    } else {
        format!("{}/{}", base, file)
    }
}

/// HTTP client wrapper with retry support
pub struct RepositoryClient {
    client: Client,
    max_retries: u32,
    downloads: PathBuf,
    /// Archive checksums known from synced source indexes, by file name
    checksums: HashMap<String, String>,
}

impl RepositoryClient {
    /// Create a new client downloading into `downloads`
    pub fn new(downloads: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
            downloads: downloads.into(),
            checksums: HashMap::new(),
        })
    }

    /// Verify downloads against the checksums of every enabled source
    pub fn with_index_checksums(mut self, conn: &Connection) -> Result<Self> {
        for (package, _) in RepositoryPackage::list_enabled(conn)? {
            self.checksums.insert(package.filename, package.checksum);
        }
        Ok(self)
    }

    /// Fetch a source index from a URL or local directory
    pub fn fetch_index(&self, location: &str) -> Result<SourceIndex> {
        let index_location = join_location(location, INDEX_FILE);
        info!("Fetching source index from {}", index_location);

        if !is_remote(location) {
            let content = fs::read(&index_location).map_err(|e| {
                Error::IoError(format!("Failed to read {}: {}", index_location, e))
            })?;
            return Ok(serde_json::from_slice(&content)?);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(&index_location).send() {
                Ok(response) => {
                    if !response.status().is_success() {
                        return Err(Error::DownloadError(format!(
                            "HTTP {} from {}",
                            response.status(),
                            index_location
                        )));
                    }

                    let index: SourceIndex = response.json().map_err(|e| {
                        Error::DownloadError(format!("Failed to parse source index: {}", e))
                    })?;

                    info!("Fetched index of {} packages", index.packages.len());
                    return Ok(index);
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to fetch index after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    warn!("Index fetch attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }

    /// Download a file to the specified path with retry support
    pub fn download_file(&self, url: &str, dest_path: &Path) -> Result<()> {
        info!("Downloading {} to {}", url, dest_path.display());

        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::IoError(format!("Failed to create directory {}: {}", parent.display(), e))
            })?;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(mut response) => {
                    if !response.status().is_success() {
                        return Err(Error::DownloadError(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }

                    // Write to temporary file first
                    let temp_path = dest_path.with_extension("tmp");
                    let mut file = File::create(&temp_path).map_err(|e| {
                        Error::IoError(format!("Failed to create file {}: {}", temp_path.display(), e))
                    })?;

                    io::copy(&mut response, &mut file).map_err(|e| {
                        Error::IoError(format!("Failed to write downloaded data: {}", e))
                    })?;

                    fs::rename(&temp_path, dest_path).map_err(|e| {
                        Error::IoError(format!(
                            "Failed to move {} to {}: {}",
                            temp_path.display(),
                            dest_path.display(),
                            e
                        ))
                    })?;

                    debug!("Downloaded {}", dest_path.display());
                    return Ok(());
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to download after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }

    fn verify(&self, path: &Path, filename: &str) -> Result<()> {
        if let Some(expected) = self.checksums.get(filename) {
            verify_checksum(path, expected)?;
        }
        // The embedded payload checksum is verified on open
        PackageArchive::open(path)?;
        Ok(())
    }
}

impl Fetcher for RepositoryClient {
    fn fetch(&self, source: &str, filename: &str) -> Result<PathBuf> {
        if !is_remote(source) {
            let path = Path::new(source).join(filename);
            if !path.is_file() {
                return Err(Error::NotFoundError(format!(
                    "{} not found in {}",
                    filename, source
                )));
            }
            self.verify(&path, filename)?;
            return Ok(path);
        }

        let dest = self.downloads.join(filename);
        if dest.is_file() && self.verify(&dest, filename).is_ok() {
            debug!("Using cached download {}", dest.display());
            return Ok(dest);
        }

        self.download_file(&join_location(source, filename), &dest)?;
        if let Err(e) = self.verify(&dest, filename) {
            let _ = fs::remove_file(&dest);
            return Err(e);
        }
        Ok(dest)
    }
}

/// Posts every newly installed manifest as JSON to a fixed URL
pub struct HttpReporter {
    client: Client,
    url: String,
}

impl HttpReporter {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl Reporter for HttpReporter {
    fn report(&self, manifest: &Manifest) -> Result<()> {
        debug!("Reporting {} to {}", manifest.version, self.url);
        let response = self
            .client
            .post(&self.url)
            .json(manifest)
            .send()
            .map_err(|e| Error::DownloadError(format!("Failed to report to {}: {}", self.url, e)))?;

        if !response.status().is_success() {
            return Err(Error::DownloadError(format!(
                "HTTP {} from {}",
                response.status(),
                self.url
            )));
        }
        Ok(())
    }
}

/// Synchronize a source index with the database
pub fn sync_repository(
    conn: &Connection,
    client: &RepositoryClient,
    repo: &mut Repository,
) -> Result<usize> {
    info!("Synchronizing repository: {}", repo.name);

    let repo_id = repo
        .id
        .ok_or_else(|| Error::InitError("Cannot sync repository without ID".to_string()))?;
    let index = client.fetch_index(&repo.url)?;

    let tx = conn.unchecked_transaction()?;
    RepositoryPackage::delete_by_repository(&tx, repo_id)?;

    let mut count = 0;
    for entry in &index.packages {
        RepositoryPackage::from_metadata(repo_id, &entry.metadata, entry.checksum.clone(), entry.size)?
            .insert(&tx)?;
        count += 1;
    }

    repo.last_sync = Some(current_timestamp());
    repo.update(&tx)?;
    tx.commit()?;

    info!("Synchronized {} packages from repository {}", count, repo.name);
    Ok(count)
}

/// Check if repository metadata needs refresh
pub fn needs_sync(repo: &Repository) -> bool {
    match &repo.last_sync {
        None => true,
        Some(last_sync) => match parse_timestamp(last_sync) {
            Ok(last_sync_time) => {
                let age_seconds = chrono::Utc::now().timestamp() - last_sync_time;
                age_seconds > i64::from(repo.metadata_expire)
            }
            Err(_) => true,
        },
    }
}

/// Build a source index for a directory of archives
pub fn index_directory(dir: &Path, name: &str) -> Result<SourceIndex> {
    let mut packages = Vec::new();
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext == crate::packages::metadata::ARCHIVE_EXTENSION)
        })
        .collect();
    paths.sort();

    for path in paths {
        let archive = PackageArchive::open(&path)?;
        let mut metadata = archive.metadata;
        if let Some(file_name) = path.file_name() {
            metadata.filename = Some(file_name.to_string_lossy().into_owned());
        }
        packages.push(IndexEntry {
            metadata,
            checksum: file_sha256(&path)?,
            size: fs::metadata(&path)?.len() as i64,
        });
    }

    Ok(SourceIndex {
        name: name.to_string(),
        packages,
    })
}

/// Verify file checksum matches expected value
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    debug!("Verifying checksum for {}", path.display());

    let actual = file_sha256(path)
        .map_err(|e| Error::IoError(format!("Failed to read file for checksum: {}", e)))?;

    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }

    debug!("Checksum verified: {}", expected);
    Ok(())
}

/// Get current timestamp as ISO 8601 string
fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Parse ISO 8601 timestamp to Unix seconds
fn parse_timestamp(timestamp: &str) -> Result<i64> {
    let dt = chrono::DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| Error::ParseError(format!("Invalid timestamp: {}", e)))?;

    Ok(dt.timestamp())
}

/// Add a new repository to the database
pub fn add_repository(
    conn: &Connection,
    name: String,
    url: String,
    enabled: bool,
    priority: i32,
) -> Result<Repository> {
    if Repository::find_by_name(conn, &name)?.is_some() {
        return Err(Error::ConflictError(format!(
            "Repository '{}' already exists",
            name
        )));
    }

    let mut repo = Repository::new(name, url);
    repo.enabled = enabled;
    repo.priority = priority;

    repo.insert(conn)?;

    info!("Added repository: {} ({})", repo.name, repo.url);
    Ok(repo)
}

fn find_repository(conn: &Connection, name: &str) -> Result<Repository> {
    Repository::find_by_name(conn, name)?
        .ok_or_else(|| Error::NotFoundError(format!("Repository '{}' not found", name)))
}

/// Remove a repository from the database
pub fn remove_repository(conn: &Connection, name: &str) -> Result<()> {
    let repo = find_repository(conn, name)?;
    if let Some(id) = repo.id {
        Repository::delete(conn, id)?;
    }
    info!("Removed repository: {}", name);
    Ok(())
}

/// Enable or disable a repository
pub fn set_repository_enabled(conn: &Connection, name: &str, enabled: bool) -> Result<()> {
    let mut repo = find_repository(conn, name)?;

    repo.enabled = enabled;
    repo.update(conn)?;

    info!(
        "Repository '{}' {}",
        name,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// Search for packages across all repositories
pub fn search_packages(conn: &Connection, pattern: &str) -> Result<Vec<RepositoryPackage>> {
    RepositoryPackage::search(conn, pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use crate::packages::archive::ArchiveBuilder;
    use crate::packages::archive::tests::build_dir;
    use crate::version::Version;
    use tempfile::{NamedTempFile, TempDir};

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    /// A local source directory with one archive and its index
    fn local_source(temp: &TempDir) -> PathBuf {
        let source = temp.path().join("source");
        let build = temp.path().join("build");
        let meta = Metadata::new("app", Version::parse("1.0").unwrap());
        build_dir(&build, &meta, &[("usr/bin/app", "binary")]);
        ArchiveBuilder::new(&build).build(&source).unwrap();

        let index = index_directory(&source, "local").unwrap();
        fs::write(source.join(INDEX_FILE), serde_json::to_vec(&index).unwrap()).unwrap();
        source
    }

    #[test]
    fn test_add_repository() {
        let (_temp, conn) = create_test_db();

        let repo = add_repository(
            &conn,
            "test-repo".to_string(),
            "https://example.com/repo".to_string(),
            true,
            10,
        )
        .unwrap();

        assert_eq!(repo.name, "test-repo");
        assert_eq!(repo.priority, 10);
        assert!(repo.id.is_some());
    }

    #[test]
    fn test_add_duplicate_repository() {
        let (_temp, conn) = create_test_db();

        add_repository(&conn, "dup".to_string(), "/srv/a".to_string(), true, 0).unwrap();
        let result = add_repository(&conn, "dup".to_string(), "/srv/b".to_string(), true, 0);
        assert!(matches!(result.unwrap_err(), Error::ConflictError(_)));
    }

    #[test]
    fn test_remove_repository() {
        let (_temp, conn) = create_test_db();

        add_repository(&conn, "gone".to_string(), "/srv/a".to_string(), true, 0).unwrap();
        remove_repository(&conn, "gone").unwrap();
        assert!(Repository::find_by_name(&conn, "gone").unwrap().is_none());
        assert!(matches!(
            remove_repository(&conn, "gone").unwrap_err(),
            Error::NotFoundError(_)
        ));
    }

    #[test]
    fn test_enable_disable_repository() {
        let (_temp, conn) = create_test_db();

        add_repository(&conn, "toggle".to_string(), "/srv/a".to_string(), true, 0).unwrap();
        set_repository_enabled(&conn, "toggle", false).unwrap();
        let repo = Repository::find_by_name(&conn, "toggle").unwrap().unwrap();
        assert!(!repo.enabled);
    }

    #[test]
    fn test_needs_sync() {
        let mut repo = Repository::new("r".to_string(), "/srv".to_string());
        assert!(needs_sync(&repo));

        repo.last_sync = Some(current_timestamp());
        assert!(!needs_sync(&repo));

        repo.last_sync = Some("garbage".to_string());
        assert!(needs_sync(&repo));
    }

    #[test]
    fn test_timestamp_functions() {
        let timestamp = current_timestamp();
        let parsed = parse_timestamp(&timestamp).unwrap();
        assert!(parsed > 0);
    }

    #[test]
    fn test_sync_and_fetch_local_source() {
        let temp = TempDir::new().unwrap();
        let (_db, conn) = create_test_db();
        let source = local_source(&temp);
        let source_str = source.to_string_lossy().into_owned();

        let mut repo = add_repository(&conn, "local".to_string(), source_str.clone(), true, 0).unwrap();
        let client = RepositoryClient::new(temp.path().join("downloads")).unwrap();
        assert_eq!(sync_repository(&conn, &client, &mut repo).unwrap(), 1);
        assert!(!needs_sync(&repo));
        assert_eq!(search_packages(&conn, "app").unwrap().len(), 1);

        let client = client.with_index_checksums(&conn).unwrap();
        let path = client.fetch(&source_str, "app-1.0.hpkg").unwrap();
        assert_eq!(path, source.join("app-1.0.hpkg"));

        assert!(matches!(
            client.fetch(&source_str, "missing-1.0.hpkg").unwrap_err(),
            Error::NotFoundError(_)
        ));
    }

    #[test]
    fn test_fetch_rejects_tampered_archive() {
        let temp = TempDir::new().unwrap();
        let source = local_source(&temp);

        let mut client = RepositoryClient::new(temp.path().join("downloads")).unwrap();
        client
            .checksums
            .insert("app-1.0.hpkg".to_string(), "deadbeef".to_string());

        let err = client
            .fetch(&source.to_string_lossy(), "app-1.0.hpkg")
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_is_remote() {
        assert!(is_remote("https://pkgs.example.com"));
        assert!(is_remote("http://pkgs.example.com/"));
        assert!(!is_remote("/srv/pkgs"));
    }
}
