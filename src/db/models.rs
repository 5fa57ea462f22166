// src/db/models.rs

//! Data models for hostpkg database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.

use crate::error::{Error, Result};
use crate::packages::metadata::{ManifestEntry, Metadata};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;

/// An installed managed package
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub id: Option<i64>,
    pub name: String,
    pub version: String,
    pub package_version: Option<String>,
    pub filename: String,
    pub description: Option<String>,
    /// Full [`Metadata`] as JSON
    pub metadata: String,
    pub installed_at: Option<String>,
    pub installed_by_changeset_id: Option<i64>,
}

impl InstalledPackage {
    pub fn from_metadata(metadata: &Metadata) -> Result<Self> {
        Ok(Self {
            id: None,
            name: metadata.name.clone(),
            version: metadata.version.to_string(),
            package_version: metadata.package_version.as_ref().map(|pv| pv.to_string()),
            filename: metadata.filename(),
            description: metadata.description.clone(),
            metadata: serde_json::to_string(metadata)?,
            installed_at: None,
            installed_by_changeset_id: None,
        })
    }

    /// Insert this package into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO packages (name, version, package_version, filename, description, metadata, installed_by_changeset_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &self.name,
                &self.version,
                &self.package_version,
                &self.filename,
                &self.description,
                &self.metadata,
                &self.installed_by_changeset_id,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, version, package_version, filename, description, metadata, installed_at, installed_by_changeset_id
             FROM packages WHERE name = ?1",
        )?;

        let package = stmt.query_row([name], Self::from_row).optional()?;

        Ok(package)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, version, package_version, filename, description, metadata, installed_at, installed_by_changeset_id
             FROM packages ORDER BY name",
        )?;

        let packages = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Delete a package by ID; its files go with it
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM packages WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn to_metadata(&self) -> Result<Metadata> {
        Ok(serde_json::from_str(&self.metadata)?)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            version: row.get(2)?,
            package_version: row.get(3)?,
            filename: row.get(4)?,
            description: row.get(5)?,
            metadata: row.get(6)?,
            installed_at: row.get(7)?,
            installed_by_changeset_id: row.get(8)?,
        })
    }
}

/// Changeset status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangesetStatus {
    Pending,
    Applied,
    Failed,
}

impl ChangesetStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ChangesetStatus::Pending => "pending",
            ChangesetStatus::Applied => "applied",
            ChangesetStatus::Failed => "failed",
        }
    }
}

impl FromStr for ChangesetStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChangesetStatus::Pending),
            "applied" => Ok(ChangesetStatus::Applied),
            "failed" => Ok(ChangesetStatus::Failed),
            _ => Err(format!("Invalid changeset status: {}", s)),
        }
    }
}

/// A history entry for one install or removal
#[derive(Debug, Clone)]
pub struct Changeset {
    pub id: Option<i64>,
    pub description: String,
    pub status: ChangesetStatus,
    pub created_at: Option<String>,
    pub applied_at: Option<String>,
}

impl Changeset {
    pub fn new(description: String) -> Self {
        Self {
            id: None,
            description,
            status: ChangesetStatus::Pending,
            created_at: None,
            applied_at: None,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO changesets (description, status) VALUES (?1, ?2)",
            params![&self.description, self.status.as_str()],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, status, created_at, applied_at FROM changesets WHERE id = ?1",
        )?;

        let changeset = stmt.query_row([id], Self::from_row).optional()?;

        Ok(changeset)
    }

    /// List all changesets, newest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, status, created_at, applied_at
             FROM changesets ORDER BY created_at DESC, id DESC",
        )?;

        let changesets = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(changesets)
    }

    pub fn update_status(&mut self, conn: &Connection, new_status: ChangesetStatus) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InitError("Cannot update changeset without ID".to_string()))?;

        if new_status == ChangesetStatus::Applied {
            conn.execute(
                "UPDATE changesets SET status = ?1, applied_at = CURRENT_TIMESTAMP WHERE id = ?2",
                params![new_status.as_str(), id],
            )?;
        } else {
            conn.execute(
                "UPDATE changesets SET status = ?1 WHERE id = ?2",
                params![new_status.as_str(), id],
            )?;
        }

        self.status = new_status;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_str: String = row.get(2)?;
        let status = status_str.parse::<ChangesetStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        Ok(Self {
            id: Some(row.get(0)?),
            description: row.get(1)?,
            status,
            created_at: row.get(3)?,
            applied_at: row.get(4)?,
        })
    }
}

/// One manifest entry of an installed package
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub id: Option<i64>,
    pub path: String,
    pub sha256_hash: String,
    pub size: i64,
    pub permissions: u32,
    pub config: bool,
    pub directory: bool,
    pub package_id: i64,
}

impl FileEntry {
    pub fn from_manifest(entry: &ManifestEntry, package_id: i64) -> Self {
        Self {
            id: None,
            path: entry.path.clone(),
            sha256_hash: entry.sha256.clone(),
            size: entry.size,
            permissions: entry.mode,
            config: entry.config,
            directory: entry.directory,
            package_id,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO files (path, sha256_hash, size, permissions, config, directory, package_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &self.path,
                &self.sha256_hash,
                &self.size,
                &self.permissions,
                self.config as i32,
                self.directory as i32,
                &self.package_id,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, path, sha256_hash, size, permissions, config, directory, package_id
             FROM files WHERE package_id = ?1 ORDER BY path",
        )?;

        let files = stmt
            .query_map([package_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(files)
    }

    /// `(path, package name)` of every installed non-directory file
    pub fn list_owned(conn: &Connection) -> Result<Vec<(String, String)>> {
        let mut stmt = conn.prepare(
            "SELECT f.path, p.name FROM files f
             JOIN packages p ON p.id = f.package_id
             WHERE f.directory = 0
             ORDER BY f.path",
        )?;

        let owners = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(owners)
    }

    pub fn to_manifest_entry(&self) -> ManifestEntry {
        ManifestEntry {
            path: self.path.clone(),
            sha256: self.sha256_hash.clone(),
            size: self.size,
            mode: self.permissions,
            config: self.config,
            directory: self.directory,
        }
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            path: row.get(1)?,
            sha256_hash: row.get(2)?,
            size: row.get(3)?,
            permissions: row.get(4)?,
            config: row.get::<_, i32>(5)? != 0,
            directory: row.get::<_, i32>(6)? != 0,
            package_id: row.get(7)?,
        })
    }
}

/// A configured package source
#[derive(Debug, Clone)]
pub struct Repository {
    pub id: Option<i64>,
    pub name: String,
    /// HTTP(S) URL or local directory
    pub url: String,
    pub enabled: bool,
    pub priority: i32,
    /// Seconds before the cached index is considered stale
    pub metadata_expire: i32,
    pub last_sync: Option<String>,
    pub created_at: Option<String>,
}

impl Repository {
    pub fn new(name: String, url: String) -> Self {
        Self {
            id: None,
            name,
            url,
            enabled: true,
            priority: 0,
            metadata_expire: 3600, // Default: 1 hour
            last_sync: None,
            created_at: None,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO repositories (name, url, enabled, priority, metadata_expire)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &self.name,
                &self.url,
                self.enabled as i32,
                &self.priority,
                &self.metadata_expire,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, enabled, priority, metadata_expire, last_sync, created_at
             FROM repositories WHERE name = ?1",
        )?;

        let repo = stmt.query_row([name], Self::from_row).optional()?;

        Ok(repo)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, enabled, priority, metadata_expire, last_sync, created_at
             FROM repositories ORDER BY priority DESC, name",
        )?;

        let repos = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(repos)
    }

    pub fn list_enabled(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, enabled, priority, metadata_expire, last_sync, created_at
             FROM repositories WHERE enabled = 1 ORDER BY priority DESC, name",
        )?;

        let repos = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(repos)
    }

    pub fn update(&self, conn: &Connection) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InitError("Cannot update repository without ID".to_string()))?;

        conn.execute(
            "UPDATE repositories SET name = ?1, url = ?2, enabled = ?3, priority = ?4,
             metadata_expire = ?5, last_sync = ?6 WHERE id = ?7",
            params![
                &self.name,
                &self.url,
                self.enabled as i32,
                &self.priority,
                &self.metadata_expire,
                &self.last_sync,
                id,
            ],
        )?;

        Ok(())
    }

    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM repositories WHERE id = ?1", [id])?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            url: row.get(2)?,
            enabled: row.get::<_, i32>(3)? != 0,
            priority: row.get(4)?,
            metadata_expire: row.get(5)?,
            last_sync: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

/// A managed package offered by a source
#[derive(Debug, Clone)]
pub struct RepositoryPackage {
    pub id: Option<i64>,
    pub repository_id: i64,
    pub name: String,
    pub version: String,
    pub package_version: Option<String>,
    pub description: Option<String>,
    pub checksum: String,
    pub size: i64,
    pub filename: String,
    /// Full [`Metadata`] as JSON
    pub metadata: String,
    pub synced_at: Option<String>,
}

const REPOSITORY_PACKAGE_COLUMNS: &str = "rp.id, rp.repository_id, rp.name, rp.version, rp.package_version,
     rp.description, rp.checksum, rp.size, rp.filename, rp.metadata, rp.synced_at";

impl RepositoryPackage {
    pub fn from_metadata(
        repository_id: i64,
        metadata: &Metadata,
        checksum: String,
        size: i64,
    ) -> Result<Self> {
        Ok(Self {
            id: None,
            repository_id,
            name: metadata.name.clone(),
            version: metadata.version.to_string(),
            package_version: metadata.package_version.as_ref().map(|pv| pv.to_string()),
            description: metadata.description.clone(),
            checksum,
            size,
            filename: metadata.filename(),
            metadata: serde_json::to_string(metadata)?,
            synced_at: None,
        })
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO repository_packages
             (repository_id, name, version, package_version, description, checksum, size, filename, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &self.repository_id,
                &self.name,
                &self.version,
                &self.package_version,
                &self.description,
                &self.checksum,
                &self.size,
                &self.filename,
                &self.metadata,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_repository(conn: &Connection, repository_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repository_packages rp WHERE rp.repository_id = ?1 ORDER BY rp.name",
            REPOSITORY_PACKAGE_COLUMNS
        ))?;

        let packages = stmt
            .query_map([repository_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Search packages by pattern (name or description)
    pub fn search(conn: &Connection, pattern: &str) -> Result<Vec<Self>> {
        let search_pattern = format!("%{}%", pattern);
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repository_packages rp
             WHERE rp.name LIKE ?1 OR rp.description LIKE ?1
             ORDER BY rp.name, rp.version",
            REPOSITORY_PACKAGE_COLUMNS
        ))?;

        let packages = stmt
            .query_map([&search_pattern], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Every package of an enabled source, paired with the source URL
    pub fn list_enabled(conn: &Connection) -> Result<Vec<(Self, String)>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, r.url FROM repository_packages rp
             JOIN repositories r ON r.id = rp.repository_id
             WHERE r.enabled = 1
             ORDER BY r.priority DESC, rp.name",
            REPOSITORY_PACKAGE_COLUMNS
        ))?;

        let packages = stmt
            .query_map([], |row| Ok((Self::from_row(row)?, row.get(11)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Delete all packages for a repository (used when syncing)
    pub fn delete_by_repository(conn: &Connection, repository_id: i64) -> Result<()> {
        conn.execute(
            "DELETE FROM repository_packages WHERE repository_id = ?1",
            [repository_id],
        )?;
        Ok(())
    }

    pub fn to_metadata(&self) -> Result<Metadata> {
        Ok(serde_json::from_str(&self.metadata)?)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            repository_id: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            package_version: row.get(4)?,
            description: row.get(5)?,
            checksum: row.get(6)?,
            size: row.get(7)?,
            filename: row.get(8)?,
            metadata: row.get(9)?,
            synced_at: row.get(10)?,
        })
    }
}
