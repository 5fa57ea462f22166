// src/db/mod.rs

//! Database layer for hostpkg
//!
//! This module handles all SQLite operations including:
//! - Database initialization and schema migration
//! - Connection management
//! - The installed-package store and the source index used by transactions

pub mod models;
pub mod schema;

use crate::error::{Error, Result};
use crate::packages::metadata::{Manifest, Metadata};
use crate::packages::traits::{AvailableIndex, AvailablePackage, InstalledStore};
use models::{Changeset, ChangesetStatus, FileEntry, InstalledPackage, RepositoryPackage};
use rusqlite::Connection;
use std::path::Path;
use tracing::{debug, info, warn};

/// Initialize a new hostpkg database at the specified path
///
/// Creates the database file and brings the schema up to date.
/// This is idempotent - calling it on an existing database is safe.
///
/// # Arguments
///
/// * `db_path` - Path where the database should be created
pub fn init(db_path: &Path) -> Result<()> {
    debug!("Initializing database at: {}", db_path.display());

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::InitError(format!("Failed to create database directory: {}", e)))?;
    }

    let conn = Connection::open(db_path)?;

    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    schema::migrate(&conn)?;

    info!("Database initialized successfully");
    Ok(())
}

/// Open an existing hostpkg database
///
/// # Arguments
///
/// * `db_path` - Path to the database file
pub fn open(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        return Err(Error::DatabaseNotFound(db_path.display().to_string()));
    }

    let conn = Connection::open(db_path)?;

    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    schema::migrate(&conn)?;

    Ok(conn)
}

/// SQLite-backed installed-state store and source index
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open the database, creating it when missing
    pub fn open(db_path: &Path) -> Result<Self> {
        if !db_path.exists() {
            init(db_path)?;
        }
        Ok(Self {
            conn: open(db_path)?,
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Installed packages with their database rows
    pub fn installed_packages(&self) -> Result<Vec<InstalledPackage>> {
        InstalledPackage::list_all(&self.conn)
    }

    pub fn history(&self) -> Result<Vec<Changeset>> {
        Changeset::list_all(&self.conn)
    }

    pub fn changeset(&self, id: i64) -> Result<Option<Changeset>> {
        Changeset::find_by_id(&self.conn, id)
    }

    /// Run `f` inside a changeset: the history row and the change commit
    /// together, or a failed history row is left behind
    fn with_changeset<F>(&self, description: String, f: F) -> Result<()>
    where
        F: FnOnce(&Connection, i64) -> Result<()>,
    {
        let mut changeset = Changeset::new(description);
        let changeset_id = changeset.insert(&self.conn)?;

        let tx = self.conn.unchecked_transaction()?;
        let result = f(&*tx, changeset_id).and_then(|()| {
            changeset.update_status(&tx, ChangesetStatus::Applied)?;
            tx.commit()?;
            Ok(())
        });

        if let Err(e) = &result {
            warn!("Changeset '{}' failed: {}", changeset.description, e);
            changeset.update_status(&self.conn, ChangesetStatus::Failed)?;
        }
        result
    }
}

impl InstalledStore for Database {
    fn list_installed(&self) -> Result<Vec<Metadata>> {
        InstalledPackage::list_all(&self.conn)?
            .iter()
            .map(InstalledPackage::to_metadata)
            .collect()
    }

    fn manifest(&self, name: &str) -> Result<Manifest> {
        let package = InstalledPackage::find_by_name(&self.conn, name)?
            .ok_or_else(|| Error::NotFoundError(format!("Package '{}' is not installed", name)))?;
        let metadata = package.to_metadata()?;

        let mut manifest = Manifest::new(&metadata);
        if let Some(id) = package.id {
            manifest.files = FileEntry::find_by_package(&self.conn, id)?
                .iter()
                .map(FileEntry::to_manifest_entry)
                .collect();
        }
        Ok(manifest)
    }

    fn file_owners(&self) -> Result<Vec<(String, String)>> {
        FileEntry::list_owned(&self.conn)
    }

    fn record_installed(&self, metadata: &Metadata, manifest: &Manifest) -> Result<()> {
        self.with_changeset(format!("Install {}", metadata.label()), |conn, changeset_id| {
            if let Some(previous) = InstalledPackage::find_by_name(conn, &metadata.name)? {
                if let Some(id) = previous.id {
                    debug!("Replacing database record of {}", previous.name);
                    InstalledPackage::delete(conn, id)?;
                }
            }

            let mut package = InstalledPackage::from_metadata(metadata)?;
            package.installed_by_changeset_id = Some(changeset_id);
            let package_id = package.insert(conn)?;

            for entry in &manifest.files {
                FileEntry::from_manifest(entry, package_id).insert(conn)?;
            }
            Ok(())
        })
    }

    fn forget_installed(&self, name: &str) -> Result<()> {
        let package = InstalledPackage::find_by_name(&self.conn, name)?
            .ok_or_else(|| Error::NotFoundError(format!("Package '{}' is not installed", name)))?;
        let label = package.to_metadata()?.label();

        self.with_changeset(format!("Remove {}", label), |conn, _| {
            if let Some(id) = package.id {
                InstalledPackage::delete(conn, id)?;
            }
            Ok(())
        })
    }
}

impl AvailableIndex for Database {
    fn list_available(&self) -> Result<Vec<AvailablePackage>> {
        RepositoryPackage::list_enabled(&self.conn)?
            .into_iter()
            .map(|(package, url)| {
                Ok(AvailablePackage {
                    metadata: package.to_metadata()?,
                    location: url,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::metadata::ManifestEntry;
    use crate::version::Version;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_init_creates_database() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_path_buf();

        // Remove the temp file so init can create it
        drop(temp_file);

        let result = init(&db_path);
        assert!(result.is_ok());
        assert!(db_path.exists());
    }

    #[test]
    fn test_open_existing_database() {
        let temp_file = NamedTempFile::new().unwrap();
        init(temp_file.path()).unwrap();
        assert!(open(temp_file.path()).is_ok());
    }

    #[test]
    fn test_open_nonexistent_database() {
        let result = open(Path::new("/nonexistent/path/db.sqlite"));
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), Error::DatabaseNotFound(_)));
    }

    fn manifest_for(meta: &Metadata, paths: &[&str]) -> Manifest {
        let mut manifest = Manifest::new(meta);
        manifest.files = paths
            .iter()
            .map(|path| ManifestEntry {
                path: path.to_string(),
                sha256: "00".to_string(),
                size: 0,
                mode: 0o644,
                config: false,
                directory: false,
            })
            .collect();
        manifest
    }

    #[test]
    fn test_record_and_forget() {
        let temp = TempDir::new().unwrap();
        let db = Database::open(&temp.path().join("hostpkg.db")).unwrap();

        let meta = Metadata::new("app", Version::parse("1.0").unwrap());
        db.record_installed(&meta, &manifest_for(&meta, &["/usr/bin/app"]))
            .unwrap();

        assert_eq!(db.list_installed().unwrap(), vec![meta.clone()]);
        assert_eq!(db.manifest("app").unwrap().files.len(), 1);
        assert_eq!(
            db.file_owners().unwrap(),
            vec![("/usr/bin/app".to_string(), "app".to_string())]
        );

        db.forget_installed("app").unwrap();
        assert!(db.list_installed().unwrap().is_empty());
        assert!(db.file_owners().unwrap().is_empty());

        let history = db.history().unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|c| c.status == ChangesetStatus::Applied));

        let newest = db.changeset(history[0].id.unwrap()).unwrap().unwrap();
        assert_eq!(newest.description, "Remove app-1.0");
        assert!(db.changeset(9999).unwrap().is_none());
    }

    #[test]
    fn test_record_replaces_previous_version() {
        let temp = TempDir::new().unwrap();
        let db = Database::open(&temp.path().join("hostpkg.db")).unwrap();

        let old = Metadata::new("app", Version::parse("1.0").unwrap());
        let new = Metadata::new("app", Version::parse("2.0").unwrap());
        db.record_installed(&old, &manifest_for(&old, &["/old"])).unwrap();
        db.record_installed(&new, &manifest_for(&new, &["/new"])).unwrap();

        assert_eq!(db.list_installed().unwrap(), vec![new]);
        assert_eq!(db.manifest("app").unwrap().files[0].path, "/new");
    }

    #[test]
    fn test_forget_unknown_package() {
        let temp = TempDir::new().unwrap();
        let db = Database::open(&temp.path().join("hostpkg.db")).unwrap();
        assert!(matches!(
            db.forget_installed("ghost").unwrap_err(),
            Error::NotFoundError(_)
        ));
    }
}
