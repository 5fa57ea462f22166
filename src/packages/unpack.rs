// src/packages/unpack.rs

//! Applying managed archives to the host
//!
//! Extraction happens under the session's install root. Removal hooks are
//! cached under `metadata/<name>/` so the package can be removed after its
//! archive is gone.

use crate::error::{Error, Result};
use crate::packages::archive::{file_sha256, PackageArchive, METADATA_ENTRY};
use crate::packages::metadata::{FileSpec, Manifest, ManifestEntry, Metadata};
use crate::packages::traits::{UnpackOptions, Unpacker};
use crate::scripts::{self, ExternalOperation};
use crate::services;
use crate::session::Session;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Hooks kept after installation for use at removal time
pub const REMOVAL_HOOKS: [&str; 2] = ["preremove", "postremove"];

/// Unpacks archives under the session's install root
#[derive(Debug, Clone)]
pub struct HostUnpacker {
    session: Session,
}

impl HostUnpacker {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    fn extract_hooks(&self, archive: &PackageArchive, scratch: &Path) -> Result<()> {
        let cache = self.session.metadata_dir(&archive.metadata.name);
        if cache.exists() {
            fs::remove_dir_all(&cache)?;
        }
        fs::create_dir_all(&cache)?;
        fs::write(
            cache.join(METADATA_ENTRY),
            serde_json::to_vec_pretty(&archive.metadata)?,
        )?;

        for hook in crate::packages::archive::HOOK_NAMES {
            let Some(data) = archive.hook(hook) else {
                continue;
            };
            write_script(&scratch.join(hook), data)?;
            if REMOVAL_HOOKS.contains(&hook) {
                write_script(&cache.join(hook), data)?;
            }
        }
        Ok(())
    }

    fn extract_payload(&self, archive: &PackageArchive) -> Result<Vec<ManifestEntry>> {
        let metadata = &archive.metadata;
        let mut files = Vec::new();
        fs::create_dir_all(&self.session.root)?;
        let root = fs::canonicalize(&self.session.root)?;

        for entry in archive.payload()?.entries()? {
            let mut entry = entry?;
            let relative = safe_relative(&entry.path()?)?;
            if relative.as_os_str().is_empty() {
                continue;
            }
            let dest = self.session.root.join(&relative);
            let package_path = format!("/{}", relative.to_string_lossy());
            let header_mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
            let entry_type = entry.header().entry_type();

            let parent = relative.parent().unwrap_or(Path::new(""));
            ensure_within(&root, if entry_type.is_dir() { relative.as_path() } else { parent })?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut manifest_entry = ManifestEntry {
                path: package_path.clone(),
                sha256: String::new(),
                size: 0,
                mode: header_mode,
                config: metadata.file_spec(&package_path).is_some_and(|f| f.config),
                directory: false,
            };

            if entry_type.is_dir() {
                fs::create_dir_all(&dest)?;
                manifest_entry.directory = true;
            } else if entry_type.is_file() {
                replace_link(&dest)?;
                let mut out = File::create(&dest).map_err(|e| {
                    Error::IoError(format!("Failed to create {}: {}", dest.display(), e))
                })?;
                io::copy(&mut entry, &mut out)?;
                drop(out);
                set_mode(&dest, header_mode)?;

                manifest_entry.sha256 = file_sha256(&dest)?;
                manifest_entry.size = fs::metadata(&dest)?.len() as i64;
            } else if entry_type.is_hard_link() {
                let target = entry.link_name()?.ok_or_else(|| {
                    Error::ParseError(format!("Hard link {} has no target", package_path))
                })?;
                let target = safe_relative(&target)?;
                ensure_within(&root, target.parent().unwrap_or(Path::new("")))?;
                replace_link(&dest)?;
                fs::hard_link(self.session.root.join(&target), &dest)?;
            } else {
                replace_link(&dest)?;
                entry.unpack(&dest)?;
            }

            debug!("Unpacked {}", dest.display());
            files.push(manifest_entry);
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    fn apply_file_specs(&self, metadata: &Metadata, files: &mut [ManifestEntry]) -> Result<()> {
        for spec in &metadata.files {
            let path = self.session.root_path(&spec.path);
            if fs::symlink_metadata(&path).is_err() {
                warn!("{} declares {} but did not install it", metadata.name, spec.path);
                continue;
            }

            if let Some(mode) = spec.mode {
                if let Err(e) = set_mode(&path, mode) {
                    self.ownership_failure(format!("chmod {:o} {}: {}", mode, path.display(), e))?;
                } else if let Some(entry) = files
                    .iter_mut()
                    .find(|f| f.path.trim_start_matches('/') == spec.path.trim_start_matches('/'))
                {
                    entry.mode = mode;
                }
            }

            if spec.owner.is_some() || spec.group.is_some() {
                if let Err(e) = set_owner(&path, spec) {
                    self.ownership_failure(e)?;
                }
            }
        }
        Ok(())
    }

    /// Fatal only when running privileged
    fn ownership_failure(&self, message: String) -> Result<()> {
        if self.session.privileged {
            Err(Error::PermissionDenied(message))
        } else {
            warn!("{} (ignored, not running as root)", message);
            Ok(())
        }
    }
}

impl Unpacker for HostUnpacker {
    fn apply(&self, path: &Path, options: &UnpackOptions) -> Result<Manifest> {
        let archive = PackageArchive::open(path)?;
        let metadata = &archive.metadata;

        if options.upgrading {
            info!("Unpacking {} (upgrade)", metadata.label());
        } else {
            info!("Unpacking {}", metadata.label());
        }
        if options.passphrase.is_some() {
            debug!("Passphrase supplied; {} payload is stored unencrypted", metadata.name);
        }

        let scratch = tempfile::tempdir()?;
        self.extract_hooks(&archive, scratch.path())?;

        let preinstall = scratch.path().join("preinstall");
        if preinstall.is_file() {
            scripts::run_pre_hook(&preinstall, self.session.force)?;
        }

        let mut manifest = Manifest::new(metadata);
        manifest.files = self.extract_payload(&archive)?;
        self.apply_file_specs(metadata, &mut manifest.files)?;

        services::wire(&self.session, metadata)?;

        let filename = metadata.filename();
        for external in &metadata.externals {
            if options.externals_to_skip.contains(external) {
                debug!("Skipping external {} shared with the previous version", external.name);
                continue;
            }
            scripts::run_external(
                &self.session.externals_dir(),
                external,
                &filename,
                ExternalOperation::Install,
            );
        }

        let postinstall = scratch.path().join("postinstall");
        if postinstall.is_file() {
            scripts::run_post_hook(&postinstall);
        }

        Ok(manifest)
    }
}

/// Reject payload paths that would escape the install root
fn safe_relative(path: &Path) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::ParseError(format!(
                    "Refusing to unpack unsafe path {}",
                    path.display()
                )));
            }
        }
    }
    Ok(relative)
}

/// Refuse a directory under `root` whose existing components resolve
/// outside it. Symlinks that stay inside the root are followed.
fn ensure_within(root: &Path, dir: &Path) -> Result<()> {
    let mut current = root.to_path_buf();
    for component in dir.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let inside = fs::canonicalize(&current).is_ok_and(|target| target.starts_with(root));
                if !inside {
                    return Err(Error::ParseError(format!(
                        "Refusing to unpack under {}: it leads outside the install root",
                        current.display()
                    )));
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Ok(())
}

/// Remove a symlink at `path` so writing does not follow it
fn replace_link(path: &Path) -> Result<()> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

fn write_script(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data)?;
    set_mode(path, 0o755)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_owner(path: &Path, spec: &FileSpec) -> std::result::Result<(), String> {
    use nix::unistd::{chown, Group, User};

    let uid = match &spec.owner {
        Some(owner) => Some(
            User::from_name(owner)
                .map_err(|e| format!("Failed to look up user {}: {}", owner, e))?
                .ok_or_else(|| format!("Unknown user {} for {}", owner, path.display()))?
                .uid,
        ),
        None => None,
    };
    let gid = match &spec.group {
        Some(group) => Some(
            Group::from_name(group)
                .map_err(|e| format!("Failed to look up group {}: {}", group, e))?
                .ok_or_else(|| format!("Unknown group {} for {}", group, path.display()))?
                .gid,
        ),
        None => None,
    };

    chown(path, uid, gid).map_err(|e| format!("chown {}: {}", path.display(), e))
}

#[cfg(not(unix))]
fn set_owner(path: &Path, _spec: &FileSpec) -> std::result::Result<(), String> {
    Err(format!("Cannot change ownership of {} on this platform", path.display()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::packages::archive::tests::build_dir;
    use crate::packages::archive::ArchiveBuilder;
    use crate::packages::metadata::External;
    use crate::version::Version;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        session: Session,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let mut session = Session::new(temp.path().join("root"), temp.path().join("base"));
            session.privileged = false;
            session.ensure_dirs().unwrap();
            Self { temp, session }
        }

        fn archive(&self, meta: &Metadata, files: &[(&str, &str)], hooks: &[(&str, &str)]) -> PathBuf {
            let build = self.temp.path().join(format!("build-{}", meta.name));
            build_dir(&build, meta, files);
            fs::create_dir_all(build.join("hooks")).unwrap();
            for (hook, body) in hooks {
                fs::write(build.join("hooks").join(hook), format!("#!/bin/sh\n{}\n", body)).unwrap();
            }
            ArchiveBuilder::new(&build).build(&self.temp.path().join("out")).unwrap()
        }

        fn marker(&self, name: &str) -> PathBuf {
            self.temp.path().join(name)
        }
    }

    #[test]
    fn test_apply_unpacks_and_reports_manifest() {
        let fixture = Fixture::new();
        let mut meta = Metadata::new("app", Version::parse("1.0").unwrap());
        let mut conf = FileSpec::new("etc/app.conf");
        conf.config = true;
        conf.mode = Some(0o600);
        meta.files = vec![conf];

        let post = format!("touch {}", fixture.marker("post").display());
        let archive = fixture.archive(
            &meta,
            &[("usr/bin/app", "binary"), ("etc/app.conf", "x=1\n")],
            &[("postinstall", post.as_str()), ("preremove", "exit 0")],
        );

        let manifest = HostUnpacker::new(fixture.session.clone())
            .apply(&archive, &UnpackOptions::default())
            .unwrap();

        let root = &fixture.session.root;
        assert_eq!(fs::read_to_string(root.join("usr/bin/app")).unwrap(), "binary");
        assert!(fixture.marker("post").exists());

        let conf = manifest.files.iter().find(|f| f.path == "/etc/app.conf").unwrap();
        assert!(conf.config);
        assert_eq!(conf.mode, 0o600);
        assert_eq!(conf.sha256, file_sha256(&root.join("etc/app.conf")).unwrap());
        let mode = fs::metadata(root.join("etc/app.conf")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let cache = fixture.session.metadata_dir("app");
        assert!(cache.join("preremove").is_file());
        assert!(!cache.join("postinstall").exists());
        assert!(cache.join(METADATA_ENTRY).is_file());
    }

    #[test]
    fn test_failing_preinstall_is_fatal_unless_forced() {
        let mut fixture = Fixture::new();
        let meta = Metadata::new("app", Version::parse("1.0").unwrap());
        let archive = fixture.archive(&meta, &[("usr/bin/app", "binary")], &[("preinstall", "exit 1")]);

        let err = HostUnpacker::new(fixture.session.clone())
            .apply(&archive, &UnpackOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::ExternalFailure { .. }));
        assert!(!fixture.session.root.join("usr/bin/app").exists());

        fixture.session.force = true;
        HostUnpacker::new(fixture.session.clone())
            .apply(&archive, &UnpackOptions::default())
            .unwrap();
        assert!(fixture.session.root.join("usr/bin/app").exists());
    }

    #[test]
    fn test_shared_externals_are_skipped() {
        let fixture = Fixture::new();
        let log = fixture.marker("externals.log");
        let script = fixture.session.externals_dir().join("users");
        fs::write(&script, format!("#!/bin/sh\necho \"$1 $2\" >> {}\n", log.display())).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut meta = Metadata::new("app", Version::parse("1.0").unwrap());
        let external = External {
            name: "users".to_string(),
            data: None,
        };
        meta.externals = vec![external.clone()];
        let archive = fixture.archive(&meta, &[("usr/bin/app", "binary")], &[]);
        let unpacker = HostUnpacker::new(fixture.session.clone());

        unpacker.apply(&archive, &UnpackOptions::default()).unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap(), "app-1.0.hpkg install\n");

        let options = UnpackOptions {
            externals_to_skip: vec![external],
            upgrading: true,
            ..UnpackOptions::default()
        };
        unpacker.apply(&archive, &options).unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap(), "app-1.0.hpkg install\n");
    }

    fn archive_with_link(fixture: &Fixture, name: &str, link: &str, target: &Path) -> PathBuf {
        let meta = Metadata::new(name, Version::parse("1.0").unwrap());
        let build = fixture.temp.path().join(format!("build-{}", name));
        build_dir(&build, &meta, &[]);
        let link = build.join("root").join(link);
        fs::create_dir_all(link.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink(target, &link).unwrap();
        ArchiveBuilder::new(&build).build(&fixture.temp.path().join("out")).unwrap()
    }

    #[test]
    fn test_files_under_link_leaving_root_are_refused() {
        let fixture = Fixture::new();
        let outside = fixture.marker("outside");
        fs::create_dir_all(&outside).unwrap();
        let unpacker = HostUnpacker::new(fixture.session.clone());

        let link = archive_with_link(&fixture, "links", "opt/data", &outside);
        unpacker.apply(&link, &UnpackOptions::default()).unwrap();
        assert!(fs::symlink_metadata(fixture.session.root.join("opt/data")).unwrap().file_type().is_symlink());

        let meta = Metadata::new("writer", Version::parse("1.0").unwrap());
        let writer = fixture.archive(&meta, &[("opt/data/x", "payload")], &[]);
        let err = unpacker.apply(&writer, &UnpackOptions::default()).unwrap_err();
        assert!(matches!(err, Error::ParseError(_)), "got {}", err);
        assert!(!outside.join("x").exists());
    }

    #[test]
    fn test_files_under_link_inside_root_are_written() {
        let fixture = Fixture::new();
        let unpacker = HostUnpacker::new(fixture.session.clone());

        let meta = Metadata::new("release", Version::parse("1.0").unwrap());
        let release = fixture.archive(&meta, &[("opt/releases/1/bin", "bin")], &[]);
        unpacker.apply(&release, &UnpackOptions::default()).unwrap();
        let link = archive_with_link(&fixture, "current", "opt/current", Path::new("releases/1"));
        unpacker.apply(&link, &UnpackOptions::default()).unwrap();

        let meta = Metadata::new("extra", Version::parse("1.0").unwrap());
        let extra = fixture.archive(&meta, &[("opt/current/extra", "extra")], &[]);
        unpacker.apply(&extra, &UnpackOptions::default()).unwrap();
        assert_eq!(
            fs::read_to_string(fixture.session.root.join("opt/releases/1/extra")).unwrap(),
            "extra"
        );
    }

    #[test]
    fn test_unknown_owner_warns_when_unprivileged() {
        let fixture = Fixture::new();
        let mut meta = Metadata::new("app", Version::parse("1.0").unwrap());
        let mut spec = FileSpec::new("usr/bin/app");
        spec.owner = Some("no-such-user-hostpkg".to_string());
        meta.files = vec![spec];
        let archive = fixture.archive(&meta, &[("usr/bin/app", "binary")], &[]);

        HostUnpacker::new(fixture.session.clone())
            .apply(&archive, &UnpackOptions::default())
            .unwrap();

        let mut privileged = fixture.session.clone();
        privileged.privileged = true;
        let err = HostUnpacker::new(privileged)
            .apply(&archive, &UnpackOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn test_safe_relative() {
        assert_eq!(safe_relative(Path::new("./usr/bin/x")).unwrap(), PathBuf::from("usr/bin/x"));
        assert!(safe_relative(Path::new("../etc/passwd")).is_err());
        assert!(safe_relative(Path::new("/etc/passwd")).is_err());
        assert!(safe_relative(Path::new("usr/../../x")).is_err());
    }
}
