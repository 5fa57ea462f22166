// src/services.rs

//! Init script and crontab wiring
//!
//! Files a package declares as init scripts are linked into `etc/init.d`,
//! crontabs into `etc/cron.d`, both under the install root.

use crate::error::Result;
use crate::packages::metadata::{FileSpec, Metadata};
use crate::scripts;
use crate::session::Session;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

const INIT_DIR: &str = "etc/init.d";
const CRON_DIR: &str = "etc/cron.d";

fn link_path(session: &Session, dir: &str, file: &FileSpec) -> Option<PathBuf> {
    Path::new(&file.path)
        .file_name()
        .map(|name| session.root_path(dir).join(name))
}

fn links(session: &Session, metadata: &Metadata) -> Vec<(PathBuf, PathBuf)> {
    let inits = metadata.init_scripts().map(|(file, _)| (INIT_DIR, file));
    let crons = metadata.crontabs().map(|file| (CRON_DIR, file));

    inits
        .chain(crons)
        .filter_map(|(dir, file)| {
            link_path(session, dir, file).map(|link| (link, session.root_path(&file.path)))
        })
        .collect()
}

/// Link a package's init scripts and crontabs into place
pub fn wire(session: &Session, metadata: &Metadata) -> Result<()> {
    for (link, target) in links(session, metadata) {
        if link == target {
            continue;
        }
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::symlink_metadata(&link).is_ok() {
            warn!("Replacing existing {}", link.display());
            fs::remove_file(&link)?;
        }
        debug!("Linking {} -> {}", link.display(), target.display());
        symlink(&target, &link)?;
    }
    Ok(())
}

/// Remove the links created by [`wire`]
pub fn unwire(session: &Session, metadata: &Metadata) -> Result<()> {
    for (link, target) in links(session, metadata) {
        if link == target {
            continue;
        }
        match fs::symlink_metadata(&link) {
            Ok(meta) if meta.file_type().is_symlink() => {
                debug!("Unlinking {}", link.display());
                fs::remove_file(&link)?;
            }
            Ok(_) => warn!("{} is not a link, leaving it in place", link.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Stop the services of `packages`, highest start priority first
pub fn stop_services(session: &Session, packages: &[&Metadata]) {
    let mut services: Vec<(u32, PathBuf)> = packages
        .iter()
        .flat_map(|metadata| {
            metadata.init_scripts().map(|(file, start)| {
                let script = link_path(session, INIT_DIR, file)
                    .filter(|link| link.exists())
                    .unwrap_or_else(|| session.root_path(&file.path));
                (start, script)
            })
        })
        .collect();
    services.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    for (_, script) in services {
        if !script.exists() {
            warn!("Init script {} is missing, not stopping it", script.display());
            continue;
        }
        if let Err(e) = scripts::run(Command::new(&script).arg("stop")) {
            warn!("Failed to stop {}: {}", script.display(), e);
        }
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    fs::copy(target, link)?;
    Ok(())
}
