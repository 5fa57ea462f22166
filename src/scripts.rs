// src/scripts.rs

//! Running package hooks, externals and other commands
//!
//! Pre-install and pre-remove hooks gate the operation: their failure is
//! fatal unless forced. Post hooks and externals only warn.

use crate::error::{Error, Result};
use crate::packages::metadata::External;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Which side of a package's lifecycle an external runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalOperation {
    Install,
    Remove,
}

impl fmt::Display for ExternalOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalOperation::Install => write!(f, "install"),
            ExternalOperation::Remove => write!(f, "remove"),
        }
    }
}

/// Run a command to completion, returning its stdout
pub fn run(command: &mut Command) -> Result<String> {
    let description = describe(command);
    debug!("Running {}", description);

    let output = command
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::ExternalFailure {
            command: description.clone(),
            status: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::ExternalFailure {
            command: description,
            status: format!("{} {}", output.status, stderr.trim()),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a hook script from its own directory
pub fn run_hook(script: &Path) -> Result<()> {
    let mut command = if is_executable(script) {
        Command::new(script)
    } else {
        warn!("Hook {} is not executable, running it with /bin/sh", script.display());
        let mut sh = Command::new("/bin/sh");
        sh.arg(script);
        sh
    };
    if let Some(dir) = script.parent() {
        command.current_dir(dir);
    }

    let description = describe(&command);
    debug!("Running hook {}", description);
    let status = command.status().map_err(|e| Error::ExternalFailure {
        command: description.clone(),
        status: e.to_string(),
    })?;

    if status.success() {
        Ok(())
    } else {
        Err(Error::ExternalFailure {
            command: description,
            status: status.to_string(),
        })
    }
}

/// Run a pre-install or pre-remove hook; failure aborts unless `force`
pub fn run_pre_hook(script: &Path, force: bool) -> Result<()> {
    match run_hook(script) {
        Err(e) if force => {
            warn!("{} (continuing, forced)", e);
            Ok(())
        }
        result => result,
    }
}

/// Run a post-install or post-remove hook; failure only warns
pub fn run_post_hook(script: &Path) {
    if let Err(e) = run_hook(script) {
        warn!("{}", e);
    }
}

/// Run an external as `<name> <package-filename> install|remove`, feeding
/// its data on stdin. Failures and missing scripts only warn.
pub fn run_external(
    externals_dir: &Path,
    external: &External,
    package_filename: &str,
    operation: ExternalOperation,
) {
    let script = externals_dir.join(&external.name);
    if !script.is_file() {
        warn!("External {} not found at {}", external.name, script.display());
        return;
    }

    if let Err(e) = feed_external(&script, external, package_filename, operation) {
        warn!("External {} failed for {}: {}", external.name, package_filename, e);
    }
}

fn feed_external(
    script: &Path,
    external: &External,
    package_filename: &str,
    operation: ExternalOperation,
) -> Result<()> {
    let mut command = Command::new(script);
    command
        .arg(package_filename)
        .arg(operation.to_string())
        .stdin(Stdio::piped());

    let description = describe(&command);
    debug!("Running external {}", description);
    let mut child = command.spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Some(data) = &external.data {
            stdin.write_all(data.as_bytes())?;
        }
    }

    let status = child.wait()?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::ExternalFailure {
            command: description,
            status: status.to_string(),
        })
    }
}

fn describe(command: &Command) -> String {
    let mut parts = vec![command.get_program().to_string_lossy().into_owned()];
    parts.extend(command.get_args().map(|arg| arg.to_string_lossy().into_owned()));
    parts.join(" ")
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
