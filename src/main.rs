// src/main.rs

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use hostpkg::db::Database;
use hostpkg::db::models::{Repository, RepositoryPackage};
use hostpkg::native;
use hostpkg::packages::archive::{ArchiveBuilder, Compression, HpkgReader};
use hostpkg::packages::traits::{AssumeYes, Confirm, Reporter};
use hostpkg::packages::unpack::HostUnpacker;
use hostpkg::repository::{self, HttpReporter, INDEX_FILE, RepositoryClient};
use hostpkg::session::{DEFAULT_BASE, Session};
use hostpkg::transaction::{Collaborators, Outcome, TerminalPrompter, TransactionEngine};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "hostpkg")]
#[command(author, version, about = "Host-level package manager with dependency resolution and locked transactions", long_about = None)]
struct Cli {
    /// Install root packages are unpacked under
    #[arg(long, global = true, env = "HOSTPKG_ROOT", default_value = "/")]
    root: PathBuf,

    /// State directory (database, lock, archived packages)
    #[arg(long, global = true, env = "HOSTPKG_BASE", default_value = DEFAULT_BASE)]
    base: PathBuf,

    /// Proceed without asking for confirmation
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    /// Treat pre-hook failures and file conflicts as warnings
    #[arg(short, long, global = true)]
    force: bool,

    /// Remove an existing repository lock unconditionally
    #[arg(long, global = true)]
    force_lock: bool,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    /// Endpoint receiving the manifest of every installed package
    #[arg(long, global = true)]
    report_url: Option<String>,

    /// Passphrase for encrypted payloads
    #[arg(long, global = true, env = "HOSTPKG_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the state directory and database
    Init,
    /// Install packages: name, name=version, name=version=packageVersion, archive path or URL
    Install {
        #[arg(required = true)]
        requests: Vec<String>,
    },
    /// Upgrade packages (all installed packages if none given)
    Upgrade {
        requests: Vec<String>,
        /// Allow moving to older versions
        #[arg(long)]
        downgrade: bool,
    },
    /// Remove installed packages
    Remove {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        requests: Vec<String>,
        /// Remove every installed package
        #[arg(short, long)]
        all: bool,
    },
    /// Query installed packages
    Query {
        /// Package name pattern (optional, shows all if omitted)
        pattern: Option<String>,
    },
    /// Show change history, or one change in detail
    History {
        /// Change id
        id: Option<i64>,
    },
    /// Build an archive from a package directory (metadata.json, root/, hooks/)
    Build {
        dir: PathBuf,
        /// Directory the archive is written to
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        #[arg(short, long, value_enum, default_value_t = PayloadCompression::Gzip)]
        compression: PayloadCompression,
    },
    /// Write the source index of a directory of archives
    Index {
        dir: PathBuf,
        /// Source name recorded in the index
        #[arg(short, long, default_value = "local")]
        name: String,
    },
    /// Add a new repository
    RepoAdd {
        name: String,
        /// URL or local directory
        url: String,
        /// Priority (higher = preferred)
        #[arg(short, long, default_value_t = 0)]
        priority: i32,
        /// Disable repository after adding
        #[arg(long)]
        disabled: bool,
    },
    /// List repositories
    RepoList {
        /// Show all repositories (including disabled)
        #[arg(short, long)]
        all: bool,
    },
    /// Remove a repository
    RepoRemove { name: String },
    /// Enable a repository
    RepoEnable { name: String },
    /// Disable a repository
    RepoDisable { name: String },
    /// Synchronize repository metadata
    RepoSync {
        /// Repository name (syncs all if omitted)
        name: Option<String>,
        /// Sync even if metadata hasn't expired
        #[arg(long)]
        refresh: bool,
    },
    /// Search for packages in repositories
    Search { pattern: String },
    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PayloadCompression {
    Gzip,
    Zstd,
    Xz,
}

impl From<PayloadCompression> for Compression {
    fn from(value: PayloadCompression) -> Self {
        match value {
            PayloadCompression::Gzip => Compression::Gzip,
            PayloadCompression::Zstd => Compression::Zstd,
            PayloadCompression::Xz => Compression::Xz,
        }
    }
}

impl Cli {
    fn session(&self) -> Session {
        let mut session = Session::new(&self.root, &self.base);
        session.force = self.force;
        session.force_lock = self.force_lock;
        session.assume_yes = self.yes;
        session.debug = self.debug;
        session.passphrase = self.passphrase.clone();
        session.report_url = self.report_url.clone();
        session
    }
}

fn open_database(session: &Session) -> Result<Database> {
    session.ensure_dirs()?;
    let db_path = session.db_path();
    Database::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))
}

enum Operation<'r> {
    Install(&'r [String]),
    Upgrade(Option<&'r [String]>, bool),
    Remove(Option<&'r [String]>),
}

/// Wire the collaborators for one transaction and run it
fn run_transaction(session: &Session, operation: Operation<'_>) -> Result<Outcome> {
    let db = open_database(session)?;
    let client = RepositoryClient::new(session.downloads_dir())?.with_index_checksums(db.conn())?;
    let reporter = session
        .report_url
        .as_deref()
        .map(HttpReporter::new)
        .transpose()?;
    let native = native::for_host(&session.host);
    let unpacker = HostUnpacker::new(session.clone());
    let confirm: &dyn Confirm = if session.assume_yes {
        &AssumeYes
    } else {
        &TerminalPrompter
    };

    let parts = Collaborators {
        store: &db,
        index: &db,
        reader: &HpkgReader,
        unpacker: &unpacker,
        native: native.as_ref(),
        fetcher: &client,
        reporter: reporter.as_ref().map(|r| r as &dyn Reporter),
        confirm,
    };
    let engine = TransactionEngine::new(session, parts);

    let outcome = match operation {
        Operation::Install(requests) => engine.install(requests)?,
        Operation::Upgrade(requests, downgrade) => engine.upgrade(requests, downgrade)?,
        Operation::Remove(requests) => engine.remove(requests)?,
    };
    Ok(outcome)
}

fn print_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Applied(summary) => {
            for label in &summary.removed {
                println!("Removed {}", label);
            }
            for label in &summary.installed {
                println!("Installed {}", label);
            }
        }
        Outcome::NothingToDo => println!("Nothing to do."),
        Outcome::Aborted => println!("Aborted."),
    }
}

fn optional(requests: &[String]) -> Option<&[String]> {
    if requests.is_empty() { None } else { Some(requests) }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let session = cli.session();

    match &cli.command {
        Some(Commands::Init) => {
            info!("Initializing hostpkg state at: {}", session.base.display());
            open_database(&session)?;
            println!("Initialized hostpkg state at: {}", session.base.display());
            Ok(())
        }
        Some(Commands::Install { requests }) => {
            print_outcome(&run_transaction(&session, Operation::Install(requests))?);
            Ok(())
        }
        Some(Commands::Upgrade { requests, downgrade }) => {
            let operation = Operation::Upgrade(optional(requests), *downgrade);
            print_outcome(&run_transaction(&session, operation)?);
            Ok(())
        }
        Some(Commands::Remove { requests, all }) => {
            let requests = if *all { None } else { Some(requests.as_slice()) };
            print_outcome(&run_transaction(&session, Operation::Remove(requests))?);
            Ok(())
        }
        Some(Commands::Query { pattern }) => {
            let db = open_database(&session)?;
            let packages: Vec<_> = db
                .installed_packages()?
                .into_iter()
                .filter(|package| {
                    pattern
                        .as_deref()
                        .is_none_or(|pattern| package.name.contains(pattern))
                })
                .collect();

            if packages.is_empty() {
                println!("No packages found.");
            } else {
                println!("Installed packages:");
                for package in &packages {
                    print!("  {} {}", package.name, package.version);
                    if let Some(package_version) = &package.package_version {
                        print!("-{}", package_version);
                    }
                    if let Some(description) = &package.description {
                        print!(" - {}", description);
                    }
                    println!();
                }
                println!("\nTotal: {} package(s)", packages.len());
            }
            Ok(())
        }
        Some(Commands::History { id: Some(id) }) => {
            let db = open_database(&session)?;
            let Some(changeset) = db.changeset(*id)? else {
                anyhow::bail!("Change not found: {}", id);
            };
            println!("Change {}:", id);
            println!("  Description: {}", changeset.description);
            println!("  Status: {}", changeset.status.as_str());
            println!("  Created: {}", changeset.created_at.as_deref().unwrap_or("unknown"));
            println!("  Applied: {}", changeset.applied_at.as_deref().unwrap_or("not applied"));
            Ok(())
        }
        Some(Commands::History { id: None }) => {
            let db = open_database(&session)?;
            let changesets = db.history()?;

            if changesets.is_empty() {
                println!("No change history.");
            } else {
                println!("Change history:");
                for changeset in &changesets {
                    let timestamp = changeset
                        .applied_at
                        .as_deref()
                        .or(changeset.created_at.as_deref())
                        .unwrap_or("pending");
                    println!(
                        "  [{}] {} - {} ({})",
                        changeset.id.unwrap_or_default(),
                        timestamp,
                        changeset.description,
                        changeset.status.as_str()
                    );
                }
                println!("\nTotal: {} change(s)", changesets.len());
            }
            Ok(())
        }
        Some(Commands::Build { dir, output, compression }) => {
            let path = ArchiveBuilder::new(dir)
                .with_compression((*compression).into())
                .build(output)?;
            println!("Built {}", path.display());
            Ok(())
        }
        Some(Commands::Index { dir, name }) => {
            let index = repository::index_directory(dir, name)?;
            let path = dir.join(INDEX_FILE);
            fs::write(&path, serde_json::to_vec_pretty(&index)?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Indexed {} package(s) into {}", index.packages.len(), path.display());
            Ok(())
        }
        Some(Commands::RepoAdd { name, url, priority, disabled }) => {
            let db = open_database(&session)?;
            let repo = repository::add_repository(
                db.conn(),
                name.clone(),
                url.clone(),
                !*disabled,
                *priority,
            )?;
            println!("Added repository: {} ({})", repo.name, repo.url);
            Ok(())
        }
        Some(Commands::RepoList { all }) => {
            let db = open_database(&session)?;
            let repos = if *all {
                Repository::list_all(db.conn())?
            } else {
                Repository::list_enabled(db.conn())?
            };

            if repos.is_empty() {
                println!("No repositories configured.");
            } else {
                println!("Repositories:");
                for repo in &repos {
                    let state = if repo.enabled { "enabled" } else { "disabled" };
                    let packages = match repo.id {
                        Some(id) => RepositoryPackage::find_by_repository(db.conn(), id)?.len(),
                        None => 0,
                    };
                    println!(
                        "  {} {} [{}, priority {}] {} package(s), last sync: {}",
                        repo.name,
                        repo.url,
                        state,
                        repo.priority,
                        packages,
                        repo.last_sync.as_deref().unwrap_or("never")
                    );
                }
            }
            Ok(())
        }
        Some(Commands::RepoRemove { name }) => {
            let db = open_database(&session)?;
            repository::remove_repository(db.conn(), name)?;
            println!("Removed repository: {}", name);
            Ok(())
        }
        Some(Commands::RepoEnable { name }) => {
            let db = open_database(&session)?;
            repository::set_repository_enabled(db.conn(), name, true)?;
            println!("Enabled repository: {}", name);
            Ok(())
        }
        Some(Commands::RepoDisable { name }) => {
            let db = open_database(&session)?;
            repository::set_repository_enabled(db.conn(), name, false)?;
            println!("Disabled repository: {}", name);
            Ok(())
        }
        Some(Commands::RepoSync { name, refresh }) => {
            let db = open_database(&session)?;
            let client = RepositoryClient::new(session.downloads_dir())?;
            let repos = match name {
                Some(name) => match Repository::find_by_name(db.conn(), name)? {
                    Some(repo) => vec![repo],
                    None => anyhow::bail!("Repository not found: {}", name),
                },
                None => Repository::list_enabled(db.conn())?,
            };

            for mut repo in repos {
                if !*refresh && !repository::needs_sync(&repo) {
                    println!("{} is up to date", repo.name);
                    continue;
                }
                let count = repository::sync_repository(db.conn(), &client, &mut repo)?;
                println!("Synchronized {}: {} package(s)", repo.name, count);
            }
            Ok(())
        }
        Some(Commands::Search { pattern }) => {
            let db = open_database(&session)?;
            let packages = repository::search_packages(db.conn(), pattern)?;

            if packages.is_empty() {
                println!("No packages found.");
            } else {
                for package in &packages {
                    print!("  {} {}", package.name, package.version);
                    if let Some(package_version) = &package.package_version {
                        print!("-{}", package_version);
                    }
                    if let Some(description) = &package.description {
                        print!(" - {}", description);
                    }
                    println!();
                }
                println!("\nTotal: {} package(s)", packages.len());
            }
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(*shell, &mut Cli::command(), "hostpkg", &mut io::stdout());
            Ok(())
        }
        None => {
            println!("hostpkg v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'hostpkg --help' for usage information");
            Ok(())
        }
    }
}
