// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn request_args(required: bool) -> Arg {
    Arg::new("requests")
        .num_args(1..)
        .required(required)
        .help("name, name=version, name=version=packageVersion, archive path or URL")
}

fn build_cli() -> Command {
    Command::new("hostpkg")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Hostpkg Contributors")
        .about("Host-level package manager with dependency resolution and locked transactions")
        .subcommand_required(false)
        .arg(
            Arg::new("root")
                .long("root")
                .global(true)
                .env("HOSTPKG_ROOT")
                .default_value("/")
                .help("Install root packages are unpacked under"),
        )
        .arg(
            Arg::new("base")
                .long("base")
                .global(true)
                .env("HOSTPKG_BASE")
                .default_value("/var/lib/hostpkg")
                .help("State directory (database, lock, archived packages)"),
        )
        .arg(
            Arg::new("yes")
                .short('y')
                .long("yes")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Proceed without asking for confirmation"),
        )
        .arg(
            Arg::new("force")
                .short('f')
                .long("force")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Treat pre-hook failures and file conflicts as warnings"),
        )
        .arg(
            Arg::new("force_lock")
                .long("force-lock")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Remove an existing repository lock unconditionally"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Verbose logging"),
        )
        .arg(
            Arg::new("report_url")
                .long("report-url")
                .global(true)
                .help("Endpoint receiving the manifest of every installed package"),
        )
        .arg(
            Arg::new("passphrase")
                .long("passphrase")
                .global(true)
                .env("HOSTPKG_PASSPHRASE")
                .hide_env_values(true)
                .help("Passphrase for encrypted payloads"),
        )
        .subcommand(Command::new("init").about("Initialize the state directory and database"))
        .subcommand(
            Command::new("install")
                .about("Install packages and their dependencies")
                .arg(request_args(true)),
        )
        .subcommand(
            Command::new("upgrade")
                .about("Upgrade packages (all installed packages if none given)")
                .arg(request_args(false))
                .arg(
                    Arg::new("downgrade")
                        .long("downgrade")
                        .action(ArgAction::SetTrue)
                        .help("Allow moving to older versions"),
                ),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove installed packages")
                .arg(request_args(false))
                .arg(
                    Arg::new("all")
                        .short('a')
                        .long("all")
                        .action(ArgAction::SetTrue)
                        .help("Remove every installed package"),
                ),
        )
        .subcommand(
            Command::new("query")
                .about("Query installed packages")
                .arg(Arg::new("pattern").help("Package name pattern (optional)")),
        )
        .subcommand(
            Command::new("history")
                .about("Show change history, or one change in detail")
                .arg(Arg::new("id").help("Change id")),
        )
        .subcommand(
            Command::new("build")
                .about("Build an archive from a package directory")
                .arg(Arg::new("dir").required(true).help("Package directory"))
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .default_value(".")
                        .help("Directory the archive is written to"),
                )
                .arg(
                    Arg::new("compression")
                        .short('c')
                        .long("compression")
                        .value_parser(["gzip", "zstd", "xz"])
                        .default_value("gzip")
                        .help("Payload compression"),
                ),
        )
        .subcommand(
            Command::new("index")
                .about("Write the source index of a directory of archives")
                .arg(Arg::new("dir").required(true).help("Directory of archives"))
                .arg(
                    Arg::new("name")
                        .short('n')
                        .long("name")
                        .default_value("local")
                        .help("Source name recorded in the index"),
                ),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
        .subcommand(
            Command::new("repo-add")
                .about("Add a new repository")
                .arg(Arg::new("name").required(true).help("Repository name"))
                .arg(Arg::new("url").required(true).help("URL or local directory"))
                .arg(
                    Arg::new("priority")
                        .short('p')
                        .long("priority")
                        .default_value("0")
                        .help("Priority (higher = preferred)"),
                )
                .arg(
                    Arg::new("disabled")
                        .long("disabled")
                        .action(ArgAction::SetTrue)
                        .help("Disable repository after adding"),
                ),
        )
        .subcommand(
            Command::new("repo-list")
                .about("List repositories")
                .arg(
                    Arg::new("all")
                        .short('a')
                        .long("all")
                        .action(ArgAction::SetTrue)
                        .help("Show all repositories (including disabled)"),
                ),
        )
        .subcommand(
            Command::new("repo-remove")
                .about("Remove a repository")
                .arg(Arg::new("name").required(true).help("Repository name")),
        )
        .subcommand(
            Command::new("repo-enable")
                .about("Enable a repository")
                .arg(Arg::new("name").required(true).help("Repository name")),
        )
        .subcommand(
            Command::new("repo-disable")
                .about("Disable a repository")
                .arg(Arg::new("name").required(true).help("Repository name")),
        )
        .subcommand(
            Command::new("repo-sync")
                .about("Synchronize repository metadata")
                .arg(Arg::new("name").help("Repository name (syncs all if omitted)"))
                .arg(
                    Arg::new("refresh")
                        .long("refresh")
                        .action(ArgAction::SetTrue)
                        .help("Sync even if metadata hasn't expired"),
                ),
        )
        .subcommand(
            Command::new("search")
                .about("Search for packages in repositories")
                .arg(Arg::new("pattern").required(true).help("Search pattern")),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("hostpkg.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
