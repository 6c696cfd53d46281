//! Extension administration CLI.
//!
//! # Responsibility
//! - Inspect installed chan and library extensions and their trust state.
//! - Persist trust and chan order decisions for the host application.
//!
//! Capability constructors are linked by the host application, so this tool
//! runs with an empty constructor table: trusted chans are reported but never
//! become available here.

use chanhost_core::{
    describe_error, init_logging, ConstructorTable, DirectoryPackageIndex, ExtensionManager,
    ManagerConfig, ManagerServices, SqliteExtensionStore, TrustState,
};
use clap::{Parser, Subcommand};
use log::info;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Manage chan extensions of a chanhost installation.
#[derive(Parser, Debug)]
#[command(name = "chanhost")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Manager configuration file (JSON).
    #[arg(short, long, default_value = "chanhost.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every enumerated extension.
    List,
    /// Trust an untrusted extension.
    Trust {
        name: String,
    },
    /// Discard an untrusted extension for this run.
    Discard {
        name: String,
    },
    /// Set the chan order; unavailable names are dropped.
    Order {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Show which chan claims a host.
    Owner {
        host: String,
    },
    /// Show archive mirrors per chan.
    Archives,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", describe_error(err.as_ref()));
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = ManagerConfig::from_json_file(&args.config)?;
    if let Some(log_dir) = &config.log_dir {
        init_logging(&config.log_level, &log_dir.to_string_lossy())?;
    }

    let store = Arc::new(SqliteExtensionStore::open(&config.database_path)?);
    let services = ManagerServices::new(
        Arc::new(DirectoryPackageIndex::new(&config.packages_dir)),
        Arc::new(ConstructorTable::new()),
        store,
    )
    .with_host_signatures(config.host_signatures.iter().cloned());
    let manager = ExtensionManager::new(services)?;
    info!(
        "event=cli_command module=cli status=start command={:?}",
        args.command
    );

    match args.command {
        Command::List => print_extensions(&manager),
        Command::Trust { name } => {
            manager.set_extension_trust(&name, true)?;
            print_trust(&manager, &name);
        }
        Command::Discard { name } => {
            manager.set_extension_trust(&name, false)?;
            print_trust(&manager, &name);
        }
        Command::Order { names } => {
            let ordered = manager.set_order(&names)?;
            println!("{}", ordered.join(" "));
        }
        Command::Owner { host } => match manager.host_owner(&host) {
            Some(owner) => println!("{owner}"),
            None => println!("no chan claims {host}"),
        },
        Command::Archives => {
            for (owner, mirrors) in manager.archive_map() {
                println!("{owner}: {}", mirrors.join(", "));
            }
        }
    }
    Ok(())
}

fn print_extensions(manager: &ExtensionManager) {
    let available = manager.available_chan_names();
    for info in manager.extensions() {
        let descriptor = &info.descriptor;
        let status = if available.contains(&descriptor.name) {
            "available"
        } else if !descriptor.supported {
            "unsupported"
        } else if info.trust == TrustState::Trusted && descriptor.is_chan() {
            "unavailable"
        } else {
            "-"
        };
        println!(
            "{:<16} {:<8} {:<10} {:<12} {}",
            descriptor.name,
            descriptor.kind.as_str(),
            info.trust.as_str(),
            status,
            descriptor.package_name()
        );
    }
}

fn print_trust(manager: &ExtensionManager, name: &str) {
    match manager.trust_state(name) {
        Some(trust) => println!("{name}: {}", trust.as_str()),
        None => println!("{name}: unknown extension"),
    }
}
