//! CLI entry point for statebridge-admin: unit provisioning, credential
//! issuing and key generation.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;

use statebridge::config::{load_config, Config};
use statebridge::credentials::{
    generate_master_secret, parse_ttl, CredentialIssuer, EnvSecretSource, SigningKeyStore,
};
use statebridge::deps::compute_unit_status;
use statebridge::handlers::validate_unit_id;
use statebridge::server::IssuedCredentials;
use statebridge::storage::backend::{StoreError, UnitStore};
use statebridge::storage::open_store;

#[derive(Parser)]
#[command(name = "statebridge-admin", about = "statebridge operator tool")]
struct Cli {
    /// Server configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage units
    Unit {
        #[command(subcommand)]
        command: UnitCommands,
    },
    /// Manage S3 credentials
    Creds {
        #[command(subcommand)]
        command: CredsCommands,
    },
    /// Print a fresh base64url master secret
    Keygen,
}

#[derive(Subcommand)]
enum UnitCommands {
    /// Provision an empty unit
    Create { unit_id: String },
    /// Show a unit's metadata and lock
    Show { unit_id: String },
    /// Report a unit's dependency status from the graph
    Status { unit_id: String },
}

#[derive(Subcommand)]
enum CredsCommands {
    /// Issue credentials without going through the HTTP endpoint
    Issue {
        #[arg(long)]
        subject: String,
        /// Bearer token the credentials are bound to
        #[arg(long)]
        session_token: String,
    },
}

fn load(path: Option<&PathBuf>) -> Result<Config, String> {
    match path {
        Some(p) => load_config(p).map_err(|e| format!("reading {}: {e}", p.display())),
        None => Ok(Config::default()),
    }
}

fn print_json(value: &impl serde::Serialize) -> i32 {
    match serde_json::to_string_pretty(value) {
        Ok(out) => {
            println!("{out}");
            0
        }
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Commands::Keygen = cli.command {
        println!("{}", generate_master_secret());
        return;
    }

    let config = match load(cli.config.as_ref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let rc = match cli.command {
        Commands::Unit { command } => run_unit(&config, command).await,
        Commands::Creds {
            command: CredsCommands::Issue {
                subject,
                session_token,
            },
        } => run_issue(&config, &subject, &session_token),
        Commands::Keygen => 0,
    };
    std::process::exit(rc);
}

async fn run_unit(config: &Config, command: UnitCommands) -> i32 {
    let store: Arc<dyn UnitStore> = match open_store(&config.storage).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error opening store: {e}");
            return 1;
        }
    };

    match command {
        UnitCommands::Create { unit_id } => {
            if let Err(reason) = validate_unit_id(&unit_id) {
                eprintln!("Error: invalid unit id: {reason}");
                return 1;
            }
            match store.create(&unit_id).await {
                Ok(_) => {
                    eprintln!("Created unit {unit_id}");
                    0
                }
                Err(StoreError::AlreadyExists) => {
                    eprintln!("Error: unit {unit_id} already exists");
                    1
                }
                Err(e) => {
                    eprintln!("Error creating unit: {e}");
                    1
                }
            }
        }
        UnitCommands::Show { unit_id } => match store.get(&unit_id).await {
            Ok(meta) => print_json(&json!({
                "unit_id": meta.id,
                "size": meta.size,
                "updated": meta.updated,
                "locked": meta.locked,
                "lock": meta.lock_info,
            })),
            Err(StoreError::NotFound) => {
                eprintln!("Error: unit {unit_id} not found");
                1
            }
            Err(e) => {
                eprintln!("Error reading unit: {e}");
                1
            }
        },
        UnitCommands::Status { unit_id } => {
            let status = compute_unit_status(store.as_ref(), &config.deps, &unit_id).await;
            print_json(&status)
        }
    }
}

fn run_issue(config: &Config, subject: &str, session_token: &str) -> i32 {
    let sts = &config.auth.sts;
    let keys = Arc::new(SigningKeyStore::load(
        &sts.active_kid,
        &sts.keys,
        Arc::new(EnvSecretSource::new(sts.env_prefix.clone())),
    ));
    let issuer = CredentialIssuer::new(keys, parse_ttl(&sts.ttl));
    match issuer.issue(subject, session_token) {
        Ok(credential) => print_json(&IssuedCredentials {
            version: 1,
            access_key_id: credential.access_key_id,
            secret_access_key: credential.secret_access_key,
            session_token: credential.session_token,
            expiration: credential
                .expires_at
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }),
        Err(e) => {
            eprintln!("Error issuing credentials: {e}");
            1
        }
    }
}
