use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "fsk")]
#[command(about = "Fiscal compliance operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands (postgres store)
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> site -> local ...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Audit trail utilities
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },

    /// Data export (DEP) utilities
    Dep {
        #[command(subcommand)]
        cmd: DepCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations. Guardrail: refuses while receipts are still
    /// queued for transmission unless --yes is provided.
    Migrate {
        /// Acknowledge migrating a DB that holds untransmitted receipts.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Verify the hash chain of an audit JSONL file. Exits non-zero if broken.
    Verify {
        #[arg(long)]
        path: PathBuf,
    },

    /// Print the audit trail of one order, oldest first.
    Show {
        #[arg(long)]
        path: PathBuf,

        #[arg(long)]
        order_id: String,
    },
}

#[derive(Subcommand)]
enum DepCmd {
    /// Write a DEP archive from a file-store data directory, offline.
    ///
    /// Read-only against the data directory: nothing is appended to the
    /// audit log. Run while the daemon is stopped for a consistent snapshot.
    Export {
        /// Data directory of the file store (contains audit.jsonl)
        #[arg(long)]
        data_dir: PathBuf,

        /// Output directory for the archive
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = fsk_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = fsk_db::status(&pool).await?;
                    println!(
                        "db_ok={} has_queue_table={} queue_depth={}",
                        s.ok,
                        s.has_queue_table,
                        s.queue_depth
                            .map(|n| n.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
                DbCmd::Migrate { yes } => {
                    let s = fsk_db::status(&pool).await?;
                    let queued = s.queue_depth.unwrap_or(0);
                    if queued > 0 && !yes {
                        anyhow::bail!(
                            "REFUSING MIGRATE: {} receipt(s) still queued for transmission. Re-run with: `fsk db migrate --yes`",
                            queued
                        );
                    }
                    fsk_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = fsk_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Audit { cmd } => match cmd {
            AuditCmd::Verify { path } => commands::audit::verify(&path)?,
            AuditCmd::Show { path, order_id } => commands::audit::show(&path, &order_id)?,
        },

        Commands::Dep { cmd } => match cmd {
            DepCmd::Export { data_dir, out } => {
                let written = commands::dep::export_offline(&data_dir, &out).await?;
                println!("dep_export=true path={}", written.path.display());
                println!("entries={}", written.entry_count);
                println!("pending={}", written.pending_count);
            }
        },
    }

    Ok(())
}

/// Logs go to stderr so stdout stays machine-parseable.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();
}
