#[cfg(feature = "cli")]
mod cli {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use anyhow::Context;
    use clap::{Parser, Subcommand};
    use conversation_ledger::{
        config::Config, memory_db::parse_filter_timestamp, run_server, telemetry, MemoryDatabase, SharedState,
    };
    use tracing::{info, warn};

    #[derive(Parser)]
    #[command(name = "conversation-ledger", version, about = "Conversation ledger service")]
    struct Cli {
        #[command(subcommand)]
        command: Option<Command>,
    }

    #[derive(Subcommand)]
    enum Command {
        /// Run the HTTP API (default)
        Serve,
        /// Thread untagged buffer messages of a user into topics
        Scan { user_id: String },
        /// Run one memory consolidation pass
        Dedup,
        /// Delete buffer messages created within an inclusive time range
        Purge {
            user_id: String,
            #[arg(long)]
            from: String,
            #[arg(long)]
            to: String,
        },
        /// ANALYZE and integrity check
        Maintenance,
    }

    /// Flag flipped by Ctrl-C; long runs stop at their next unit boundary.
    fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current unit");
                flag.store(true, Ordering::SeqCst);
            }
        });
        cancel
    }

    fn open_state(cfg: Config) -> anyhow::Result<SharedState> {
        let db = Arc::new(MemoryDatabase::new(&cfg.db_path)?);
        Ok(SharedState::new(cfg, db)?)
    }

    pub async fn run() -> anyhow::Result<()> {
        dotenvy::dotenv().ok();
        let cli = Cli::parse();
        let cfg = Config::from_env()?;
        telemetry::init_tracing(&cfg.log_level);

        match cli.command.unwrap_or(Command::Serve) {
            Command::Serve => run_server(cfg).await,
            Command::Scan { user_id } => {
                let state = open_state(cfg)?;
                let cancel = cancel_on_ctrl_c();
                let report = state.scan_topics(&user_id, &cancel).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
            Command::Dedup => {
                let state = open_state(cfg)?;
                let cancel = cancel_on_ctrl_c();
                let report = state.run_dedup(&cancel).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
            Command::Purge { user_id, from, to } => {
                let from = parse_filter_timestamp("from", &from)?;
                let to = parse_filter_timestamp("to", &to)?;
                let state = open_state(cfg)?;
                let deleted = state
                    .purge_messages(&user_id, &from, &to)
                    .with_context(|| format!("purge for user {} failed", user_id))?;
                info!("Deleted {} messages", deleted);
                Ok(())
            }
            Command::Maintenance => {
                open_state(cfg)?.run_maintenance()?;
                info!("Maintenance complete");
                Ok(())
            }
        }
    }
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
