use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use shared::domain::ConnectionId;
use storage::{open_store, BackendConfig, BackendKind, DEFAULT_KEY_PREFIX};

/// Inspect and maintain connection state held by a session store.
#[derive(Parser, Debug)]
struct Cli {
    /// `memory` only lives as long as this process; useful for smoke tests.
    #[arg(long, default_value = "redis")]
    backend: BackendKind,
    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    redis_url: String,
    #[arg(long, default_value = DEFAULT_KEY_PREFIX)]
    key_prefix: String,
    /// Connection TTL in seconds applied to anything written.
    #[arg(long, default_value_t = 3600)]
    ttl: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    NewConnection,
    Renew {
        connection_id: String,
        modules: Vec<String>,
    },
    Show {
        connection_id: String,
        module: String,
    },
    Info {
        connection_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = open_store(&BackendConfig {
        kind: cli.backend,
        connection_ttl: Duration::from_secs(cli.ttl),
        check_expired_interval: None,
        redis_url: cli.redis_url,
        key_prefix: cli.key_prefix,
    })
    .await?;

    match cli.command {
        Command::NewConnection => {
            let id = store.new_connection().await?;
            println!("created connection_id={id}");
        }
        Command::Renew {
            connection_id,
            modules,
        } => {
            let id = ConnectionId::from(connection_id);
            store.renew_connection(&id, &modules).await?;
            println!("renewed {id} for {}s ({} modules)", cli.ttl, modules.len());
        }
        Command::Show {
            connection_id,
            module,
        } => {
            let id = ConnectionId::from(connection_id);
            let state: Value = store.get_state(&id, &module, &|| json!({})).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Command::Info { connection_id } => {
            let info = store
                .connection_info(&ConnectionId::from(connection_id))
                .await?;
            println!("connection_id={} created_at={}", info.id, info.created_at.to_rfc3339());
        }
    }

    Ok(())
}
