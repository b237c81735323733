use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use fleet_resources::Driver;
use navigator_live::{
    CHAT_EVENTS_TOPIC, LiveConfig, LiveSession, LiveUpdate, ORDER_UPDATES_TOPIC, OverrideStore,
    TracingNotificationSink,
};
use tracing::{debug, info};

const DEFAULT_OVERRIDES_PATH: &str = "navigator-overrides.json";

#[derive(Parser, Debug)]
#[command(name = "navigator-listener", about = "Live order and chat updates for a driver")]
struct Args {
    /// Device override store (JSON object of string keys to string values).
    #[arg(long, global = true, default_value = DEFAULT_OVERRIDES_PATH)]
    overrides: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a driver's channel and log orders until Ctrl-C.
    Listen {
        #[arg(long)]
        driver_id: String,
        /// Chat channel ids to watch as well.
        #[arg(long = "chat")]
        chats: Vec<String>,
    },
    /// Inspect or edit the device override store.
    Overrides {
        #[command(subcommand)]
        action: OverridesAction,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum OverridesAction {
    Show,
    Set { key: String, value: String },
    Clear { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut overrides = OverrideStore::load(&args.overrides)
        .with_context(|| format!("load overrides {}", args.overrides.display()))?;

    match args.command {
        Command::Listen { driver_id, chats } => listen(&overrides, driver_id, chats).await,
        Command::Overrides { action } => edit_overrides(&mut overrides, action),
    }
}

async fn listen(overrides: &OverrideStore, driver_id: String, chats: Vec<String>) -> Result<()> {
    let config = LiveConfig::from_env(overrides).context("resolve live configuration")?;
    let session = LiveSession::connect(config, Arc::new(TracingNotificationSink))
        .context("start live session")?;

    let _orders = session
        .registry()
        .subscribe(ORDER_UPDATES_TOPIC, |update: &LiveUpdate| {
            if let LiveUpdate::Order { event, order } = update {
                info!(
                    event = event.as_str(),
                    order_id = order.id.as_str(),
                    status = order.status.as_deref().unwrap_or_default(),
                    "order update"
                );
                debug!(order_id = order.id.as_str(), payload = %order.to_json(), "order payload");
            }
        });
    let _chats = session
        .registry()
        .subscribe(CHAT_EVENTS_TOPIC, |update: &LiveUpdate| {
            if let LiveUpdate::Chat(event) = update {
                info!(event = %event.kind, channel = event.channel.as_str(), "chat update");
            }
        });

    let channel = session
        .watch_driver(Driver::new(driver_id))
        .await
        .context("watch driver channel")?;
    info!(channel = channel.as_str(), "listening for orders");
    for chat in chats {
        let channel = session
            .watch_chat(&chat)
            .await
            .with_context(|| format!("watch chat {chat}"))?;
        info!(channel = channel.as_str(), "listening for chat");
    }

    tokio::signal::ctrl_c()
        .await
        .context("wait for ctrl-c")?;

    for outcome in session.shutdown().await {
        info!(
            channel = outcome.channel.as_str(),
            delivered = outcome.delivered,
            failed = outcome.failed,
            "listener stopped"
        );
    }
    Ok(())
}

fn edit_overrides(overrides: &mut OverrideStore, action: OverridesAction) -> Result<()> {
    match action {
        OverridesAction::Show => {
            let entries: serde_json::Map<String, serde_json::Value> = overrides
                .entries()
                .map(|(key, value)| (key.to_string(), serde_json::Value::from(value)))
                .collect();
            let rendered = serde_json::to_string_pretty(&entries)?;
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{rendered}").context("write overrides")?;
            return Ok(());
        }
        OverridesAction::Set { key, value } => {
            if key.trim().is_empty() {
                return Err(anyhow!("override key must not be empty"));
            }
            overrides.set(key.as_str(), value);
            info!(key = key.as_str(), "override set");
        }
        OverridesAction::Clear { key } => {
            if overrides.remove(&key).is_none() {
                info!(key = key.as_str(), "override was not set");
                return Ok(());
            }
            info!(key = key.as_str(), "override cleared");
        }
    }
    overrides.save().context("save overrides")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_accepts_repeated_chat_flags() -> Result<()> {
        let args = Args::try_parse_from([
            "navigator-listener",
            "listen",
            "--driver-id",
            "drv_1",
            "--chat",
            "c1",
            "--chat",
            "c2",
        ])?;
        assert_eq!(args.overrides, PathBuf::from(DEFAULT_OVERRIDES_PATH));
        match args.command {
            Command::Listen { driver_id, chats } => {
                assert_eq!(driver_id, "drv_1");
                assert_eq!(chats, vec!["c1".to_string(), "c2".to_string()]);
            }
            Command::Overrides { .. } => return Err(anyhow!("expected listen command")),
        }
        Ok(())
    }

    #[test]
    fn override_edits_persist_to_the_store() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("overrides.json");
        let mut store = OverrideStore::load(&path)?;

        edit_overrides(
            &mut store,
            OverridesAction::Set {
                key: "_SOCKET_HOST".to_string(),
                value: "socket.device.example".to_string(),
            },
        )?;
        assert_eq!(
            OverrideStore::load(&path)?.get("_SOCKET_HOST"),
            Some("socket.device.example")
        );

        edit_overrides(
            &mut store,
            OverridesAction::Clear {
                key: "_SOCKET_HOST".to_string(),
            },
        )?;
        assert!(OverrideStore::load(&path)?.is_empty());
        assert!(
            edit_overrides(
                &mut store,
                OverridesAction::Set {
                    key: " ".to_string(),
                    value: "x".to_string(),
                },
            )
            .is_err()
        );
        Ok(())
    }
}
