use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use skillpulse_client::config::{default_url, validate_url, DEFAULT_HOST, DEFAULT_PORT};
use skillpulse_client::{ClientConfig, ClientEvent, EventClient};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "skillpulse-monitor")]
struct Args {
    #[arg(long, default_value = "")]
    url: String,
    #[arg(long, default_value = "")]
    host: String,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    heartbeat_interval: Option<u64>,
    #[arg(long, default_value_t = 60)]
    summary_interval: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug || env_true("SKILLPULSE_DEBUG"));
    let config = load_config(&args, |key| std::env::var(key).ok())?;
    let summary_every = Duration::from_secs(args.summary_interval.max(1));

    info!(
        event = "monitor_start",
        url = %config.url,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        summary_secs = summary_every.as_secs()
    );
    let client = EventClient::connect_ws(config).context("failed to start event client")?;
    let mut events = client.subscribe();

    let mut summary = tokio::time::interval(summary_every);
    summary.set_missed_tick_behavior(MissedTickBehavior::Delay);
    summary.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(event = "monitor_shutdown_requested");
                break;
            }
            received = events.recv() => match received {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(event = "events_lagged", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = summary.tick() => log_summary(&client).await,
        }
    }

    let _ = client.shutdown().await;
    info!(event = "monitor_stop");
    Ok(())
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("SKILLPULSE_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Flags win over `SKILLPULSE_*` variables, which win over defaults.
fn load_config<F>(args: &Args, lookup: F) -> Result<ClientConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ClientConfig::from_lookup(&lookup).context("invalid SKILLPULSE_* setting")?;

    let url = args.url.trim();
    let host = args.host.trim();
    if !url.is_empty() {
        config.url = url.to_string();
    } else if !host.is_empty() || args.port.is_some() {
        let host = if host.is_empty() {
            lookup("SKILLPULSE_HOST")
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_HOST.to_string())
        } else {
            host.to_string()
        };
        let port = match args.port {
            Some(port) => port,
            None => match lookup("SKILLPULSE_PORT") {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid SKILLPULSE_PORT '{raw}'"))?,
                None => DEFAULT_PORT,
            },
        };
        config.url = default_url(&host, port);
    }
    validate_url(&config.url)?;

    if let Some(secs) = args.heartbeat_interval {
        if secs == 0 {
            bail!("--heartbeat-interval must be at least 1 second");
        }
        config.heartbeat_interval = Duration::from_secs(secs);
    }
    Ok(config)
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn log_event(event: &ClientEvent) {
    match event {
        ClientEvent::ConfirmationTick { .. } | ClientEvent::StepUpdated { .. } => {
            debug!(event = event.kind(), "{}", describe(event));
        }
        _ => info!(event = event.kind(), "{}", describe(event)),
    }
}

fn describe(event: &ClientEvent) -> String {
    match event {
        ClientEvent::Connectivity { connected: true } => "connected to orchestrator".to_string(),
        ClientEvent::Connectivity { connected: false } => {
            "lost connection to orchestrator".to_string()
        }
        ClientEvent::ExecutionStarted(execution) => format!(
            "{} ({}) started with {} steps",
            execution.name, execution.id, execution.total_steps
        ),
        ClientEvent::ExecutionUpdated(execution) => match execution.current_step {
            Some(index) => format!(
                "{} ({}) at step {}/{}: {}",
                execution.name,
                execution.id,
                index + 1,
                execution.total_steps,
                execution.current_step_name.as_deref().unwrap_or("")
            ),
            None => format!("{} ({}) updated", execution.name, execution.id),
        },
        ClientEvent::ExecutionCompleted(execution) => {
            format!("{} ({}) {}", execution.name, execution.id, execution.status)
        }
        ClientEvent::ExecutionRemoved { execution_id } => format!("{execution_id} removed"),
        ClientEvent::StepUpdated { execution_id, step } => {
            format!("{execution_id} step {} {}", step.index, step.status)
        }
        ClientEvent::ConfirmationRequired(request) => format!(
            "confirmation {} for {}: {} [{}] ({}s)",
            request.id,
            request.execution_id,
            request.prompt,
            request.options.join("/"),
            request.timeout_seconds
        ),
        ClientEvent::ConfirmationTick {
            id,
            remaining_seconds,
        } => format!("confirmation {id}: {remaining_seconds}s left"),
        ClientEvent::ConfirmationResolved { id, reason } => {
            format!("confirmation {id} resolved: {reason}")
        }
        ClientEvent::AutoHealTriggered(payload) => format!(
            "auto-heal on {} step {}: {}",
            payload.skill_id, payload.step_index, payload.fix_action
        ),
        ClientEvent::AutoHealCompleted(payload) => format!(
            "auto-heal on {} step {} finished (success: {})",
            payload.skill_id,
            payload.step_index,
            payload.success.unwrap_or(false)
        ),
    }
}

async fn log_summary(client: &EventClient) {
    let (Ok(state), Ok(running), Ok(pending), Ok(stale)) = (
        client.connection_state().await,
        client.list_running().await,
        client.list_pending().await,
        client.list_stale().await,
    ) else {
        return;
    };
    info!(
        event = "summary",
        state = %state,
        running = running.len(),
        pending = pending.len(),
        stale = stale.len()
    );
    for execution in &stale {
        warn!(
            event = "execution_stale",
            execution_id = %execution.id,
            name = %execution.name,
            last_event_at = %execution.last_event_at
        );
    }
}
