mod auth;
mod routes;

use chrono::{Duration, Utc};
use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tp_core::RateLimitPolicy;
use tp_storage::FleetStore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use auth::AdminKeyring;
use routes::{AppState, SharedState};

const TOKEN_SWEEP_INTERVAL_SECS: u64 = 600;
const PENDING_EXPIRY_INTERVAL_SECS: u64 = 3_600;

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    db_path: String,
    admin_token: Option<String>,
    token_ttl: Duration,
    policy: RateLimitPolicy,
    /// Age after which unacknowledged nudges are dropped; `None` keeps
    /// them pending forever.
    expire_pending: Option<Duration>,
    debug: bool,
}

#[derive(Parser, Debug)]
#[command(name = "tp-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    db: String,
    /// Admin token to accept; generated and logged once when empty.
    #[arg(long, default_value = "")]
    admin_token: String,
    #[arg(long, default_value_t = 24)]
    token_ttl_hours: i64,
    #[arg(long, default_value_t = 5)]
    rate_limit_count: u32,
    #[arg(long, default_value_t = 60)]
    rate_limit_window_secs: i64,
    /// 0 disables the expiry sweep.
    #[arg(long, default_value_t = 0)]
    expire_pending_hours: i64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    if let Some(parent) = Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                error!(event = "db_dir_error", error = %err, path = %parent.display());
                return;
            }
        }
    }

    let store = match FleetStore::open(&config.db_path) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "db_open_error", error = %err, path = %config.db_path);
            return;
        }
    };

    let keyring = AdminKeyring::new(config.token_ttl);
    match &config.admin_token {
        Some(token) => {
            keyring.insert(token.clone(), Utc::now());
            info!(event = "admin_token_loaded");
        }
        None => {
            let token = keyring.issue(Utc::now());
            // Logged once at startup; operators pass it to the console.
            info!(event = "admin_token_issued", token = %token);
        }
    }

    let state: SharedState = Arc::new(AppState {
        store,
        keyring,
        policy: config.policy,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_token_sweeper(state.clone(), shutdown_rx.clone());
    if let Some(max_age) = config.expire_pending {
        spawn_pending_expiry(state.clone(), max_age, shutdown_rx);
    }

    let app = routes::router(state);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_error", error = %err, addr = %config.addr);
            return;
        }
    };

    info!(event = "hub_start", addr = %config.addr, db = %config.db_path);

    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    };

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(event = "hub_error", error = %err);
    }
    info!(event = "hub_stop");
}

fn spawn_token_sweeper(state: SharedState, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(TOKEN_SWEEP_INTERVAL_SECS));
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let evicted = state.keyring.evict_expired(Utc::now());
                    if evicted > 0 {
                        info!(event = "admin_tokens_evicted", count = evicted);
                    }
                }
            }
        }
    });
}

fn spawn_pending_expiry(state: SharedState, max_age: Duration, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(PENDING_EXPIRY_INTERVAL_SECS));
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    match state.store.expire_pending(Utc::now() - max_age) {
                        Ok(0) => {}
                        Ok(dropped) => {
                            info!(event = "pending_nudges_expired", count = dropped);
                        }
                        Err(err) => {
                            warn!(event = "pending_expiry_error", error = %err);
                        }
                    }
                }
            }
        }
    });
}

fn load_config() -> Config {
    let args = Args::parse();
    let admin_token = resolve_admin_token(&args.admin_token);
    Config {
        addr: resolve_addr(&args.addr),
        db_path: resolve_db_path(&args.db),
        admin_token,
        token_ttl: Duration::hours(args.token_ttl_hours.max(1)),
        policy: RateLimitPolicy {
            max_per_window: args.rate_limit_count,
            window: Duration::seconds(args.rate_limit_window_secs.max(1)),
        },
        expire_pending: expiry_policy(args.expire_pending_hours),
        debug: args.debug || env_true("TP_HUB_DEBUG"),
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("TP_HUB_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "127.0.0.1:4680".to_string()
}

fn resolve_db_path(db_flag: &str) -> String {
    if !db_flag.trim().is_empty() {
        return db_flag.to_string();
    }
    if let Ok(value) = std::env::var("TP_DB_PATH") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    ".tablepulse/fleet.db".to_string()
}

fn resolve_admin_token(token_flag: &str) -> Option<String> {
    if !token_flag.trim().is_empty() {
        return Some(token_flag.to_string());
    }
    match std::env::var("TP_ADMIN_TOKEN") {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn expiry_policy(hours: i64) -> Option<Duration> {
    if hours > 0 {
        Some(Duration::hours(hours))
    } else {
        None
    }
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

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("TP_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_or_negative_hours_disable_pending_expiry() {
        assert!(expiry_policy(0).is_none());
        assert!(expiry_policy(-3).is_none());
        assert_eq!(expiry_policy(48), Some(Duration::hours(48)));
    }
}
