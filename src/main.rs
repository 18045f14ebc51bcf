use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use powerctl::api;
use powerctl::config::{AppConfig, ConfigWatcher, PriceApiMode};
use powerctl::controller::Controller;
use powerctl::device::{DeviceRegistry, HttpDeviceClient};
use powerctl::ephemeris::Location;
use powerctl::notify::{heartbeat_task, Notifier};
use powerctl::prices::PriceCache;
use powerctl::schedule::ScheduleBook;
use powerctl::store::StateStore;
use powerctl::telemetry::{init_tracing, shutdown_signal};
use powerctl::ups::UpsMonitor;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("powerctl.toml"));
    let cfg = AppConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(label = %cfg.general.label, outputs = cfg.outputs.len(), "configuration loaded");

    let tz = cfg.location.tz()?;
    let location = Location {
        latitude: cfg.location.latitude,
        longitude: cfg.location.longitude,
        tz,
    };
    let schedules = ScheduleBook::build(&cfg.schedules, location, cfg.general.default_price)?;

    let prices = Arc::new(PriceCache::new(
        cfg.price_api.clone(),
        cfg.files.prices_cache_file.clone(),
    )?);
    if let Err(e) = prices.load_cache_file().await {
        warn!(error = %e, "price cache file unusable, starting cold");
    }

    let store = StateStore::new(
        cfg.files.state_file.clone(),
        cfg.files.days_of_history as usize,
    );

    let notifier = Arc::new(Notifier::new(
        cfg.email.as_ref(),
        &cfg.general.label,
        cfg.general.report_critical_errors_delay_mins,
    )?);

    let client = Arc::new(
        HttpDeviceClient::new(std::time::Duration::from_secs(
            cfg.devices.response_timeout_secs,
        ))
        .map_err(|e| anyhow::anyhow!("device client: {e}"))?,
    );
    let (device_events_tx, device_events_rx) = mpsc::channel(64);
    let registry = Arc::new(DeviceRegistry::start(&cfg, client, device_events_tx));

    // UPS monitor and other wake sources feed one channel into the loop.
    let (wake_tx, wake_rx) = mpsc::channel(8);
    let ups_rx = match cfg.ups.clone() {
        Some(ups_cfg) if !ups_cfg.devices.is_empty() => {
            let (monitor, rx) = UpsMonitor::new(ups_cfg);
            tokio::spawn(monitor.run(wake_tx.clone()));
            Some(rx)
        }
        _ => None,
    };

    if let Some(heartbeat) = cfg.heartbeat.clone() {
        tokio::spawn(heartbeat_task(heartbeat));
    }

    // Price refresher: periodic, on-demand via POST /refresh, shortened
    // cadence after a failure.
    let (refresh_tx, refresh_rx) = mpsc::channel(8);
    tokio::spawn(price_refresher(
        prices.clone(),
        refresh_rx,
        wake_tx.clone(),
        notifier.clone(),
        cfg.price_api.max_concurrent_errors,
    ));

    let (controller, handles) = Controller::new(
        cfg.clone(),
        registry,
        prices,
        schedules,
        store,
        notifier,
        ups_rx,
        refresh_tx,
        device_events_rx,
        wake_rx,
    )?;

    tokio::spawn(powerctl::controller::watch_config_file(
        ConfigWatcher::new(config_path),
        handles.commands_tx.clone(),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let controller_task = tokio::spawn(controller.run(stop_rx));

    let addr = cfg.server.socket_addr()?;
    let app = api::router(handles.app_state.clone());
    info!(%addr, "starting powerctl");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // HTTP is down; stop the control loop and let it drain.
    let _ = stop_tx.send(true);
    if let Err(e) = controller_task.await {
        warn!(error = %e, "controller task ended abnormally");
    }
    info!("shutdown complete");
    Ok(())
}

async fn price_refresher(
    prices: Arc<PriceCache>,
    mut on_demand: mpsc::Receiver<()>,
    wake: mpsc::Sender<()>,
    notifier: Arc<Notifier>,
    max_errors: u32,
) {
    if prices.mode() == PriceApiMode::Disabled {
        info!("price API disabled, refresher idle");
        return;
    }
    let mut delay = prices.refresh_interval();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            Some(()) = on_demand.recv() => info!("price refresh requested"),
        }
        let now = chrono::Utc::now();
        match prices.refresh(now).await {
            Ok(()) => {
                delay = prices.refresh_interval();
                notifier.clear_issue("Price API", "Connection Error").await;
            }
            Err(_) => {
                // Retry sooner while the source is unhappy.
                delay = std::time::Duration::from_secs(60);
                let errors = prices.consecutive_errors().await;
                if errors >= max_errors {
                    notifier
                        .report_issue(
                            "Price API",
                            "Connection Error",
                            &format!("API is still not responding after {errors} attempts."),
                        )
                        .await;
                }
            }
        }
        let _ = wake.try_send(());
    }
}
