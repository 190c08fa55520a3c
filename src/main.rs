//! Gateway entry point.
//!
//! Startup runs in dependency order: storage, router, command engine, then
//! the UDP adapter (bound before anything that could block on BLE), the BLE
//! client, and finally the SSE server. Shutdown is signal-driven and
//! bounded: beacons 5 s, BLE 5 s, UDP 3 s, SSE 3 s; a duplicate signal
//! within five seconds is ignored, a later one force-exits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mcapp::ble::remote::{BleTransportBridge, RemoteBleClient};
use mcapp::ble::{BleClient, BleMode, DisabledBleClient};
use mcapp::commands::{CommandEngine, MeshStorageSubscriber};
use mcapp::config::{hours_to_dd_hh, GatewayConfig};
use mcapp::domain::Callsign;
use mcapp::message::MessageNormalizer;
use mcapp::router::{DisconnectCacheClear, MessageRouter, RegisterCacheSubscriber, Topic};
use mcapp::sse::{AppState, SseFanout};
use mcapp::storage::StorageEngine;
use mcapp::udp::{UdpAdapter, MESHCOM_UDP_PORT};
use mcapp::weather::WeatherService;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = GatewayConfig::load();

    let default_level = if cfg.dev { "mcapp=debug" } else { "mcapp=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse()?),
        )
        .init();

    if cfg.dev {
        info!("*** dev environment detected ***");
    }
    info!(
        "retention: msgs {}, pos/ack {}",
        hours_to_dd_hh(cfg.retention.prune_hours_msg),
        hours_to_dd_hh(cfg.retention.prune_hours_pos),
    );
    info!(db = %cfg.db_path.display(), "SQLite storage");

    // Storage first; a failed migration is fatal.
    let storage = Arc::new(
        StorageEngine::open(&cfg.db_path)
            .await
            .context("storage initialization failed")?,
    );
    storage.prune(&cfg.retention, &cfg.block_list).await?;

    // Router and normalizer.
    let callsign = Callsign::try_new(cfg.call_sign.clone())
        .map_err(|e| anyhow::anyhow!("invalid callsign in config: {e}"))?;
    let normalizer = MessageNormalizer::new(callsign);
    let router = Arc::new(MessageRouter::new());
    router.set_normalizer(normalizer.clone());

    router.subscribe(
        Topic::BleNotification,
        Arc::new(RegisterCacheSubscriber::new(router.clone())),
    );
    router.subscribe(
        Topic::BleStatus,
        Arc::new(DisconnectCacheClear::new(router.clone())),
    );

    // Weather service; location arrives from the node's GPS.
    let weather = Arc::new(WeatherService::new(&cfg.station_name, None, None));

    // Command engine joins the command-bearing topics.
    let engine = CommandEngine::new(
        router.clone(),
        storage.clone(),
        weather.clone(),
        normalizer,
        cfg.user_info(),
    );
    router.subscribe(Topic::MeshMessage, engine.clone());
    router.subscribe(Topic::BleNotification, engine.clone());

    // Storage subscriber persists everything the engine sees.
    let storage_sub = Arc::new(MeshStorageSubscriber::new(storage.clone(), engine.clone()));
    router.subscribe(Topic::MeshMessage, storage_sub.clone());
    router.subscribe(Topic::BleNotification, storage_sub);

    let shutdown = CancellationToken::new();

    // UDP early, before BLE init which can block for seconds on small
    // boards; the health check expects port 1799 listening promptly.
    let udp = Arc::new(
        UdpAdapter::bind(MESHCOM_UDP_PORT, &cfg.udp_target, router.clone())
            .await
            .context("UDP bind failed")?,
    );
    router.register_udp(udp.clone());
    let udp_task = tokio::spawn(udp.clone().run(shutdown.child_token()));
    info!(port = MESHCOM_UDP_PORT, target = %cfg.udp_target, "UDP adapter running");

    // BLE client per configured mode.
    let ble: Arc<dyn BleClient> = match cfg.ble_mode {
        BleMode::Remote => {
            match RemoteBleClient::new(&cfg.ble_url, cfg.ble_api_key.clone(), router.clone()) {
                Ok(client) => {
                    router.register_ble(Arc::new(BleTransportBridge::new(client.clone())));
                    info!(url = %cfg.ble_url, "BLE: remote mode");
                    client as Arc<dyn BleClient>
                }
                Err(e) => {
                    error!(error = %e, "BLE client init failed, falling back to disabled");
                    Arc::new(DisabledBleClient) as Arc<dyn BleClient>
                }
            }
        }
        BleMode::Disabled => {
            info!("BLE: disabled");
            Arc::new(DisabledBleClient)
        }
    };
    if let Err(e) = ble.clone().start().await {
        warn!(error = %e, "BLE client start failed");
    }

    // SSE server.
    let app_state = AppState::new(router.clone(), storage.clone(), weather, ble.clone());
    SseFanout::register(app_state.clone());
    let sse_shutdown = shutdown.child_token();
    let sse_host = cfg.sse_host.clone();
    let sse_port = cfg.sse_port;
    let sse_task = tokio::spawn(async move {
        // An SSE failure darkens the UI but mesh logging survives.
        if let Err(e) = mcapp::sse::serve(app_state, &sse_host, sse_port, sse_shutdown).await {
            error!(error = %e, "SSE server failed, continuing without UI");
        }
    });
    info!(host = %cfg.sse_host, port = cfg.sse_port, "SSE server available at /events");

    // Nightly maintenance at 04:00 local.
    let maintenance = tokio::spawn(nightly_maintenance(
        storage.clone(),
        cfg.clone(),
        shutdown.child_token(),
    ));

    wait_for_shutdown_signal(&shutdown).await;

    // Bounded shutdown sequence.
    info!("stopping gateway, saving to disk...");
    maintenance.abort();

    if tokio::time::timeout(Duration::from_secs(5), engine.stop()).await.is_err() {
        warn!("beacon cleanup timeout");
    }
    if tokio::time::timeout(Duration::from_secs(5), ble.stop()).await.is_err() {
        warn!("BLE disconnect timeout");
    }
    shutdown.cancel();
    if tokio::time::timeout(Duration::from_secs(3), udp_task).await.is_err() {
        warn!("UDP stop timeout");
    }
    if tokio::time::timeout(Duration::from_secs(3), sse_task).await.is_err() {
        warn!("SSE stop timeout");
    }

    storage.close().await;
    info!("shutdown complete");
    Ok(())
}

/// First signal starts the clean shutdown; duplicates within five seconds
/// are ignored (signal delivery can double-fire), a deliberate second
/// signal after that force-exits.
async fn wait_for_shutdown_signal(shutdown: &CancellationToken) {
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, stopping gateway..."),
        _ = sigterm.recv() => info!("SIGTERM received, stopping gateway..."),
    }
    shutdown.cancel();

    let first = tokio::time::Instant::now();
    let watcher = async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            if first.elapsed() < Duration::from_secs(5) {
                info!("ignoring duplicate signal");
                continue;
            }
            warn!("force shutdown on second signal");
            std::process::exit(1);
        }
    };
    // The watcher lives for the rest of the shutdown sequence.
    tokio::spawn(watcher);
}

/// Sleep until 04:00 local, then prune, roll up buckets and enforce the
/// size cap; repeat daily.
async fn nightly_maintenance(
    storage: Arc<StorageEngine>,
    cfg: GatewayConfig,
    shutdown: CancellationToken,
) {
    loop {
        let now = chrono::Local::now();
        let next_4am = {
            let today_4am = now
                .date_naive()
                .and_hms_opt(4, 0, 0)
                .expect("valid wall clock");
            let candidate = today_4am
                .and_local_timezone(chrono::Local)
                .single()
                .unwrap_or_else(|| now.naive_local().and_utc().into());
            if candidate <= now {
                candidate + chrono::Duration::days(1)
            } else {
                candidate
            }
        };
        let wait = (next_4am - now)
            .to_std()
            .unwrap_or(Duration::from_secs(3600));
        info!(hours = wait.as_secs() / 3600, "next DB prune scheduled for 04:00");

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        info!("starting nightly DB maintenance");
        if let Err(e) = storage.prune(&cfg.retention, &cfg.block_list).await {
            error!(error = %e, "nightly prune failed");
        }
        if let Err(e) = storage.aggregate_hourly_buckets().await {
            error!(error = %e, "hourly rollup failed");
        }
        match storage.enforce_size_cap().await {
            Ok(true) => warn!("size cap pruner ran"),
            Ok(false) => {}
            Err(e) => error!(error = %e, "size cap enforcement failed"),
        }
    }
}
