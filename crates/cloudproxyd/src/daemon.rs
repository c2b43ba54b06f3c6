//! Process assembly for `cloudproxyd serve`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use cloudproxy_api::{ApiState, build_router, rolling_handlers::ROLLING_SETTING};
use cloudproxy_controller::{Controller, DestroyWorker};
use cloudproxy_core::FleetConfig;
use cloudproxy_provider::{ProviderRegistry, SimulatedProvider};
use cloudproxy_rollout::{PolicyHandle, RollingPolicy};
use cloudproxy_state::{FleetStore, InstanceGroup};

fn load_config(path: Option<PathBuf>) -> anyhow::Result<FleetConfig> {
    let Some(path) = path else {
        info!("no config file given, using defaults");
        return Ok(FleetConfig::default());
    };
    let config = FleetConfig::from_file(&path)
        .with_context(|| format!("load config {}", path.display()))?;
    info!(path = %path.display(), groups = config.instances().count(), "config loaded");
    Ok(config)
}

fn open_store(data_dir: Option<PathBuf>) -> anyhow::Result<FleetStore> {
    match data_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            let db_path = dir.join("cloudproxy.redb");
            let store = FleetStore::open(&db_path)?;
            info!(path = ?db_path, "fleet store opened");
            Ok(store)
        }
        None => {
            info!("fleet store running in memory");
            Ok(FleetStore::open_in_memory()?)
        }
    }
}

/// Persisted policy wins over the config file so runtime PATCHes survive
/// restarts.
fn restore_policy(store: &FleetStore, config: &FleetConfig) -> anyhow::Result<PolicyHandle> {
    let from_config = RollingPolicy::from(&config.rolling);
    let policy = match store.get_setting::<RollingPolicy>(ROLLING_SETTING) {
        Ok(Some(stored)) if stored.validate().is_ok() => {
            info!(?stored, "restored persisted rolling policy");
            stored
        }
        Ok(Some(stored)) => {
            warn!(?stored, "persisted rolling policy out of range, using config");
            from_config
        }
        Ok(None) => from_config,
        Err(e) => {
            warn!(error = %e, "failed to read persisted rolling policy, using config");
            from_config
        }
    };
    Ok(PolicyHandle::new(policy)?)
}

fn build_providers(config: &FleetConfig) -> anyhow::Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    for (index, name) in config.providers.keys().enumerate() {
        let network = u8::try_from(index + 1).context("too many providers configured")?;
        registry.register(Arc::new(SimulatedProvider::new(name.clone(), network)));
        info!(provider = %name, network, "provider adapter registered");
    }
    Ok(registry)
}

pub async fn run(
    config_path: Option<PathBuf>,
    port: u16,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("CloudProxy daemon starting");

    let config = load_config(config_path)?;
    let store = open_store(data_dir)?;

    for (provider, instance, inst) in config.instances() {
        let group = InstanceGroup::from_config(provider, instance, inst)?;
        if store.declare(group)? {
            info!(provider, instance, "instance group declared");
        }
    }

    let policy = restore_policy(&store, &config)?;
    let providers = build_providers(&config)?;

    // ── Background loops ───────────────────────────────────────

    let controller = Controller::new(
        store.clone(),
        policy.clone(),
        providers.clone(),
        config.controller.clone(),
    );
    let destroyer = DestroyWorker::new(
        store.clone(),
        providers,
        &config.controller,
        controller.waker(),
    );
    let controller = controller.with_destroy_wake(destroyer.waker());

    let api_state = ApiState {
        controller_wake: controller.waker(),
        destroy_wake: destroyer.waker(),
        ..ApiState::new(store, policy, config.auth.clone())
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller_handle = tokio::spawn(controller.run(shutdown_rx.clone()));
    let destroy_handle = tokio::spawn(destroyer.run(shutdown_rx));

    // ── API server ─────────────────────────────────────────────

    let router = build_router(api_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c, shutting down");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = controller_handle.await;
    let _ = destroy_handle.await;

    info!("CloudProxy daemon stopped");
    Ok(())
}
