use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use env_logger::Env;
use log::{error, info, warn};
use structopt::StructOpt;

use wifi_provision::network::NetworkAdapter;
use wifi_provision::*;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Bad CLI arguments or env values exit with 2, fatal init errors with 1.
    let config = match config::Config::from_args_safe() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        },
    };

    let default_filter = if config.debug { "debug" } else { "info" };
    env_logger::init_from_env(Env::new().filter_or("RUST_LOG", default_filter));

    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(2);
    }

    if let Err(e) = main_inner(config).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn main_inner(config: config::Config) -> Result<(), ProvisionError> {
    let addr = SocketAddr::from((config.web_host, config.web_port));
    http_server::test_bind(addr).await?;

    let identity =
        identity::DeviceIdentity::load_or_generate(&config.identity_file(), &config.ap_ssid_prefix)?;
    info!(
        "Device {} ({}), setup network {}",
        identity.device_id, identity.hostname, identity.ap_ssid
    );

    let store = Arc::new(store::StateStore::load(&config.state_file()));

    let nm = Arc::new(network::nm::NetworkManagerAdapter::new().await?);
    let adapter: Arc<dyn NetworkAdapter> = nm.clone();

    let captive = captive::CaptivePortal::new(
        nm.interface_name().to_owned(),
        config.ap_ip,
        config.web_port,
        PathBuf::from(captive::DNSMASQ_DROPIN_DIR),
        Some(nm.bus().clone()),
    );
    let tunnel = tunnel::spawn(config.clone(), identity.hostname.clone(), store.clone());

    let _display = display::spawn(store.clone(), Arc::new(display::LogDisplay));
    let _mdns = mdns::spawn(store.clone(), identity.hostname.clone(), Arc::new(mdns::AvahiPublisher));

    let (orchestrator, handle) = orchestrator::Orchestrator::new(
        config.clone(),
        identity,
        store.clone(),
        adapter.clone(),
        captive,
        tunnel,
    );

    let http_state = http_server::shared_state(store, handle.clone(), adapter, config);
    tokio::spawn(async move {
        if let Err(e) = http_server::run_server(http_state, addr).await {
            error!("{}", e);
            std::process::exit(1);
        }
    });

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received");
        handle.shutdown().await;
    });

    orchestrator.run().await?;
    info!("Clean shutdown");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = term.recv() => {},
            }
        },
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        },
    }
}
