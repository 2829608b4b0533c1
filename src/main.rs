use std::{process, sync::Arc};

use tempsim::{
    config::{identity::DeviceIdentity, Config},
    core::{
        shutdown::{wait_for_signal, Shutdown},
        telemetry::{Publisher, TelemetryLoop},
    },
    logger::LoggerManager,
    print_error, print_info,
};
use tempsim_mqtt::MqttManager;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    if dotenv::dotenv().is_ok() {
        print_info!("Loaded environment from .env");
    }

    let cfg = Config::new().unwrap_or_else(|e| {
        print_error!("{}", e);
        process::exit(1);
    });
    let identity = DeviceIdentity::from_env().unwrap_or_else(|e| {
        print_error!("{}", e);
        process::exit(1);
    });

    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });

    info!("Starting tempsim version {}...", env!("CARGO_PKG_VERSION"));
    info!(
        client_id = %identity.client_id,
        host = %identity.endpoint_host,
        "Device identity loaded"
    );
    debug!("{:#?}", cfg);

    let handle = MqttManager::from_config(cfg.transport_for(&identity))
        .build()
        .unwrap_or_else(|e| {
            error!("Failed to build MQTT connection: {}", e);
            process::exit(1);
        });

    // Built before `start` so an exit here leaves no connection behind.
    let publisher: Arc<dyn Publisher> = Arc::new(handle.clone());
    let telemetry_loop =
        TelemetryLoop::new(publisher, identity.client_id.clone(), &cfg.telemetry)
            .unwrap_or_else(|e| {
                error!("Invalid telemetry settings: {}", e);
                process::exit(1);
            });

    if let Err(e) = handle.start().await {
        error!("Failed to start MQTT connection: {}", e);
        process::exit(1);
    }
    info!("MQTT connection started");

    let telemetry = telemetry_loop.start(handle.subscribe_state());

    let shutdown = Shutdown::new(
        handle,
        Some(telemetry.clone()),
        cfg.shutdown.stop_timeout(),
    );

    tokio::select! {
        signal = wait_for_signal() => match signal {
            Ok(name) => info!("Received {name}, initiating graceful shutdown..."),
            Err(e) => {
                error!("Failed to listen for signals: {}", e);
                telemetry.join().await;
            }
        },
        _ = telemetry.join() => {
            error!("Telemetry loop unexpectedly finished");
        }
    }

    // Errors are already logged; exit cleanly either way.
    let _ = shutdown.shutdown().await;
    process::exit(0);
}
