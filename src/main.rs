use std::sync::Arc;

use mqtt_gateway::config::GatewayConfig;
use mqtt_gateway::connection::DeliveryContext;
use mqtt_gateway::db::DatabaseService;
use mqtt_gateway::directory::ConfigDirectory;
use mqtt_gateway::registry::ConnectionRegistry;
use mqtt_gateway::service_utils::{
    handle_shutdown, start_command_listener, start_config_watcher, start_idle_reaper,
    start_stream_archiver, wait_for_shutdown_signal, GatewayTasks,
};
use mqtt_gateway::transport::MqttConnector;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = match GatewayConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let db_service = match DatabaseService::new(&config.db_path) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to create database service: {:?}", e);
            return;
        }
    };

    if let Err(e) = db_service.initialize_db() {
        error!("Database initialization failed: {:?}", e);
        return;
    }
    info!("Database initialized successfully.");

    let connector = Arc::new(MqttConnector::new(
        config.mqtt_client_id_prefix.clone(),
        config.keep_alive(),
    ));
    let delivery = DeliveryContext {
        directory: Arc::new(ConfigDirectory::new(config.default_stream_name.clone())),
        streams: db_service.clone(),
        status: db_service.clone(),
    };
    let registry = Arc::new(ConnectionRegistry::new(
        connector,
        delivery,
        config.connection_settings(),
    ));

    let mut tasks = GatewayTasks::new(CancellationToken::new());
    start_config_watcher(&mut tasks, &config, db_service.clone(), registry.clone());
    start_command_listener(
        &mut tasks,
        &config,
        db_service.clone(),
        db_service.clone(),
        registry.clone(),
    );
    start_idle_reaper(&mut tasks, &config, registry.clone());
    start_stream_archiver(
        &mut tasks,
        &config,
        db_service.clone(),
        db_service.clone(),
        db_service.clone(),
        &registry,
    );
    info!("Gateway started.");

    wait_for_shutdown_signal().await;
    handle_shutdown(tasks, registry).await;
}
