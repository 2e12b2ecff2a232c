use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use broker_kafka::{KafkaBroker, KafkaConfig};
use broker_mqtt::{MqttBroker, MqttConfig};
use ferry_api::broker::BrokerConnection;
use ferry_engine::Relay;
use ferry_engine::loopback::LoopbackBroker;

use crate::config::{BrokerSection, LoopbackConfig, ServeArgs, ServerConfig, Transport};
use crate::error::ServerError;

/// How long the API server gets to finish in-flight requests.
const API_DRAIN: Duration = Duration::from_secs(5);

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("ferry-server starting");

    // --- Load config ---
    let config = ServerConfig::load(&args.config)?;
    tracing::info!(
        config = %args.config,
        transport = config.broker.transport.as_str(),
        topics = ?config.broker.topics,
        "loaded config"
    );

    // --- Broker connection ---
    let connection = build_connection(&config.broker)?;

    // --- Relay: connect + initial subscriptions ---
    let relay = Relay::bootstrap(
        config.relay(),
        connection,
        config.broker.topics.clone(),
        config.broker.subscribe.clone(),
    )
    .await?;

    // --- CancellationToken for graceful shutdown ---
    let token = CancellationToken::new();

    // --- API server ---
    let api_relay = relay.clone();
    let api_port = config.api_port;
    let prefix = config.tool_prefix().to_string();
    let api_token = token.clone();
    let mut api_handle = tokio::spawn(async move {
        ferry_api_server::run(api_port, api_relay, &prefix, api_token).await
    });

    tracing::info!(port = config.api_port, prefix = config.tool_prefix(), "server ready");

    // --- Wait for Ctrl+C, or for the API server to die ---
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down...");
            signal.map_err(ServerError::from)
        }
        joined = &mut api_handle => {
            let result = match joined {
                Ok(result) => result.map_err(ServerError::from),
                Err(e) => {
                    tracing::error!(error = %e, "api server task failed");
                    Ok(())
                }
            };
            relay.shutdown().await;
            return result;
        }
    };

    // Signal the API server to stop accepting
    token.cancel();

    match tokio::time::timeout(API_DRAIN, &mut api_handle).await {
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "api server error"),
        Ok(Err(e)) => tracing::error!(error = %e, "api server task failed"),
        Ok(Ok(Ok(()))) => {}
        Err(_) => {
            tracing::warn!("api server did not drain in time, aborting");
            api_handle.abort();
        }
    }

    relay.shutdown().await;

    tracing::info!("shutdown complete");
    outcome
}

fn build_connection(broker: &BrokerSection) -> Result<Arc<dyn BrokerConnection>, ServerError> {
    let connection: Arc<dyn BrokerConnection> = match broker.transport {
        Transport::Mqtt => {
            let config: MqttConfig = broker.transport_config()?;
            Arc::new(MqttBroker::new(config)?)
        }
        Transport::Kafka => {
            let config: KafkaConfig = broker.transport_config()?;
            Arc::new(KafkaBroker::new(config)?)
        }
        Transport::Loopback => {
            let config: LoopbackConfig = broker.transport_config()?;
            let mut loopback = LoopbackBroker::new(config.mode);
            if let Some(wildcards) = config.wildcards {
                loopback = loopback.with_wildcards(wildcards);
            }
            Arc::new(loopback)
        }
    };

    tracing::info!(
        transport = connection.transport(),
        mode = %connection.mode(),
        details = %connection.describe(),
        "broker connection configured"
    );
    Ok(connection)
}
