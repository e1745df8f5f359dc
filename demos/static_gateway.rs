//! Static Gateway - namespace ownership from a fixed table.
//!
//! This example demonstrates:
//! - Building a gateway with the builder pattern
//! - Feeding it an in-memory coordination backend instead of a cluster
//! - Installing a `tracing` subscriber for the gateway's logs
//!
//! # Running
//!
//! ```sh
//! GATEWAY_ROUTES="vhostA=127.0.0.1:5673,vhostB=127.0.0.1:5674" \
//! RUST_LOG=amqp_gateway=debug \
//!     cargo run --example static_gateway -- gateway.json
//! ```
//!
//! The config file is optional; without it the defaults apply. Point any
//! AMQP 0-9-1 client at the bind address and open `/vhostA`.

use std::sync::Arc;

use amqp_gateway::lookup::{BrokerEndpoint, InMemoryCoordination, ServiceLookupData};
use amqp_gateway::{Gateway, GatewayConfig};
use tracing_subscriber::EnvFilter;

/// Parse `namespace=host:port` pairs.
fn routes(spec: &str) -> Vec<(String, BrokerEndpoint)> {
    spec.split(',')
        .filter_map(|route| {
            let (namespace, endpoint) = route.trim().split_once('=')?;
            Some((namespace.to_owned(), BrokerEndpoint::from_advertisement(endpoint)?))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };

    let coordination = Arc::new(InMemoryCoordination::new());
    let table = std::env::var("GATEWAY_ROUTES").unwrap_or_default();
    for (namespace, endpoint) in routes(&table) {
        // Each endpoint doubles as its broker's web service address.
        let web_service_url = format!("http://{endpoint}");
        coordination.register_broker(
            &ServiceLookupData::new(&web_service_url)
                .with_protocol("amqp", format!("amqp://{endpoint}")),
        )?;
        coordination.assign(&namespace, web_service_url);
        tracing::info!(%namespace, %endpoint, "static route");
    }

    let gateway = Gateway::builder()
        .config(config)
        .coordination(coordination)
        .start()
        .await?;

    tokio::signal::ctrl_c().await?;
    gateway.shutdown();
    gateway.wait().await?;
    Ok(())
}
