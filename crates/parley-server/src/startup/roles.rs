// Role runners: each one serves until the shutdown signal fires

use std::sync::Arc;

use tracing::{error, info};

use parley_core::{
    handler::{reference_handlers, spawn_request_loop},
    model::Configuration,
    service::{
        Endpoint, LogicalClock, PeerNode, PeerTransport, ReferenceRegistry,
        persistence::{PersistenceConfig, open_store, write_snapshot},
        registry::RegistryConfig,
    },
};

use super::shutdown::{ShutdownSignal, run_with_shutdown};
use crate::transport::{BroadcastProxy, ProxyConfig, tcp_transport};

/// Run a peer: restore the store, join the cluster and serve clients
pub async fn run_peer(configuration: &Configuration, shutdown: ShutdownSignal) -> anyhow::Result<()> {
    let mut shutdown_rx = shutdown.subscribe();
    let persistence = PersistenceConfig::from_configuration(configuration);
    let data_dir = persistence.data_dir.clone();
    let (store, writer) = open_store(persistence).await;

    let transport = tcp_transport(configuration);
    let peer = PeerNode::new(configuration, transport, store.clone());
    let phase = peer.start().await?;
    info!(
        "Peer {} serving clients on {} ({})",
        peer.identity(),
        peer.domain_address(),
        phase
    );

    shutdown_rx.recv().await.ok();

    peer.stop().await;
    writer.abort();
    if let Err(e) = write_snapshot(&data_dir, &store.snapshot()).await {
        error!("Final snapshot failed: {}", e);
    }
    info!("Peer {} shut down", peer.identity());
    Ok(())
}

/// Run the reference service handing out ranks
pub async fn run_reference(
    configuration: &Configuration,
    shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let mut shutdown_rx = shutdown.subscribe();
    let registry = Arc::new(ReferenceRegistry::new(RegistryConfig::from_configuration(
        configuration,
    )));
    let transport = tcp_transport(configuration);
    let inbox = transport.bind(&Endpoint::Reference).await?;

    let handlers = Arc::new(reference_handlers(
        registry.clone(),
        Arc::new(LogicalClock::new()),
    ));
    let request_loop = spawn_request_loop(handlers, inbox);
    let sweeper = registry.start_sweeper();
    info!(
        "Reference service listening on {}",
        configuration.reference_address()
    );

    shutdown_rx.recv().await.ok();

    sweeper.abort();
    request_loop.abort();
    info!("Reference service shut down");
    Ok(())
}

/// Run the broadcast proxy
pub async fn run_proxy(configuration: &Configuration, shutdown: ShutdownSignal) -> anyhow::Result<()> {
    let proxy = BroadcastProxy::bind(&ProxyConfig::from_configuration(configuration)).await?;
    run_with_shutdown(proxy.run(), shutdown.subscribe()).await;
    info!("Broadcast proxy shut down");
    Ok(())
}
