//! Standalone hub server.
//!
//! Usage: `rally-server [bind-addr]`. Expects an upstream proxy to set
//! `X-User-Id` on authenticated upgrade requests.

use rally_collab::docsync::{DocSync, DocSyncConfig};
use rally_collab::hub::{Hub, HubConfig, HubObserver};
use rally_collab::presence::{PresenceNotifier, StaticWatchers};
use rally_collab::router::Router;
use rally_collab::server::{HubServer, ServerConfig, TrustedHeaderAuthenticator};
use rally_core::MemorySnapshotStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Some(addr) = std::env::args().nth(1) {
        config.bind_addr = addr;
    }

    let presence = Arc::new(PresenceNotifier::new(Arc::new(StaticWatchers::new())));
    let hub = Hub::start(HubConfig::default(), vec![presence as Arc<dyn HubObserver>]);

    let docs = Arc::new(DocSync::new(
        Arc::new(MemorySnapshotStore::new()),
        DocSyncConfig::default(),
    ));
    let maintenance = docs.spawn_maintenance(hub.clone());
    let router = Arc::new(docs.register(Router::new()));

    let server = HubServer::new(
        config,
        hub.clone(),
        Arc::new(TrustedHeaderAuthenticator::default()),
        router,
    );

    log::info!("Starting Rally hub...");
    let result: Result<(), Box<dyn std::error::Error>> = tokio::select! {
        result = server.run() => result.map_err(Into::into),
        signal = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
            signal.map_err(Into::into)
        }
    };

    maintenance.abort();
    hub.shutdown();
    let flushed = docs.flush_all();
    log::info!("Flushed {flushed} documents");
    result
}
