//! Tandem Node - mesh replication daemon.
//!
//! Listens for peers over TCP, keeps the replica in sync with them, and
//! serves the HTTP control surface the repository layer talks to.

use std::path::Path;
use std::sync::Arc;

use tandem_engine::{ConflictResolver, StoreSnapshot};
use tandem_mesh::config::Config;
use tandem_mesh::discovery::{PeerDiscovery, StaticSource};
use tandem_mesh::link::{serve, TcpTransport};
use tandem_mesh::protocol::{Announcement, Capabilities};
use tandem_mesh::repository::{MemoryRepository, Repository};
use tandem_mesh::routes::{self, AppState};
use tandem_mesh::{MeshNode, Replica};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_mesh=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let mut config = Config::from_env()?;

    // Restore state under the device id it was written with
    let snapshot = match config.state_file.clone() {
        Some(path) if path.exists() => {
            let snapshot = StoreSnapshot::from_json(&tokio::fs::read_to_string(&path).await?)?;
            config.restore_identity(&snapshot.device_id)?;
            tracing::info!(
                path = %path.display(),
                records = snapshot.record_count(),
                "Restored snapshot"
            );
            Some(snapshot)
        }
        _ => None,
    };

    tracing::info!(
        node_id = %config.node_id,
        listen = %config.listen_addr,
        http = %config.http_addr,
        "Starting Tandem node"
    );

    let repository = match snapshot {
        Some(snapshot) => MemoryRepository::from_snapshot(snapshot)?,
        None => MemoryRepository::new(config.node_id.clone()),
    };
    let repository: Arc<dyn Repository> = Arc::new(repository);
    let replica = Arc::new(Replica::new(
        Arc::clone(&repository),
        ConflictResolver::new(config.node_id.clone(), config.sync.merge_strategy),
    ));

    // Mesh
    let local = Announcement {
        id: config.node_id.clone(),
        name: config.node_name.clone(),
        address: Some(config.listen_addr.clone()),
        capabilities: Capabilities::default(),
    };
    let discovery = PeerDiscovery::new(local, config.discovery.clone())
        .with_source(Arc::new(StaticSource::new(config.seed_peers.clone())));
    let mut node = MeshNode::start(
        discovery,
        replica,
        Arc::new(TcpTransport),
        config.sync.clone(),
    );

    let mesh_listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    let link = Arc::clone(node.link());
    tokio::spawn(async move {
        if let Err(e) = serve(mesh_listener, link).await {
            tracing::error!("Mesh listener stopped: {}", e);
        }
    });
    node.spawn_timers();

    // HTTP control surface
    let state = AppState {
        coordinator: Arc::clone(node.coordinator()),
    };
    let app = axum::Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    tracing::info!("HTTP listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    node.shutdown();
    if let Some(path) = &config.state_file {
        persist(repository.as_ref(), path).await?;
    }

    Ok(())
}

async fn persist(repository: &dyn Repository, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = repository.snapshot().await?;
    tokio::fs::write(path, snapshot.to_json_pretty()?).await?;
    tracing::info!(
        path = %path.display(),
        records = snapshot.record_count(),
        "Snapshot written"
    );
    Ok(())
}
