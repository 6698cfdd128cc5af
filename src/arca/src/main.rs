use std::sync::Arc;

use log::{error, info};

use cache::{CacheHandle, EventCache, LoggingEventsHandler};
use cluster::{ClusterConfig, ClusterManager, ReplicatedStore};

// Use jemalloc as the global allocator for better memory efficiency
// jemalloc reduces memory fragmentation significantly compared to the system allocator
// Used by Redis, Firefox, and other high-performance systems
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn setup_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[tokio::main]
async fn main() {
    setup_logging();

    let ascii_logo = r#"
   ___ _______________ _
  / _ `/ __/ __/ _  /,' \
 / __  / / / /_/.,_/ /^\ \
/_/ /_/_/  \___/_/|_/_/ \_\
-----------------------------------------------
Replicated principal cache
-----------------------------------------------
    "#;

    println!("{}", ascii_logo);

    let config = match ClusterConfig::from_env() {
        Some(config) => config,
        None => {
            eprintln!("ARCA_NODE_ID must be set");
            std::process::exit(1);
        }
    };
    info!(
        "Starting node '{}' on port {}",
        config.node_id, config.cluster_port
    );

    let (cache_handle, mailbox) = CacheHandle::channel();
    let store = Arc::new(ReplicatedStore::new(cache_handle.notifier()));
    let (manager, cluster_handle) =
        ClusterManager::new(config.clone(), store, cache_handle.notifier());

    tokio::spawn(async move {
        if let Err(e) = manager.run().await {
            error!("Cluster manager failed: {}", e);
            std::process::exit(1);
        }
    });

    let cache = EventCache::new(
        config.node_id.clone(),
        mailbox,
        Arc::new(cluster_handle.clone()),
        Box::new(LoggingEventsHandler),
    );
    tokio::spawn(cache.run());

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
    cluster_handle.shutdown();
}
