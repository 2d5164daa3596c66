#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use bptree::config::TreeConfig;
use bptree::storage::btree::{BTree, BTreeError};
use bptree::storage::buffer_pool::{BufferPool, DEFAULT_POOL_CAPACITY};
use bptree::storage::cache::cache_for_capacity;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bptree=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match TreeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: index_directory={}, order={}, page_cache_capacity={}",
        config.index_directory.display(),
        config.order,
        config.page_cache_capacity
    );

    if let Err(e) = std::fs::create_dir_all(&config.index_directory) {
        tracing::error!("Failed to create index directory: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run_demo(&config) {
        tracing::error!("Demo failed: {e}");
        std::process::exit(1);
    }
}

/// Insert keys 1..=10 into the demo index, then read them back.
fn run_demo(config: &TreeConfig) -> Result<(), BTreeError> {
    let path = config.index_file("demo", "id");
    let mut tree: BTree<u64, String> = BTree::open_or_create(
        &path,
        "demo-id",
        config.order,
        BufferPool::new(DEFAULT_POOL_CAPACITY),
    )?
    .with_cache(cache_for_capacity(config.page_cache_capacity));

    for key in 1..=10 {
        tree.put(key, format!("record-{key}"))?;
    }
    tree.sync()?;
    tracing::info!(
        "Index {} holds {} entries at {}",
        tree.index_name(),
        tree.count(),
        tree.path().display()
    );

    match tree.get(&7)? {
        Some(value) => tracing::info!("Lookup 7 -> {value}"),
        None => tracing::warn!("Lookup 7 -> missing"),
    }

    for entry in tree.seek_first()? {
        let (key, value) = entry?;
        tracing::info!("{key} -> {value}");
    }
    Ok(())
}
