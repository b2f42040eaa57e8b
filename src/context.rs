/// Application context and dependency injection
use crate::{
    account::{AccountDirectory, KvAccountDirectory},
    chat::{ChatService, Hub},
    config::ServerConfig,
    error::AppResult,
    media::{MediaProcessor, MediaQueue},
    push::{DeviceTokenRegistry, PushQueue},
    store::Store,
};
use std::sync::Arc;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub store: Store,
    pub accounts: Arc<dyn AccountDirectory>,
    // Live chat
    pub hub: Hub,
    pub chat: ChatService,
    // Background pipelines
    pub media_queue: Arc<MediaQueue>,
    pub push: PushQueue,
    pub devices: DeviceTokenRegistry,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> AppResult<Self> {
        config.validate()?;
        Self::ensure_directories(&config).await?;

        let store = Store::open(&config.storage.kv_path)?;
        tracing::info!(path = %config.storage.kv_path.display(), "KV store opened");

        let accounts: Arc<dyn AccountDirectory> = Arc::new(KvAccountDirectory::new(store.clone()));
        Ok(Self::build(config, store, accounts))
    }

    /// Wire every component over an open store and account directory
    pub fn build(config: ServerConfig, store: Store, accounts: Arc<dyn AccountDirectory>) -> Self {
        let hub = Hub::start();

        let media_queue = Arc::new(
            MediaProcessor::new(
                store.clone(),
                config.storage.static_directory.clone(),
                config.media.keep_originals,
            )
            .spawn(config.media.queue_capacity),
        );

        let push = PushQueue::start(&config.push, store.clone());
        let devices = DeviceTokenRegistry::new(store.clone());
        let chat = ChatService::new(store.clone(), hub.clone(), Arc::clone(&accounts), push.clone());

        Self {
            config: Arc::new(config),
            store,
            accounts,
            hub,
            chat,
            media_queue,
            push,
            devices,
        }
    }

    /// Ensure required directories exist
    async fn ensure_directories(config: &ServerConfig) -> AppResult<()> {
        tokio::fs::create_dir_all(&config.storage.data_directory).await?;
        tokio::fs::create_dir_all(config.photos_directory()).await?;
        Ok(())
    }

    /// Stop the hub and both workers, letting each finish its current job
    pub async fn shutdown(&self) {
        self.hub.stop();
        self.media_queue.shutdown().await;
        self.push.shutdown().await;
        tracing::info!("Background components stopped");
    }
}
