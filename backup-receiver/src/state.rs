use crate::config::AppConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::models::settings;
use crate::services::metadata::MetadataStore;
use crate::store::ContentStore;
use std::path::PathBuf;
use std::sync::Arc;

pub struct AppState {
    pub config: AppConfig,
    pub meta: MetadataStore,
    pub store: Arc<ContentStore>,
}

impl AppState {
    /// Creates the data layout, opens and migrates the metadata database, and
    /// restores the storage-location list saved by a previous run. On first
    /// start the list is seeded from the config.
    pub async fn open(config: AppConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_root)?;
        std::fs::create_dir_all(&config.backups_dir)?;

        let pool = create_pool(&config.db_path)?;
        migrate(&pool)?;
        let meta = MetadataStore::new(pool);

        let saved: Option<Vec<PathBuf>> = match meta.setting(settings::STORAGE_LOCATIONS).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(list) => Some(list),
                Err(e) => {
                    tracing::warn!("Ignoring unreadable storage location setting: {}", e);
                    None
                }
            },
            None => None,
        };
        let locations = match saved {
            Some(list) if !list.is_empty() => list,
            _ => {
                let mut list = vec![config.store_dir.clone()];
                for extra in &config.extra_storage_locations {
                    if !list.contains(extra) {
                        list.push(extra.clone());
                    }
                }
                list
            }
        };
        let active = meta
            .setting(settings::ACTIVE_STORAGE_INDEX)
            .await?
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);

        let store = Arc::new(ContentStore::from_dirs(&locations, active)?);
        let state = Self { config, meta, store };
        state.persist_locations().await?;

        let (roots, active) = state.store.locations();
        tracing::info!(locations = roots.len(), active = %roots[active].display(), "Content store ready");
        Ok(state)
    }

    /// Saves the current location list and active index.
    pub async fn persist_locations(&self) -> anyhow::Result<()> {
        let (roots, active) = self.store.locations();
        self.meta
            .set_setting(settings::STORAGE_LOCATIONS, serde_json::to_string(&roots)?)
            .await?;
        self.meta
            .set_setting(settings::ACTIVE_STORAGE_INDEX, active.to_string())
            .await?;
        Ok(())
    }
}
