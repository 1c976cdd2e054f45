use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_root: PathBuf,
    pub backups_dir: PathBuf,
    pub store_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_level: String,
    /// Extra blob directories registered on first start, after `store_dir`
    pub extra_storage_locations: Vec<PathBuf>,
    pub max_json_body: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_root = PathBuf::from(
            std::env::var("DATA_ROOT").unwrap_or_else(|_| "./data".into()),
        );

        let mut config = Self::with_data_root(data_root);
        config.port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        config.log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());
        config.extra_storage_locations = std::env::var("STORAGE_LOCATIONS")
            .map(|v| {
                v.split(':')
                    .filter(|s| !s.trim().is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();
        config.max_json_body = std::env::var("MAX_BODY_MB")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(10)
            * 1024
            * 1024;
        config
    }

    /// Defaults with every derived path rooted at `data_root`.
    pub fn with_data_root(data_root: impl AsRef<Path>) -> Self {
        let data_root = data_root.as_ref().to_path_buf();
        Self {
            port: 8080,
            backups_dir: data_root.join("backups"),
            store_dir: data_root.join("store"),
            db_path: data_root.join("metadata.db"),
            data_root,
            log_level: "info".into(),
            extra_storage_locations: Vec::new(),
            max_json_body: 10 * 1024 * 1024,
        }
    }
}
