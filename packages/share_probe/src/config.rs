use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use engine_sharing::config::SharingFileConfig;
use engine_sharing::store::open_store;
use engine_sharing::{Origin, SharedStore, StoreKind, Timings};
use tracing::info;

/// Build a figment that layers: defaults → share.toml → SHARE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `SHARE_TIMING__HEARTBEAT_MS=500`  →  `timing.heartbeat_ms = 500`
///   `SHARE_STORE__KIND=file`  →  `store.kind = "file"`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(SharingFileConfig::default()))
        .merge(Toml::file(config_dir.join("share.toml")))
        .merge(Env::prefixed("SHARE_").split("__"))
}

#[derive(Clone, Debug)]
pub struct ProbeConfig {
    pub config_dir: PathBuf,
    pub file: SharingFileConfig,
}

impl ProbeConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".share-probe"),
        };
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;

        let file: SharingFileConfig = load_config(&config_dir)
            .extract()
            .context("Failed to load share.toml")?;
        info!("Config directory: {}", config_dir.display());

        Ok(Self { config_dir, file })
    }

    pub fn timings(&self) -> Timings {
        Timings::from_file(&self.file.timing)
    }

    pub fn origin(&self) -> Origin {
        let sharing = &self.file.sharing;
        Origin::new(&sharing.origin_host, &sharing.build_id, &sharing.page_protocol)
    }

    /// Where file and cookie stores live unless `store.path` says otherwise.
    pub fn store_path(&self) -> PathBuf {
        match &self.file.store.path {
            Some(path) => path.clone(),
            None => match self.file.store.kind {
                StoreKind::Cookie => self.config_dir.join("store.cookies"),
                _ => self.config_dir.join("store"),
            },
        }
    }

    pub fn open_store(&self) -> Result<Arc<dyn SharedStore>> {
        let path = self.store_path();
        if self.file.store.kind == StoreKind::File {
            std::fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create store directory: {:?}", path))?;
        }
        open_store(self.file.store.kind, Some(&path))
            .with_context(|| format!("Failed to open {} store at {:?}", self.file.store.kind, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_without_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ProbeConfig::new(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(config.timings(), Timings::default());
        assert_eq!(config.file.sharing.namespace, "default");
        assert_eq!(config.store_path(), tmp.path().join("store"));
    }

    #[test]
    fn share_toml_overrides_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("share.toml"),
            r#"
[timing]
heartbeat_ms = 250

[store]
kind = "cookie"

[sharing]
namespace = "editor"
on_found = "ATTACH_FAST"
"#,
        )
        .unwrap();

        let config = ProbeConfig::new(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(config.timings().heartbeat, Duration::from_millis(250));
        assert_eq!(config.timings().tolerance, Duration::from_millis(2000));
        assert_eq!(config.file.store.kind, StoreKind::Cookie);
        assert_eq!(config.store_path(), tmp.path().join("store.cookies"));
        assert_eq!(config.file.sharing.on_found, "ATTACH_FAST");
        assert_eq!(config.origin().host, "localhost");
    }

    #[test]
    fn explicit_store_path_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let elsewhere = tmp.path().join("elsewhere");
        std::fs::write(
            tmp.path().join("share.toml"),
            format!("[store]\nkind = \"file\"\npath = {:?}\n", elsewhere),
        )
        .unwrap();

        let config = ProbeConfig::new(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(config.store_path(), elsewhere);
        config.open_store().unwrap();
    }
}
