use crate::download::DownloadSettings;
use crate::http::{fetch_text, HttpTransport};
use anyhow::{Context, Result};
use packrat_core::{AssetDescriptor, AssetIdentity, AssetPack, ManifestError};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const MANIFEST_FILE: &str = "manifest.json";
const MAX_MANIFEST_BYTES: u64 = 16 * 1024 * 1024;

/// Known asset packs, keyed by `pack_id`. Later registrations replace earlier ones.
pub struct PackRegistry {
    packs: RwLock<BTreeMap<String, Arc<AssetPack>>>,
}

impl PackRegistry {
    pub fn new() -> Self {
        Self {
            packs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Scans every `<dir>/<pack>/manifest.json`. Bad manifests are logged and skipped.
    pub fn discover(dirs: &[PathBuf]) -> Self {
        let registry = Self::new();
        for dir in dirs {
            let loaded = registry.load_dir(dir);
            log::debug!("Loaded {} packs from {:?}", loaded, dir);
        }
        registry
    }

    /// Loads the packs below `dir`, returning how many were registered.
    pub fn load_dir(&self, dir: &Path) -> usize {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Pack directory {:?} unavailable: {}", dir, e);
                return 0;
            }
        };

        let mut pack_dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.join(MANIFEST_FILE).is_file())
            .collect();
        pack_dirs.sort();

        let mut loaded = 0;
        for pack_dir in pack_dirs {
            match self.load_manifest_file(&pack_dir.join(MANIFEST_FILE)) {
                Ok(_) => loaded += 1,
                Err(e) => log::warn!("Skipping pack at {:?}: {}", pack_dir, e),
            }
        }
        loaded
    }

    /// Parses a local manifest; its directory becomes the pack's base path.
    pub fn load_manifest_file(&self, path: &Path) -> Result<Arc<AssetPack>, ManifestError> {
        let content = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_path = path.parent().map(Path::to_path_buf);
        let pack = AssetPack::parse(&content, base_path)?;
        Ok(self.register(pack))
    }

    /// Registers a manifest fetched from `manifest_url`. Without an explicit
    /// `base_url`, files are looked up next to the manifest.
    pub fn register_remote(
        &self,
        json: &str,
        manifest_url: &str,
    ) -> Result<Arc<AssetPack>, ManifestError> {
        let mut pack = AssetPack::parse(json, None)?;
        if pack.base_url.is_none() {
            pack.base_url = manifest_url
                .rsplit_once('/')
                .map(|(dir, _)| dir.to_string())
                .filter(|dir| dir.contains("://") && !dir.ends_with('/'));
        }
        Ok(self.register(pack))
    }

    /// Downloads and registers a remote manifest.
    pub async fn fetch_remote(
        &self,
        transport: &dyn HttpTransport,
        url: &str,
        settings: &DownloadSettings,
    ) -> Result<Arc<AssetPack>> {
        let json = fetch_text(
            transport,
            url,
            settings.max_redirects,
            settings.timeout,
            MAX_MANIFEST_BYTES,
        )
        .await
        .with_context(|| format!("Failed to fetch manifest {}", url))?;
        let pack = self
            .register_remote(&json, url)
            .with_context(|| format!("Invalid manifest at {}", url))?;
        log::info!(
            "Registered remote pack '{}' with {} assets",
            pack.pack_id,
            pack.asset_count()
        );
        Ok(pack)
    }

    pub fn register(&self, pack: AssetPack) -> Arc<AssetPack> {
        let pack = Arc::new(pack);
        if let Some(previous) = self.write().insert(pack.pack_id.clone(), pack.clone()) {
            log::warn!(
                "Pack '{}' registered twice; {} replaces {}",
                pack.pack_id,
                origin(&pack),
                origin(&previous)
            );
        }
        pack
    }

    pub fn get(&self, pack_id: &str) -> Option<Arc<AssetPack>> {
        self.read().get(pack_id).cloned()
    }

    pub fn packs(&self) -> Vec<Arc<AssetPack>> {
        self.read().values().cloned().collect()
    }

    /// Asset ids and descriptors of one pack, in id order.
    pub fn assets(&self, pack_id: &str) -> Option<Vec<(String, AssetDescriptor)>> {
        let pack = self.get(pack_id)?;
        Some(
            pack.assets
                .iter()
                .map(|(id, descriptor)| (id.clone(), descriptor.clone()))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Whether any pack names this identity, regardless of where the file lives.
    pub fn knows(&self, identity: &AssetIdentity) -> bool {
        self.get(&identity.pack_id)
            .is_some_and(|pack| pack.file_name(identity).is_some())
    }

    /// Bundled file for `identity`, only if it is actually on disk.
    pub fn local_path(&self, identity: &AssetIdentity) -> Option<PathBuf> {
        self.get(&identity.pack_id)?
            .local_path(identity)
            .filter(|path| path.is_file())
    }

    pub fn remote_url(&self, identity: &AssetIdentity) -> Option<String> {
        self.get(&identity.pack_id)?.remote_url(identity)
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<AssetPack>>> {
        self.packs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<AssetPack>>> {
        self.packs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn origin(pack: &AssetPack) -> String {
    match (&pack.base_path, &pack.base_url) {
        (Some(path), _) => path.display().to_string(),
        (None, Some(url)) => url.clone(),
        (None, None) => "<nowhere>".to_string(),
    }
}

impl Default for PackRegistry {
    fn default() -> Self {
        Self::new()
    }
}
