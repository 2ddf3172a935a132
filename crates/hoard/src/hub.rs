use crate::cache::DiskCache;
use crate::config::HoardConfig;
use crate::download::{DownloadQueue, DownloadSettings};
use crate::http::{HttpTransport, SurfTransport};
use crate::peer::{NoPeers, PeerSettings, PeerTransferService, PeerTransport};
use crate::registry::PackRegistry;
use crate::resolver::ResolutionPipeline;
use anyhow::{Context, Result};
use futures::StreamExt;
use packrat_core::{AssetPack, DownloadEvent, DownloadFailure};
use std::path::PathBuf;
use std::sync::Arc;

/// Application root: builds every component once and wires them together.
#[derive(Clone)]
pub struct AssetHub {
    config: HoardConfig,
    http: Arc<dyn HttpTransport>,
    registry: Arc<PackRegistry>,
    cache: Arc<DiskCache>,
    downloads: DownloadQueue,
    peers: PeerTransferService,
    pipeline: ResolutionPipeline,
}

impl AssetHub {
    /// Production wiring over `surf`. Pass the session transport when in a multiplayer game.
    pub async fn open(config: HoardConfig, peers: Option<Arc<dyn PeerTransport>>) -> Result<Self> {
        let peers = peers.unwrap_or_else(|| Arc::new(NoPeers));
        Self::open_with(config, Arc::new(SurfTransport::new()), peers).await
    }

    pub async fn open_with(
        config: HoardConfig,
        http: Arc<dyn HttpTransport>,
        peer_transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        let cache = DiskCache::open_async(config.cache_dir.clone(), config.cache_budget_bytes)
            .await
            .with_context(|| format!("Failed to open cache at {:?}", config.cache_dir))?;
        let cache = Arc::new(cache);
        let registry = Arc::new(PackRegistry::discover(&config.pack_dirs()));
        log::info!(
            "Asset hub ready: {} packs, {} cached assets ({} bytes of {})",
            registry.len(),
            cache.len(),
            cache.size_bytes(),
            cache.budget_bytes()
        );

        let downloads = DownloadQueue::new(
            http.clone(),
            cache.clone(),
            DownloadSettings::from(&config),
        );
        let peers = PeerTransferService::new(
            peer_transport,
            registry.clone(),
            cache.clone(),
            PeerSettings::from(&config),
        );
        let pipeline = ResolutionPipeline::new(
            registry.clone(),
            cache.clone(),
            downloads.clone(),
            peers.clone(),
        );

        Ok(Self {
            config,
            http,
            registry,
            cache,
            downloads,
            peers,
            pipeline,
        })
    }

    pub fn config(&self) -> &HoardConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PackRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<DiskCache> {
        &self.cache
    }

    pub fn downloads(&self) -> &DownloadQueue {
        &self.downloads
    }

    pub fn peers(&self) -> &PeerTransferService {
        &self.peers
    }

    pub fn pipeline(&self) -> &ResolutionPipeline {
        &self.pipeline
    }

    /// Fetches a manifest over HTTP and makes its assets resolvable.
    pub async fn register_remote_manifest(&self, url: &str) -> Result<Arc<AssetPack>> {
        let settings = DownloadSettings::from(&self.config);
        self.registry
            .fetch_remote(self.http.as_ref(), url, &settings)
            .await
    }

    /// Downloads `url` straight to `destination`, bypassing the cache.
    pub async fn install(
        &self,
        url: &str,
        destination: PathBuf,
        priority: i32,
    ) -> Result<PathBuf, DownloadFailure> {
        let key = DownloadQueue::key_for_path(&destination);
        let mut events = self.downloads.subscribe();
        self.downloads.request_file(url, destination, priority);

        while let Some(event) = events.next().await {
            match event {
                DownloadEvent::Completed { key: k, path, .. } if k == key => return Ok(path),
                DownloadEvent::Failed { key: k, failure, .. } if k == key => return Err(failure),
                _ => {}
            }
        }
        Err(DownloadFailure::Unknown("download queue shut down".to_string()))
    }
}
