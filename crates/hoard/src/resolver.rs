use crate::cache::DiskCache;
use crate::download::DownloadQueue;
use crate::events::{lock, Listeners};
use crate::peer::PeerTransferService;
use crate::registry::PackRegistry;
use futures::channel::mpsc;
use futures::StreamExt;
use packrat_core::{
    AssetIdentity, DownloadEvent, PeerEvent, RequestId, ResolutionStage, ResolveEvent,
    ResolveFailure,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

/// Bundled file first, then the disk cache. Never touches the network.
pub fn locate_offline(
    registry: &PackRegistry,
    cache: &DiskCache,
    identity: &AssetIdentity,
) -> Option<(PathBuf, ResolutionStage)> {
    if let Some(path) = registry.local_path(identity) {
        return Some((path, ResolutionStage::Local));
    }
    cache
        .get(identity)
        .map(|path| (path, ResolutionStage::Cache))
}

/// Bookkeeping for one in-flight resolution.
#[derive(Debug, Clone)]
pub struct ResolutionRequest {
    pub request_id: RequestId,
    pub identity: AssetIdentity,
    pub priority: i32,
    pub stage: ResolutionStage,
    pub created_at: Instant,
}

#[derive(Default)]
struct PipelineState {
    requests: HashMap<RequestId, ResolutionRequest>,
    key_to_request: HashMap<String, RequestId>,
    next_id: u64,
}

impl PipelineState {
    fn allocate(&mut self) -> RequestId {
        self.next_id += 1;
        RequestId(self.next_id)
    }

    fn by_key(&self, key: &str) -> Option<ResolutionRequest> {
        let id = self.key_to_request.get(key)?;
        self.requests.get(id).cloned()
    }

    fn take(&mut self, request_id: RequestId) -> Option<ResolutionRequest> {
        let request = self.requests.remove(&request_id)?;
        self.key_to_request.remove(&request.identity.key());
        Some(request)
    }
}

enum SourceEvent {
    Http(DownloadEvent),
    Peer(PeerEvent),
}

struct Inner {
    registry: Arc<PackRegistry>,
    cache: Arc<DiskCache>,
    downloads: DownloadQueue,
    peers: PeerTransferService,
    state: Mutex<PipelineState>,
    listeners: Listeners<ResolveEvent>,
}

/// Turns asset identities into local paths: bundled pack, disk cache, HTTP, then
/// peer streaming from the session host.
///
/// Outcomes are published as [`ResolveEvent`]s to every [`subscribe`](Self::subscribe)r.
/// A network failure only reaches callers once every remaining source is exhausted.
#[derive(Clone)]
pub struct ResolutionPipeline {
    inner: Arc<Inner>,
}

impl ResolutionPipeline {
    pub fn new(
        registry: Arc<PackRegistry>,
        cache: Arc<DiskCache>,
        downloads: DownloadQueue,
        peers: PeerTransferService,
    ) -> Self {
        let http_events = downloads.subscribe().map(SourceEvent::Http);
        let peer_events = peers.subscribe().map(SourceEvent::Peer);
        let inner = Arc::new(Inner {
            registry,
            cache,
            downloads,
            peers,
            state: Mutex::new(PipelineState::default()),
            listeners: Listeners::new(),
        });

        let weak = Arc::downgrade(&inner);
        async_std::task::spawn(route_events(
            weak,
            futures::stream::select(http_events, peer_events),
        ));
        Self { inner }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ResolveEvent> {
        self.inner.listeners.subscribe()
    }

    pub fn registry(&self) -> &Arc<PackRegistry> {
        &self.inner.registry
    }

    pub fn cache(&self) -> &Arc<DiskCache> {
        &self.inner.cache
    }

    pub fn downloads(&self) -> &DownloadQueue {
        &self.inner.downloads
    }

    pub fn peers(&self) -> &PeerTransferService {
        &self.inner.peers
    }

    /// Local bundle, then cache. No network activity.
    pub fn resolve_sync(&self, identity: &AssetIdentity) -> Option<PathBuf> {
        locate_offline(&self.inner.registry, &self.inner.cache, identity).map(|(path, _)| path)
    }

    /// Starts (or joins) a resolution and returns its id. Lower priority is more urgent.
    ///
    /// Offline hits resolve immediately; the events are already queued when this returns.
    pub fn resolve_async(&self, identity: &AssetIdentity, priority: i32) -> RequestId {
        let offline = locate_offline(&self.inner.registry, &self.inner.cache, identity);
        if let Some((path, stage)) = offline {
            let request_id = lock(&self.inner.state).allocate();
            self.emit_stage(request_id, identity, stage);
            self.inner.listeners.emit(ResolveEvent::Resolved {
                request_id,
                identity: identity.clone(),
                path,
            });
            return request_id;
        }

        let key = identity.key();
        let url = self.inner.registry.remote_url(identity);
        let (request_id, stage) = {
            let mut state = lock(&self.inner.state);
            if let Some(&existing) = state.key_to_request.get(&key) {
                let bumped = state.requests.get_mut(&existing).and_then(|request| {
                    (priority < request.priority).then(|| {
                        request.priority = priority;
                        request.stage
                    })
                });
                drop(state);
                if let Some(stage) = bumped {
                    log::debug!("Raising priority of {} to {}", existing, priority);
                    self.forward(identity, stage, url.as_deref(), priority);
                }
                return existing;
            }

            let request_id = state.allocate();
            let stage = if url.is_some() {
                ResolutionStage::Http
            } else if self.inner.peers.can_request() {
                ResolutionStage::P2p
            } else {
                ResolutionStage::Failed
            };
            if stage != ResolutionStage::Failed {
                state.key_to_request.insert(key, request_id);
                state.requests.insert(
                    request_id,
                    ResolutionRequest {
                        request_id,
                        identity: identity.clone(),
                        priority,
                        stage,
                        created_at: Instant::now(),
                    },
                );
            }
            (request_id, stage)
        };

        if stage == ResolutionStage::Failed {
            log::info!("No download sources for {}", identity);
            self.inner.listeners.emit(ResolveEvent::Failed {
                request_id,
                identity: identity.clone(),
                failure: ResolveFailure::NoSources,
            });
            return request_id;
        }

        log::debug!("{} resolving {} via {:?}", request_id, identity, stage);
        self.emit_stage(request_id, identity, stage);
        self.forward(identity, stage, url.as_deref(), priority);
        request_id
    }

    /// Resolves and waits for the outcome.
    pub async fn resolve(
        &self,
        identity: &AssetIdentity,
        priority: i32,
    ) -> Result<PathBuf, ResolveFailure> {
        let mut events = self.subscribe();
        let request_id = self.resolve_async(identity, priority);
        while let Some(event) = events.next().await {
            match event {
                ResolveEvent::Resolved {
                    request_id: id,
                    path,
                    ..
                } if id == request_id => return Ok(path),
                ResolveEvent::Failed {
                    request_id: id,
                    failure,
                    ..
                } if id == request_id => return Err(failure),
                _ => {}
            }
        }
        Err(ResolveFailure::Cancelled)
    }

    /// Starts a resolution for each identity, yielding to the scheduler between them.
    pub async fn preload(&self, identities: &[AssetIdentity], priority: i32) -> Vec<RequestId> {
        let mut ids = Vec::with_capacity(identities.len());
        for identity in identities {
            ids.push(self.resolve_async(identity, priority));
            async_std::task::yield_now().await;
        }
        ids
    }

    /// Forgets a request. Transfers already in flight still finish and land in the cache.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        let Some(request) = lock(&self.inner.state).take(request_id) else {
            return false;
        };
        log::debug!("Cancelled {} ({})", request_id, request.identity);
        self.inner.listeners.emit(ResolveEvent::Failed {
            request_id,
            identity: request.identity,
            failure: ResolveFailure::Cancelled,
        });
        true
    }

    pub fn request(&self, request_id: RequestId) -> Option<ResolutionRequest> {
        lock(&self.inner.state).requests.get(&request_id).cloned()
    }

    /// In-flight requests, oldest first.
    pub fn pending(&self) -> Vec<ResolutionRequest> {
        let mut pending: Vec<_> = lock(&self.inner.state).requests.values().cloned().collect();
        pending.sort_by_key(|r| r.request_id);
        pending
    }

    pub fn resolve_model_sync(
        &self,
        pack_id: &str,
        asset_id: &str,
        variant_id: &str,
    ) -> Option<PathBuf> {
        self.resolve_sync(&AssetIdentity::model(pack_id, asset_id, variant_id))
    }

    pub fn resolve_model_async(
        &self,
        pack_id: &str,
        asset_id: &str,
        variant_id: &str,
        priority: i32,
    ) -> RequestId {
        self.resolve_async(&AssetIdentity::model(pack_id, asset_id, variant_id), priority)
    }

    pub fn resolve_icon_sync(
        &self,
        pack_id: &str,
        asset_id: &str,
        variant_id: &str,
    ) -> Option<PathBuf> {
        self.resolve_sync(&AssetIdentity::icon(pack_id, asset_id, variant_id))
    }

    pub fn resolve_icon_async(
        &self,
        pack_id: &str,
        asset_id: &str,
        variant_id: &str,
        priority: i32,
    ) -> RequestId {
        self.resolve_async(&AssetIdentity::icon(pack_id, asset_id, variant_id), priority)
    }

    /// Cache lookup only; bundled files are not "cached".
    pub fn get_cached_path(&self, identity: &AssetIdentity) -> Option<PathBuf> {
        self.inner.cache.get(identity)
    }

    pub fn is_asset_available(&self, identity: &AssetIdentity) -> bool {
        self.resolve_sync(identity).is_some()
    }

    /// True when the asset is not on disk yet and has to come from HTTP or a peer.
    pub fn needs_download(&self, identity: &AssetIdentity) -> bool {
        !self.is_asset_available(identity)
    }

    /// Whether some source could provide this identity right now.
    pub fn has_source(&self, identity: &AssetIdentity) -> bool {
        self.is_asset_available(identity)
            || self.inner.registry.remote_url(identity).is_some()
            || self.inner.peers.can_request()
    }

    fn forward(
        &self,
        identity: &AssetIdentity,
        stage: ResolutionStage,
        url: Option<&str>,
        priority: i32,
    ) {
        match (stage, url) {
            (ResolutionStage::Http, Some(url)) => {
                self.inner.downloads.request(identity, url, priority, None)
            }
            (ResolutionStage::P2p, _) => {
                if let Err(failure) = self.inner.peers.request(identity, priority) {
                    self.finish_key(&identity.key(), Err(failure.into()));
                }
            }
            _ => {}
        }
    }

    fn emit_stage(&self, request_id: RequestId, identity: &AssetIdentity, stage: ResolutionStage) {
        self.inner.listeners.emit(ResolveEvent::Stage {
            request_id,
            identity: identity.clone(),
            stage,
        });
    }

    fn on_source_event(&self, event: SourceEvent) {
        match event {
            SourceEvent::Http(DownloadEvent::Progress {
                key,
                downloaded,
                total,
                ..
            }) => {
                let fraction = total
                    .filter(|t| *t > 0)
                    .map(|t| (downloaded as f64 / t as f64).min(1.0) as f32);
                self.progress(&key, fraction);
            }
            SourceEvent::Http(DownloadEvent::Completed { key, path, .. }) => {
                self.finish_key(&key, Ok(path));
            }
            SourceEvent::Http(DownloadEvent::Failed { key, failure, .. }) => {
                self.escalate(&key, failure.into());
            }
            SourceEvent::Peer(PeerEvent::Progress {
                identity,
                received,
                total,
            }) => {
                let fraction = (total > 0).then(|| received as f32 / total as f32);
                self.progress(&identity.key(), fraction);
            }
            SourceEvent::Peer(PeerEvent::Completed { identity, path }) => {
                self.finish_key(&identity.key(), Ok(path));
            }
            SourceEvent::Peer(PeerEvent::Failed { identity, failure }) => {
                let key = identity.key();
                let in_p2p = lock(&self.inner.state)
                    .by_key(&key)
                    .is_some_and(|r| r.stage == ResolutionStage::P2p);
                if in_p2p {
                    self.finish_key(&key, Err(failure.into()));
                }
            }
        }
    }

    fn progress(&self, key: &str, fraction: Option<f32>) {
        let Some(request) = lock(&self.inner.state).by_key(key) else {
            return;
        };
        self.inner.listeners.emit(ResolveEvent::Progress {
            request_id: request.request_id,
            identity: request.identity,
            fraction,
        });
    }

    // An HTTP failure is only terminal when peer streaming cannot take over.
    fn escalate(&self, key: &str, failure: ResolveFailure) {
        let escalated = {
            let mut state = lock(&self.inner.state);
            let Some(id) = state.key_to_request.get(key).copied() else {
                return;
            };
            let Some(request) = state.requests.get_mut(&id) else {
                return;
            };
            if request.stage != ResolutionStage::Http {
                return;
            }
            if self.inner.peers.can_request() {
                request.stage = ResolutionStage::P2p;
                Some(request.clone())
            } else {
                None
            }
        };

        match escalated {
            Some(request) => {
                log::info!(
                    "HTTP failed for {} ({}), falling back to peer streaming",
                    request.identity,
                    failure
                );
                self.emit_stage(request.request_id, &request.identity, ResolutionStage::P2p);
                self.forward(&request.identity, ResolutionStage::P2p, None, request.priority);
            }
            None => self.finish_key(key, Err(failure)),
        }
    }

    fn finish_key(&self, key: &str, outcome: Result<PathBuf, ResolveFailure>) {
        let request = {
            let mut state = lock(&self.inner.state);
            let Some(id) = state.key_to_request.get(key).copied() else {
                return;
            };
            state.take(id)
        };
        let Some(request) = request else {
            return;
        };

        let event = match outcome {
            Ok(path) => {
                log::debug!("{} resolved {} -> {:?}", request.request_id, request.identity, path);
                ResolveEvent::Resolved {
                    request_id: request.request_id,
                    identity: request.identity,
                    path,
                }
            }
            Err(failure) => {
                log::warn!("Could not resolve {}: {}", request.identity, failure);
                self.emit_stage(request.request_id, &request.identity, ResolutionStage::Failed);
                ResolveEvent::Failed {
                    request_id: request.request_id,
                    identity: request.identity,
                    failure,
                }
            }
        };
        self.inner.listeners.emit(event);
    }
}

// Lives as long as the pipeline; source events for forgotten keys are dropped.
async fn route_events<S>(pipeline: Weak<Inner>, mut events: S)
where
    S: futures::Stream<Item = SourceEvent> + Unpin,
{
    while let Some(event) = events.next().await {
        let Some(inner) = pipeline.upgrade() else {
            break;
        };
        ResolutionPipeline { inner }.on_source_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadSettings;
    use crate::http::{HttpResponse, HttpTransport};
    use crate::peer::{NoPeers, PeerSettings};
    use async_trait::async_trait;
    use packrat_core::DownloadFailure;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Offline;

    #[async_trait]
    impl HttpTransport for Offline {
        async fn get(&self, _url: &str) -> Result<HttpResponse, DownloadFailure> {
            Err(DownloadFailure::ConnectionRefused)
        }
    }

    fn pipeline(dir: &TempDir) -> ResolutionPipeline {
        let registry = Arc::new(PackRegistry::new());
        let cache = Arc::new(DiskCache::open(dir.path().join("cache"), 1 << 20).unwrap());
        let downloads = DownloadQueue::new(
            Arc::new(Offline),
            cache.clone(),
            DownloadSettings {
                concurrency: 2,
                timeout: Duration::from_secs(5),
                max_redirects: 5,
                max_body_bytes: 1 << 20,
            },
        );
        let peers = PeerTransferService::new(
            Arc::new(NoPeers),
            registry.clone(),
            cache.clone(),
            PeerSettings {
                enabled: true,
                concurrency: 2,
                chunk_size: 1024,
                chunks_per_yield: 4,
                max_bytes: 1024 * 1024,
            },
        );
        ResolutionPipeline::new(registry, cache, downloads, peers)
    }

    #[async_std::test]
    async fn unknown_asset_without_peers_has_no_sources() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let id = AssetIdentity::model("pokemon", "999", "default");
        assert!(pipeline.needs_download(&id));
        assert!(!pipeline.has_source(&id));
        assert_eq!(pipeline.resolve(&id, 0).await, Err(ResolveFailure::NoSources));
        assert!(pipeline.pending().is_empty());
    }

    #[async_std::test]
    async fn cached_asset_resolves_without_bookkeeping() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let id = AssetIdentity::icon("pokemon", "025", "default");
        let stored = pipeline.cache().store(&id, b"png").unwrap();

        assert_eq!(pipeline.resolve_icon_sync("pokemon", "025", "default"), Some(stored.clone()));
        assert_eq!(pipeline.get_cached_path(&id), Some(stored.clone()));
        assert_eq!(pipeline.resolve(&id, 5).await, Ok(stored));
        assert!(pipeline.pending().is_empty());
    }

    #[async_std::test]
    async fn cancel_of_unknown_request_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        assert!(!pipeline.cancel(RequestId(42)));
    }
}
