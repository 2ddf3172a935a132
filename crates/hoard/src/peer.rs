use crate::cache::DiskCache;
use crate::codec;
use crate::config::HoardConfig;
use crate::events::{lock, Listeners};
use crate::registry::PackRegistry;
use crate::resolver::locate_offline;
use anyhow::Result;
use async_trait::async_trait;
use futures::channel::mpsc;
use packrat_core::{AssetIdentity, PeerEvent, PeerFailure, PeerId, PeerMessage, HOST_PEER_ID};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Addressed, reliable, in-order delivery to one remote participant.
///
/// Incoming messages are pushed into [`PeerTransferService::handle_message`] by
/// whoever owns the connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn local_id(&self) -> PeerId;

    fn is_host(&self) -> bool {
        self.local_id() == HOST_PEER_ID
    }

    fn is_connected(&self) -> bool;

    async fn send(&self, to: PeerId, message: PeerMessage) -> Result<()>;
}

/// Transport for a process that is not in a session.
pub struct NoPeers;

#[async_trait]
impl PeerTransport for NoPeers {
    fn local_id(&self) -> PeerId {
        0
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn send(&self, to: PeerId, _message: PeerMessage) -> Result<()> {
        anyhow::bail!("not connected, cannot reach peer {}", to)
    }
}

#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub enabled: bool,
    pub concurrency: usize,
    pub chunk_size: usize,
    pub chunks_per_yield: usize,
    /// Largest asset a client will accept from the host.
    pub max_bytes: u64,
}

impl PeerSettings {
    fn accepts(&self, total_chunks: u32, original_size: u64) -> bool {
        original_size <= self.max_bytes
            && total_chunks <= codec::max_chunks(self.max_bytes, self.chunk_size)
    }
}

impl From<&HoardConfig> for PeerSettings {
    fn from(config: &HoardConfig) -> Self {
        Self {
            enabled: config.peer_streaming,
            concurrency: config.peer_concurrency.max(1),
            chunk_size: config.chunk_size.max(1),
            chunks_per_yield: config.chunks_per_yield.max(1),
            max_bytes: config.max_body_bytes,
        }
    }
}

/// Where a client-side transfer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    /// Request sent, header not yet received.
    Requested,
    Receiving { received: u32, total: u32 },
}

#[derive(Debug, Clone)]
struct QueuedTransfer {
    identity: AssetIdentity,
    priority: i32,
    seq: u64,
}

/// Receiver-side reassembly buffer.
#[derive(Debug)]
struct IncomingTransfer {
    identity: AssetIdentity,
    chunks: Vec<Option<Vec<u8>>>,
    original_size: u64,
}

impl IncomingTransfer {
    fn total(&self) -> u32 {
        self.chunks.len() as u32
    }

    // Full scan rather than a counter: duplicate chunks overwrite their slot and
    // must not be counted twice.
    fn received(&self) -> u32 {
        self.chunks.iter().filter(|slot| slot.is_some()).count() as u32
    }

    fn assemble(self) -> Vec<u8> {
        self.chunks.into_iter().flatten().flatten().collect()
    }
}

#[derive(Default)]
struct PeerState {
    queued: Vec<QueuedTransfer>,
    requested: HashMap<String, AssetIdentity>,
    receiving: HashMap<String, IncomingTransfer>,
    next_seq: u64,
    /// Host side: keys currently being streamed to each peer.
    outgoing: HashMap<PeerId, HashSet<String>>,
}

impl PeerState {
    fn in_flight(&self) -> usize {
        self.requested.len() + self.receiving.len()
    }

    fn sort(&mut self) {
        self.queued.sort_by_key(|t| (t.priority, t.seq));
    }

    fn forget(&mut self, key: &str) -> bool {
        let queued = self.queued.len();
        self.queued.retain(|t| t.identity.key() != key);
        let requested = self.requested.remove(key).is_some();
        let receiving = self.receiving.remove(key).is_some();
        requested || receiving || queued != self.queued.len()
    }
}

struct Inner {
    transport: Arc<dyn PeerTransport>,
    registry: Arc<PackRegistry>,
    cache: Arc<DiskCache>,
    settings: PeerSettings,
    state: Mutex<PeerState>,
    listeners: Listeners<PeerEvent>,
}

/// Chunked asset streaming between a session host and its clients.
///
/// The same service plays both roles: it answers requests when the transport
/// says we are the host, and queues/reassembles transfers otherwise.
#[derive(Clone)]
pub struct PeerTransferService {
    inner: Arc<Inner>,
}

impl PeerTransferService {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        registry: Arc<PackRegistry>,
        cache: Arc<DiskCache>,
        settings: PeerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                registry,
                cache,
                settings,
                state: Mutex::new(PeerState::default()),
                listeners: Listeners::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        self.inner.listeners.subscribe()
    }

    /// True when we are a connected, non-host peer with streaming enabled.
    pub fn can_request(&self) -> bool {
        let transport = &self.inner.transport;
        self.inner.settings.enabled && transport.is_connected() && !transport.is_host()
    }

    pub fn transfer_state(&self, identity: &AssetIdentity) -> Option<TransferState> {
        let key = identity.key();
        let state = lock(&self.inner.state);
        if let Some(transfer) = state.receiving.get(&key) {
            return Some(TransferState::Receiving {
                received: transfer.received(),
                total: transfer.total(),
            });
        }
        if state.requested.contains_key(&key) {
            return Some(TransferState::Requested);
        }
        state
            .queued
            .iter()
            .any(|t| t.identity == *identity)
            .then_some(TransferState::Queued)
    }

    /// Queues a transfer from the host. Duplicate requests only raise priority.
    pub fn request(&self, identity: &AssetIdentity, priority: i32) -> Result<(), PeerFailure> {
        if !self.can_request() {
            return Err(PeerFailure::Unavailable);
        }
        let key = identity.key();
        {
            let mut state = lock(&self.inner.state);
            if state.requested.contains_key(&key) || state.receiving.contains_key(&key) {
                return Ok(());
            }
            if let Some(queued) = state.queued.iter_mut().find(|t| t.identity == *identity) {
                if priority < queued.priority {
                    queued.priority = priority;
                    state.sort();
                }
                return Ok(());
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queued.push(QueuedTransfer {
                identity: identity.clone(),
                priority,
                seq,
            });
            state.sort();
        }
        self.pump();
        Ok(())
    }

    /// Feeds one message received from `from` into the protocol.
    pub async fn handle_message(&self, from: PeerId, message: PeerMessage) {
        match message {
            PeerMessage::RequestAsset { asset } => {
                if !self.inner.transport.is_host() {
                    log::debug!("Ignoring asset request from {} while not host", from);
                    return;
                }
                let service = self.clone();
                async_std::task::spawn(async move { service.serve(from, asset).await });
            }
            PeerMessage::AssetNotFound { asset } => {
                if from != HOST_PEER_ID {
                    return;
                }
                let known = lock(&self.inner.state).requested.contains_key(&asset.key());
                if known {
                    log::info!("Host has no copy of {}", asset);
                    self.fail(&asset, PeerFailure::NotFound);
                }
            }
            PeerMessage::AssetHeader {
                asset,
                total_chunks,
                original_size,
            } => {
                if from == HOST_PEER_ID {
                    self.on_header(asset, total_chunks, original_size).await;
                }
            }
            PeerMessage::AssetChunk {
                asset,
                chunk_index,
                bytes,
            } => {
                if from == HOST_PEER_ID {
                    self.on_chunk(asset, chunk_index, bytes).await;
                }
            }
        }
    }

    /// Drops everything tied to `peer`. Losing the host fails every client transfer.
    pub fn peer_disconnected(&self, peer: PeerId) {
        let failed: Vec<AssetIdentity> = {
            let mut state = lock(&self.inner.state);
            if state.outgoing.remove(&peer).is_some() {
                log::info!("Peer {} disconnected, abandoning its transfers", peer);
            }
            if peer != HOST_PEER_ID {
                return;
            }
            let mut failed: Vec<AssetIdentity> =
                state.requested.drain().map(|(_, id)| id).collect();
            failed.extend(state.receiving.drain().map(|(_, t)| t.identity));
            failed.extend(state.queued.drain(..).map(|t| t.identity));
            failed
        };

        for identity in failed {
            self.inner.listeners.emit(PeerEvent::Failed {
                identity,
                failure: PeerFailure::Disconnected,
            });
        }
    }

    fn pump(&self) {
        let to_send: Vec<AssetIdentity> = {
            let mut state = lock(&self.inner.state);
            let mut to_send = Vec::new();
            while state.in_flight() < self.inner.settings.concurrency && !state.queued.is_empty() {
                let next = state.queued.remove(0);
                state.requested.insert(next.identity.key(), next.identity.clone());
                to_send.push(next.identity);
            }
            to_send
        };

        for identity in to_send {
            let service = self.clone();
            async_std::task::spawn(async move {
                log::debug!("Requesting {} from host", identity);
                let message = PeerMessage::RequestAsset {
                    asset: identity.clone(),
                };
                if let Err(e) = service.inner.transport.send(HOST_PEER_ID, message).await {
                    service.fail(&identity, PeerFailure::Send(e.to_string()));
                }
            });
        }
    }

    fn fail(&self, identity: &AssetIdentity, failure: PeerFailure) {
        let known = lock(&self.inner.state).forget(&identity.key());
        if known {
            log::warn!("Peer transfer of {} failed: {}", identity, failure);
            self.inner.listeners.emit(PeerEvent::Failed {
                identity: identity.clone(),
                failure,
            });
        }
        self.pump();
    }

    async fn on_header(&self, asset: AssetIdentity, total_chunks: u32, original_size: u64) {
        let key = asset.key();
        let complete = {
            let mut state = lock(&self.inner.state);
            if !state.requested.contains_key(&key) {
                log::debug!("Unsolicited header for {}", asset);
                return;
            }
            if !self.inner.settings.accepts(total_chunks, original_size) {
                drop(state);
                self.fail(
                    &asset,
                    PeerFailure::TooLarge {
                        total_chunks,
                        original_size,
                    },
                );
                return;
            }
            state.requested.remove(&key);
            let transfer = IncomingTransfer {
                identity: asset.clone(),
                chunks: vec![None; total_chunks as usize],
                original_size,
            };
            if total_chunks == 0 {
                Some(transfer)
            } else {
                state.receiving.insert(key, transfer);
                None
            }
        };

        log::debug!("Receiving {} in {} chunks", asset, total_chunks);
        self.inner.listeners.emit(PeerEvent::Progress {
            identity: asset,
            received: 0,
            total: total_chunks,
        });
        if let Some(transfer) = complete {
            self.finish(transfer).await;
        }
    }

    async fn on_chunk(&self, asset: AssetIdentity, chunk_index: u32, bytes: Vec<u8>) {
        let key = asset.key();
        let outcome = {
            let mut state = lock(&self.inner.state);
            let Some(transfer) = state.receiving.get_mut(&key) else {
                log::debug!("Chunk {} for unknown transfer {}", chunk_index, asset);
                return;
            };
            let total = transfer.total();
            match transfer.chunks.get_mut(chunk_index as usize) {
                None => Err(PeerFailure::ChunkOutOfRange {
                    index: chunk_index,
                    total,
                }),
                Some(slot) => {
                    *slot = Some(bytes);
                    let received = transfer.received();
                    let done = if received == total {
                        state.receiving.remove(&key)
                    } else {
                        None
                    };
                    Ok((received, total, done))
                }
            }
        };

        match outcome {
            Err(failure) => self.fail(&asset, failure),
            Ok((received, total, done)) => {
                self.inner.listeners.emit(PeerEvent::Progress {
                    identity: asset,
                    received,
                    total,
                });
                if let Some(transfer) = done {
                    self.finish(transfer).await;
                }
            }
        }
    }

    // Decompress, verify and write through the cache off the cooperative thread.
    async fn finish(&self, transfer: IncomingTransfer) {
        let identity = transfer.identity.clone();
        let cache = self.inner.cache.clone();
        let target = identity.clone();
        let result = async_std::task::spawn_blocking(move || {
            let original_size = transfer.original_size;
            let data = codec::decompress(&transfer.assemble(), original_size)?;
            cache
                .store(&target, &data)
                .map_err(|e| PeerFailure::Cache(e.to_string()))
        })
        .await;

        let event = match result {
            Ok(path) => {
                log::info!("Received {} from host -> {:?}", identity, path);
                PeerEvent::Completed { identity, path }
            }
            Err(failure) => {
                log::warn!("Peer transfer of {} failed: {}", identity, failure);
                PeerEvent::Failed { identity, failure }
            }
        };
        self.inner.listeners.emit(event);
        self.pump();
    }

    async fn serve(&self, peer: PeerId, asset: AssetIdentity) {
        let key = asset.key();
        let fresh = lock(&self.inner.state)
            .outgoing
            .entry(peer)
            .or_default()
            .insert(key.clone());
        if !fresh {
            log::debug!("Already streaming {} to peer {}", asset, peer);
            return;
        }

        if let Err(e) = self.stream_to(peer, &asset).await {
            log::warn!("Streaming {} to peer {} stopped: {}", asset, peer, e);
        }

        let mut state = lock(&self.inner.state);
        if let Some(keys) = state.outgoing.get_mut(&peer) {
            keys.remove(&key);
            if keys.is_empty() {
                state.outgoing.remove(&peer);
            }
        }
    }

    async fn stream_to(&self, peer: PeerId, asset: &AssetIdentity) -> Result<(), PeerFailure> {
        let transport = &self.inner.transport;
        let send = |message: PeerMessage| async move {
            transport
                .send(peer, message)
                .await
                .map_err(|e| PeerFailure::Send(e.to_string()))
        };

        let Some((path, _)) = locate_offline(&self.inner.registry, &self.inner.cache, asset) else {
            log::debug!("Peer {} asked for {}, which we do not have", peer, asset);
            return send(PeerMessage::AssetNotFound {
                asset: asset.clone(),
            })
            .await;
        };

        let prepared = async_std::task::spawn_blocking(move || -> std::io::Result<(Vec<u8>, u64)> {
            let data = std::fs::read(&path)?;
            Ok((codec::compress(&data)?, data.len() as u64))
        })
        .await;
        let (compressed, original_size) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                send(PeerMessage::AssetNotFound {
                    asset: asset.clone(),
                })
                .await?;
                return Err(PeerFailure::Read(e.to_string()));
            }
        };

        let chunk_size = self.inner.settings.chunk_size;
        let total_chunks = codec::chunk_count(compressed.len(), chunk_size);
        log::info!(
            "Streaming {} to peer {}: {} bytes in {} chunks",
            asset,
            peer,
            original_size,
            total_chunks
        );
        send(PeerMessage::AssetHeader {
            asset: asset.clone(),
            total_chunks,
            original_size,
        })
        .await?;

        let key = asset.key();
        for (index, chunk) in codec::split(&compressed, chunk_size).into_iter().enumerate() {
            if !self.still_serving(peer, &key) {
                return Err(PeerFailure::Disconnected);
            }
            send(PeerMessage::AssetChunk {
                asset: asset.clone(),
                chunk_index: index as u32,
                bytes: chunk.to_vec(),
            })
            .await?;
            if (index + 1) % self.inner.settings.chunks_per_yield == 0 {
                async_std::task::yield_now().await;
            }
        }
        Ok(())
    }

    fn still_serving(&self, peer: PeerId, key: &str) -> bool {
        lock(&self.inner.state)
            .outgoing
            .get(&peer)
            .is_some_and(|keys| keys.contains(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(slots: usize) -> IncomingTransfer {
        IncomingTransfer {
            identity: AssetIdentity::model("pokemon", "025", "default"),
            chunks: vec![None; slots],
            original_size: 0,
        }
    }

    #[test]
    fn duplicate_chunks_are_counted_once() {
        let mut t = transfer(3);
        t.chunks[1] = Some(vec![1]);
        t.chunks[1] = Some(vec![1]);
        assert_eq!(t.received(), 1);
        t.chunks[0] = Some(vec![0]);
        t.chunks[2] = Some(vec![2, 3]);
        assert_eq!(t.received(), t.total());
        assert_eq!(t.assemble(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn forget_clears_every_stage() {
        let id = AssetIdentity::model("pokemon", "025", "default");
        let mut state = PeerState::default();
        state.queued.push(QueuedTransfer {
            identity: id.clone(),
            priority: 0,
            seq: 0,
        });
        assert!(state.forget(&id.key()));
        assert!(!state.forget(&id.key()));
        assert_eq!(state.in_flight(), 0);
    }

    #[test]
    fn headers_beyond_the_transfer_limit_are_refused() {
        let settings = PeerSettings {
            enabled: true,
            concurrency: 2,
            chunk_size: 1024,
            chunks_per_yield: 4,
            max_bytes: 10 * 1024,
        };
        assert!(settings.accepts(10, 10 * 1024));
        assert!(settings.accepts(11, 10 * 1024));
        assert!(!settings.accepts(u32::MAX, 10));
        assert!(!settings.accepts(1, 10 * 1024 + 1));
    }

    #[async_std::test]
    async fn offline_service_refuses_requests() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = Arc::new(DiskCache::open(dir.path(), 1024).unwrap());
        let service = PeerTransferService::new(
            Arc::new(NoPeers),
            Arc::new(PackRegistry::new()),
            cache,
            PeerSettings {
                enabled: true,
                concurrency: 2,
                chunk_size: 16,
                chunks_per_yield: 4,
                max_bytes: 1024,
            },
        );
        assert!(!service.can_request());
        assert_eq!(
            service.request(&AssetIdentity::model("p", "a", "v"), 0),
            Err(PeerFailure::Unavailable)
        );
    }
}
