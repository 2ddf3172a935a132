#![allow(dead_code)]

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::{Future, StreamExt};
use packrat_core::{
    AssetIdentity, DownloadEvent, DownloadFailure, PeerId, PeerMessage, HOST_PEER_ID,
};
use packrat_hoard::{
    AssetHub, HoardConfig, HttpResponse, HttpTransport, PeerTransferService, PeerTransport,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const PIKACHU_URL: &str = "https://cdn.example/pikachu.glb";

/// Routes `log` output through the test harness. `RUST_LOG=debug` shows pipeline traces.
pub fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// Fails the test instead of hanging it.
pub async fn within<F: Future>(future: F) -> F::Output {
    async_std::future::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out waiting for the pipeline")
}

/// Poorly compressible bytes, so transfers span several chunks.
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

pub fn pokemon_manifest(model_file: &str) -> String {
    format!(
        r#"{{
            "pack_id": "pokemon",
            "display_name": "Pokemon",
            "assets": {{
                "025": {{
                    "display_name": "Pikachu",
                    "variants": {{ "default": {{ "model_file": "{}", "icon_file": "pikachu.png" }} }}
                }}
            }}
        }}"#,
        model_file
    )
}

/// Writes `<root>/packs/pokemon/manifest.json`, plus the model file when given.
pub fn write_pokemon_pack(root: &Path, model_file: &str, model: Option<&[u8]>) -> PathBuf {
    let pack_dir = root.join("packs").join("pokemon");
    fs::create_dir_all(pack_dir.join("models")).unwrap();
    fs::write(pack_dir.join("manifest.json"), pokemon_manifest(model_file)).unwrap();
    if let Some(bytes) = model {
        fs::write(pack_dir.join("models").join(model_file), bytes).unwrap();
    }
    pack_dir
}

#[derive(Clone)]
pub enum Reply {
    Body(Vec<u8>),
    Status(u16),
    Redirect(String),
    Fail(DownloadFailure),
}

/// In-process HTTP server: canned replies per URL, optional gates, and a call log.
#[derive(Default)]
pub struct ScriptedHttp {
    replies: Mutex<HashMap<String, Reply>>,
    gates: Mutex<HashMap<String, oneshot::Receiver<()>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, url: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(url.to_string(), reply);
    }

    /// The next GET of `url` blocks until the returned sender fires or is dropped.
    pub fn hold(&self, url: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().insert(url.to_string(), rx);
        tx
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl HttpTransport for ScriptedHttp {
    async fn get(&self, url: &str) -> Result<HttpResponse, DownloadFailure> {
        self.calls.lock().unwrap().push(url.to_string());
        let gate = self.gates.lock().unwrap().remove(url);
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or(Reply::Status(404));
        let (status, location, body) = match reply {
            Reply::Body(bytes) => (200, None, bytes),
            Reply::Status(status) => (status, None, Vec::new()),
            Reply::Redirect(to) => (302, Some(to), Vec::new()),
            Reply::Fail(failure) => return Err(failure),
        };
        Ok(HttpResponse {
            status,
            location,
            content_length: Some(body.len() as u64),
            body: Box::new(futures::io::Cursor::new(body)),
        })
    }
}

/// One end of an in-memory session. Messages cross as wire bytes.
pub struct LoopbackTransport {
    id: PeerId,
    outbox: mpsc::UnboundedSender<(PeerId, Vec<u8>)>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    fn local_id(&self) -> PeerId {
        self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, to: PeerId, message: PeerMessage) -> anyhow::Result<()> {
        if !self.is_connected() {
            bail!("peer {} is gone", to);
        }
        let bytes = message.to_bytes()?;
        self.outbox
            .unbounded_send((self.id, bytes))
            .map_err(|e| anyhow!("link closed: {}", e))
    }
}

/// A host (peer 1) and one client joined by ordered in-memory channels.
pub struct Link {
    pub host: Arc<LoopbackTransport>,
    pub client: Arc<LoopbackTransport>,
    to_host: mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>,
    to_client: mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>,
}

pub fn link() -> Link {
    let connected = Arc::new(AtomicBool::new(true));
    let (host_tx, to_host) = mpsc::unbounded();
    let (client_tx, to_client) = mpsc::unbounded();
    Link {
        host: Arc::new(LoopbackTransport {
            id: HOST_PEER_ID,
            outbox: client_tx,
            connected: connected.clone(),
        }),
        client: Arc::new(LoopbackTransport {
            id: 2,
            outbox: host_tx,
            connected,
        }),
        to_host,
        to_client,
    }
}

impl Link {
    /// Delivers host messages to `client` and hands the client's outgoing requests
    /// to the test, which plays the host by hand.
    pub fn attach_client(
        self,
        client: PeerTransferService,
    ) -> mpsc::UnboundedReceiver<(PeerId, Vec<u8>)> {
        async_std::task::spawn(deliver(self.to_client, client, |m| m));
        self.to_host
    }

    /// Starts delivering messages. `tamper` sees every message bound for the client.
    pub fn attach(
        self,
        host: Option<PeerTransferService>,
        client: PeerTransferService,
        tamper: fn(PeerMessage) -> PeerMessage,
    ) {
        match host {
            Some(host) => {
                async_std::task::spawn(deliver(self.to_host, host, |m| m));
            }
            // Keep the link open but let requests vanish.
            None => {
                async_std::task::spawn(self.to_host.for_each(|_| futures::future::ready(())));
            }
        }
        async_std::task::spawn(deliver(self.to_client, client, tamper));
    }
}

async fn deliver(
    mut inbox: mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>,
    service: PeerTransferService,
    tamper: fn(PeerMessage) -> PeerMessage,
) {
    while let Some((from, bytes)) = inbox.next().await {
        let message = PeerMessage::from_bytes(&bytes).expect("undecodable wire message");
        service.handle_message(from, tamper(message)).await;
    }
}

/// The asset named by the next `RequestAsset` the client sent.
pub async fn next_request(
    inbox: &mut mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>,
) -> AssetIdentity {
    let (_, bytes) = within(inbox.next()).await.expect("client link closed");
    match PeerMessage::from_bytes(&bytes).expect("undecodable wire message") {
        PeerMessage::RequestAsset { asset } => asset,
        other => panic!("expected an asset request, got {:?}", other),
    }
}

/// A full hub rooted in its own temp directory.
pub struct Node {
    pub dir: TempDir,
    pub hub: AssetHub,
}

pub async fn node(
    dir: TempDir,
    http: Arc<ScriptedHttp>,
    peers: Arc<dyn PeerTransport>,
    configure: impl FnOnce(&mut HoardConfig),
) -> Node {
    init_logging();
    let mut config = HoardConfig::with_root(dir.path());
    configure(&mut config);
    let hub = AssetHub::open_with(config, http, peers).await.unwrap();
    Node { dir, hub }
}

/// Next completed or failed download, skipping progress.
pub async fn next_outcome(events: &mut mpsc::UnboundedReceiver<DownloadEvent>) -> DownloadEvent {
    within(async {
        loop {
            match events.next().await {
                Some(DownloadEvent::Progress { .. }) => continue,
                Some(event) => return event,
                None => panic!("download queue dropped"),
            }
        }
    })
    .await
}
