//! # Hoard: The Supplier
//!
//! **Asset resolution, LRU disk caching, HTTP downloads and host-to-client streaming.**
//!
//! Hoard turns an [`AssetIdentity`](packrat_core::AssetIdentity) (pack, asset, variant, kind)
//! into a file on disk. Sources are tried in a fixed order: the bundled pack, the disk cache,
//! the pack's HTTP URL, and finally a chunked transfer from the session host.
//!
//! ## Core Features
//!
//! - **Pack Registry**: Discovers `manifest.json` files and fetches remote manifests.
//! - **Disk Cache**: Size-bounded, least-recently-used eviction with a self-healing JSON index.
//! - **Download Queue**: Prioritized, deduplicated HTTP with bounded concurrency and
//!   classified failures.
//! - **Peer Streaming**: Compressed, chunked transfers over any reliable ordered transport.
//!
//! ## Usage
//!
//! ### 1. Awaiting a Path
//!
//! ```no_run
//! use packrat_core::AssetIdentity;
//! use packrat_hoard::{AssetHub, HoardConfig};
//!
//! #[async_std::main]
//! async fn main() -> anyhow::Result<()> {
//!     let hub = AssetHub::open(HoardConfig::load()?, None).await?;
//!     let pikachu = AssetIdentity::model("pokemon", "025", "default");
//!
//!     match hub.pipeline().resolve(&pikachu, 0).await {
//!         Ok(path) => println!("Model available at: {:?}", path),
//!         Err(failure) => eprintln!("Showing placeholder: {}", failure),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ### 2. Event-Based Resolution
//!
//! ```no_run
//! use futures::StreamExt;
//! use packrat_core::{AssetIdentity, ResolveEvent};
//! use packrat_hoard::{AssetHub, HoardConfig};
//!
//! #[async_std::main]
//! async fn main() -> anyhow::Result<()> {
//!     let hub = AssetHub::open(HoardConfig::load()?, None).await?;
//!     let mut events = hub.pipeline().subscribe();
//!     let id = hub
//!         .pipeline()
//!         .resolve_async(&AssetIdentity::icon("pokemon", "025", "default"), 10);
//!
//!     while let Some(event) = events.next().await {
//!         if event.request_id() != id {
//!             continue;
//!         }
//!         match event {
//!             ResolveEvent::Stage { stage, .. } => println!("Trying {:?}", stage),
//!             ResolveEvent::Progress { fraction, .. } => println!("Progress: {:?}", fraction),
//!             ResolveEvent::Resolved { path, .. } => {
//!                 println!("Ready: {:?}", path);
//!                 break;
//!             }
//!             ResolveEvent::Failed { failure, .. } => {
//!                 eprintln!("Unavailable: {}", failure);
//!                 break;
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

/// Size-bounded LRU store of downloaded and streamed assets.
pub mod cache;

/// Whole-buffer compression and chunking for peer streaming.
pub mod codec;

/// Settings loaded from defaults, `packrat.toml` and the environment.
pub mod config;

/// Prioritized HTTP download queue.
pub mod download;

mod events;

/// HTTP seam and redirect handling.
pub mod http;

/// Application root that wires the components together.
pub mod hub;

/// Chunked asset streaming between session host and clients.
pub mod peer;

/// Discovered and remote asset packs.
pub mod registry;

/// The local, cache, HTTP, peer fallback chain.
pub mod resolver;

pub use cache::DiskCache;
pub use config::HoardConfig;
pub use download::{DownloadQueue, DownloadSettings};
pub use http::{HttpResponse, HttpTransport, SurfTransport};
pub use hub::AssetHub;
pub use peer::{NoPeers, PeerSettings, PeerTransferService, PeerTransport, TransferState};
pub use registry::PackRegistry;
pub use resolver::{ResolutionPipeline, ResolutionRequest};
