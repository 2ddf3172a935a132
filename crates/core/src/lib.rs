//! Shared vocabulary for packrat: asset identities, pack manifests, the peer
//! streaming wire format, component events and the failure taxonomy.

pub mod error;
pub mod identity;
pub mod manifest;
pub mod protocol;

pub use error::{CacheError, DownloadFailure, ManifestError, PeerFailure, ResolveFailure};
pub use identity::{AssetIdentity, AssetKind};
pub use manifest::{AssetDescriptor, AssetPack, AssetVariant, PackManifest};
pub use protocol::{
    DownloadEvent, PeerEvent, PeerId, PeerMessage, RequestId, ResolutionStage, ResolveEvent,
    HOST_PEER_ID,
};
