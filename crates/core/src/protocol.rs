use crate::error::{DownloadFailure, PeerFailure, ResolveFailure};
use crate::identity::AssetIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Transport-level participant id.
pub type PeerId = u32;

/// The session host always has this id.
pub const HOST_PEER_ID: PeerId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Where a resolution currently is in the local → cache → HTTP → P2P chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStage {
    Local,
    Cache,
    Http,
    P2p,
    Failed,
}

/// Peer streaming wire messages, all addressed by asset identity rather than request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    RequestAsset {
        asset: AssetIdentity,
    },
    AssetNotFound {
        asset: AssetIdentity,
    },
    AssetHeader {
        asset: AssetIdentity,
        total_chunks: u32,
        original_size: u64,
    },
    AssetChunk {
        asset: AssetIdentity,
        chunk_index: u32,
        #[serde(with = "chunk_bytes")]
        bytes: Vec<u8>,
    },
}

impl PeerMessage {
    pub fn asset(&self) -> &AssetIdentity {
        match self {
            PeerMessage::RequestAsset { asset }
            | PeerMessage::AssetNotFound { asset }
            | PeerMessage::AssetHeader { asset, .. }
            | PeerMessage::AssetChunk { asset, .. } => asset,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// serde_json writes Vec<u8> as an array of numbers; padded base64 is a third larger
// than the raw bytes.
mod chunk_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(|e| D::Error::custom(format!("malformed chunk payload: {}", e)))
    }
}

/// Events published by the HTTP download queue. `key` is the dedup key of the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DownloadEvent {
    Progress {
        key: String,
        identity: Option<AssetIdentity>,
        downloaded: u64,
        total: Option<u64>,
    },
    Completed {
        key: String,
        identity: Option<AssetIdentity>,
        path: PathBuf,
    },
    Failed {
        key: String,
        identity: Option<AssetIdentity>,
        failure: DownloadFailure,
    },
}

/// Events published by the peer transfer service on the requesting side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerEvent {
    Progress {
        identity: AssetIdentity,
        received: u32,
        total: u32,
    },
    Completed {
        identity: AssetIdentity,
        path: PathBuf,
    },
    Failed {
        identity: AssetIdentity,
        failure: PeerFailure,
    },
}

/// Events published by the resolution pipeline to its callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResolveEvent {
    /// The request moved to another source.
    Stage {
        request_id: RequestId,
        identity: AssetIdentity,
        stage: ResolutionStage,
    },
    /// Fraction in `0.0..=1.0`, or `None` when the source does not know the total.
    Progress {
        request_id: RequestId,
        identity: AssetIdentity,
        fraction: Option<f32>,
    },
    Resolved {
        request_id: RequestId,
        identity: AssetIdentity,
        path: PathBuf,
    },
    Failed {
        request_id: RequestId,
        identity: AssetIdentity,
        failure: ResolveFailure,
    },
}

impl ResolveEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            ResolveEvent::Stage { request_id, .. }
            | ResolveEvent::Progress { request_id, .. }
            | ResolveEvent::Resolved { request_id, .. }
            | ResolveEvent::Failed { request_id, .. } => *request_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_message_survives_the_wire() {
        let msg = PeerMessage::AssetChunk {
            asset: AssetIdentity::model("pokemon", "025", "default"),
            chunk_index: 3,
            bytes: vec![0x00, 0x7f, 0xff, 0x10],
        };
        let bytes = msg.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"type\":\"asset_chunk\""));
        assert!(text.contains("\"bytes\":\"AH//EA==\""));
        assert_eq!(PeerMessage::from_bytes(&bytes).unwrap(), msg);
    }

    fn chunk_with_payload(payload: &str) -> String {
        format!(
            r#"{{"type":"asset_chunk","asset":{{"pack_id":"p","asset_id":"a","variant_id":"v","kind":"model"}},"chunk_index":0,"bytes":"{}"}}"#,
            payload
        )
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        for payload in ["abc", "+f", "-f==", "AH//EA=", "not base64!"] {
            let raw = chunk_with_payload(payload);
            assert!(
                PeerMessage::from_bytes(raw.as_bytes()).is_err(),
                "accepted {:?}",
                payload
            );
        }
    }

    #[test]
    fn empty_payload_decodes_to_no_bytes() {
        let raw = chunk_with_payload("");
        match PeerMessage::from_bytes(raw.as_bytes()).unwrap() {
            PeerMessage::AssetChunk { bytes, .. } => assert!(bytes.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
