use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest has no pack_id")]
    MissingPackId,
    #[error("invalid {what} id '{id}'")]
    InvalidId { what: &'static str, id: String },
    #[error("failed to read manifest {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache index could not be encoded: {0}")]
    Index(#[from] serde_json::Error),
}

impl CacheError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Classified HTTP download failure. Callers branch on the variant, never on raw codes.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DownloadFailure {
    #[error("connection refused")]
    ConnectionRefused,
    #[error("could not resolve host name")]
    DnsResolutionFailed,
    #[error("TLS handshake failed")]
    TlsHandshakeFailed,
    #[error("server sent no response")]
    NoResponse,
    #[error("response body exceeds the size limit")]
    BodyTooLarge,
    #[error("response body could not be decompressed")]
    DecompressionFailed,
    #[error("request timed out")]
    Timeout,
    #[error("could not write downloaded file: {0}")]
    FileWriteError(String),
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("server answered with HTTP status {0}")]
    HttpStatus(u16),
    #[error("download failed: {0}")]
    Unknown(String),
}

impl DownloadFailure {
    /// Maps a transport error message onto the failure taxonomy.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["connection refused"]) {
            DownloadFailure::ConnectionRefused
        } else if has(&[
            "dns",
            "failed to lookup",
            "name resolution",
            "resolve host",
            "no such host",
        ]) {
            DownloadFailure::DnsResolutionFailed
        } else if has(&["tls", "ssl", "certificate", "handshake"]) {
            DownloadFailure::TlsHandshakeFailed
        } else if has(&["timed out", "timeout"]) {
            DownloadFailure::Timeout
        } else if has(&["decompress", "gzip", "deflate", "brotli", "decode body"]) {
            DownloadFailure::DecompressionFailed
        } else if has(&[
            "connection reset",
            "connection closed",
            "empty response",
            "unexpected eof",
            "broken pipe",
        ]) {
            DownloadFailure::NoResponse
        } else {
            DownloadFailure::Unknown(message.to_string())
        }
    }
}

/// Terminal outcome of one peer transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PeerFailure {
    #[error("host does not have the asset")]
    NotFound,
    #[error("decompressed {actual} bytes, header declared {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("transfer could not be decompressed: {0}")]
    Decompression(String),
    #[error("header declares {original_size} bytes in {total_chunks} chunks, over the limit")]
    TooLarge {
        total_chunks: u32,
        original_size: u64,
    },
    #[error("chunk {index} is outside the declared {total} chunks")]
    ChunkOutOfRange { index: u32, total: u32 },
    #[error("peer disconnected during transfer")]
    Disconnected,
    #[error("could not send to peer: {0}")]
    Send(String),
    #[error("could not read asset for sending: {0}")]
    Read(String),
    #[error("could not store received asset: {0}")]
    Cache(String),
    #[error("peer streaming is not available")]
    Unavailable,
}

/// Why a resolution ended without a path.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ResolveFailure {
    #[error("no download sources available")]
    NoSources,
    #[error("request was cancelled")]
    Cancelled,
    #[error(transparent)]
    Download(#[from] DownloadFailure),
    #[error(transparent)]
    Peer(#[from] PeerFailure),
}
