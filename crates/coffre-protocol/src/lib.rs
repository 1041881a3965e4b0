//! Shared wire-format types and constants for coffre IPC and the storage
//! HTTP protocol.
//!
//! This crate is intentionally minimal: DTOs, the handshake version
//! string, resource naming, and transport-level validation. No I/O, no
//! crypto.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coffre_types::Mac;

// ── Handshake ──────────────────────────────────────────────────────────────

/// Version string exchanged during the IPC handshake. Client and daemon
/// must match byte-for-byte unless the client opts out.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

// ── IPC packets ────────────────────────────────────────────────────────────

/// One request from a client to the cached daemon. Exactly one response
/// packet comes back per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPkt {
    /// Pre-derived repository secret; empty when the daemon should derive
    /// the key itself from the store config.
    #[serde(with = "serde_bytes")]
    pub secret: Vec<u8>,
    pub repo_id: Uuid,
    pub store_config: BTreeMap<String, String>,

    /// Push the request but don't wait for the actual execution.
    #[serde(default)]
    pub fire_and_forget: bool,

    /// All-zero requests a full rebuild, otherwise ingest that state file.
    #[serde(default = "zero_mac")]
    pub state_id: Mac,
}

fn zero_mac() -> Mac {
    Mac::ZERO
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePkt {
    /// Empty on success.
    pub err: String,
    pub exit_code: i32,
}

impl ResponsePkt {
    pub fn ok() -> Self {
        ResponsePkt {
            err: String::new(),
            exit_code: 0,
        }
    }

    pub fn failure(err: impl fmt::Display) -> Self {
        ResponsePkt {
            err: err.to_string(),
            exit_code: -1,
        }
    }
}

// ── Storage resources ──────────────────────────────────────────────────────

/// The closed set of resource kinds a store holds. Each resource is
/// content-addressed by MAC; packfiles additionally support range reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Packfile,
    State,
    Lock,
    EccPackfile,
    EccState,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Packfile,
        ResourceKind::State,
        ResourceKind::Lock,
        ResourceKind::EccPackfile,
        ResourceKind::EccState,
    ];

    /// The URL path segment naming this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Packfile => "packfiles",
            ResourceKind::State => "states",
            ResourceKind::Lock => "locks",
            ResourceKind::EccPackfile => "eccpackfiles",
            ResourceKind::EccState => "eccstates",
        }
    }

    /// Parse a URL path segment. Anything outside the closed set is an error.
    pub fn from_path_segment(s: &str) -> Result<ResourceKind, ProtocolError> {
        match s {
            "packfiles" => Ok(ResourceKind::Packfile),
            "states" => Ok(ResourceKind::State),
            "locks" => Ok(ResourceKind::Lock),
            "eccpackfiles" => Ok(ResourceKind::EccPackfile),
            "eccstates" => Ok(ResourceKind::EccState),
            _ => Err(ProtocolError::InvalidResourceType),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Range reads ────────────────────────────────────────────────────────────

/// A byte range on a blob: `length` bytes starting at `offset`.
/// Lengths are bounded by the packfile format's 32-bit blob sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u32,
}

/// Transport-level validation failures on the storage wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidResourceType,
    InvalidMac,
    InvalidRange,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidResourceType => f.write_str("Invalid resource type"),
            ProtocolError::InvalidMac => f.write_str("Invalid MAC"),
            ProtocolError::InvalidRange => f.write_str("Invalid range"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Parse a `Range` header value. Only `bytes=<start>-<end>` with `end`
/// exclusive is accepted; the resulting length must fit in 32 bits.
pub fn parse_range_header(value: &str) -> Result<ByteRange, ProtocolError> {
    let spec = value.strip_prefix("bytes=").ok_or(ProtocolError::InvalidRange)?;
    let (start, end) = spec.split_once('-').ok_or(ProtocolError::InvalidRange)?;

    let offset: u64 = start.parse().map_err(|_| ProtocolError::InvalidRange)?;
    let end: u64 = end.parse().map_err(|_| ProtocolError::InvalidRange)?;

    if end <= offset {
        return Err(ProtocolError::InvalidRange);
    }
    let length = end - offset;
    if length > u32::MAX as u64 {
        return Err(ProtocolError::InvalidRange);
    }

    Ok(ByteRange {
        offset,
        length: length as u32,
    })
}

/// Format the `Range` header for a [`ByteRange`], the inverse of
/// [`parse_range_header`].
pub fn format_range_header(range: ByteRange) -> String {
    format!(
        "bytes={}-{}",
        range.offset,
        range.offset + range.length as u64
    )
}

/// Decode a hex MAC path segment. The decoded value must be exactly 32 bytes.
pub fn mac_from_hex_segment(s: &str) -> Result<Mac, ProtocolError> {
    Mac::from_hex(s).ok_or(ProtocolError::InvalidMac)
}
