//! Wire format for replicated writes.
//!
//! Frames are a single opcode byte followed by a u32 big-endian length and
//! a JSON body. JSON keeps the principal payloads readable on the wire and
//! spares the protocol a version bump every time the domain model grows a
//! field.

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use cache::VersionedEntry;

/// Upper bound on a frame body; anything larger is a protocol error
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// The mutation carried by a replication entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReplicationOp {
    /// Add the key to the cluster-wide grow-only key set
    RegisterKey,
    /// Replace the key's slot with this versioned entry
    Put { entry: VersionedEntry },
    /// Clear the key's slot (deletion-by-absence)
    Remove,
}

/// Replication entry propagated to peers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEntry {
    /// Per-origin sequence number, echoed back in acknowledgements
    pub sequence: u64,
    /// Rendered cache key the operation applies to
    pub key: String,
    pub op: ReplicationOp,
    /// Node that created this entry
    pub origin_node: String,
}

pub fn serialize_replication_entry(entry: &ReplicationEntry) -> Vec<u8> {
    serde_json::to_vec(entry).unwrap_or_else(|e| {
        warn!("Failed to serialize replication entry for '{}': {}", entry.key, e);
        Vec::new()
    })
}

/// Decode a replication entry; malformed input is logged and dropped
pub fn deserialize_replication_entry(data: &[u8]) -> Option<ReplicationEntry> {
    match serde_json::from_slice(data) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!("Dropping malformed replication entry: {}", e);
            None
        }
    }
}

/// Write one `opcode + length + body` frame
///
/// The size limit is enforced on both sides of the wire; an oversized
/// body must fail here rather than truncate its length prefix.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    opcode: u8,
    body: &[u8],
) -> tokio::io::Result<()> {
    if body.len() > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame body of {} bytes exceeds limit", body.len()),
        ));
    }
    writer.write_u8(opcode).await?;
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Read the length-prefixed body that follows an opcode
pub async fn read_frame_body<R: AsyncRead + Unpin>(reader: &mut R) -> tokio::io::Result<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame body of {} bytes exceeds limit", len),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}
