//! Out-of-band commit requests from producers.
//!
//! A commit either points the service at chunks that completed (`moves`,
//! equivalent to a shared-memory-update notification for their pages) or
//! carries patches: byte edits to chunks that were already released as
//! complete, used by producers to backfill length fields of nested
//! messages. Patches are buffered and applied when the service acquires
//! the chunk; applying removes the entry, so each `(writer_id, chunk_id)`
//! is committed at most once.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{ChunkId, WriterId};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitDataRequest {
    #[serde(default)]
    pub chunks_to_move: Vec<ChunksToMove>,
    #[serde(default)]
    pub chunks_to_patch: Vec<ChunkToPatch>,
    #[serde(flatten)]
    pub unknown_fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunksToMove {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub chunk: u32,
    #[serde(default)]
    pub target_buffer: u16,
    #[serde(flatten)]
    pub unknown_fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkToPatch {
    #[serde(default)]
    pub writer_id: WriterId,
    #[serde(default)]
    pub chunk_id: ChunkId,
    #[serde(default)]
    pub patches: Vec<ChunkPatch>,
    /// More patches for the same chunk will follow in a later request;
    /// the chunk must not be read until a request with this bit clear
    /// seals it.
    #[serde(default)]
    pub has_more_patches: bool,
    #[serde(flatten)]
    pub unknown_fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkPatch {
    /// Byte offset into the chunk payload.
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(flatten)]
    pub unknown_fields: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commit_request_preserves_unknown_fields() {
        let raw = json!({
            "chunks_to_patch": [{
                "writer_id": 3,
                "chunk_id": 17,
                "patches": [{"offset": 12, "data": [0, 0, 1, 64]}],
                "has_more_patches": false,
                "retry_hint": "none"
            }],
            "batch_epoch": 9
        });
        let req: CommitDataRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(req.chunks_to_patch[0].writer_id, 3);
        assert_eq!(req.chunks_to_patch[0].patches[0].data, vec![0, 0, 1, 64]);

        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["batch_epoch"], 9);
        assert_eq!(back["chunks_to_patch"][0]["retry_hint"], "none");
    }
}
