/// Heartbeat wire payload.
///
/// The payload carries only the advertised TTL, as a MessagePack unsigned
/// integer of milliseconds. Sender identity and sequence number come from
/// the substrate envelope.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Heartbeat {
    ttl_ms: u64,
}

impl Heartbeat {
    /// Sub-millisecond TTLs round up to 1ms.
    pub fn new(ttl: Duration) -> Self {
        let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Self { ttl_ms: ms.max(1) }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ClusterError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    /// Decode a payload. A zero TTL is rejected as malformed.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ClusterError> {
        let hb: Heartbeat = rmp_serde::from_slice(data)?;
        if hb.ttl_ms == 0 {
            return Err(ClusterError::Deserialization("zero ttl".into()));
        }
        Ok(hb)
    }
}
