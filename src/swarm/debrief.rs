use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use tokio::io::AsyncReadExt;
use tracing::warn;

use super::{conn::Connection, Debrief};

/// Learns something from a peer the moment it is lent out of a gateway.
#[async_trait]
pub trait Debriefer: Send + Sync {
    async fn debrief(&self, conn: &mut dyn Connection) -> Debrief;
}

/// Reads the peer's preferred load as one big-endian `i32`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadPreferenceDebriefer;

#[async_trait]
impl Debriefer for LoadPreferenceDebriefer {
    async fn debrief(&self, conn: &mut dyn Connection) -> Debrief {
        let mut buf = [0u8; 4];
        match conn.read_exact(&mut buf).await {
            Ok(_) => Some(BigEndian::read_i32(&buf)),
            Err(e) => {
                warn!(
                    address = %conn.address(),
                    error = %e,
                    "failed to debrief endpoint"
                );
                None
            }
        }
    }
}

/// For deployments whose peers report nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentDebriefer;

#[async_trait]
impl Debriefer for SilentDebriefer {
    async fn debrief(&self, _conn: &mut dyn Connection) -> Debrief {
        None
    }
}
