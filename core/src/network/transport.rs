//! Transport abstraction
//!
//! The sync layer needs an ordered, reliable-ish byte stream per peer and
//! nothing else. Inbound connections are handed to
//! [`SyncNode::connect`](super::SyncNode::connect) directly; a [`Dialer`]
//! lets the node re-open connections to peers it lost.

use crate::error::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn PeerStream>;

/// Opens a stream to a known peer
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, peer: &str) -> Result<BoxedStream>;
}

#[cfg(feature = "tcp")]
pub use tcp::TcpDialer;

#[cfg(feature = "tcp")]
mod tcp {
    use super::{BoxedStream, Dialer};
    use crate::error::{NetworkErrorKind, Result, SyncError};
    use async_trait::async_trait;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use tokio::net::TcpStream;

    /// Dials peers by a replica id -> `host:port` table
    #[derive(Debug, Default)]
    pub struct TcpDialer {
        addresses: RwLock<HashMap<String, String>>,
    }

    impl TcpDialer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn register(&self, peer: impl Into<String>, address: impl Into<String>) {
            self.addresses.write().insert(peer.into(), address.into());
        }
    }

    #[async_trait]
    impl Dialer for TcpDialer {
        async fn dial(&self, peer: &str) -> Result<BoxedStream> {
            let address = self.addresses.read().get(peer).cloned().ok_or_else(|| {
                SyncError::network(
                    NetworkErrorKind::Unreachable,
                    format!("no address for peer '{}'", peer),
                )
            })?;
            let stream = TcpStream::connect(&address).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
    }
}
