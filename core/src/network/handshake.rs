//! Connection handshake
//!
//! Both sides send `Hello` and validate the other's. Any mismatch drops the
//! connection: the handshake fails closed.

use crate::error::{NetworkErrorKind, Result, SyncError};
use crate::protocol::codec::{read_frame, write_frame};
use crate::protocol::{envelope, Envelope, Hello, CAP_DELTA_STATE, PROTOCOL_VERSION};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Check a received `Hello` against local expectations
pub fn validate_hello(local_id: &str, expected_peer: Option<&str>, hello: &Hello) -> Result<()> {
    let fail = |reason: String| Err(SyncError::network(NetworkErrorKind::Handshake, reason));

    if hello.protocol_version != PROTOCOL_VERSION {
        return fail(format!(
            "protocol version {} (expected {})",
            hello.protocol_version, PROTOCOL_VERSION
        ));
    }
    if hello.replica_id.is_empty() {
        return fail("peer sent an empty replica id".to_string());
    }
    if hello.replica_id == local_id {
        return fail(format!("peer claims our own replica id '{}'", local_id));
    }
    if let Some(expected) = expected_peer {
        if hello.replica_id != expected {
            return fail(format!(
                "expected peer '{}', got '{}'",
                expected, hello.replica_id
            ));
        }
    }
    if !hello.capabilities.iter().any(|c| c == CAP_DELTA_STATE) {
        return fail(format!("peer '{}' lacks {}", hello.replica_id, CAP_DELTA_STATE));
    }
    Ok(())
}

/// Exchange `Hello`s within `deadline`; returns the peer's
pub async fn handshake<S>(
    stream: &mut S,
    local: &Hello,
    expected_peer: Option<&str>,
    deadline: Duration,
    max_frame_bytes: usize,
) -> Result<Hello>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = tokio::time::timeout(deadline, exchange(stream, local, max_frame_bytes))
        .await
        .map_err(|_| SyncError::network(NetworkErrorKind::Timeout, "handshake timed out"))??;

    if let Err(err) = validate_hello(&local.replica_id, expected_peer, &remote) {
        warn!(local = %local.replica_id, remote = %remote.replica_id, error = %err, "handshake rejected");
        return Err(err);
    }
    debug!(local = %local.replica_id, remote = %remote.replica_id, "handshake complete");
    Ok(remote)
}

async fn exchange<S>(stream: &mut S, local: &Hello, max_frame_bytes: usize) -> Result<Hello>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, &Envelope::hello(local.clone()), max_frame_bytes).await?;
    match read_frame(stream, max_frame_bytes).await? {
        Some((Envelope { body: Some(envelope::Body::Hello(hello)) }, _)) => Ok(hello),
        Some((other, _)) => Err(SyncError::network(
            NetworkErrorKind::Handshake,
            format!("expected hello, got {}", other.label()),
        )),
        None => Err(SyncError::network(
            NetworkErrorKind::Disconnected,
            "stream closed during handshake",
        )),
    }
}
