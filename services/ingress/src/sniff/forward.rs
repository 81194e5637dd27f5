//! Payload forwarding seam for credentialed connections.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Relays the payload of a credentialed connection.
///
/// The reader starts at the first byte after the header's CRLF. The
/// listener shuts the connection down once `handle` returns, whatever the
/// outcome.
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    /// Relay until either side closes or fails.
    ///
    /// Returns (bytes read from the client, bytes written to the client).
    async fn handle(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> io::Result<(u64, u64)>;
}
