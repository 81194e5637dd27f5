//! Credential header detection.
//!
//! The header is read one byte at a time so that a peer speaking some other
//! protocol is recognized at its first line feed, before any of its payload
//! beyond that line has been consumed. Whatever was read is pushed back onto
//! the connection before it is handed to the fallback consumer.

use std::fmt;
use std::io;
use std::sync::Arc;

use portshare_credential::{Header, Validator, HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::rewind::Rewind;
use crate::config::SniffConfig;

/// Header plus its CRLF delimiter.
const SNIFF_LEN: usize = HEADER_LEN + 2;

/// Why a connection was handed to the fallback consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// A line feed arrived at position `at`, before the header could end.
    EarlyLineFeed { at: usize },
    /// A full header was read but the validator rejected it.
    InvalidCredential,
    /// A read failed with something other than end-of-stream.
    ReadError(io::ErrorKind),
    /// The sniff deadline expired.
    Timeout,
    /// Too many consecutive interrupted reads at one position.
    TooManyInterruptedReads,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::EarlyLineFeed { at } => write!(f, "line feed at offset {}", at),
            FallbackReason::InvalidCredential => write!(f, "invalid credential"),
            FallbackReason::ReadError(kind) => write!(f, "read error: {}", kind),
            FallbackReason::Timeout => write!(f, "sniff timeout"),
            FallbackReason::TooManyInterruptedReads => write!(f, "too many interrupted reads"),
        }
    }
}

/// Result of sniffing a connection.
#[derive(Debug)]
pub enum Sniffed<C> {
    /// Valid header; the next byte read is the first byte after CRLF.
    Matched { conn: Rewind<C>, header: Header },
    /// Not a credentialed connection; every consumed byte was pushed back.
    Fallback {
        conn: Rewind<C>,
        reason: FallbackReason,
    },
    /// The peer closed the stream after `consumed` bytes.
    Disconnected { consumed: usize },
}

impl<C> Sniffed<C> {
    /// Returns true for the matched outcome.
    pub fn is_matched(&self) -> bool {
        matches!(self, Sniffed::Matched { .. })
    }

    /// Returns true for the fallback outcome.
    pub fn is_fallback(&self) -> bool {
        matches!(self, Sniffed::Fallback { .. })
    }
}

/// Per-connection header sniffer.
pub struct HeaderSniffer {
    validator: Arc<dyn Validator>,
    config: SniffConfig,
}

impl HeaderSniffer {
    /// Create a sniffer with default configuration.
    pub fn new(validator: Arc<dyn Validator>) -> Self {
        Self::with_config(validator, SniffConfig::default())
    }

    /// Create a sniffer with custom configuration.
    pub fn with_config(validator: Arc<dyn Validator>, config: SniffConfig) -> Self {
        Self { validator, config }
    }

    /// The validator headers are checked against.
    pub fn validator(&self) -> &dyn Validator {
        self.validator.as_ref()
    }

    /// Classify `conn` by its opening bytes.
    pub async fn sniff<C: AsyncRead + Unpin>(&self, conn: C) -> Sniffed<C> {
        let mut conn = Rewind::new(conn);
        let mut buf = [0u8; SNIFF_LEN];
        // A deadline too far out to represent is no deadline.
        let deadline = self
            .config
            .timeout
            .and_then(|t| Instant::now().checked_add(t));
        let mut interrupted = 0u32;
        let mut n = 0;

        while n < SNIFF_LEN {
            let read = conn.read(&mut buf[n..n + 1]);
            let result = match deadline {
                Some(deadline) => match timeout_at(deadline, read).await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(consumed = n, "Header sniff timed out");
                        return fall_back(conn, &buf[..n], FallbackReason::Timeout);
                    }
                },
                None => read.await,
            };

            match result {
                Ok(0) => {
                    debug!(consumed = n, "Peer closed while reading header");
                    return Sniffed::Disconnected { consumed: n };
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!(consumed = n, error = %e, "Peer closed while reading header");
                    return Sniffed::Disconnected { consumed: n };
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    interrupted += 1;
                    if interrupted > self.config.max_interrupted_reads {
                        debug!(consumed = n, "Header read kept being interrupted");
                        return fall_back(
                            conn,
                            &buf[..n],
                            FallbackReason::TooManyInterruptedReads,
                        );
                    }
                    continue;
                }
                Err(e) => {
                    debug!(consumed = n, error = %e, "Header read failed, rewinding");
                    return fall_back(conn, &buf[..n], FallbackReason::ReadError(e.kind()));
                }
            }
            interrupted = 0;

            // A line ends before the header could have: some other line protocol.
            if buf[n] == b'\n' && n < SNIFF_LEN - 1 {
                return fall_back(conn, &buf[..=n], FallbackReason::EarlyLineFeed { at: n });
            }
            n += 1;
        }

        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&buf[..HEADER_LEN]);
        let header = Header::from_bytes(raw);

        if !self.validator.validate(&header) {
            return fall_back(conn, &buf, FallbackReason::InvalidCredential);
        }

        Sniffed::Matched { conn, header }
    }
}

fn fall_back<C>(mut conn: Rewind<C>, consumed: &[u8], reason: FallbackReason) -> Sniffed<C> {
    conn.unread(consumed);
    Sniffed::Fallback { conn, reason }
}
