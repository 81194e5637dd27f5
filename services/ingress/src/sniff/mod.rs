//! Protocol sniffing on a shared port.
//!
//! This module provides:
//! - Connection and raw listener seams
//! - Byte-exact rewinding of consumed bytes
//! - Credential header detection
//! - The sniffing listener that routes each connection to exactly one owner
//!
//! ## Architecture
//!
//! ```text
//! Client -> RawListener -> Rewind -> HeaderSniffer -> Forwarder          (valid header)
//!                                                 -> unread -> accept()  (anything else)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use portshare_ingress::{ListenerConfig, SniffingListener};
//!
//! let listener = SniffingListener::bind(addr, validator, forwarder, ListenerConfig::new()).await?;
//! loop {
//!     let conn = listener.accept().await?;
//!     // serve `conn` as if it had never been inspected
//! }
//! ```

mod conn;
mod forward;
mod listener;
mod rewind;
mod sniffer;

pub use conn::{Connection, RawListener};
pub use forward::Forwarder;
pub use listener::{ListenerStats, SniffingListener};
pub use rewind::{rewind, Rewind};
pub use sniffer::{FallbackReason, HeaderSniffer, Sniffed};
