pub mod config;
pub mod error;
pub mod sniff;

pub use config::{ListenerConfig, SniffConfig};
pub use error::{is_closed_error, ListenerError};
pub use portshare_credential::{Header, MemoryValidator, Validator, CRLF, HEADER_LEN};
pub use sniff::{
    rewind, Connection, FallbackReason, Forwarder, HeaderSniffer, ListenerStats, RawListener,
    Rewind, Sniffed, SniffingListener,
};
