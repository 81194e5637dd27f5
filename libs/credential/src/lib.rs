//! Proxy credential headers and validation.
//!
//! A credentialed connection opens with a fixed-length header: the
//! lowercase hex encoding of `SHA-224(password)`, followed by CRLF.
//!
//! ```text
//! +-----------------------+---------+----------------+---------+----------+
//! | hex(SHA224(password)) |  CRLF   | Proxy Request  |  CRLF   | Payload  |
//! +-----------------------+---------+----------------+---------+----------+
//! |          56           | X'0D0A' |    Variable    | X'0D0A' | Variable |
//! +-----------------------+---------+----------------+---------+----------+
//! ```
//!
//! This crate provides the [`Header`] type, the [`Validator`] trait consumed
//! by the sniffing listener, and [`MemoryValidator`], an in-memory store with
//! per-credential traffic accounting.

mod error;
mod header;
mod store;

pub use error::CredentialError;
pub use header::{Header, CRLF, HEADER_LEN};
pub use store::{MemoryValidator, Traffic, Validator};
