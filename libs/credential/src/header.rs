//! The fixed-length credential header.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha224};

use crate::error::CredentialError;

/// Length of the hex-encoded SHA-224 digest that opens a session.
pub const HEADER_LEN: usize = 56;

/// Delimiter that terminates the header.
pub const CRLF: [u8; 2] = [0x0D, 0x0A];

/// A candidate credential header.
///
/// Sniffed headers are built from raw bytes with [`Header::from_bytes`] and
/// may contain anything; only a [`Validator`](crate::Validator) decides
/// whether they name a real credential.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header([u8; HEADER_LEN]);

impl Header {
    /// Wrap raw header bytes without any checks.
    pub const fn from_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive the header a client using `password` will send.
    pub fn from_password(password: &str) -> Self {
        let digest = Sha224::digest(password.as_bytes());
        let encoded = hex::encode(digest);

        let mut bytes = [0u8; HEADER_LEN];
        bytes.copy_from_slice(encoded.as_bytes());
        Self(bytes)
    }

    /// The raw header bytes.
    pub fn as_bytes(&self) -> &[u8; HEADER_LEN] {
        &self.0
    }

    /// Returns true if every byte is an ASCII hex digit.
    pub fn is_hex(&self) -> bool {
        self.0.iter().all(u8::is_ascii_hexdigit)
    }
}

impl TryFrom<&[u8]> for Header {
    type Error = CredentialError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; HEADER_LEN] =
            value
                .try_into()
                .map_err(|_| CredentialError::InvalidLength {
                    expected: HEADER_LEN,
                    actual: value.len(),
                })?;
        Ok(Self(bytes))
    }
}

impl FromStr for Header {
    type Err = CredentialError;

    /// Parse header text, normalizing hex digits to lowercase.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut header = Self::try_from(s.as_bytes())?;
        if let Some(position) = header.0.iter().position(|b| !b.is_ascii_hexdigit()) {
            return Err(CredentialError::InvalidHex { position });
        }
        header.0.make_ascii_lowercase();
        Ok(header)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.escape_ascii())
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Header({})", self)
    }
}
