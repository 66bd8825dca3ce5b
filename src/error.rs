//! # Error types.

/// Errors produced while parsing, decrypting or verifying a message.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `BEGIN`/`END` lines are missing or mismatched, or the base64 body is corrupt.
    #[error("Malformed armor: {0}")]
    MalformedArmor(String),

    #[error("Armor checksum mismatch: expected {expected:06X}, got {actual:06X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// A multipart container has no usable boundary parameter.
    #[error("Multipart boundary is missing or empty")]
    MalformedBoundary,

    /// No delimiter line for the declared boundary was found.
    #[error("No delimiter found for boundary {boundary:?}")]
    TruncatedMultipart { boundary: String },

    #[error("Invalid header block: {0}")]
    MalformedHeaders(#[from] mailparse::MailParseError),

    #[error("Unsupported Content-Transfer-Encoding {0:?}")]
    UnsupportedEncoding(String),

    #[error("Failed to decode {encoding} part: {reason}")]
    TransferDecoding { encoding: String, reason: String },

    #[error("MIME nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    /// Key material could not be parsed or is unusable.
    #[error("Key rejected: {0:#}")]
    KeyRejected(anyhow::Error),

    #[error("Decryption failed: {0:#}")]
    Decryption(anyhow::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    /// Returns true if the error prevents any content from being produced
    /// when it hits the element a call is about.
    ///
    /// Transfer-encoding problems only ever affect a single leaf.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::UnsupportedEncoding(_) | Error::TransferDecoding { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_display() {
        let err = Error::ChecksumMismatch {
            expected: 0x0a_bc_de,
            actual: 0x12,
        };
        assert_eq!(
            err.to_string(),
            "Armor checksum mismatch: expected 0ABCDE, got 000012"
        );
    }

    #[test]
    fn test_encoding_errors_are_not_fatal() {
        assert!(!Error::UnsupportedEncoding("x-uuencode".to_string()).is_fatal());
        assert!(Error::MalformedBoundary.is_fatal());
        assert!(Error::Decryption(anyhow::anyhow!("bad passphrase")).is_fatal());
    }
}
