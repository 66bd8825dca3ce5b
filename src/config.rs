//! # Parser and decryptor options.

use serde::Deserialize;

use crate::error::Result;

/// Default limit for multipart nesting and recursive decryption.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Tunables shared by the MIME parser and the decryption pipeline.
///
/// Options are passed explicitly to every [crate::decrypt::Decryptor] and
/// [crate::mimeparser::parse_mime_with] call, there is no process-wide state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// How many multipart levels (and nested encryption layers) are followed.
    pub max_depth: usize,

    /// Also accept `multipart/encrypted` structures mangled by
    /// Microsoft Exchange, ProtonMail Bridge or Google Workspace footers.
    pub accept_mangled_envelopes: bool,

    /// Retry detached signature checks over CRLF line endings
    /// if the signed part arrived with bare LF.
    pub canonicalize_signed_line_endings: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            accept_mangled_envelopes: true,
            canonicalize_signed_line_endings: true,
        }
    }
}

impl Options {
    /// Reads options from a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}
