//! # Decryption and verification of PGP/MIME and inline OpenPGP mail.
//!
//! [decrypt_and_verify] takes a raw message and key material, removes any
//! encryption and signature layers and reports the recovered body, the
//! attachments and the signature status to a [MessageSink].

#![recursion_limit = "256"]
#![warn(
    unused,
    clippy::correctness,
    missing_debug_implementations,
    clippy::all,
    clippy::wildcard_imports,
    clippy::needless_borrow,
    clippy::cast_lossless,
    clippy::explicit_iter_loop,
    clippy::explicit_into_iter_loop,
    clippy::cloned_instead_of_copied
)]
#![cfg_attr(not(test), warn(clippy::indexing_slicing))]
#![cfg_attr(not(test), forbid(clippy::string_slice))]
#![allow(clippy::match_bool, clippy::bool_assert_comparison)]

pub mod armor;
pub mod config;
pub mod decrypt;
pub mod error;
pub mod headerdef;
pub mod key;
pub mod mimeparser;
pub mod pgp;
pub mod sink;
pub mod status;

#[cfg(test)]
mod test_utils;

pub use crate::armor::{armor, unarmor, ArmorKind, ArmorTrailer};
pub use crate::config::Options;
pub use crate::decrypt::{decrypt_and_verify, DecryptedMessage, Decryptor};
pub use crate::error::{Error, Result};
pub use crate::key::KeyMaterial;
pub use crate::mimeparser::{parse_mime, Attachment, Body, ParsedMime};
pub use crate::pgp::{CryptoProvider, Decrypted, RpgpProvider};
pub use crate::sink::{MessageSink, NullSink};
pub use crate::status::VerificationStatus;
