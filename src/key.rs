//! Cryptographic key module

use std::fmt;
use std::io::Cursor;

use anyhow::Context as _;
use pgp::composed::Deserializable;
use pgp::ser::Serialize;

use crate::armor::{self, ArmorKind};
use crate::error::{Error, Result};

pub use pgp::composed::{SignedPublicKey, SignedSecretKey};

/// Convenience trait for working with keys.
///
/// This trait is implemented for rPGP's [SignedPublicKey] and
/// [SignedSecretKey] types and accepts keys both armored and binary.
pub trait KeyExt: Serialize + Deserializable + Sized {
    /// Block type of the armored form.
    const ARMOR_KIND: ArmorKind;

    /// Create a key from binary OpenPGP packets.
    fn from_slice(bytes: &[u8]) -> Result<Self> {
        <Self as Deserializable>::from_bytes(Cursor::new(bytes))
            .context("failed to parse key packets")
            .map_err(Error::KeyRejected)
    }

    /// Create a key from either its armored or binary form.
    fn from_asc_or_binary(data: &[u8]) -> Result<Self> {
        let bytes = armor::dearmor_as(data, Self::ARMOR_KIND)?;
        Self::from_slice(&bytes)
    }

    /// Serialise the key to ASCII armor.
    fn to_asc(&self) -> Result<String> {
        let bytes = self
            .to_bytes()
            .context("failed to serialize key")
            .map_err(Error::KeyRejected)?;
        Ok(armor::armor(Self::ARMOR_KIND, &[], &bytes)?)
    }
}

impl KeyExt for SignedPublicKey {
    const ARMOR_KIND: ArmorKind = ArmorKind::PublicKey;
}

impl KeyExt for SignedSecretKey {
    const ARMOR_KIND: ArmorKind = ArmorKind::PrivateKey;
}

fn is_blank(data: &[u8]) -> bool {
    data.iter().all(u8::is_ascii_whitespace)
}

/// Key material supplied by the caller for one decryption call.
///
/// Keys are kept in their serialized form and parsed on demand,
/// an empty public key means no verifier is available.
#[derive(Clone, Copy)]
pub struct KeyMaterial<'a> {
    public_key: &'a [u8],
    private_key: &'a [u8],
    passphrase: &'a str,
}

impl<'a> KeyMaterial<'a> {
    pub fn new(public_key: &'a [u8], private_key: &'a [u8], passphrase: &'a str) -> Self {
        Self {
            public_key,
            private_key,
            passphrase,
        }
    }

    /// Material for checking signatures only.
    pub fn verify_only(public_key: &'a [u8]) -> Self {
        Self::new(public_key, &[], "")
    }

    pub fn passphrase(&self) -> &'a str {
        self.passphrase
    }

    pub fn has_public_key(&self) -> bool {
        !is_blank(self.public_key)
    }

    /// Parses the sender's public key. Returns an empty list if none was supplied.
    pub fn public_keys(&self) -> Result<Vec<SignedPublicKey>> {
        if !self.has_public_key() {
            return Ok(Vec::new());
        }
        let key = SignedPublicKey::from_asc_or_binary(self.public_key)?;
        Ok(vec![key])
    }

    /// Parses the recipient's private key.
    pub fn secret_key(&self) -> Result<SignedSecretKey> {
        if is_blank(self.private_key) {
            return Err(Error::KeyRejected(anyhow::anyhow!("no private key supplied")));
        }
        SignedSecretKey::from_asc_or_binary(self.private_key)
    }
}

impl fmt::Debug for KeyMaterial<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("public_key", &format_args!("{} bytes", self.public_key.len()))
            .field("private_key", &format_args!("{} bytes", self.private_key.len()))
            .field("passphrase", &"<redacted>")
            .finish()
    }
}
