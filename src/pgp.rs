//! OpenPGP helper module using [rPGP facilities](https://github.com/rpgp/rpgp).

use std::io::Cursor;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Duration, Utc};
use pgp::composed::{
    Deserializable, Message, SignedPublicKey, SignedPublicSubKey, SignedSecretKey,
    StandaloneSignature,
};
use pgp::packet::Signature;
use pgp::types::PublicKeyTrait;
use tracing::{debug, info, warn};

use crate::armor::{self, ArmorKind};
use crate::error::Error;
use crate::key::KeyMaterial;
use crate::status::VerificationStatus;

/// Plaintext of an encrypted payload with the result of checking
/// the signature embedded in it.
#[derive(Debug)]
pub struct Decrypted {
    pub content: Vec<u8>,
    pub status: VerificationStatus,
}

/// Cryptographic backend of the decryption pipeline.
///
/// Both operations are pure functions of their inputs.
/// Signature problems are reported as a [VerificationStatus],
/// errors are reserved for unusable key material and undecryptable payloads.
pub trait CryptoProvider: Send + Sync {
    /// Decrypts an armored or binary OpenPGP message.
    fn decrypt(
        &self,
        ciphertext: &[u8],
        keys: &KeyMaterial<'_>,
        reference_time: DateTime<Utc>,
    ) -> crate::Result<Decrypted>;

    /// Checks a detached signature over `content`.
    fn verify_detached(
        &self,
        content: &[u8],
        signature: &[u8],
        keys: &KeyMaterial<'_>,
        reference_time: DateTime<Utc>,
    ) -> crate::Result<VerificationStatus>;
}

/// [CryptoProvider] implemented with rPGP.
#[derive(Debug, Default, Clone, Copy)]
pub struct RpgpProvider;

impl CryptoProvider for RpgpProvider {
    fn decrypt(
        &self,
        ciphertext: &[u8],
        keys: &KeyMaterial<'_>,
        reference_time: DateTime<Utc>,
    ) -> crate::Result<Decrypted> {
        let ctext = armor::dearmor_as(ciphertext, ArmorKind::Message)?;
        let msg = Message::from_bytes(Cursor::new(ctext))
            .context("failed to parse OpenPGP message")
            .map_err(Error::Decryption)?;

        let msg = if matches!(msg, Message::Encrypted { .. }) {
            let secret_key = keys.secret_key()?;
            pk_decrypt(msg, &secret_key, keys.passphrase()).map_err(Error::Decryption)?
        } else {
            info!("OpenPGP message is not encrypted, reading it as is");
            msg.decompress()
                .context("failed to decompress message")
                .map_err(Error::Decryption)?
        };

        let public_keys = keys.public_keys()?;
        let status = message_signature_status(&msg, &public_keys, reference_time);

        let content = msg
            .get_content()
            .context("failed to read decrypted content")
            .map_err(Error::Decryption)?
            .context("decrypted message is empty")
            .map_err(Error::Decryption)?;
        Ok(Decrypted { content, status })
    }

    fn verify_detached(
        &self,
        content: &[u8],
        signature: &[u8],
        keys: &KeyMaterial<'_>,
        reference_time: DateTime<Utc>,
    ) -> crate::Result<VerificationStatus> {
        let public_keys = keys.public_keys()?;
        if public_keys.is_empty() {
            return Ok(VerificationStatus::NoVerifier);
        }
        let signature = match read_detached_signature(signature) {
            Ok(signature) => signature,
            Err(err) => {
                warn!("Cannot parse detached signature: {err:#}");
                return Ok(VerificationStatus::Failed);
            }
        };
        if is_from_future(&signature.signature, reference_time)
            || is_expired(&signature.signature, reference_time)
        {
            return Ok(VerificationStatus::Invalid);
        }

        Ok(signer_status(
            &public_keys,
            reference_time,
            |pkey| signature.verify(pkey, content).is_ok(),
            |subkey| signature.verify(subkey, content).is_ok(),
        ))
    }
}

/// Decrypts the message with the recipient's private key.
fn pk_decrypt(msg: Message, secret_key: &SignedSecretKey, passphrase: &str) -> Result<Message> {
    let passphrase = passphrase.to_string();
    let (msg, _key_ids) = msg
        .decrypt(move || passphrase, &[secret_key])
        .context("failed to decrypt message")?;

    // get_content() will decompress the message if needed,
    // but this avoids decompressing it again to check signatures
    let msg = msg.decompress().context("failed to decompress message")?;

    Ok(msg)
}

fn read_detached_signature(signature: &[u8]) -> Result<StandaloneSignature> {
    let bytes = armor::dearmor_as(signature, ArmorKind::Signature)?;
    let signature = StandaloneSignature::from_bytes(Cursor::new(bytes))
        .context("failed to parse signature packet")?;
    Ok(signature)
}

fn is_from_future(signature: &Signature, reference_time: DateTime<Utc>) -> bool {
    match signature.created() {
        Some(created) if *created > reference_time => {
            warn!("Signature created at {created}, after reference time {reference_time}");
            true
        }
        _ => false,
    }
}

fn is_expired(signature: &Signature, reference_time: DateTime<Utc>) -> bool {
    let (Some(created), Some(lifetime)) =
        (signature.created(), signature.signature_expiration_time())
    else {
        return false;
    };
    // A zero lifetime means the signature does not expire.
    if lifetime.is_zero() {
        return false;
    }
    let expires = *created + *lifetime;
    if expires <= reference_time {
        warn!("Signature expired at {expires}, before reference time {reference_time}");
        return true;
    }
    false
}

fn is_key_expired(
    created: &DateTime<Utc>,
    lifetime: Option<Duration>,
    reference_time: DateTime<Utc>,
) -> bool {
    match lifetime {
        Some(lifetime) if !lifetime.is_zero() => *created + lifetime <= reference_time,
        _ => false,
    }
}

fn subkey_expiration_time(subkey: &SignedPublicSubKey) -> Option<Duration> {
    subkey
        .signatures
        .iter()
        .filter_map(|sig| sig.key_expiration_time())
        .max()
        .copied()
}

/// Looks for the key that made a signature.
///
/// A signature made by a primary key or subkey that had expired
/// at `reference_time` is [VerificationStatus::Invalid].
fn signer_status(
    public_keys: &[SignedPublicKey],
    reference_time: DateTime<Utc>,
    verifies_primary: impl Fn(&SignedPublicKey) -> bool,
    verifies_subkey: impl Fn(&SignedPublicSubKey) -> bool,
) -> VerificationStatus {
    for pkey in public_keys {
        let primary_expired = is_key_expired(
            pkey.primary_key.created_at(),
            pkey.details.key_expiration_time(),
            reference_time,
        );
        let signer_expired = if verifies_primary(pkey) {
            primary_expired
        } else if let Some(subkey) = pkey.public_subkeys.iter().find(|s| verifies_subkey(s)) {
            primary_expired
                || is_key_expired(
                    subkey.key.created_at(),
                    subkey_expiration_time(subkey),
                    reference_time,
                )
        } else {
            continue;
        };

        if signer_expired {
            warn!(
                "Signing key {:?} had expired at reference time {reference_time}",
                pkey.fingerprint()
            );
            return VerificationStatus::Invalid;
        }
        return VerificationStatus::Valid;
    }
    debug!("Signature does not match any supplied key");
    VerificationStatus::Invalid
}

/// Checks the signature embedded into a decrypted message.
fn message_signature_status(
    msg: &Message,
    public_keys_for_validation: &[SignedPublicKey],
    reference_time: DateTime<Utc>,
) -> VerificationStatus {
    let Message::Signed { signature, .. } = msg else {
        return VerificationStatus::NotSigned;
    };
    if public_keys_for_validation.is_empty() {
        return VerificationStatus::NoVerifier;
    }
    if is_from_future(signature, reference_time) || is_expired(signature, reference_time) {
        return VerificationStatus::Invalid;
    }

    signer_status(
        public_keys_for_validation,
        reference_time,
        |pkey| msg.verify(&pkey.primary_key).is_ok(),
        |subkey| msg.verify(subkey).is_ok(),
    )
}
