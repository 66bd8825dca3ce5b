//! Utilities to help writing tests.
//!
//! This module is only compiled for test runs.

use chrono::{Duration, SubsecRound, Utc};
use once_cell::sync::Lazy;
use pgp::composed::{
    KeyType as PgpKeyType, Message, SecretKeyParamsBuilder, SignedPublicKey, SignedSecretKey,
    StandaloneSignature, SubkeyParamsBuilder,
};
use pgp::crypto::ecc_curve::ECCCurve;
use pgp::crypto::hash::HashAlgorithm;
use pgp::crypto::sym::SymmetricKeyAlgorithm;
use pgp::packet::{SignatureConfig, SignatureType, Subpacket, SubpacketData};
use pgp::ser::Serialize;
use pgp::types::{CompressionAlgorithm, PublicKeyTrait, SecretKeyTrait, Tag};
use rand::thread_rng;
use smallvec::smallvec;

use crate::armor::{armor, ArmorKind};
use crate::error::Error;
use crate::key::KeyExt;
use crate::mimeparser::Attachment;
use crate::sink::MessageSink;
use crate::status::VerificationStatus;

/// A generated keypair together with its armored forms.
pub(crate) struct TestKeyPair {
    pub public: SignedPublicKey,
    pub secret: SignedSecretKey,
    pub public_asc: String,
    pub secret_asc: String,
    pub passphrase: &'static str,
}

/// Creates an Ed25519 signing key with an X25519 encryption subkey.
fn create_keypair(user_id: &str, passphrase: &'static str) -> TestKeyPair {
    let protection = (!passphrase.is_empty()).then(|| passphrase.to_string());
    let key_params = SecretKeyParamsBuilder::default()
        .key_type(PgpKeyType::EdDSALegacy)
        .can_certify(true)
        .can_sign(true)
        .primary_user_id(user_id.to_string())
        .passphrase(protection.clone())
        .preferred_symmetric_algorithms(smallvec![
            SymmetricKeyAlgorithm::AES256,
            SymmetricKeyAlgorithm::AES128,
        ])
        .preferred_hash_algorithms(smallvec![HashAlgorithm::SHA2_256])
        .preferred_compression_algorithms(smallvec![CompressionAlgorithm::ZLIB])
        .subkey(
            SubkeyParamsBuilder::default()
                .key_type(PgpKeyType::ECDH(ECCCurve::Curve25519))
                .can_encrypt(true)
                .passphrase(protection)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let mut rng = thread_rng();
    let secret = key_params
        .generate(&mut rng)
        .unwrap()
        .sign(&mut rng, || passphrase.into())
        .unwrap();
    let public = secret
        .public_key()
        .sign(&mut rng, &secret, || passphrase.into())
        .unwrap();

    TestKeyPair {
        public_asc: public.to_asc().unwrap(),
        secret_asc: secret.to_asc().unwrap(),
        public,
        secret,
        passphrase,
    }
}

static ALICE: Lazy<TestKeyPair> =
    Lazy::new(|| create_keypair("<alice@example.org>", "alice-passphrase"));
static BOB: Lazy<TestKeyPair> = Lazy::new(|| create_keypair("<bob@example.net>", ""));

/// Alice's keypair, protected with a passphrase.
pub(crate) fn alice_keypair() -> &'static TestKeyPair {
    &ALICE
}

/// Bob's keypair, not protected.
pub(crate) fn bob_keypair() -> &'static TestKeyPair {
    &BOB
}

/// Encrypts `plain` to the recipient's encryption subkey,
/// optionally signing it first.
pub(crate) fn encrypt_for(
    plain: &[u8],
    recipient: &TestKeyPair,
    signer: Option<&TestKeyPair>,
) -> String {
    let mut rng = thread_rng();
    let msg = Message::new_literal_bytes("", plain);
    let msg = match signer {
        Some(signer) => msg
            .sign(
                &mut rng,
                &signer.secret,
                || signer.passphrase.into(),
                HashAlgorithm::SHA2_256,
            )
            .unwrap()
            .compress(CompressionAlgorithm::ZLIB)
            .unwrap(),
        None => msg,
    };
    msg.encrypt_to_keys_seipdv1(
        &mut rng,
        SymmetricKeyAlgorithm::AES128,
        &[&recipient.public.public_subkeys[0]],
    )
    .unwrap()
    .to_armored_string(Default::default())
    .unwrap()
}

/// Creates an armored detached signature over `content`.
pub(crate) fn sign_detached(content: &[u8], signer: &TestKeyPair) -> String {
    let mut rng = thread_rng();
    let signature = Message::new_literal_bytes("", content)
        .sign(
            &mut rng,
            &signer.secret,
            || signer.passphrase.into(),
            HashAlgorithm::SHA2_256,
        )
        .unwrap()
        .into_signature();
    armor(ArmorKind::Signature, &[], &signature.to_bytes().unwrap()).unwrap()
}

/// Signature configuration with the subpackets rPGP puts into its own signatures,
/// followed by `extra` hashed subpackets.
fn signature_config(
    typ: SignatureType,
    signer: &TestKeyPair,
    extra: SubpacketData,
) -> SignatureConfig {
    let mut config = SignatureConfig::v4(typ, signer.secret.algorithm(), HashAlgorithm::SHA2_256);
    config.hashed_subpackets = vec![
        Subpacket::regular(SubpacketData::IssuerFingerprint(signer.secret.fingerprint())),
        Subpacket::regular(SubpacketData::SignatureCreationTime(
            Utc::now().trunc_subsecs(0),
        )),
        Subpacket::regular(extra),
    ];
    config.unhashed_subpackets = vec![Subpacket::regular(SubpacketData::Issuer(
        signer.secret.key_id(),
    ))];
    config
}

/// Creates an armored detached signature over `content`
/// that expires `lifetime` after it was made.
pub(crate) fn sign_detached_expiring(
    content: &[u8],
    signer: &TestKeyPair,
    lifetime: Duration,
) -> String {
    let signature = signature_config(
        SignatureType::Binary,
        signer,
        SubpacketData::SignatureExpirationTime(lifetime),
    )
    .sign(&signer.secret, || signer.passphrase.into(), content)
    .unwrap();
    let bytes = StandaloneSignature::new(signature).to_bytes().unwrap();
    armor(ArmorKind::Signature, &[], &bytes).unwrap()
}

/// Returns the public key of `pair` with a self-certification
/// that lets the key expire `lifetime` after its creation.
pub(crate) fn expiring_public_key(pair: &TestKeyPair, lifetime: Duration) -> SignedPublicKey {
    let mut public = pair.public.clone();
    let user = &mut public.details.users[0];
    let certification = signature_config(
        SignatureType::CertPositive,
        pair,
        SubpacketData::KeyExpirationTime(lifetime),
    )
    .sign_certification(&pair.secret, || pair.passphrase.into(), Tag::UserId, &user.id)
    .unwrap();
    user.signatures.push(certification);
    public
}

/// Sink callback invocation as recorded by [RecordingSink].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SinkEvent {
    Body {
        text: String,
        mime_type: String,
    },
    Attachment {
        mimetype: String,
        data: Vec<u8>,
        decode_error: bool,
    },
    EncryptedHeaders(String),
    Verified(VerificationStatus),
    Error(String),
}

/// [MessageSink] remembering every call in order.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub events: Vec<SinkEvent>,
}

impl MessageSink for RecordingSink {
    fn on_body(&mut self, text: &str, mime_type: &str) {
        self.events.push(SinkEvent::Body {
            text: text.to_string(),
            mime_type: mime_type.to_string(),
        });
    }

    fn on_attachment(&mut self, attachment: &Attachment) {
        self.events.push(SinkEvent::Attachment {
            mimetype: attachment.mimetype.clone(),
            data: attachment.data.clone(),
            decode_error: attachment.decode_error.is_some(),
        });
    }

    fn on_encrypted_headers(&mut self, headers: &str) {
        self.events
            .push(SinkEvent::EncryptedHeaders(headers.to_string()));
    }

    fn on_verified(&mut self, status: VerificationStatus) {
        self.events.push(SinkEvent::Verified(status));
    }

    fn on_error(&mut self, error: &Error) {
        self.events.push(SinkEvent::Error(error.to_string()));
    }
}

/// Sends log output of the library to the test harness.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}
