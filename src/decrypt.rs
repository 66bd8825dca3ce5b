//! End-to-end decryption support.
//!
//! The [Decryptor] parses a message, finds its OpenPGP envelope, drives the
//! [CryptoProvider] and reports the outcome to a [MessageSink].

use chrono::{DateTime, Utc};
use strum_macros::Display;
use tracing::{debug, info, trace, warn};

use crate::armor::{is_armored, ArmorKind};
use crate::config::Options;
use crate::error::{Error, Result};
use crate::key::KeyMaterial;
use crate::mimeparser::{self, Body, ParsedMime, Part};
use crate::pgp::{CryptoProvider, Decrypted, RpgpProvider};
use crate::sink::MessageSink;
use crate::status::VerificationStatus;

/// Progress of a single decryption call.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Start,
    Parsed,
    EnvelopeIdentified,
    Decrypting,
    Verifying,
    Reported,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// Returns true if the pipeline may move from `self` to `next`.
    ///
    /// Decrypted payloads are parsed again, so `Decrypting` leads back to `Parsed`.
    pub fn can_advance_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Start | Decrypting, Parsed) => true,
            (Parsed, EnvelopeIdentified) => true,
            (EnvelopeIdentified, Decrypting | Verifying | Reported) => true,
            (Decrypting | Verifying, Reported) => true,
            (Reported, Done) => true,
            _ => false,
        }
    }
}

/// Content of a message after all protection layers were removed.
#[derive(Debug, Default)]
pub struct DecryptedMessage {
    /// Header block carried inside the encrypted or signed payload.
    pub encrypted_headers: Option<String>,
    pub status: VerificationStatus,
    /// Body and attachments of the innermost layer that could be opened.
    pub parsed: ParsedMime,
}

impl DecryptedMessage {
    /// Invokes the sink callbacks in reporting order.
    fn report(&self, sink: &mut dyn MessageSink) {
        if let Some(headers) = &self.encrypted_headers {
            sink.on_encrypted_headers(headers);
        }
        sink.on_verified(self.status);
        sink.on_body(&self.parsed.body.text, &self.parsed.body.mime_type);
        for attachment in &self.parsed.attachments {
            sink.on_attachment(attachment);
        }
    }
}

/// Decrypts and verifies PGP/MIME and inline PGP messages.
///
/// A `Decryptor` holds no per-message state and can be shared between threads.
#[derive(Debug, Default, Clone)]
pub struct Decryptor<P = RpgpProvider> {
    provider: P,
    options: Options,
}

impl Decryptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: Options) -> Self {
        Self::with_provider(RpgpProvider, options)
    }
}

impl<P: CryptoProvider> Decryptor<P> {
    pub fn with_provider(provider: P, options: Options) -> Self {
        Self { provider, options }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Removes all protection layers of `raw` and returns the result
    /// without reporting it.
    pub fn decrypt_message(
        &self,
        raw: &[u8],
        keys: &KeyMaterial<'_>,
        reference_time: DateTime<Utc>,
    ) -> Result<DecryptedMessage> {
        let mut call = Call::new(self, keys, reference_time);
        call.open(raw, 0).map(|layer| layer.message).map_err(|err| {
            call.advance(PipelineState::Failed);
            err
        })
    }

    /// Decrypts and verifies `raw`, reporting the result to `sink`.
    ///
    /// `reference_time` is the nominal verification time, signatures created after
    /// it are invalid. On a fatal error `sink` only receives
    /// [MessageSink::on_error] and the error is returned.
    pub fn decrypt_and_verify(
        &self,
        raw: &[u8],
        keys: &KeyMaterial<'_>,
        sink: &mut dyn MessageSink,
        reference_time: DateTime<Utc>,
    ) -> Result<()> {
        let mut call = Call::new(self, keys, reference_time);
        match call.open(raw, 0) {
            Ok(layer) => {
                layer.message.report(sink);
                call.advance(PipelineState::Reported);
                call.advance(PipelineState::Done);
                Ok(())
            }
            Err(err) => {
                warn!("Cannot process message: {err}");
                call.advance(PipelineState::Failed);
                sink.on_error(&err);
                Err(err)
            }
        }
    }
}

/// Decrypts and verifies `raw` with rPGP and default [Options].
pub fn decrypt_and_verify(
    raw: &[u8],
    keys: &KeyMaterial<'_>,
    sink: &mut dyn MessageSink,
    reference_time: DateTime<Utc>,
) -> Result<()> {
    Decryptor::new().decrypt_and_verify(raw, keys, sink, reference_time)
}

/// The structural wrapper that identifies a message as protected.
enum Envelope<'a> {
    /// Ciphertext of a `multipart/encrypted` message.
    Encrypted(Vec<u8>),
    /// `multipart/signed` content with its detached signature.
    Signed { content: Part<'a>, signature: Vec<u8> },
    Plain(Part<'a>),
}

fn identify_envelope<'a>(tree: Part<'a>, options: &Options) -> Envelope<'a> {
    let mut payload = get_autocrypt_mime(&tree);
    if payload.is_none() && options.accept_mangled_envelopes {
        payload = get_mixed_up_mime(&tree)
            .or_else(|| get_attachment_mime(&tree))
            .or_else(|| get_footer_mime(&tree));
    }
    if let Some(ciphertext) = payload.and_then(Part::data).map(<[u8]>::to_vec) {
        info!("Found PGP/MIME encrypted payload");
        return Envelope::Encrypted(ciphertext);
    }

    if !is_pgp_signed(&tree) {
        return Envelope::Plain(tree);
    }
    match tree.into_pair() {
        Ok([content, signature]) => {
            info!("Found PGP/MIME signed content");
            Envelope::Signed {
                signature: signature.data().unwrap_or_default().to_vec(),
                content,
            }
        }
        Err(tree) => Envelope::Plain(tree),
    }
}

/// Returns a reference to the encrypted payload of a valid PGP/MIME message.
///
/// Returns `None` if the message is not a valid PGP/MIME message.
fn get_autocrypt_mime<'a, 'b>(part: &'a Part<'b>) -> Option<&'a Part<'b>> {
    if part.mimetype() != "multipart/encrypted" {
        return None;
    }
    if let [first_part, second_part] = part.children() {
        if first_part.mimetype() == "application/pgp-encrypted"
            && second_part.mimetype() == "application/octet-stream"
        {
            Some(second_part)
        } else {
            None
        }
    } else {
        None
    }
}

/// Returns a reference to the encrypted payload of a ["Mixed
/// Up"][pgpmime-message-mangling] message.
///
/// According to [RFC 3156] encrypted messages should have
/// `multipart/encrypted` MIME type and two parts, but Microsoft
/// Exchange and ProtonMail IMAP/SMTP Bridge are known to mangle this
/// structure by changing the type to `multipart/mixed` and prepending
/// an empty part at the start.
///
/// ProtonMail IMAP/SMTP Bridge prepends a part literally saying
/// "Empty Message", so we don't check its contents at all, checking
/// only for `text/plain` type.
///
/// Returns `None` if the message is not a "Mixed Up" message.
///
/// [RFC 3156]: https://www.rfc-editor.org/info/rfc3156
/// [pgpmime-message-mangling]: https://tools.ietf.org/id/draft-dkg-openpgp-pgpmime-message-mangling-00.html
fn get_mixed_up_mime<'a, 'b>(part: &'a Part<'b>) -> Option<&'a Part<'b>> {
    if part.mimetype() != "multipart/mixed" {
        return None;
    }
    if let [first_part, second_part, third_part] = part.children() {
        if first_part.mimetype() == "text/plain"
            && second_part.mimetype() == "application/pgp-encrypted"
            && third_part.mimetype() == "application/octet-stream"
        {
            Some(third_part)
        } else {
            None
        }
    } else {
        None
    }
}

/// Returns a reference to the encrypted payload of a message turned into attachment.
///
/// Google Workspace has an option "Append footer" which appends standard footer defined
/// by administrator to the end of the message. The message is then wrapped into
/// `multipart/mixed` with the original `multipart/encrypted` in front of a
/// `text/plain` footer.
///
/// Some clients do it the other way round and prepend a `text/plain` part.
fn get_attachment_mime<'a, 'b>(part: &'a Part<'b>) -> Option<&'a Part<'b>> {
    if part.mimetype() != "multipart/mixed" {
        return None;
    }
    if let [first_part, second_part] = part.children() {
        if first_part.mimetype() == "text/plain"
            && second_part.mimetype() == "multipart/encrypted"
        {
            get_autocrypt_mime(second_part)
        } else {
            None
        }
    } else {
        None
    }
}

fn get_footer_mime<'a, 'b>(part: &'a Part<'b>) -> Option<&'a Part<'b>> {
    if part.mimetype() != "multipart/mixed" {
        return None;
    }
    match part.children() {
        [encrypted, footers @ ..]
            if !footers.is_empty() && footers.iter().all(|p| p.mimetype() == "text/plain") =>
        {
            get_autocrypt_mime(encrypted)
        }
        _ => None,
    }
}

/// Returns true for a `multipart/signed` message
/// with content and an OpenPGP signature part.
fn is_pgp_signed(part: &Part<'_>) -> bool {
    if part.mimetype() != "multipart/signed" {
        return false;
    }
    matches!(
        part.children(),
        [_, signature] if signature.mimetype() == "application/pgp-signature"
    )
}

fn has_bare_lf(data: &[u8]) -> bool {
    data.iter()
        .enumerate()
        .any(|(i, &b)| b == b'\n' && (i == 0 || data.get(i - 1) != Some(&b'\r')))
}

/// Converts bare LF line endings to CRLF, the canonical form signatures are made over.
fn canonicalize_line_endings(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32);
    let mut prev = 0;
    for &b in data {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

fn non_empty(headers: &str) -> Option<String> {
    if headers.trim().is_empty() {
        None
    } else {
        Some(headers.to_string())
    }
}

fn text_only(content: &[u8]) -> ParsedMime {
    ParsedMime {
        body: Body {
            text: String::from_utf8_lossy(content).into_owned(),
            ..Default::default()
        },
        attachments: Vec::new(),
    }
}

/// Errors that only concern the content of one decrypted layer,
/// the layer itself is still shown.
fn is_layer_local(err: &Error) -> bool {
    matches!(
        err,
        Error::Decryption(_)
            | Error::MalformedArmor(_)
            | Error::ChecksumMismatch { .. }
            | Error::MalformedBoundary
            | Error::TruncatedMultipart { .. }
            | Error::MalformedHeaders(_)
    )
}

/// One opened protection layer.
struct Layer {
    /// Header block of the layer's root entity.
    root_headers: String,
    message: DecryptedMessage,
}

/// State of a single [Decryptor] call.
struct Call<'c, P> {
    decryptor: &'c Decryptor<P>,
    keys: &'c KeyMaterial<'c>,
    reference_time: DateTime<Utc>,
    state: PipelineState,
}

impl<'c, P: CryptoProvider> Call<'c, P> {
    fn new(
        decryptor: &'c Decryptor<P>,
        keys: &'c KeyMaterial<'c>,
        reference_time: DateTime<Utc>,
    ) -> Self {
        Self {
            decryptor,
            keys,
            reference_time,
            state: PipelineState::Start,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid pipeline transition {} -> {next}",
            self.state
        );
        trace!(from = %self.state, to = %next, "Pipeline state change");
        self.state = next;
    }

    fn options(&self) -> &'c Options {
        &self.decryptor.options
    }

    /// Parses `raw` and removes its protection layers.
    fn open(&mut self, raw: &[u8], depth: usize) -> Result<Layer> {
        let tree = mimeparser::parse_tree(raw, None, self.options())?;
        self.advance(PipelineState::Parsed);
        let root_headers = tree.headers.clone();

        let envelope = identify_envelope(tree, self.options());
        self.advance(PipelineState::EnvelopeIdentified);

        let message = match envelope {
            Envelope::Encrypted(ciphertext) => {
                self.advance(PipelineState::Decrypting);
                let decrypted = self.decrypt(&ciphertext)?;
                self.open_plaintext(decrypted, depth)?
            }
            Envelope::Signed { content, signature } => {
                self.advance(PipelineState::Verifying);
                let status = self.verify_detached(content.raw_bytes, &signature)?;
                DecryptedMessage {
                    encrypted_headers: non_empty(&content.headers),
                    status,
                    parsed: ParsedMime::from_tree(content),
                }
            }
            Envelope::Plain(tree) => {
                let parsed = ParsedMime::from_tree(tree);
                if is_armored(parsed.body.text.as_bytes(), ArmorKind::Message) {
                    info!("Found inline PGP message");
                    self.advance(PipelineState::Decrypting);
                    let decrypted = self.decrypt(parsed.body.text.as_bytes())?;
                    let mut inner = self.open_plaintext(decrypted, depth)?;
                    let mut attachments = parsed.attachments;
                    attachments.append(&mut inner.parsed.attachments);
                    inner.parsed.attachments = attachments;
                    inner
                } else {
                    DecryptedMessage {
                        encrypted_headers: None,
                        status: VerificationStatus::NotSigned,
                        parsed,
                    }
                }
            }
        };

        Ok(Layer {
            root_headers,
            message,
        })
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Decrypted> {
        self.decryptor
            .provider
            .decrypt(ciphertext, self.keys, self.reference_time)
    }

    fn verify_detached(&self, content: &[u8], signature: &[u8]) -> Result<VerificationStatus> {
        let provider = &self.decryptor.provider;
        let status = provider.verify_detached(content, signature, self.keys, self.reference_time)?;
        if status == VerificationStatus::Invalid
            && self.options().canonicalize_signed_line_endings
            && has_bare_lf(content)
        {
            let canonical = canonicalize_line_endings(content);
            let retried =
                provider.verify_detached(&canonical, signature, self.keys, self.reference_time)?;
            if retried.is_valid() {
                debug!("Signature is valid over CRLF line endings");
                return Ok(retried);
            }
        }
        Ok(status)
    }

    /// Interprets decrypted content, which may be a MIME document or
    /// another OpenPGP message of its own.
    fn open_plaintext(&mut self, decrypted: Decrypted, depth: usize) -> Result<DecryptedMessage> {
        let Decrypted { content, status } = decrypted;
        let is_nested = mimeparser::is_mime_document(&content)
            || is_armored(&content, ArmorKind::Message);
        if !is_nested {
            return Ok(DecryptedMessage {
                encrypted_headers: None,
                status,
                parsed: text_only(&content),
            });
        }

        let max_depth = self.options().max_depth;
        if depth + 1 > max_depth {
            return Err(Error::NestingTooDeep(max_depth));
        }
        match self.open(&content, depth + 1) {
            Ok(Layer {
                root_headers,
                message: inner,
            }) => Ok(DecryptedMessage {
                encrypted_headers: non_empty(&root_headers).or(inner.encrypted_headers),
                status: status.combine(inner.status),
                parsed: inner.parsed,
            }),
            Err(err) if is_layer_local(&err) => {
                warn!("Showing decrypted layer as is, its content cannot be opened: {err}");
                let parsed = mimeparser::parse_mime_with(&content, None, self.options())
                    .unwrap_or_else(|_| text_only(&content));
                Ok(DecryptedMessage {
                    encrypted_headers: None,
                    status,
                    parsed,
                })
            }
            Err(err) => Err(err),
        }
    }
}
