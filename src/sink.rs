//! # Receiving the results of a decryption call.

use crate::error::Error;
use crate::mimeparser::Attachment;
use crate::status::VerificationStatus;

/// Receiver of the events of one [crate::decrypt::Decryptor::decrypt_and_verify] call.
///
/// For a successful call the order is: [MessageSink::on_encrypted_headers] if the
/// protected payload carried headers, then [MessageSink::on_verified] exactly once,
/// then [MessageSink::on_body] exactly once, then [MessageSink::on_attachment] for
/// every attachment in message order.
/// A failed call only sees a single [MessageSink::on_error].
///
/// All methods default to doing nothing.
pub trait MessageSink {
    fn on_body(&mut self, _text: &str, _mime_type: &str) {}

    fn on_attachment(&mut self, _attachment: &Attachment) {}

    /// Header block found inside the encrypted or signed part.
    fn on_encrypted_headers(&mut self, _headers: &str) {}

    fn on_verified(&mut self, _status: VerificationStatus) {}

    fn on_error(&mut self, _error: &Error) {}
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MessageSink for NullSink {}
