//! # MIME message parsing module.
//!
//! The raw message is split into a tree of [Part]s following the boundary
//! parameters of `multipart/*` containers. Leaves are transfer-decoded and then
//! classified into exactly one [Body] and an ordered list of [Attachment]s,
//! see [ParsedMime::from_tree].

use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::{alphabet, Engine as _};
use mailparse::{DispositionType, MailHeader, ParsedContentDisposition, ParsedContentType};
use strum_macros::EnumString;
use tracing::{debug, warn};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::headerdef::{HeaderDef, HeaderDefMap};

/// MIME bodies are often wrapped at odd places and sloppy about padding.
const MIME_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Value of the `Content-Transfer-Encoding` header.
#[derive(Debug, Clone, PartialEq, Eq, Default, EnumString)]
pub enum TransferEncoding {
    #[default]
    #[strum(serialize = "7bit")]
    SevenBit,
    #[strum(serialize = "8bit")]
    EightBit,
    #[strum(serialize = "binary")]
    Binary,
    #[strum(serialize = "base64")]
    Base64,
    #[strum(serialize = "quoted-printable")]
    QuotedPrintable,
    #[strum(default)]
    Other(String),
}

impl TransferEncoding {
    fn parse(value: &str) -> Self {
        let value = value.trim().to_ascii_lowercase();
        TransferEncoding::from_str(&value).unwrap_or(TransferEncoding::Other(value))
    }

    pub fn as_str(&self) -> &str {
        match self {
            TransferEncoding::SevenBit => "7bit",
            TransferEncoding::EightBit => "8bit",
            TransferEncoding::Binary => "binary",
            TransferEncoding::Base64 => "base64",
            TransferEncoding::QuotedPrintable => "quoted-printable",
            TransferEncoding::Other(name) => name,
        }
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<u8>> {
        match self {
            TransferEncoding::SevenBit | TransferEncoding::EightBit | TransferEncoding::Binary => {
                Ok(body.to_vec())
            }
            TransferEncoding::Base64 => {
                let cleaned: Vec<u8> = body
                    .iter()
                    .copied()
                    .filter(|b| !b.is_ascii_whitespace())
                    .collect();
                MIME_BASE64
                    .decode(cleaned)
                    .map_err(|err| Error::TransferDecoding {
                        encoding: self.as_str().to_string(),
                        reason: err.to_string(),
                    })
            }
            TransferEncoding::QuotedPrintable => {
                quoted_printable::decode(body, quoted_printable::ParseMode::Robust).map_err(
                    |err| Error::TransferDecoding {
                        encoding: self.as_str().to_string(),
                        reason: format!("{err:?}"),
                    },
                )
            }
            TransferEncoding::Other(name) => Err(Error::UnsupportedEncoding(name.clone())),
        }
    }
}

/// A node of the MIME tree.
#[derive(Debug)]
pub struct Part<'a> {
    /// Header block as it appeared in the message, without the separating blank line.
    pub headers: String,
    pub ctype: ParsedContentType,
    pub disposition: ParsedContentDisposition,
    /// `Content-ID` without angle brackets.
    pub content_id: Option<String>,
    pub transfer_encoding: TransferEncoding,
    /// The whole entity including headers, exactly as in the input.
    /// This is what a `multipart/signed` signature covers.
    pub raw_bytes: &'a [u8],
    pub body: PartBody<'a>,
}

#[derive(Debug)]
pub enum PartBody<'a> {
    Leaf {
        data: Vec<u8>,
        /// Set if the payload could not be decoded; `data` then holds the raw body.
        decode_error: Option<Error>,
    },
    Multipart {
        boundary: String,
        /// In document order.
        children: Vec<Part<'a>>,
    },
}

impl<'a> Part<'a> {
    pub fn mimetype(&self) -> &str {
        &self.ctype.mimetype
    }

    pub fn children(&self) -> &[Part<'a>] {
        match &self.body {
            PartBody::Multipart { children, .. } => children,
            PartBody::Leaf { .. } => &[],
        }
    }

    pub fn into_children(self) -> Vec<Part<'a>> {
        match self.body {
            PartBody::Multipart { children, .. } => children,
            PartBody::Leaf { .. } => Vec::new(),
        }
    }

    /// Decoded payload of a leaf part.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.body {
            PartBody::Leaf { data, .. } => Some(data),
            PartBody::Multipart { .. } => None,
        }
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self.body, PartBody::Multipart { .. })
    }

    /// Splits a container with exactly two children into them.
    /// Any other part is handed back unchanged.
    pub fn into_pair(self) -> std::result::Result<[Part<'a>; 2], Self> {
        match self.body {
            PartBody::Multipart { boundary, children } => {
                match <[Part<'a>; 2]>::try_from(children) {
                    Ok(pair) => Ok(pair),
                    Err(children) => Err(Part {
                        body: PartBody::Multipart { boundary, children },
                        ..self
                    }),
                }
            }
            PartBody::Leaf { data, decode_error } => Err(Part {
                body: PartBody::Leaf { data, decode_error },
                ..self
            }),
        }
    }

    /// Builds a leaf for a segment that could not be parsed, keeping its raw bytes.
    fn malformed(raw: &'a [u8], err: Error) -> Self {
        let (headers, header_text, body) =
            split_header_block(raw).unwrap_or_else(|_| (Vec::new(), String::new(), raw));
        let mut part = Part {
            headers: header_text,
            ctype: content_type(&headers),
            disposition: content_disposition(&headers),
            content_id: content_id(&headers),
            transfer_encoding: TransferEncoding::default(),
            raw_bytes: raw,
            body: PartBody::Leaf {
                data: body.to_vec(),
                decode_error: Some(err),
            },
        };
        if part.ctype.mimetype.starts_with("multipart/") {
            part.ctype = default_content_type("application/octet-stream");
        }
        part
    }
}

fn default_content_type(mimetype: &str) -> ParsedContentType {
    mailparse::parse_content_type(mimetype)
}

fn content_type(headers: &[MailHeader]) -> ParsedContentType {
    let mut ctype = headers
        .get_header_value(HeaderDef::ContentType)
        .map(|value| mailparse::parse_content_type(&value))
        .unwrap_or_else(|| default_content_type("text/plain"));
    ctype.mimetype = ctype.mimetype.trim().to_ascii_lowercase();
    ctype
}

fn content_disposition(headers: &[MailHeader]) -> ParsedContentDisposition {
    match headers.get_header_value(HeaderDef::ContentDisposition) {
        Some(value) => mailparse::parse_content_disposition(&value),
        None => ParsedContentDisposition {
            disposition: DispositionType::Inline,
            params: BTreeMap::new(),
        },
    }
}

fn content_id(headers: &[MailHeader]) -> Option<String> {
    let value = headers.get_header_value(HeaderDef::ContentId)?;
    let id = value.trim().trim_start_matches('<').trim_end_matches('>').trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Returns true if `raw` begins with something shaped like a header field,
/// i.e. a printable name followed by a colon on the first line.
pub(crate) fn starts_with_header_field(raw: &[u8]) -> bool {
    let Some(colon) = raw.iter().position(|&b| b == b':') else {
        return false;
    };
    colon > 0
        && raw
            .get(..colon)
            .is_some_and(|name| name.iter().all(|b| b.is_ascii_graphic()))
}

/// Returns true if `raw` is a MIME entity with its own `Content-Type`,
/// as opposed to plain text.
pub(crate) fn is_mime_document(raw: &[u8]) -> bool {
    if !starts_with_header_field(raw) {
        return false;
    }
    mailparse::parse_headers(raw)
        .map(|(headers, _)| headers.get_header(HeaderDef::ContentType).is_some())
        .unwrap_or(false)
}

/// Splits an entity into parsed headers, the raw header text and the body.
///
/// Input that does not start with a header field, e.g. a bare armored block or a
/// payload whose headers were stripped, has an empty header block.
fn split_header_block(raw: &[u8]) -> Result<(Vec<MailHeader<'_>>, String, &[u8])> {
    if let Some(body) = raw
        .strip_prefix(b"\r\n")
        .or_else(|| raw.strip_prefix(b"\n"))
    {
        return Ok((Vec::new(), String::new(), body));
    }
    if !starts_with_header_field(raw) {
        return Ok((Vec::new(), String::new(), raw));
    }

    let (headers, body_start) = mailparse::parse_headers(raw)?;
    let header_text = raw.get(..body_start).unwrap_or(raw);
    let header_text = String::from_utf8_lossy(header_text)
        .trim_end_matches(['\r', '\n'])
        .to_string();
    Ok((headers, header_text, raw.get(body_start..).unwrap_or_default()))
}

/// Returns the end of the content preceding a delimiter line at `delimiter_start`.
///
/// The line break before a delimiter belongs to the delimiter (RFC 2046, 5.1.1).
fn content_end(body: &[u8], start: usize, delimiter_start: usize) -> usize {
    let mut end = delimiter_start;
    if end > start && body.get(end - 1) == Some(&b'\n') {
        end -= 1;
        if end > start && body.get(end - 1) == Some(&b'\r') {
            end -= 1;
        }
    }
    end
}

/// Splits a multipart body into the raw segments between delimiter lines.
///
/// Only lines consisting of `--boundary` or `--boundary--`, optionally followed by
/// linear whitespace, are delimiters. A longer boundary of a nested container that
/// merely starts with this one never matches.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<&'a [u8]>> {
    let delimiter = format!("--{boundary}");
    let mut segments = Vec::new();
    let mut current: Option<usize> = None;
    let mut found = false;
    let mut closed = false;
    let mut pos = 0;

    while pos < body.len() {
        let line_end = body
            .get(pos..)
            .and_then(|rest| rest.iter().position(|&b| b == b'\n'))
            .map_or(body.len(), |i| pos + i);
        let next = (line_end + 1).min(body.len());
        let line = body.get(pos..line_end).unwrap_or_default();
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if let Some(rest) = line.strip_prefix(delimiter.as_bytes()) {
            let (is_close, rest) = match rest.strip_prefix(b"--") {
                Some(rest) => (true, rest),
                None => (false, rest),
            };
            if rest.iter().all(|&b| b == b' ' || b == b'\t') {
                found = true;
                if let Some(start) = current.take() {
                    let end = content_end(body, start, pos);
                    segments.push(body.get(start..end).unwrap_or_default());
                }
                if is_close {
                    closed = true;
                    break;
                }
                current = Some(next);
            }
        }
        pos = next;
    }

    if !found {
        return Err(Error::TruncatedMultipart {
            boundary: boundary.to_string(),
        });
    }
    if !closed {
        warn!("Multipart with boundary {boundary:?} is not terminated");
        if let Some(start) = current {
            segments.push(body.get(start..).unwrap_or_default());
        }
    }
    Ok(segments)
}

fn parse_entity<'a>(
    raw: &'a [u8],
    external_boundary: Option<&str>,
    depth: usize,
    options: &Options,
) -> Result<Part<'a>> {
    let (headers, header_text, body) = split_header_block(raw)?;
    let ctype = content_type(&headers);
    let disposition = content_disposition(&headers);
    let content_id = content_id(&headers);
    let transfer_encoding = headers
        .get_header_value(HeaderDef::ContentTransferEncoding)
        .map(|value| TransferEncoding::parse(&value))
        .unwrap_or_default();

    let boundary = match external_boundary {
        Some(boundary) => Some(boundary.to_string()),
        None if ctype.mimetype.starts_with("multipart/") => {
            Some(ctype.params.get("boundary").cloned().unwrap_or_default())
        }
        None => None,
    };

    let body = match boundary {
        Some(boundary) => {
            if boundary.is_empty() {
                return Err(Error::MalformedBoundary);
            }
            if depth >= options.max_depth {
                return Err(Error::NestingTooDeep(options.max_depth));
            }
            let children = split_multipart(body, &boundary)?
                .into_iter()
                .map(|segment| parse_child(segment, depth + 1, options))
                .collect();
            PartBody::Multipart {
                boundary,
                children,
            }
        }
        None => match transfer_encoding.decode(body) {
            Ok(data) => PartBody::Leaf {
                data,
                decode_error: None,
            },
            Err(err) => {
                warn!("Keeping {} part undecoded: {err}", ctype.mimetype);
                PartBody::Leaf {
                    data: body.to_vec(),
                    decode_error: Some(err),
                }
            }
        },
    };

    Ok(Part {
        headers: header_text,
        ctype,
        disposition,
        content_id,
        transfer_encoding,
        raw_bytes: raw,
        body,
    })
}

/// Parses a child segment. Failures stay local to the child.
fn parse_child<'a>(segment: &'a [u8], depth: usize, options: &Options) -> Part<'a> {
    parse_entity(segment, None, depth, options).unwrap_or_else(|err| {
        warn!("Treating malformed MIME part as raw attachment: {err}");
        Part::malformed(segment, err)
    })
}

/// Parses `raw` into a MIME tree.
///
/// `external_boundary` is used when the boundary of the outermost container is
/// known from a wrapping context rather than from the text itself. It overrides any
/// declared boundary and forces the outermost entity to be treated as multipart.
///
/// Errors are returned only if the outermost entity cannot be delimited.
pub fn parse_tree<'a>(
    raw: &'a [u8],
    external_boundary: Option<&str>,
    options: &Options,
) -> Result<Part<'a>> {
    parse_entity(raw, external_boundary, 0, options)
}

/// The main displayable content of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    pub text: String,
    /// `text/plain` or `text/html`.
    pub mime_type: String,
    pub headers: String,
}

impl Default for Body {
    fn default() -> Self {
        Self {
            text: String::new(),
            mime_type: "text/plain".to_string(),
            headers: String::new(),
        }
    }
}

impl Body {
    pub fn is_html(&self) -> bool {
        self.mime_type == "text/html"
    }
}

/// A leaf that is not the body.
#[derive(Debug)]
pub struct Attachment {
    pub headers: String,
    pub data: Vec<u8>,
    pub mimetype: String,
    pub filename: Option<String>,
    /// Set for inline parts that the body can reference as `cid:`.
    pub content_id: Option<String>,
    /// Set if the part is surfaced undecoded.
    pub decode_error: Option<Error>,
}

impl Attachment {
    pub fn is_inline(&self) -> bool {
        self.content_id.is_some()
    }
}

/// Result of [parse_mime].
#[derive(Debug, Default)]
pub struct ParsedMime {
    pub body: Body,
    /// In the order the parts appear in the message.
    pub attachments: Vec<Attachment>,
}

impl ParsedMime {
    /// Classifies the leaves of a MIME tree.
    ///
    /// `text/plain` and `text/html` leaves without `Content-ID` and without
    /// attachment disposition are body candidates. The last candidate inside the
    /// most deeply nested `multipart/alternative` becomes the body, as the richest
    /// representation of an alternative comes last. Candidates that are
    /// alternatives of the body are dropped, any other candidate is kept as an
    /// attachment. All other leaves become attachments, except the signature of
    /// `multipart/signed` and the control part of `multipart/encrypted`.
    pub fn from_tree(tree: Part<'_>) -> Self {
        let mut collector = Collector::default();
        collector.visit(tree);
        collector.finish()
    }

    pub fn attachment_data(&self) -> Vec<&[u8]> {
        self.attachments.iter().map(|a| a.data.as_slice()).collect()
    }

    pub fn attachment_headers(&self) -> Vec<&str> {
        self.attachments.iter().map(|a| a.headers.as_str()).collect()
    }
}

/// A text leaf that may become the body.
#[derive(Debug)]
struct Candidate {
    body: Body,
    data: Vec<u8>,
    filename: Option<String>,
    /// Ids of the enclosing `multipart/alternative` containers, outermost first.
    alternatives: Vec<usize>,
}

impl Candidate {
    fn is_alternative_of(&self, other: &Candidate) -> bool {
        self.alternatives
            .iter()
            .any(|id| other.alternatives.contains(id))
    }

    fn into_attachment(self) -> Attachment {
        Attachment {
            headers: self.body.headers,
            data: self.data,
            mimetype: self.body.mime_type,
            filename: self.filename,
            content_id: None,
            decode_error: None,
        }
    }
}

#[derive(Debug)]
enum Leaf {
    Candidate(Candidate),
    Attachment(Attachment),
}

#[derive(Debug, Default)]
struct Collector {
    leaves: Vec<Leaf>,
    alternatives: Vec<usize>,
    next_alternative: usize,
}

impl Collector {
    fn visit(&mut self, part: Part<'_>) {
        if !part.is_multipart() {
            self.add_leaf(part);
            return;
        }
        let mimetype = part.mimetype().to_string();
        let children = part.into_children();
        match mimetype.as_str() {
            /* RFC 1847: the first body part is the signed content,
            the second holds the control information to verify it. */
            "multipart/signed" => {
                if let Some(first) = children.into_iter().next() {
                    self.visit(first);
                }
            }
            "multipart/encrypted" => {
                for child in children {
                    if child.mimetype() != "application/pgp-encrypted" {
                        self.visit(child);
                    }
                }
            }
            "multipart/alternative" => {
                self.alternatives.push(self.next_alternative);
                self.next_alternative += 1;
                for child in children {
                    self.visit(child);
                }
                self.alternatives.pop();
            }
            _ => {
                for child in children {
                    self.visit(child);
                }
            }
        }
    }

    fn add_leaf(&mut self, part: Part<'_>) {
        let Part {
            headers,
            ctype,
            disposition,
            content_id,
            body,
            ..
        } = part;
        let (data, decode_error) = match body {
            PartBody::Leaf { data, decode_error } => (data, decode_error),
            PartBody::Multipart { .. } => return,
        };

        let is_text = matches!(ctype.mimetype.as_str(), "text/plain" | "text/html");
        let is_attachment = disposition.disposition == DispositionType::Attachment;
        let filename = attachment_filename(&ctype, &disposition);

        if is_text && !is_attachment && content_id.is_none() && decode_error.is_none() {
            self.leaves.push(Leaf::Candidate(Candidate {
                body: Body {
                    text: decode_text(&data, &ctype.charset),
                    mime_type: ctype.mimetype,
                    headers,
                },
                data,
                filename,
                alternatives: self.alternatives.clone(),
            }));
            return;
        }

        self.leaves.push(Leaf::Attachment(Attachment {
            headers,
            data,
            mimetype: ctype.mimetype,
            filename,
            content_id,
            decode_error,
        }));
    }

    /// Picks the body and keeps the remaining leaves in document order.
    fn finish(self) -> ParsedMime {
        let winner = self
            .leaves
            .iter()
            .enumerate()
            .filter_map(|(index, leaf)| match leaf {
                Leaf::Candidate(candidate) => Some((candidate.alternatives.len(), index)),
                Leaf::Attachment(_) => None,
            })
            .max()
            .map(|(_, index)| index);

        let mut leaves: Vec<Option<Leaf>> = self.leaves.into_iter().map(Some).collect();
        let body = match winner.and_then(|index| leaves.get_mut(index)?.take()) {
            Some(Leaf::Candidate(candidate)) => Some(candidate),
            _ => None,
        };

        let mut attachments = Vec::new();
        for leaf in leaves.into_iter().flatten() {
            match leaf {
                Leaf::Attachment(attachment) => attachments.push(attachment),
                Leaf::Candidate(candidate) => match &body {
                    Some(body) if candidate.is_alternative_of(body) => {
                        debug!("Alternative {} superseded", candidate.body.mime_type);
                    }
                    _ => attachments.push(candidate.into_attachment()),
                },
            }
        }

        ParsedMime {
            body: body.map(|candidate| candidate.body).unwrap_or_default(),
            attachments,
        }
    }
}

/// Decodes body text according to its charset.
/// ASCII and unknown labels are read as UTF-8.
fn decode_text(data: &[u8], charset: &str) -> String {
    let charset = charset.trim().to_ascii_lowercase();
    if matches!(charset.as_str(), "" | "us-ascii" | "ascii" | "utf-8" | "utf8") {
        return String::from_utf8_lossy(data).into_owned();
    }
    match encoding_rs::Encoding::for_label(charset.as_bytes()) {
        Some(encoding) => encoding.decode(data).0.into_owned(),
        None => {
            warn!("Unknown charset {charset:?}, reading as UTF-8");
            String::from_utf8_lossy(data).into_owned()
        }
    }
}

/// Tries to get the attachment filename.
///
/// `Content-Disposition` parameters are preferred. MS Outlook is known to
/// put the name only into the `name` parameter of `Content-Type`.
/// For attachment dispositions without any name, one is guessed from the subtype.
fn attachment_filename(
    ctype: &ParsedContentType,
    disposition: &ParsedContentDisposition,
) -> Option<String> {
    let desired = disposition
        .params
        .get("filename")
        .or_else(|| disposition.params.get("filename*"))
        .or_else(|| disposition.params.get("name"))
        .or_else(|| ctype.params.get("name"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());

    if desired.is_none() && disposition.disposition == DispositionType::Attachment {
        let subtype = ctype.mimetype.split('/').nth(1).unwrap_or("bin");
        return Some(format!("file.{subtype}"));
    }
    desired
}

/// Parses a message into its body and attachments with default [Options].
pub fn parse_mime(raw: &[u8], external_boundary: Option<&str>) -> Result<ParsedMime> {
    parse_mime_with(raw, external_boundary, &Options::default())
}

pub fn parse_mime_with(
    raw: &[u8],
    external_boundary: Option<&str>,
    options: &Options,
) -> Result<ParsedMime> {
    let tree = parse_tree(raw, external_boundary, options)?;
    Ok(ParsedMime::from_tree(tree))
}
