//! # List of header names used while walking MIME structures.

use mailparse::{MailHeader, MailHeaderMap};
use strum_macros::{AsRefStr, Display};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "kebab_case")]
pub enum HeaderDef {
    ContentType,
    ContentTransferEncoding,
    ContentDisposition,
    ContentId,
}

impl HeaderDef {
    /// Returns the header name.
    pub fn get_headername(&self) -> &str {
        self.as_ref()
    }
}

pub trait HeaderDefMap {
    /// Returns requested header value if it exists.
    fn get_header_value(&self, headerdef: HeaderDef) -> Option<String>;

    /// Returns requested header if it exists.
    fn get_header(&self, headerdef: HeaderDef) -> Option<&MailHeader>;
}

impl HeaderDefMap for [MailHeader<'_>] {
    fn get_header_value(&self, headerdef: HeaderDef) -> Option<String> {
        self.get_first_value(headerdef.get_headername())
    }

    fn get_header(&self, headerdef: HeaderDef) -> Option<&MailHeader> {
        self.get_first_header(headerdef.get_headername())
    }
}
