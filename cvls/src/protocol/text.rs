//! Text command protocol helpers.
//!
//! Text commands start with `&` and are terminated by a line break. Binary
//! page uploads travel inside text commands: the page index, the data and a
//! Fletcher-16 checksum are escaped with [`TEXT_ESCAPE`] so they cannot be
//! mistaken for a command start or a line terminator.
//!
//! Multi-line replies end with a line containing [`END_PROMPT`].

use crate::protocol::checksum::fletcher16;

/// Marker line closing a multi-line reply.
pub const END_PROMPT: &str = "MULTILINECOMPLETE";

/// Escape byte for binary data inside text commands.
pub const TEXT_ESCAPE: u8 = 0xFE;

/// Page index telling the unit that no more pages follow.
pub const SENTINEL_PAGE: u16 = 0xFFFF;

/// Firmware page upload command.
pub const FIRMWARE_UPLOAD: &str = "&@f";

/// Configuration import page command.
pub const CONFIG_IMPORT: &str = "&@u";

/// Configuration export page command.
pub const CONFIG_EXPORT: &str = "&@i";

/// Log entry command.
pub const LOG_READ: &str = "&@e";

/// Firmware version query.
pub const FIRMWARE_VERSION: &str = "&f";

/// Probe command answered by every unit.
pub const PROBE: &str = "&z";

/// Escape every byte the unit would interpret as framing.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 16);
    for &byte in data {
        if matches!(byte, TEXT_ESCAPE | b'&' | b'\n' | b'\r') {
            out.push(TEXT_ESCAPE);
        }
        out.push(byte);
    }
    out
}

/// Build a page upload command: `command` + escaped(page + data + checksum).
pub fn upload_packet(command: &str, page: u16, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(data.len() + 4);
    payload.extend_from_slice(&page.to_be_bytes());
    payload.extend_from_slice(data);
    let checksum = fletcher16(&payload);
    payload.extend_from_slice(&checksum);

    let mut out = command.as_bytes().to_vec();
    out.extend(escape(&payload));
    out
}

/// Acknowledgement the unit sends after storing a page.
pub fn upload_ack(command: &str, page: u16, len: usize) -> String {
    format!("{command}{page},{len}")
}

/// Request for a numbered page or entry, e.g. `&@i3`.
pub fn page_request(command: &str, page: u16) -> Vec<u8> {
    format!("{command}{page}").into_bytes()
}

/// Request for the number of available pages, e.g. `&@e?`.
pub fn count_request(command: &str) -> Vec<u8> {
    format!("{command}?").into_bytes()
}

/// Parse the reply to a count request.
pub fn parse_count(command: &str, line: &str) -> Option<u32> {
    line.trim().strip_prefix(command)?.trim().parse().ok()
}

/// Parse the reply to [`FIRMWARE_VERSION`], e.g. `&f1.14 Jan 01 2020`.
pub fn parse_firmware_version(line: &str) -> Option<f64> {
    let rest = line.trim().strip_prefix(FIRMWARE_VERSION)?;
    rest.split(' ').next()?.parse().ok()
}

/// Whether `line` closes a multi-line reply.
pub fn is_end_prompt(line: &str) -> bool {
    line.contains(END_PROMPT)
}

/// Drop the closing marker line from a multi-line reply.
pub fn strip_end_prompt(lines: &mut Vec<String>) {
    while lines.last().is_some_and(|line| is_end_prompt(line)) {
        lines.pop();
    }
}

/// Error token a unit can send instead of a page reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    /// `!c`: page checksum did not match.
    Checksum,
    /// `!w`: page could not be written or processed.
    Processing,
    /// `!o`: reply did not fit the unit's buffer.
    Overflow,
    /// `!v`: page index out of range.
    InvalidPage,
    /// `!r`: unit is rebooting.
    Rebooting,
    /// `!s`: upload already complete.
    UploadComplete,
    /// `!e`: upload failed on the unit.
    UploadError,
}

impl ReplyError {
    /// Recognise an error token reply to `command`, e.g. `&@u!c`.
    pub fn parse(command: &str, line: &str) -> Option<Self> {
        let token = line.trim().strip_prefix(command)?.strip_prefix('!')?;
        let error = match token {
            "c" => Self::Checksum,
            "w" => Self::Processing,
            "o" => Self::Overflow,
            "v" => Self::InvalidPage,
            "r" => Self::Rebooting,
            "s" => Self::UploadComplete,
            "e" => Self::UploadError,
            _ => return None,
        };
        Some(error)
    }

    /// Human readable description.
    pub fn message(self) -> &'static str {
        match self {
            Self::Checksum => "Checksum Error!",
            Self::Processing => "Data Processing Error",
            Self::Overflow => "Buffer overflow!",
            Self::InvalidPage => "Invalid Page Number!",
            Self::Rebooting => "Unit is rebooting",
            Self::UploadComplete => "Upload Complete",
            Self::UploadError => "Upload Error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_inserts_before_special_bytes() {
        assert_eq!(escape(b"abc"), b"abc".to_vec());
        assert_eq!(
            escape(&[0xFE, b'&', b'x', b'\n', b'\r']),
            vec![0xFE, 0xFE, 0xFE, b'&', b'x', 0xFE, b'\n', 0xFE, b'\r']
        );
    }

    #[test]
    fn test_upload_packet_layout() {
        let packet = upload_packet(CONFIG_IMPORT, 1, &[0x41]);
        let checksum = fletcher16(&[0x00, 0x01, 0x41]);
        let mut expected = b"&@u".to_vec();
        expected.extend_from_slice(&[0x00, 0x01, 0x41]);
        expected.extend(escape(&checksum));
        assert_eq!(packet, expected);
    }

    #[test]
    fn test_upload_packet_escapes_page_index() {
        // Page 0x260A has both '&' and '\n' in its index bytes.
        let packet = upload_packet(FIRMWARE_UPLOAD, 0x260A, &[]);
        assert_eq!(&packet[..7], &[b'&', b'@', b'f', 0xFE, b'&', 0xFE, b'\n']);
    }

    #[test]
    fn test_ack_and_requests() {
        assert_eq!(upload_ack(FIRMWARE_UPLOAD, 8, 1024), "&@f8,1024");
        assert_eq!(page_request(CONFIG_EXPORT, 3), b"&@i3".to_vec());
        assert_eq!(count_request(LOG_READ), b"&@e?".to_vec());
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count(LOG_READ, "&@e12"), Some(12));
        assert_eq!(parse_count(CONFIG_EXPORT, " &@i 7\r"), Some(7));
        assert_eq!(parse_count(LOG_READ, "&@i12"), None);
        assert_eq!(parse_count(LOG_READ, "&@e!v"), None);
    }

    #[test]
    fn test_parse_firmware_version() {
        assert_eq!(parse_firmware_version("&f1.14 Mar 3 2017"), Some(1.14));
        assert_eq!(parse_firmware_version("&f2"), Some(2.0));
        assert_eq!(parse_firmware_version("&fbeta"), None);
        assert_eq!(parse_firmware_version("&z000123"), None);
    }

    #[test]
    fn test_reply_error_tokens() {
        assert_eq!(ReplyError::parse(CONFIG_IMPORT, "&@u!c"), Some(ReplyError::Checksum));
        assert_eq!(ReplyError::parse(CONFIG_EXPORT, "&@i!o\r"), Some(ReplyError::Overflow));
        assert_eq!(ReplyError::parse(CONFIG_EXPORT, "&@i!v"), Some(ReplyError::InvalidPage));
        assert_eq!(ReplyError::parse(FIRMWARE_UPLOAD, "&@f!r"), Some(ReplyError::Rebooting));
        assert_eq!(ReplyError::parse(CONFIG_IMPORT, "&@f!c"), None);
        assert_eq!(ReplyError::parse(CONFIG_IMPORT, "&@u0,1024"), None);
        assert_eq!(ReplyError::Processing.message(), "Data Processing Error");
    }

    #[test]
    fn test_strip_end_prompt() {
        let mut lines = vec!["a=1".to_string(), "b=2".to_string(), END_PROMPT.to_string()];
        strip_end_prompt(&mut lines);
        assert_eq!(lines, vec!["a=1", "b=2"]);
    }
}
