//! Parsing for the raw response header lines the transport delivers.
//!
//! The transport hands over one header per callback with continuation lines
//! already merged, so parsing here stays line-oriented.

use http::{
    header::{HeaderName, HeaderValue},
    StatusCode, Version,
};

/// A parsed response status line.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatusLine {
    pub(crate) version: Version,
    pub(crate) status: StatusCode,
}

/// Parse `HTTP/<version> <status> [reason]`. Returns `None` if `line` is not
/// a status line.
pub(crate) fn parse_status_line(line: &[u8]) -> Option<StatusLine> {
    let rest = line.strip_prefix(b"HTTP/")?;
    let mut parts = rest.splitn(2, |&b| b == b' ');

    let version = match parts.next()? {
        b"0.9" => Version::HTTP_09,
        b"1.0" => Version::HTTP_10,
        b"1.1" => Version::HTTP_11,
        b"2" | b"2.0" => Version::HTTP_2,
        b"3" | b"3.0" => Version::HTTP_3,
        _ => return None,
    };

    let status = StatusCode::from_bytes(parts.next()?.get(..3)?).ok()?;

    Some(StatusLine { version, status })
}

/// Whether `line` is the blank line terminating a header block.
pub(crate) fn is_end_of_headers(line: &[u8]) -> bool {
    trim_line(line).is_empty()
}

/// Parse a `Name: value` header line. Returns `None` for lines that are not
/// valid header fields.
pub(crate) fn parse_header_line(line: &[u8]) -> Option<(HeaderName, HeaderValue)> {
    let line = trim_line(line);
    let colon = line.iter().position(|&b| b == b':')?;

    let name = HeaderName::from_bytes(&line[..colon]).ok()?;

    let mut value = &line[colon + 1..];
    while let Some((&(b' ' | b'\t'), rest)) = value.split_first() {
        value = rest;
    }
    let value = HeaderValue::from_bytes(value).ok()?;

    Some((name, value))
}

fn trim_line(mut line: &[u8]) -> &[u8] {
    while let Some((&(b'\r' | b'\n' | b' ' | b'\t'), rest)) = line.split_last() {
        line = rest;
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines() {
        let line = parse_status_line(b"HTTP/1.1 200 OK\r\n").unwrap();
        assert_eq!(line.version, Version::HTTP_11);
        assert_eq!(line.status, StatusCode::OK);

        let line = parse_status_line(b"HTTP/2 301 \r\n").unwrap();
        assert_eq!(line.version, Version::HTTP_2);
        assert_eq!(line.status, StatusCode::MOVED_PERMANENTLY);

        assert!(parse_status_line(b"Content-Length: 5\r\n").is_none());
        assert!(parse_status_line(b"HTTP/9.9 200 OK\r\n").is_none());
        assert!(parse_status_line(b"HTTP/1.1 XXX\r\n").is_none());
    }

    #[test]
    fn header_lines() {
        let (name, value) = parse_header_line(b"Content-Type:  text/plain \r\n").unwrap();
        assert_eq!(name, http::header::CONTENT_TYPE);
        assert_eq!(value, "text/plain");

        assert!(parse_header_line(b"no colon here\r\n").is_none());
        assert!(parse_header_line(b"\r\n").is_none());
    }

    #[test]
    fn end_of_headers() {
        assert!(is_end_of_headers(b"\r\n"));
        assert!(is_end_of_headers(b"\n"));
        assert!(!is_end_of_headers(b"X: y\r\n"));
    }
}
