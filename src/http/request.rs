//! Incremental start-line + header parser (§4.1). Stateless and idempotent:
//! `RequestParser::parse` is handed the connection's whole unconsumed read
//! buffer each time new bytes arrive and returns `NeedMore` until a
//! complete header block is present, at which point it returns the parsed
//! request plus how many bytes of the buffer it consumed. Body bytes are
//! never inspected here — they are handed off to the connection's body
//! machine untouched.

use std::fmt;

/// A name→value header mapping that preserves the first occurrence of a
/// name and performs case-insensitive lookups, as HTTP requires.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap(Vec<(String, String)>);

impl HeaderMap {
    pub fn new() -> Self {
        HeaderMap(Vec::new())
    }

    /// Inserts `name: value`, keeping whichever value was seen first for a
    /// case-insensitively equal name.
    pub fn insert_first(&mut self, name: String, value: String) {
        if !self.0.iter().any(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            self.0.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: HeaderMap,
}

impl HttpRequest {
    /// The target with query string stripped.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }

    /// Everything after the first `?`, or empty if there is none.
    pub fn query(&self) -> &str {
        match self.target.split_once('?') {
            Some((_, q)) => q,
            None => "",
        }
    }
}

/// Every way `RequestParser::parse` can refuse a request, each mapped by
/// the connection layer (§4.6) to an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    RequestLineTooLong,
    HeaderLineTooLong,
    TooManyHeaders,
    MalformedHeader,
    EmptyHeaderName,
    BadVersion,
    BadMethod,
    BadRequestLine,
}

impl ParseErrorKind {
    pub fn status(&self) -> u16 {
        match self {
            ParseErrorKind::RequestLineTooLong => 414,
            ParseErrorKind::HeaderLineTooLong | ParseErrorKind::TooManyHeaders => 431,
            _ => 400,
        }
    }
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseErrorKind::RequestLineTooLong => "request line too long",
            ParseErrorKind::HeaderLineTooLong => "header line too long",
            ParseErrorKind::TooManyHeaders => "too many headers",
            ParseErrorKind::MalformedHeader => "malformed header",
            ParseErrorKind::EmptyHeaderName => "empty header name",
            ParseErrorKind::BadVersion => "unsupported HTTP version",
            ParseErrorKind::BadMethod => "malformed method token",
            ParseErrorKind::BadRequestLine => "malformed request line",
        };
        write!(f, "{}", s)
    }
}

pub enum ParseOutcome {
    NeedMore,
    Complete { request: HttpRequest, consumed: usize },
    Error(ParseErrorKind),
}

pub struct RequestParser {
    pub max_request_line: usize,
    pub max_header_bytes: usize,
    pub max_header_lines: usize,
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

impl RequestParser {
    pub fn parse(&self, buf: &[u8]) -> ParseOutcome {
        let Some(line_end) = find_crlf(buf, 0) else {
            if buf.len() > self.max_request_line {
                return ParseOutcome::Error(ParseErrorKind::RequestLineTooLong);
            }
            return ParseOutcome::NeedMore;
        };
        if line_end > self.max_request_line {
            return ParseOutcome::Error(ParseErrorKind::RequestLineTooLong);
        }

        let line = match std::str::from_utf8(&buf[..line_end]) {
            Ok(s) => s,
            Err(_) => return ParseOutcome::Error(ParseErrorKind::BadRequestLine),
        };
        let mut parts = line.split(' ').filter(|s| !s.is_empty());
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v), None) => (m, t, v),
            _ => return ParseOutcome::Error(ParseErrorKind::BadRequestLine),
        };

        if !method.bytes().all(|b| b.is_ascii_graphic()) {
            return ParseOutcome::Error(ParseErrorKind::BadMethod);
        }
        if version != "HTTP/1.1" && version != "HTTP/1.0" {
            return ParseOutcome::Error(ParseErrorKind::BadVersion);
        }

        let mut headers = HeaderMap::new();
        let mut cursor = line_end + 2;
        let mut header_count = 0usize;

        loop {
            let Some(next_crlf) = find_crlf(buf, cursor) else {
                if buf.len() - cursor > self.max_header_bytes {
                    return ParseOutcome::Error(ParseErrorKind::HeaderLineTooLong);
                }
                return ParseOutcome::NeedMore;
            };
            let raw = &buf[cursor..next_crlf];
            if raw.len() > self.max_header_bytes {
                return ParseOutcome::Error(ParseErrorKind::HeaderLineTooLong);
            }
            if raw.is_empty() {
                cursor = next_crlf + 2;
                let request = HttpRequest {
                    method: method.to_string(),
                    target: target.to_string(),
                    version: version.to_string(),
                    headers,
                };
                return ParseOutcome::Complete {
                    request,
                    consumed: cursor,
                };
            }

            header_count += 1;
            if header_count > self.max_header_lines {
                return ParseOutcome::Error(ParseErrorKind::TooManyHeaders);
            }

            let line = match std::str::from_utf8(raw) {
                Ok(s) => s,
                Err(_) => return ParseOutcome::Error(ParseErrorKind::MalformedHeader),
            };
            let Some((name, value)) = line.split_once(':') else {
                return ParseOutcome::Error(ParseErrorKind::MalformedHeader);
            };
            let name = name.trim();
            let value = value.trim();
            if name.is_empty() {
                return ParseOutcome::Error(ParseErrorKind::EmptyHeaderName);
            }
            headers.insert_first(name.to_string(), value.to_string());
            cursor = next_crlf + 2;
        }
    }
}
