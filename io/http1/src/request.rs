//! HTTP/1.1 request model and incremental parser.

use std::collections::HashMap;

use reactor::Buffer;

use crate::multipart::{FormFile, MultipartError, MultipartParser, parse_boundary};

/// Accepted request methods.
pub const METHODS: [&str; 10] = [
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH", "PRI",
];

pub fn is_valid_method(method: &str) -> bool {
    METHODS.contains(&method)
}

/// Case-insensitive header map preserving the first-seen spelling for
/// serialization.
#[derive(Debug, Default, Clone)]
pub struct Headers {
    map: HashMap<String, (String, String)>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.map
            .insert(name.to_ascii_lowercase(), (name.to_string(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map
            .get(&name.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Multipart parts in body order; multiple parts may share a name.
    pub files: Vec<FormFile>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// First part with the given field name.
    pub fn file(&self, name: &str) -> Option<&FormFile> {
        self.files.iter().find(|f| f.name == name)
    }

    /// All parts with the given field name.
    pub fn files_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FormFile> {
        self.files.iter().filter(move |f| f.name == name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request line")]
    BadStartLine,
    #[error("unknown method {0:?}")]
    BadMethod(String),
    #[error("unsupported version {0:?}")]
    BadVersion(String),
    #[error("malformed header line")]
    BadHeader,
    #[error("unparseable Content-Length")]
    BadContentLength,
    #[error("multipart: {0}")]
    Multipart(#[from] MultipartError),
}

enum ParseState {
    StartLine,
    HeaderLines,
    FixedBody { remaining: usize },
    TakeAll,
    Multipart(MultipartParser),
}

/// Incremental request parser. State progresses strictly start-line ->
/// headers -> body; any error is fatal for the connection.
pub struct RequestParser {
    state: ParseState,
    request: HttpRequest,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> RequestParser {
        RequestParser {
            state: ParseState::StartLine,
            request: HttpRequest::default(),
        }
    }

    /// Consume as much of `buf` as possible. `Ok(Some(..))` yields a
    /// complete request and resets for the next one on the connection.
    pub fn feed(&mut self, buf: &mut Buffer) -> Result<Option<HttpRequest>, ParseError> {
        loop {
            match &mut self.state {
                ParseState::StartLine => {
                    let Some(pos) = buf.find_crlf() else {
                        return Ok(None);
                    };
                    let line = buf.read(pos);
                    buf.retrieve(2);
                    self.parse_start_line(&line)?;
                    self.state = ParseState::HeaderLines;
                }
                ParseState::HeaderLines => {
                    let Some(pos) = buf.find_crlf() else {
                        return Ok(None);
                    };
                    if pos == 0 {
                        buf.retrieve(2);
                        self.state = self.body_state()?;
                        continue;
                    }
                    let line = buf.read(pos);
                    buf.retrieve(2);
                    self.parse_header_line(&line)?;
                }
                ParseState::FixedBody { remaining } => {
                    if buf.readable_bytes() < *remaining {
                        return Ok(None);
                    }
                    let remaining = *remaining;
                    self.request.body = buf.read(remaining);
                    return Ok(Some(self.complete()));
                }
                ParseState::TakeAll => {
                    let n = buf.readable_bytes();
                    self.request.body = buf.read(n);
                    return Ok(Some(self.complete()));
                }
                ParseState::Multipart(parser) => {
                    if parser.feed(buf, &mut self.request.files)? {
                        return Ok(Some(self.complete()));
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn complete(&mut self) -> HttpRequest {
        self.state = ParseState::StartLine;
        std::mem::take(&mut self.request)
    }

    fn parse_start_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::BadStartLine)?;
        let mut tokens = line.split(' ').filter(|t| !t.is_empty());
        let (Some(method), Some(path), Some(version), None) =
            (tokens.next(), tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(ParseError::BadStartLine);
        };
        if !is_valid_method(method) {
            return Err(ParseError::BadMethod(method.to_string()));
        }
        if version != "HTTP/1.1" && version != "HTTP/1.0" {
            return Err(ParseError::BadVersion(version.to_string()));
        }
        self.request.method = method.to_string();
        self.request.path = path.to_string();
        self.request.version = version.to_string();
        Ok(())
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::BadHeader)?;
        let Some((name, value)) = line.split_once(':') else {
            return Err(ParseError::BadHeader);
        };
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return Err(ParseError::BadHeader);
        }
        if !value.is_empty() {
            self.request.headers.insert(name, value);
        }
        Ok(())
    }

    /// Choose how the body is bounded: multipart takes over on its
    /// content type, a Content-Length bounds a fixed read, and anything
    /// else takes the remaining buffered bytes.
    fn body_state(&self) -> Result<ParseState, ParseError> {
        // Byte-wise prefix check: slicing the str at a fixed offset could
        // land inside a multi-byte character in a hostile header value.
        if let Some(content_type) = self.request.headers.get("Content-Type")
            && content_type
                .as_bytes()
                .get(..19)
                .is_some_and(|head| head.eq_ignore_ascii_case(b"multipart/form-data"))
        {
            let boundary = parse_boundary(content_type)?;
            return Ok(ParseState::Multipart(MultipartParser::new(&boundary)));
        }
        if let Some(length) = self.request.headers.get("Content-Length") {
            let remaining = length
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::BadContentLength)?;
            return Ok(ParseState::FixedBody { remaining });
        }
        Ok(ParseState::TakeAll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_str(parser: &mut RequestParser, input: &str) -> Result<Option<HttpRequest>, ParseError> {
        let mut buf = Buffer::new();
        buf.append(input.as_bytes());
        parser.feed(&mut buf)
    }

    #[test]
    fn parses_a_get_request() {
        let mut parser = RequestParser::new();
        let request = feed_str(
            &mut parser,
            "GET /hello?x=1 HTTP/1.1\r\nHost: example\r\nAccept:  text/plain \r\n\r\n",
        )
        .unwrap()
        .expect("complete");
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/hello?x=1");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.header("host"), Some("example"));
        assert_eq!(request.header("ACCEPT"), Some("text/plain"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn waits_for_more_bytes_between_reads() {
        let mut parser = RequestParser::new();
        let mut buf = Buffer::new();
        buf.append(b"POST /submit HTTP/1.1\r\nContent-Le");
        assert!(parser.feed(&mut buf).unwrap().is_none());
        buf.append(b"ngth: 5\r\n\r\nhel");
        assert!(parser.feed(&mut buf).unwrap().is_none());
        buf.append(b"lo");
        let request = parser.feed(&mut buf).unwrap().expect("complete");
        assert_eq!(request.body, b"hello");
    }

    #[test]
    fn rejects_unknown_method_and_bad_version() {
        let mut parser = RequestParser::new();
        assert!(matches!(
            feed_str(&mut parser, "BREW /pot HTTP/1.1\r\n\r\n"),
            Err(ParseError::BadMethod(_))
        ));
        let mut parser = RequestParser::new();
        assert!(matches!(
            feed_str(&mut parser, "GET /pot HTTP/2.0\r\n\r\n"),
            Err(ParseError::BadVersion(_))
        ));
    }

    #[test]
    fn pri_method_is_accepted() {
        let mut parser = RequestParser::new();
        let request = feed_str(&mut parser, "PRI * HTTP/1.1\r\n\r\n")
            .unwrap()
            .expect("complete");
        assert_eq!(request.method, "PRI");
    }

    #[test]
    fn body_without_content_length_takes_the_rest() {
        let mut parser = RequestParser::new();
        let request = feed_str(&mut parser, "POST /raw HTTP/1.0\r\n\r\ntrailing bytes")
            .unwrap()
            .expect("complete");
        assert_eq!(request.body, b"trailing bytes");
    }

    #[test]
    fn multibyte_content_type_is_not_multipart() {
        // 10 two-byte characters: 20 bytes, and byte offset 19 falls
        // inside the last one. The multipart check must not slice there.
        let mut parser = RequestParser::new();
        let request = feed_str(
            &mut parser,
            "POST /x HTTP/1.1\r\nContent-Type: éééééééééé\r\nContent-Length: 2\r\n\r\nok",
        )
        .unwrap()
        .expect("complete");
        assert!(request.files.is_empty());
        assert_eq!(request.body, b"ok");
    }

    #[test]
    fn multipart_body_populates_files() {
        let body = "--abc\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\n\r\nHELLO\r\n--abc--";
        let input = format!(
            "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=abc\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut parser = RequestParser::new();
        let request = feed_str(&mut parser, &input).unwrap().expect("complete");
        assert_eq!(request.files.len(), 1);
        let file = request.file("f").expect("file part");
        assert_eq!(file.filename, "a.txt");
        assert_eq!(file.content_type, "");
        assert_eq!(file.content, b"HELLO");
    }

    #[test]
    fn parser_resets_for_the_next_request() {
        let mut parser = RequestParser::new();
        let mut buf = Buffer::new();
        buf.append(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n");
        let first = parser.feed(&mut buf).unwrap().expect("first");
        assert_eq!(first.path, "/a");
        // A GET without Content-Length takes the rest of the buffer as
        // body, so the second request must arrive separately.
        assert_eq!(first.body, b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n");

        buf.append(b"GET /c HTTP/1.1\r\nHost: x\r\n\r\n");
        let second = parser.feed(&mut buf).unwrap().expect("second");
        assert_eq!(second.path, "/c");
    }
}
