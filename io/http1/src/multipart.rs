//! Streaming `multipart/form-data` parser.
//!
//! A five-state machine fed incrementally from the connection's read
//! buffer, so a part larger than any single read is handled without
//! re-buffering the whole body. Content can be materialised on the part
//! or streamed through a per-part callback.

use reactor::Buffer;

#[derive(Debug, thiserror::Error)]
pub enum MultipartError {
    #[error("multipart content type without a boundary parameter")]
    MissingBoundary,
    #[error("malformed part header line")]
    BadPartHeader,
    #[error("unexpected bytes after boundary")]
    UnexpectedAfterBoundary,
}

/// One decoded `form-data` part.
#[derive(Debug, Default, Clone)]
pub struct FormFile {
    pub name: String,
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// Extract the `boundary` parameter from a `multipart/form-data`
/// Content-Type value.
pub fn parse_boundary(content_type: &str) -> Result<String, MultipartError> {
    for param in content_type.split(';') {
        let param = param.trim();
        if let Some(rest) = strip_prefix_ignore_case(param, "boundary=") {
            let boundary = rest.trim_matches('"');
            if boundary.is_empty() {
                return Err(MultipartError::MissingBoundary);
            }
            return Ok(boundary.to_string());
        }
    }
    Err(MultipartError::MissingBoundary)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// 0: scan for the opening `--boundary\r\n`.
    FindFirstBoundary,
    /// 1: reset per-part info.
    BeginPart,
    /// 2: part headers until a blank line.
    PartHeaders,
    /// 3: content until `\r\n--boundary`.
    Content,
    /// 4: `\r\n` continues with the next part, `--` ends the body.
    AfterBoundary,
}

type PartDataCallback = Box<dyn FnMut(&FormFile, &[u8], bool) + Send>;

pub struct MultipartParser {
    dash_boundary_crlf: Vec<u8>,
    crlf_dash_boundary: Vec<u8>,
    state: State,
    current: FormFile,
    /// When set, content chunks go here instead of `FormFile::content`;
    /// the final call passes `done = true`.
    part_data_cb: Option<PartDataCallback>,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> MultipartParser {
        MultipartParser {
            dash_boundary_crlf: format!("--{boundary}\r\n").into_bytes(),
            crlf_dash_boundary: format!("\r\n--{boundary}").into_bytes(),
            state: State::FindFirstBoundary,
            current: FormFile::default(),
            part_data_cb: None,
        }
    }

    /// Stream part content through `cb` instead of materialising it.
    pub fn set_part_data_callback(
        &mut self,
        cb: impl FnMut(&FormFile, &[u8], bool) + Send + 'static,
    ) {
        self.part_data_cb = Some(Box::new(cb));
    }

    /// Consume whatever is decodable from `buf`. Returns `Ok(true)` when
    /// the closing boundary was seen; `Ok(false)` means feed more bytes.
    pub fn feed(
        &mut self,
        buf: &mut Buffer,
        parts: &mut Vec<FormFile>,
    ) -> Result<bool, MultipartError> {
        loop {
            match self.state {
                State::FindFirstBoundary => {
                    if let Some(pos) = buf.find(&self.dash_boundary_crlf) {
                        buf.retrieve(pos + self.dash_boundary_crlf.len());
                        self.state = State::BeginPart;
                    } else {
                        // Drop the preamble but keep enough tail to match
                        // a boundary straddling the next refill.
                        let keep = self.dash_boundary_crlf.len() - 1;
                        if buf.readable_bytes() > keep {
                            buf.retrieve(buf.readable_bytes() - keep);
                        }
                        return Ok(false);
                    }
                }
                State::BeginPart => {
                    self.current = FormFile::default();
                    self.state = State::PartHeaders;
                }
                State::PartHeaders => match buf.find_crlf() {
                    None => return Ok(false),
                    Some(0) => {
                        buf.retrieve(2);
                        self.state = State::Content;
                    }
                    Some(pos) => {
                        let line = buf.read(pos);
                        buf.retrieve(2);
                        self.parse_part_header(&line)?;
                    }
                },
                State::Content => {
                    if let Some(pos) = buf.find(&self.crlf_dash_boundary) {
                        let chunk = buf.read(pos);
                        self.commit_content(&chunk);
                        buf.retrieve(self.crlf_dash_boundary.len());
                        self.state = State::AfterBoundary;
                    } else {
                        // Bytes inside the last len(\r\n--boundary) bytes
                        // may be the start of the terminator; only commit
                        // what precedes them.
                        let guard = self.crlf_dash_boundary.len();
                        if buf.readable_bytes() > guard {
                            let chunk = buf.read(buf.readable_bytes() - guard);
                            self.commit_content(&chunk);
                        }
                        return Ok(false);
                    }
                }
                State::AfterBoundary => {
                    if buf.readable_bytes() < 2 {
                        return Ok(false);
                    }
                    let next: [u8; 2] = buf.peek()[..2].try_into().expect("checked");
                    match &next {
                        b"\r\n" => {
                            buf.retrieve(2);
                            self.finish_part(parts);
                            self.state = State::BeginPart;
                        }
                        b"--" => {
                            buf.retrieve(2);
                            self.finish_part(parts);
                            self.state = State::FindFirstBoundary;
                            return Ok(true);
                        }
                        _ => return Err(MultipartError::UnexpectedAfterBoundary),
                    }
                }
            }
        }
    }

    fn parse_part_header(&mut self, line: &[u8]) -> Result<(), MultipartError> {
        let line = std::str::from_utf8(line).map_err(|_| MultipartError::BadPartHeader)?;
        let Some((name, value)) = line.split_once(':') else {
            return Err(MultipartError::BadPartHeader);
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-disposition") {
            for attr in value.split(';') {
                let attr = attr.trim();
                if let Some(v) = strip_prefix_ignore_case(attr, "name=") {
                    self.current.name = v.trim_matches('"').to_string();
                } else if let Some(v) = strip_prefix_ignore_case(attr, "filename=") {
                    self.current.filename = v.trim_matches('"').to_string();
                }
            }
        } else if name.eq_ignore_ascii_case("content-type") {
            self.current.content_type = value.to_string();
        }
        Ok(())
    }

    fn commit_content(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        match &mut self.part_data_cb {
            Some(cb) => cb(&self.current, chunk, false),
            None => self.current.content.extend_from_slice(chunk),
        }
    }

    fn finish_part(&mut self, parts: &mut Vec<FormFile>) {
        if let Some(cb) = &mut self.part_data_cb {
            cb(&self.current, &[], true);
        }
        parts.push(std::mem::take(&mut self.current));
    }
}

/// `prefix` must be ASCII. The comparison runs on bytes so a multi-byte
/// character in `s` at the cut point cannot panic the slice; a byte-wise
/// ASCII match also guarantees the cut lands on a char boundary.
fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.as_bytes().get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix.as_bytes()) {
        return None;
    }
    debug_assert!(s.is_char_boundary(prefix.len()));
    Some(&s[prefix.len()..])
}
