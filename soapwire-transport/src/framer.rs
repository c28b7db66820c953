//! The incremental request framer.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::FrameError;
use crate::headers::Headers;

const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Parsed request line plus the complete header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

/// Events drained from the framer, in order: one `Request`, zero or more
/// `BodyChunk`s, one `End`.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    Request(RequestHead),
    BodyChunk(Bytes),
    End { trailers: Headers },
}

#[derive(Debug)]
enum State {
    Line,
    Headers,
    BodyFixed { remaining: usize },
    ChunkSize,
    ChunkData { remaining: usize },
    ChunkDataEnd,
    Trailers,
    End,
    Done,
}

/// Incremental HTTP/1.1 request parser. `feed` appends whatever the socket
/// produced; `next_event` drains as far as the buffered bytes allow.
/// Arbitrary fragmentation is fine: a chunk-size line, its data and the
/// CRLFs may all arrive split across reads.
#[derive(Debug)]
pub struct RequestFramer {
    buf: BytesMut,
    state: State,
    head: Option<RequestHead>,
    capture_trailers: bool,
    trailers: Headers,
    header_lines: Vec<(String, String)>,
    request_line: Option<(String, String, String)>,
}

impl Default for RequestFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestFramer {
    pub fn new() -> Self {
        RequestFramer {
            buf: BytesMut::with_capacity(4096),
            state: State::Line,
            head: None,
            capture_trailers: false,
            trailers: Headers::new(),
            header_lines: Vec::new(),
            request_line: None,
        }
    }

    /// Keep trailer headers instead of discarding them.
    pub fn capture_trailers(&mut self, capture: bool) {
        self.capture_trailers = capture;
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The headers of the request being parsed, once seen.
    pub fn head(&self) -> Option<&RequestHead> {
        self.head.as_ref()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Bytes past the end of the current request: the start of the next
    /// request on a kept-alive connection. Feed them to a fresh framer.
    pub fn take_remainder(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Drain the next event, or `None` when more bytes are needed.
    pub fn next_event(&mut self) -> Result<Option<FrameEvent>, FrameError> {
        loop {
            match self.state {
                State::Line => {
                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        // Tolerate a stray CRLF before the request line.
                        continue;
                    }
                    self.request_line = Some(parse_request_line(&line)?);
                    self.state = State::Headers;
                }
                State::Headers => {
                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        return self.finish_headers().map(Some);
                    }
                    self.header_lines.push(parse_header_line(&line)?);
                }
                State::BodyFixed { remaining } => {
                    if remaining == 0 {
                        self.state = State::End;
                        continue;
                    }
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(self.buf.len());
                    let chunk = self.buf.split_to(take).freeze();
                    self.state = State::BodyFixed {
                        remaining: remaining - take,
                    };
                    return Ok(Some(FrameEvent::BodyChunk(chunk)));
                }
                State::ChunkSize => {
                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&line)?;
                    if size == 0 {
                        self.state = State::Trailers;
                    } else {
                        self.state = State::ChunkData { remaining: size };
                    }
                }
                State::ChunkData { remaining } => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(self.buf.len());
                    let chunk = self.buf.split_to(take).freeze();
                    if take == remaining {
                        self.state = State::ChunkDataEnd;
                    } else {
                        self.state = State::ChunkData {
                            remaining: remaining - take,
                        };
                    }
                    return Ok(Some(FrameEvent::BodyChunk(chunk)));
                }
                State::ChunkDataEnd => {
                    // The CRLF terminating the chunk data, possibly split.
                    match self.buf.first().copied() {
                        None => return Ok(None),
                        Some(b'\r') => {
                            if self.buf.len() < 2 {
                                return Ok(None);
                            }
                            if self.buf[1] != b'\n' {
                                return Err(FrameError::InvalidChunkSize(
                                    "missing CRLF after chunk data".into(),
                                ));
                            }
                            self.buf.advance(2);
                        }
                        Some(b'\n') => self.buf.advance(1),
                        Some(_) => {
                            return Err(FrameError::InvalidChunkSize(
                                "missing CRLF after chunk data".into(),
                            ))
                        }
                    }
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = State::End;
                        continue;
                    }
                    if self.capture_trailers {
                        let (name, value) = parse_header_line(&line)?;
                        self.trailers.add(&name, &value);
                    }
                }
                State::End => {
                    self.state = State::Done;
                    return Ok(Some(FrameEvent::End {
                        trailers: std::mem::take(&mut self.trailers),
                    }));
                }
                State::Done => return Ok(None),
            }
        }
    }

    fn finish_headers(&mut self) -> Result<FrameEvent, FrameError> {
        let (method, target, version) = self
            .request_line
            .take()
            .unwrap_or_else(|| ("GET".into(), "/".into(), "HTTP/1.1".into()));
        let headers: Headers = std::mem::take(&mut self.header_lines).into_iter().collect();

        self.state = if headers.is_chunked() {
            State::ChunkSize
        } else {
            match headers.get("content-length") {
                Some(raw) => {
                    let len = raw
                        .trim()
                        .parse()
                        .map_err(|_| FrameError::InvalidContentLength(raw.to_owned()))?;
                    State::BodyFixed { remaining: len }
                }
                None => State::End,
            }
        };

        let head = RequestHead {
            method,
            target,
            version,
            headers,
        };
        tracing::trace!("parsed request head: {} {}", head.method, head.target);
        self.head = Some(head.clone());
        Ok(FrameEvent::Request(head))
    }

    /// Take one line ending in LF (tolerating bare LF), or `None` when the
    /// terminator has not arrived yet. The returned line has no CR/LF.
    fn take_line(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(nl) = self.buf.iter().position(|&b| b == b'\n') else {
            if self.buf.len() > MAX_HEADER_BYTES {
                return Err(FrameError::HeadersTooLarge(MAX_HEADER_BYTES));
            }
            return Ok(None);
        };
        let mut line = self.buf.split_to(nl + 1);
        line.truncate(nl);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Ok(Some(line.to_vec()))
    }
}

fn parse_request_line(line: &[u8]) -> Result<(String, String, String), FrameError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| FrameError::InvalidRequestLine(String::from_utf8_lossy(line).into_owned()))?;
    let mut parts = text.split(' ').filter(|p| !p.is_empty());
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(FrameError::InvalidRequestLine(text.to_owned()));
    };
    if parts.next().is_some() {
        return Err(FrameError::InvalidRequestLine(text.to_owned()));
    }
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(FrameError::UnsupportedVersion(version.to_owned()));
    }
    Ok((method.to_owned(), target.to_owned(), version.to_owned()))
}

fn parse_header_line(line: &[u8]) -> Result<(String, String), FrameError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| FrameError::InvalidHeader(String::from_utf8_lossy(line).into_owned()))?;
    let Some((name, value)) = text.split_once(':') else {
        return Err(FrameError::InvalidHeader(text.to_owned()));
    };
    let name = name.trim();
    if name.is_empty() || name.contains(' ') {
        return Err(FrameError::InvalidHeader(text.to_owned()));
    }
    Ok((name.to_owned(), value.trim().to_owned()))
}

/// Hex chunk size; extensions after `;` are ignored.
fn parse_chunk_size(line: &[u8]) -> Result<usize, FrameError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| FrameError::InvalidChunkSize(String::from_utf8_lossy(line).into_owned()))?;
    let size_part = text.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size_part, 16)
        .map_err(|_| FrameError::InvalidChunkSize(text.to_owned()))
}
