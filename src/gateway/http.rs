//! Incremental HTTP/1.1 head parsing and body framing for the gateway
//! relay. This is not a general HTTP implementation; it understands
//! exactly what the relay needs: request and response heads,
//! Content-Length and chunked framing, and connection tokens.

use std::io;
use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Cap on a request or response head.
const HEAD_CAP: usize = 32 * 1024;

#[derive(Debug, ThisError)]
pub enum HttpError {
    #[error("message head exceeds the size cap")]
    HeadTooLarge,
    #[error("malformed message head")]
    Malformed,
    #[error("connection closed mid-message")]
    UnexpectedEof,
    #[error("malformed chunked encoding")]
    BadChunk,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Ordered, case-preserving header list with case-insensitive lookup.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Whether the Connection header names the `close` token.
    pub fn connection_close(&self) -> bool {
        self.get("Connection")
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("close"))
            })
            .unwrap_or(false)
    }

    /// Strips the RFC 7230 §6.1 hop-by-hop headers, including any
    /// header the Connection header itself names.
    pub fn strip_hop_by_hop(&mut self) {
        let mut named: Vec<String> = self
            .get("Connection")
            .map(|value| {
                value
                    .split(',')
                    .map(|token| token.trim().to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default();
        named.extend(
            [
                "connection",
                "keep-alive",
                "proxy-authenticate",
                "proxy-authorization",
                "te",
                "trailer",
                "transfer-encoding",
                "upgrade",
            ]
            .iter()
            .map(|name| name.to_string()),
        );
        self.entries
            .retain(|(key, _)| !named.contains(&key.to_ascii_lowercase()));
    }

    fn parse(lines: std::str::Lines) -> Result<Self, HttpError> {
        let mut headers = Headers::default();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or(HttpError::Malformed)?;
            headers.push(name.trim(), value.trim());
        }
        Ok(headers)
    }

    fn write(&self, out: &mut Vec<u8>) {
        for (name, value) in self.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

impl RequestHead {
    pub fn parse(head: &[u8]) -> Result<Self, HttpError> {
        let text = std::str::from_utf8(head).map_err(|_| HttpError::Malformed)?;
        let mut lines = text.lines();
        let request_line = lines.next().ok_or(HttpError::Malformed)?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or(HttpError::Malformed)?.to_string();
        let target = parts.next().ok_or(HttpError::Malformed)?.to_string();
        let version = parts.next().ok_or(HttpError::Malformed)?.to_string();
        Ok(Self {
            method,
            target,
            version,
            headers: Headers::parse(lines)?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        self.headers.write(&mut out);
        out
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn parse(head: &[u8]) -> Result<Self, HttpError> {
        let text = std::str::from_utf8(head).map_err(|_| HttpError::Malformed)?;
        let mut lines = text.lines();
        let status_line = lines.next().ok_or(HttpError::Malformed)?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().ok_or(HttpError::Malformed)?.to_string();
        if !version.starts_with("HTTP/") {
            return Err(HttpError::Malformed);
        }
        let status = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or(HttpError::Malformed)?;
        let reason = parts.next().unwrap_or_default().to_string();
        Ok(Self {
            version,
            status,
            reason,
            headers: Headers::parse(lines)?,
        })
    }
}

/// Reads one message head (through the blank line) from `reader`,
/// buffering any bytes read past it in `buffer` for the body reader.
/// `Ok(None)` means the connection closed cleanly between messages.
pub async fn read_head<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut Vec<u8>,
) -> Result<Option<Vec<u8>>, HttpError> {
    loop {
        if let Some(end) = find_blank_line(buffer) {
            let head = buffer.drain(..end).collect();
            return Ok(Some(head));
        }
        if buffer.len() > HEAD_CAP {
            return Err(HttpError::HeadTooLarge);
        }
        let mut chunk = [0u8; 4096];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return if buffer.is_empty() {
                Ok(None)
            } else {
                Err(HttpError::UnexpectedEof)
            };
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

fn find_blank_line(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|position| position + 4)
}

/// How a message body ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
    /// No length information: the body runs to connection close.
    UntilClose,
}

pub fn request_framing(head: &RequestHead) -> BodyFraming {
    if let Some(te) = head.headers.get("Transfer-Encoding") {
        if te
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
        {
            return BodyFraming::Chunked;
        }
    }
    match head.headers.get("Content-Length").and_then(|v| v.parse().ok()) {
        Some(0) | None => BodyFraming::None,
        Some(length) => BodyFraming::ContentLength(length),
    }
}

pub fn response_framing(request_method: &str, response: &ResponseHead) -> BodyFraming {
    if request_method.eq_ignore_ascii_case("HEAD")
        || response.status / 100 == 1
        || response.status == 204
        || response.status == 304
    {
        return BodyFraming::None;
    }
    if let Some(te) = response.headers.get("Transfer-Encoding") {
        if te
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
        {
            return BodyFraming::Chunked;
        }
    }
    match response
        .headers
        .get("Content-Length")
        .and_then(|v| v.parse().ok())
    {
        Some(length) => BodyFraming::ContentLength(length),
        None => BodyFraming::UntilClose,
    }
}

/// Byte-by-byte scanner that finds where a chunked body ends while the
/// raw bytes are relayed untouched.
#[derive(Debug)]
pub struct ChunkedScanner {
    state: ChunkState,
}

#[derive(Debug)]
enum ChunkState {
    SizeLine { line: Vec<u8> },
    Data { remaining: u64 },
    DataCr,
    DataLf,
    Trailer { line: Vec<u8> },
    Done,
}

impl ChunkedScanner {
    pub fn new() -> Self {
        Self {
            state: ChunkState::SizeLine { line: Vec::new() },
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Consumes bytes from `input`, optionally appending the decoded
    /// chunk data to `decoded`. Returns how many bytes belong to this
    /// body; fewer than `input.len()` only once the terminator has been
    /// seen.
    pub fn feed(
        &mut self,
        input: &[u8],
        mut decoded: Option<&mut Vec<u8>>,
    ) -> Result<usize, HttpError> {
        let mut consumed = 0;
        while consumed < input.len() && !self.is_done() {
            let byte = input[consumed];
            match &mut self.state {
                ChunkState::SizeLine { line } => {
                    consumed += 1;
                    if byte == b'\n' {
                        let text = std::str::from_utf8(line).map_err(|_| HttpError::BadChunk)?;
                        let size_text = text
                            .trim_end_matches('\r')
                            .split(';')
                            .next()
                            .unwrap_or_default()
                            .trim();
                        let size =
                            u64::from_str_radix(size_text, 16).map_err(|_| HttpError::BadChunk)?;
                        self.state = if size == 0 {
                            ChunkState::Trailer { line: Vec::new() }
                        } else {
                            ChunkState::Data { remaining: size }
                        };
                    } else {
                        if line.len() > 64 {
                            return Err(HttpError::BadChunk);
                        }
                        line.push(byte);
                    }
                }
                ChunkState::Data { remaining } => {
                    let take = (*remaining).min((input.len() - consumed) as u64) as usize;
                    if let Some(decoded) = decoded.as_deref_mut() {
                        decoded.extend_from_slice(&input[consumed..consumed + take]);
                    }
                    consumed += take;
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = ChunkState::DataCr;
                    }
                }
                ChunkState::DataCr => {
                    if byte != b'\r' {
                        return Err(HttpError::BadChunk);
                    }
                    consumed += 1;
                    self.state = ChunkState::DataLf;
                }
                ChunkState::DataLf => {
                    if byte != b'\n' {
                        return Err(HttpError::BadChunk);
                    }
                    consumed += 1;
                    self.state = ChunkState::SizeLine { line: Vec::new() };
                }
                ChunkState::Trailer { line } => {
                    consumed += 1;
                    if byte == b'\n' {
                        let was_blank = line.iter().all(|&b| b == b'\r');
                        if was_blank {
                            self.state = ChunkState::Done;
                        } else {
                            line.clear();
                        }
                    } else {
                        if line.len() > HEAD_CAP {
                            return Err(HttpError::BadChunk);
                        }
                        line.push(byte);
                    }
                }
                ChunkState::Done => unreachable!(),
            }
        }
        Ok(consumed)
    }
}
