//! forelay/src/protocol.rs
//! HTTP/1.x head parsing and body framing utilities.

use crate::error::{ProxyError, Result};
use std::io::{Error, ErrorKind};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a request or response head. Exceeding it is a protocol error.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Header {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A parsed request head. Headers keep their original order and duplicates;
/// lookup is case-insensitive.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Minor version of HTTP/1.x.
    pub version: u8,
    pub headers: Vec<Header>,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// First header with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        for h in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", h.name, h.value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<Header>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the peer will close this connection after the response.
    pub fn wants_close(&self) -> bool {
        let conn = self
            .header("connection")
            .or_else(|| self.header("proxy-connection"));
        match conn {
            Some(v) => v.to_ascii_lowercase().contains("close"),
            None => self.version == 0,
        }
    }
}

/// Reads one head (request or response) up to and including the CRLFCRLF,
/// bounded by [`MAX_HEAD_BYTES`]. Bytes past the head stay buffered in the
/// reader.
pub async fn read_head_bytes<R>(stream: &mut R, what: &str) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(512);
    loop {
        let line_start = head.len();
        let n = stream.read_until(b'\n', &mut head).await?;
        if n == 0 {
            return Err(ProxyError::Protocol(if head.is_empty() {
                format!("connection closed before {what} head")
            } else {
                format!("{what} head truncated")
            }));
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::Protocol(format!(
                "{what} head exceeds {MAX_HEAD_BYTES} bytes"
            )));
        }
        let line = &head[line_start..];
        if line == b"\r\n" || line == b"\n" {
            if line_start == 0 {
                return Err(ProxyError::Protocol(format!("empty {what} head")));
            }
            break;
        }
    }
    Ok(head)
}

pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::Protocol("truncated request head".into()));
        }
        Err(e) => return Err(ProxyError::Protocol(format!("bad request head: {e}"))),
    }
    let method = req
        .method
        .ok_or_else(|| ProxyError::Protocol("missing method".into()))?
        .to_string();
    let target = req
        .path
        .ok_or_else(|| ProxyError::Protocol("missing request target".into()))?
        .to_string();
    let version = req.version.unwrap_or(1);
    Ok(RequestHead {
        method,
        target,
        version,
        headers: convert_headers(req.headers)?,
    })
}

pub fn parse_response_head(raw: &[u8]) -> Result<ResponseHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::Protocol("truncated response head".into()));
        }
        Err(e) => return Err(ProxyError::Protocol(format!("bad response head: {e}"))),
    }
    Ok(ResponseHead {
        version: resp.version.unwrap_or(1),
        status: resp
            .code
            .ok_or_else(|| ProxyError::Protocol("missing status code".into()))?,
        reason: resp.reason.unwrap_or("").to_string(),
        headers: convert_headers(resp.headers)?,
    })
}

fn convert_headers(parsed: &[httparse::Header<'_>]) -> Result<Vec<Header>> {
    parsed
        .iter()
        .map(|h| {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| ProxyError::Protocol(format!("non-UTF-8 value in {}", h.name)))?;
            Ok(Header::new(h.name, value))
        })
        .collect()
}

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "upgrade",
    "proxy-connection",
];

/// Removes hop-by-hop headers, including any named by a Connection header.
/// Transfer-Encoding survives: the body is streamed through unreframed, so
/// it stays the framing header of the forwarded message.
pub fn strip_hop_by_hop(headers: &mut Vec<Header>) {
    let mut named: Vec<String> = Vec::new();
    for h in headers.iter() {
        if h.name.eq_ignore_ascii_case("connection")
            || h.name.eq_ignore_ascii_case("proxy-connection")
        {
            named.extend(h.value.split(',').map(|t| t.trim().to_ascii_lowercase()));
        }
    }
    headers.retain(|h| {
        let n = h.name.to_ascii_lowercase();
        if n == "transfer-encoding" {
            return true;
        }
        !(HOP_BY_HOP.contains(&n.as_str()) || named.contains(&n))
    });
}

/// Body framing of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

pub fn request_body_length(head: &RequestHead) -> Result<BodyLength> {
    if let Some(te) = head.header("transfer-encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(BodyLength::Chunked);
        }
        return Err(ProxyError::Protocol(format!(
            "unsupported transfer encoding: {te}"
        )));
    }
    match head.header("content-length") {
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(BodyLength::Length)
            .map_err(|_| ProxyError::Protocol(format!("bad content-length: {v}"))),
        None => Ok(BodyLength::Empty),
    }
}

pub fn response_body_length(request_method: &str, resp: &ResponseHead) -> BodyLength {
    if request_method.eq_ignore_ascii_case("HEAD")
        || resp.status < 200
        || resp.status == 204
        || resp.status == 304
    {
        return BodyLength::Empty;
    }
    if let Some(te) = resp.header("transfer-encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return BodyLength::Chunked;
        }
    }
    if let Some(cl) = resp.header("content-length") {
        if let Ok(n) = cl.trim().parse::<u64>() {
            return BodyLength::Length(n);
        }
    }
    BodyLength::UntilClose
}

/// Streams a message body from `src` to `dst` per its framing; chunked
/// bodies pass through with their chunk lines intact. Returns bytes copied.
pub async fn copy_body<R, W>(src: &mut R, dst: &mut W, length: &BodyLength) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match length {
        BodyLength::Empty => 0,
        BodyLength::Length(n) => copy_exact(src, dst, *n).await?,
        BodyLength::Chunked => copy_chunked(src, dst).await?,
        BodyLength::UntilClose => tokio::io::copy(src, dst).await?,
    };
    dst.flush().await?;
    Ok(copied)
}

async fn copy_exact<R, W>(src: &mut R, dst: &mut W, n: u64) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut limited = (&mut *src).take(n);
    let copied = tokio::io::copy(&mut limited, dst).await?;
    if copied < n {
        return Err(Error::new(ErrorKind::UnexpectedEof, "body truncated").into());
    }
    Ok(copied)
}

async fn copy_chunked<R, W>(src: &mut R, dst: &mut W) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let mut line = Vec::with_capacity(16);
        let n = src.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(Error::new(ErrorKind::UnexpectedEof, "chunked body truncated").into());
        }
        dst.write_all(&line).await?;
        total += line.len() as u64;

        let size_text = std::str::from_utf8(&line)
            .map_err(|_| ProxyError::Protocol("bad chunk size line".into()))?
            .trim();
        let size_text = size_text.split(';').next().unwrap_or("");
        let size = u64::from_str_radix(size_text, 16)
            .map_err(|_| ProxyError::Protocol(format!("bad chunk size: {size_text}")))?;

        if size == 0 {
            // Trailer section, terminated by an empty line.
            loop {
                let mut trailer = Vec::with_capacity(8);
                let n = src.read_until(b'\n', &mut trailer).await?;
                if n == 0 {
                    return Err(
                        Error::new(ErrorKind::UnexpectedEof, "chunked trailer truncated").into(),
                    );
                }
                dst.write_all(&trailer).await?;
                total += trailer.len() as u64;
                if trailer == b"\r\n" || trailer == b"\n" {
                    return Ok(total);
                }
            }
        }
        // Chunk data plus its trailing CRLF.
        total += copy_exact(src, dst, size + 2).await?;
    }
}

/// A canned plain-text error response.
pub fn error_response(status: u16, message: &str) -> Vec<u8> {
    let reason = match status {
        400 => "Bad Request",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Internal Server Error",
    };
    let body = format!("{status} {reason}: {message}\r\n");
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}
