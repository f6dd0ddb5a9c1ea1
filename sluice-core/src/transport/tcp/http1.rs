//! Plaintext HTTP/1.1 framing for the TCP engine
//!
//! One request per connection. The request head is assembled while the
//! reactor appends headers and goes out either right after `AppendHeaders`
//! or together with the body on the final write. Every request carries
//! `Connection: close`, so a response without a length runs until EOF.

use std::mem;

use httparse::Status;

use crate::error::{Result, SluiceError};
use crate::transport::Target;

/// Headers parsed from one response head.
const MAX_HEADERS: usize = 64;

/// A response head larger than this is refused.
const MAX_HEAD_LEN: usize = 64 * 1024;

/// Something the reader extracted from the inbound byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Piece {
    Head {
        status: u16,
        content_type: Option<String>,
    },
    /// `remaining` is the announced length still due, 0 when unknown.
    Body { data: Vec<u8>, remaining: usize },
    /// The response is complete.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Head,
    Length(usize),
    UntilClose,
    ChunkSize,
    ChunkData(usize),
    ChunkEnd,
    Trailer,
    Done,
}

/// Incremental response parser.
#[derive(Debug)]
pub(crate) struct ResponseReader {
    buf: Vec<u8>,
    state: ReadState,
    head_only: bool,
}

impl ResponseReader {
    /// `head_only` marks the answer to a HEAD request, which has no body
    /// whatever its headers say.
    pub(crate) fn new(head_only: bool) -> Self {
        Self {
            buf: Vec::new(),
            state: ReadState::Head,
            head_only,
        }
    }

    /// Consume `data`, returning whatever became complete.
    pub(crate) fn feed(&mut self, data: &[u8]) -> std::result::Result<Vec<Piece>, String> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            match self.state {
                ReadState::Head => match self.parse_head()? {
                    Some(head) => {
                        out.push(head);
                        if self.state == ReadState::Done {
                            out.push(Piece::End);
                        }
                    }
                    None => break,
                },
                ReadState::Length(left) => {
                    let take = left.min(self.buf.len());
                    if take > 0 {
                        let data = self.buf.drain(..take).collect();
                        out.push(Piece::Body {
                            data,
                            remaining: left - take,
                        });
                    }
                    if take == left {
                        self.state = ReadState::Done;
                        out.push(Piece::End);
                    } else {
                        self.state = ReadState::Length(left - take);
                        break;
                    }
                }
                ReadState::UntilClose => {
                    if !self.buf.is_empty() {
                        out.push(Piece::Body {
                            data: mem::take(&mut self.buf),
                            remaining: 0,
                        });
                    }
                    break;
                }
                ReadState::ChunkSize => match httparse::parse_chunk_size(&self.buf) {
                    Ok(Status::Complete((used, 0))) => {
                        self.buf.drain(..used);
                        self.state = ReadState::Trailer;
                    }
                    Ok(Status::Complete((used, size))) => {
                        self.buf.drain(..used);
                        let size = usize::try_from(size).map_err(|_| "chunk too large")?;
                        self.state = ReadState::ChunkData(size);
                    }
                    Ok(Status::Partial) => break,
                    Err(_) => return Err("malformed chunk size".to_string()),
                },
                ReadState::ChunkData(left) => {
                    let take = left.min(self.buf.len());
                    if take > 0 {
                        let data = self.buf.drain(..take).collect();
                        out.push(Piece::Body { data, remaining: 0 });
                    }
                    if take == left {
                        self.state = ReadState::ChunkEnd;
                    } else {
                        self.state = ReadState::ChunkData(left - take);
                        break;
                    }
                }
                ReadState::ChunkEnd => {
                    if self.buf.len() < 2 {
                        break;
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err("malformed chunk terminator".to_string());
                    }
                    self.buf.drain(..2);
                    self.state = ReadState::ChunkSize;
                }
                ReadState::Trailer => {
                    let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") else {
                        break;
                    };
                    self.buf.drain(..pos + 2);
                    if pos == 0 {
                        self.state = ReadState::Done;
                        out.push(Piece::End);
                    }
                }
                ReadState::Done => {
                    self.buf.clear();
                    break;
                }
            }
        }
        Ok(out)
    }

    /// The peer closed the connection. `Ok` if that ends the response.
    pub(crate) fn eof(&self) -> std::result::Result<(), String> {
        match self.state {
            ReadState::UntilClose | ReadState::Done => Ok(()),
            ReadState::Head => Err("connection closed before response".to_string()),
            _ => Err("connection closed mid-body".to_string()),
        }
    }

    fn parse_head(&mut self) -> std::result::Result<Option<Piece>, String> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let consumed = match response.parse(&self.buf) {
            Ok(Status::Complete(n)) => n,
            Ok(Status::Partial) => {
                if self.buf.len() > MAX_HEAD_LEN {
                    return Err("response head too large".to_string());
                }
                return Ok(None);
            }
            Err(e) => return Err(format!("malformed response head: {e}")),
        };

        let status = response.code.unwrap_or(0);
        let mut content_type = None;
        let mut length = None;
        let mut chunked = false;
        for header in response.headers.iter() {
            if header.name.eq_ignore_ascii_case("content-type") {
                content_type = Some(String::from_utf8_lossy(header.value).into_owned());
            } else if header.name.eq_ignore_ascii_case("content-length") {
                let parsed = std::str::from_utf8(header.value)
                    .ok()
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .ok_or("invalid Content-Length")?;
                length = Some(parsed);
            } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = String::from_utf8_lossy(header.value)
                    .to_ascii_lowercase()
                    .contains("chunked");
            }
        }
        self.buf.drain(..consumed);

        // Interim responses precede the real one.
        if (100..200).contains(&status) && status != 101 {
            return self.parse_head();
        }

        self.state = if self.head_only || matches!(status, 101 | 204 | 304) {
            ReadState::Done
        } else if chunked {
            ReadState::ChunkSize
        } else if let Some(length) = length {
            ReadState::Length(length)
        } else {
            ReadState::UntilClose
        };
        Ok(Some(Piece::Head {
            status,
            content_type,
        }))
    }
}

/// Request-side state of one HTTP connection.
#[derive(Debug)]
pub(crate) struct Http1 {
    head: Vec<u8>,
    head_sent: bool,
    pub(crate) body_pending: bool,
    pub(crate) reader: ResponseReader,
}

impl Http1 {
    pub(crate) fn new(target: &Target) -> Self {
        let host = if target.port == 80 {
            target.host.clone()
        } else {
            format!("{}:{}", target.host, target.port)
        };
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n",
            target.method, target.path
        );
        if let Some(origin) = &target.origin {
            head.push_str("Origin: ");
            head.push_str(origin);
            head.push_str("\r\n");
        }
        Self {
            head: head.into_bytes(),
            head_sent: false,
            body_pending: false,
            reader: ResponseReader::new(target.method.eq_ignore_ascii_case("HEAD")),
        }
    }

    pub(crate) fn append_header(&mut self, name: &str, value: &str) -> Result<()> {
        if self.head_sent {
            return Err(SluiceError::transport("request head already sent"));
        }
        let bad_name = name.is_empty()
            || name
                .bytes()
                .any(|b| b == b':' || b.is_ascii_whitespace() || b.is_ascii_control());
        if bad_name || value.bytes().any(|b| b == b'\r' || b == b'\n') {
            return Err(SluiceError::transport(format!("invalid header {name}")));
        }
        self.head.extend_from_slice(name.as_bytes());
        self.head.extend_from_slice(b": ");
        self.head.extend_from_slice(value.as_bytes());
        self.head.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// The terminated request head, once.
    pub(crate) fn take_head(&mut self) -> Option<Vec<u8>> {
        if self.head_sent {
            return None;
        }
        self.head_sent = true;
        let mut head = mem::take(&mut self.head);
        head.extend_from_slice(b"\r\n");
        Some(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Kind;

    fn head(status: u16, content_type: Option<&str>) -> Piece {
        Piece::Head {
            status,
            content_type: content_type.map(str::to_owned),
        }
    }

    fn body(data: &[u8], remaining: usize) -> Piece {
        Piece::Body {
            data: data.to_vec(),
            remaining,
        }
    }

    #[test]
    fn test_request_head_layout() {
        let target = Target::new(Kind::Http, "api.test", 8080)
            .with_method("POST")
            .with_path("/v1/orders")
            .with_origin(Some("https://app.test".into()));
        let mut http = Http1::new(&target);
        http.append_header("Content-Length", "3").unwrap();
        let head = String::from_utf8(http.take_head().unwrap()).unwrap();
        assert_eq!(
            head,
            "POST /v1/orders HTTP/1.1\r\nHost: api.test:8080\r\nConnection: close\r\n\
             Origin: https://app.test\r\nContent-Length: 3\r\n\r\n"
        );
        assert!(http.take_head().is_none());
        assert!(http.append_header("X-Late", "1").is_err());
    }

    #[test]
    fn test_header_injection_refused() {
        let mut http = Http1::new(&Target::new(Kind::Http, "h", 80));
        assert!(http.append_header("X-A", "1\r\nX-B: 2").is_err());
        assert!(http.append_header("Bad Name", "1").is_err());
        assert!(http.append_header("", "1").is_err());
    }

    #[test]
    fn test_content_length_split_across_reads() {
        let mut reader = ResponseReader::new(false);
        let first = reader
            .feed(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Len")
            .unwrap();
        assert!(first.is_empty());
        let second = reader.feed(b"gth: 5\r\n\r\nhel").unwrap();
        assert_eq!(second, [head(200, Some("text/plain")), body(b"hel", 2)]);
        let third = reader.feed(b"lo").unwrap();
        assert_eq!(third, [body(b"lo", 0), Piece::End]);
        assert!(reader.eof().is_ok());
    }

    #[test]
    fn test_chunked_body() {
        let mut reader = ResponseReader::new(false);
        let pieces = reader
            .feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nsome\r\n6\r\n data!\r\n0\r\n\r\n")
            .unwrap();
        assert_eq!(
            pieces,
            [head(200, None), body(b"some", 0), body(b" data!", 0), Piece::End]
        );
    }

    #[test]
    fn test_body_until_close() {
        let mut reader = ResponseReader::new(false);
        let pieces = reader.feed(b"HTTP/1.0 404 Not Found\r\n\r\nmissing").unwrap();
        assert_eq!(pieces, [head(404, None), body(b"missing", 0)]);
        assert!(reader.eof().is_ok());
    }

    #[test]
    fn test_bodiless_responses() {
        let mut reader = ResponseReader::new(false);
        let pieces = reader
            .feed(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n")
            .unwrap();
        assert_eq!(pieces, [head(204, None), Piece::End]);

        let mut reader = ResponseReader::new(true);
        let pieces = reader
            .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n")
            .unwrap();
        assert_eq!(pieces, [head(200, None), Piece::End]);
    }

    #[test]
    fn test_truncated_response_is_an_error() {
        let mut reader = ResponseReader::new(false);
        assert!(reader.eof().is_err());
        reader
            .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc")
            .unwrap();
        assert_eq!(reader.eof().unwrap_err(), "connection closed mid-body");
        assert!(ResponseReader::new(false).feed(b"garbage\r\n\r\n").is_err());
    }
}
