// multipart/mixed bodies used by the HTTP transport. JSON messages travel as
// `application/json` parts and media chunks as `application/octet-stream`
// parts, in the order they would have gone over the stream.

use crate::{Frame, TransportError};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

pub fn encode_multipart(frames: &[Frame], boundary: &str) -> Bytes {
    let mut out = BytesMut::new();
    for frame in frames {
        out.put_slice(b"--");
        out.put_slice(boundary.as_bytes());
        out.put_slice(b"\r\n");
        let (content_type, body): (&str, &[u8]) = match frame {
            Frame::Text(text) => (JSON_CONTENT_TYPE, text.as_bytes()),
            Frame::Binary(data) => (BINARY_CONTENT_TYPE, data),
        };
        out.put_slice(b"Content-Type: ");
        out.put_slice(content_type.as_bytes());
        out.put_slice(b"\r\n");
        out.put_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        out.put_slice(body);
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"--");
    out.put_slice(boundary.as_bytes());
    out.put_slice(b"--\r\n");
    out.freeze()
}

/// `boundary` parameter of a multipart content type, unquoted.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let (media_type, params) = content_type.split_once(';')?;
    if !media_type.trim().to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    params.split(';').find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
            .filter(|b| !b.is_empty())
    })
}

/// Split a multipart body into frames. Accepts CRLF or bare LF line endings.
pub fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<Frame>, TransportError> {
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();

    let mut frames = Vec::new();
    let mut cursor = find(body, delimiter, 0)
        .ok_or_else(|| TransportError::Codec("multipart body has no boundary".into()))?;

    loop {
        let after = cursor + delimiter.len();
        if body[after..].starts_with(b"--") {
            return Ok(frames);
        }
        let part_start = skip_line_end(body, after);
        let next = find(body, delimiter, part_start)
            .ok_or_else(|| TransportError::Codec("multipart body is not terminated".into()))?;

        let part = trim_line_end(&body[part_start..next]);
        if let Some(frame) = parse_part(part)? {
            frames.push(frame);
        }
        cursor = next;
    }
}

fn parse_part(part: &[u8]) -> Result<Option<Frame>, TransportError> {
    let (headers, body) = match find(part, b"\r\n\r\n", 0) {
        Some(end) => (&part[..end], &part[end + 4..]),
        None => match find(part, b"\n\n", 0) {
            Some(end) => (&part[..end], &part[end + 2..]),
            None => (&b""[..], part),
        },
    };

    let headers = String::from_utf8_lossy(headers);
    let content_type = headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.trim().to_ascii_lowercase())
        .unwrap_or_else(|| JSON_CONTENT_TYPE.to_string());

    if content_type.starts_with(JSON_CONTENT_TYPE) || content_type.starts_with("text/") {
        let text = std::str::from_utf8(body)
            .map_err(|e| TransportError::Codec(format!("JSON part is not UTF-8: {}", e)))?;
        Ok(Some(Frame::Text(text.to_string())))
    } else if content_type.starts_with(BINARY_CONTENT_TYPE) {
        Ok(Some(Frame::Binary(Bytes::copy_from_slice(body))))
    } else {
        warn!("Skipping multipart part with content type {}", content_type);
        Ok(None)
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

fn skip_line_end(body: &[u8], at: usize) -> usize {
    if body[at..].starts_with(b"\r\n") {
        at + 2
    } else if body[at..].starts_with(b"\n") {
        at + 1
    } else {
        at
    }
}

fn trim_line_end(part: &[u8]) -> &[u8] {
    part.strip_suffix(b"\r\n")
        .or_else(|| part.strip_suffix(b"\n"))
        .unwrap_or(part)
}
