//! Minimal HTTP/1.1 request parsing and response writing, shared by the
//! collector and the edge ingest server.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 8192;
pub(crate) const MAX_BODY_BYTES: usize = 64 * 1024;
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub(crate) struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Header lookup by lower-case name; blank values count as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }
}

/// Read one request. Bodies declaring more than `max_body` bytes are refused
/// before any of the body is buffered.
pub(crate) fn read_request<S: Read>(stream: &mut S, max_body: usize) -> Result<HttpRequest> {
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > max_body {
        return Err(anyhow!("request body of {} bytes too large", content_length));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!(
                "connection closed after {} of {} body bytes",
                body.len(),
                content_length
            ));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        headers,
        body,
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

pub(crate) fn write_json_response<S: Write>(stream: &mut S, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

pub(crate) fn write_response<S: Write>(
    stream: &mut S,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}
