//! Raw HTTP/1.1 bytes for sockets that bypass the HTTP client.

use crate::core::chunked::read_chunked;
use crate::domain::model::RawResponse;
use crate::utils::error::{CtfError, Result};
use reqwest::header::{CONTENT_LENGTH, HOST};
use reqwest::Request;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Formats a built request as it would appear on the wire.
///
/// The request line uses the path plus query only. `host` and `content-length`
/// are filled in when the client left them for the connection layer to add.
pub fn format_raw_request(request: &Request) -> Vec<u8> {
    let url = request.url();
    let body = request.body().and_then(|b| b.as_bytes()).unwrap_or_default();

    let mut head = format!("{} {}", request.method(), url.path());
    if let Some(query) = url.query() {
        head.push('?');
        head.push_str(query);
    }
    head.push_str(" HTTP/1.1\r\n");

    if !request.headers().contains_key(HOST) {
        if let Some(host) = url.host_str() {
            match url.port() {
                Some(port) => head.push_str(&format!("host: {}:{}\r\n", host, port)),
                None => head.push_str(&format!("host: {}\r\n", host)),
            }
        }
    }

    for (name, value) in request.headers() {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push_str("\r\n");
    }

    if !body.is_empty() && !request.headers().contains_key(CONTENT_LENGTH) {
        head.push_str(&format!("content-length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");

    let mut raw = head.into_bytes();
    raw.extend_from_slice(body);
    raw
}

/// Reads one response: status line, headers, then the body framed by
/// `transfer-encoding: chunked`, `content-length`, or EOF.
pub async fn read_response<R>(reader: &mut R) -> Result<RawResponse>
where
    R: AsyncBufRead + Unpin,
{
    let status_line = read_line(reader).await?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default().to_string();
    if !version.starts_with("HTTP/") {
        return Err(CtfError::protocol(format!(
            "invalid status line: {:?}",
            status_line
        )));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| CtfError::protocol(format!("invalid status code: {:?}", status_line)))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(CtfError::protocol(format!("invalid header line: {:?}", line)));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let mut response = RawResponse {
        version,
        status,
        reason,
        headers,
        body: Vec::new(),
    };

    let chunked = response
        .header("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    response.body = if chunked {
        read_chunked(reader).await?
    } else if let Some(length) = response.header("content-length") {
        let length: u64 = length
            .parse()
            .map_err(|_| CtfError::protocol(format!("invalid content-length: {:?}", length)))?;
        let mut body = Vec::new();
        let read = (&mut *reader).take(length).read_to_end(&mut body).await?;
        if (read as u64) < length {
            return Err(CtfError::protocol("unexpected end of response body"));
        }
        body
    } else {
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await?;
        body
    };

    tracing::debug!(
        "Raw response {} {} ({} bytes body)",
        response.status,
        response.reason,
        response.body.len()
    );
    Ok(response)
}

async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Err(CtfError::protocol("connection closed before response head"));
    }
    while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
