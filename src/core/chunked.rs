//! HTTP/1.1 chunked transfer-coding decoder.
//!
//! Size lines are hex, `\r` is ignored and `\n` ends the line. Blank lines
//! between chunks (the CRLF after each payload) are skipped. Decoding stops at
//! the zero-size chunk; any trailer section is left on the stream.

use crate::utils::error::{CtfError, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

const UNEXPECTED_EOF: &str = "unexpected end of chunked stream";

/// Reads a chunked body from `reader` and returns the concatenated payload.
pub async fn read_chunked<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    let mut chunks = 0usize;

    loop {
        let size = read_chunk_size(reader).await?;
        if size == 0 {
            break;
        }

        let read = (&mut *reader)
            .take(size as u64)
            .read_to_end(&mut body)
            .await?;
        if read < size {
            return Err(CtfError::protocol(UNEXPECTED_EOF));
        }
        chunks += 1;
        tracing::trace!("chunk #{} ({} bytes)", chunks, size);
    }

    tracing::debug!("Decoded {} chunks, {} bytes total", chunks, body.len());
    Ok(body)
}

async fn read_chunk_size<R>(reader: &mut R) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(CtfError::protocol(UNEXPECTED_EOF));
        }
        let trimmed = strip_line(&line);
        if trimmed.is_empty() {
            continue;
        }
        return parse_chunk_size(&trimmed);
    }
}

/// Decodes an in-memory chunked body.
pub fn decode_chunked(mut input: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::new();

    loop {
        let size = loop {
            let Some(end) = input.iter().position(|b| *b == b'\n') else {
                return Err(CtfError::protocol(UNEXPECTED_EOF));
            };
            let trimmed = strip_line(&input[..end]);
            input = &input[end + 1..];
            if !trimmed.is_empty() {
                break parse_chunk_size(&trimmed)?;
            }
        };

        if size == 0 {
            return Ok(body);
        }
        if input.len() < size {
            return Err(CtfError::protocol(UNEXPECTED_EOF));
        }
        body.extend_from_slice(&input[..size]);
        input = &input[size..];
    }
}

fn strip_line(line: &[u8]) -> Vec<u8> {
    line.iter()
        .copied()
        .filter(|b| *b != b'\r' && *b != b'\n')
        .collect()
}

/// Parses a chunk-size line, ignoring any `;extension`.
pub fn parse_chunk_size(line: &[u8]) -> Result<usize> {
    let text = String::from_utf8_lossy(line);
    let digits = text.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(digits, 16)
        .map_err(|_| CtfError::protocol(format!("invalid chunk size line: {:?}", text)))
}

/// Encodes `data` as a single chunk plus the terminating chunk.
pub fn encode_chunked(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    if !data.is_empty() {
        out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIKI_BODY: &[u8] = b"4\r\nWiki\r\n7\r\npedia i\r\nB\r\nn \r\nchunks.\r\n0\r\n\r\n";

    #[test]
    fn test_decode_standard_body() {
        let body = decode_chunked(WIKI_BODY).unwrap();
        assert_eq!(body, b"Wikipedia in \r\nchunks.");
    }

    #[test]
    fn test_decode_ignores_extensions_and_bare_newlines() {
        let body = decode_chunked(b"3;name=value\nabc\n\n2\nde\n0\n").unwrap();
        assert_eq!(body, b"abcde");
    }

    #[test]
    fn test_decode_rejects_bad_size() {
        let err = decode_chunked(b"zz\r\nabc\r\n0\r\n\r\n").unwrap_err();
        assert!(matches!(err, CtfError::ProtocolError { .. }));
    }

    #[test]
    fn test_decode_truncated_payload() {
        let err = decode_chunked(b"a\r\nshort").unwrap_err();
        assert!(err.to_string().contains("unexpected end"));
    }

    #[tokio::test]
    async fn test_read_chunked_from_stream_leaves_rest() {
        let mut input: &[u8] = b"5\r\nhello\r\n0\r\n\r\nNEXT";
        let body = read_chunked(&mut input).await.unwrap();
        assert_eq!(body, b"hello");
        assert_eq!(input, b"\r\nNEXT");
    }

    #[tokio::test]
    async fn test_read_chunked_split_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"7\r")
            .read(b"\nfla")
            .read(b"g{x}\r\n")
            .read(b"0\r\n\r\n")
            .build();
        let mut reader = tokio::io::BufReader::new(mock);
        let body = read_chunked(&mut reader).await.unwrap();
        assert_eq!(body, b"flag{x}");
    }

    #[tokio::test]
    async fn test_read_chunked_eof_before_terminator() {
        let mut input: &[u8] = b"3\r\nabc\r\n";
        let err = read_chunked(&mut input).await.unwrap_err();
        assert!(matches!(err, CtfError::ProtocolError { .. }));
    }

    #[test]
    fn test_encode_then_decode() {
        let encoded = encode_chunked(b"flag{chunky}");
        assert_eq!(decode_chunked(&encoded).unwrap(), b"flag{chunky}");
        assert_eq!(encode_chunked(b""), b"0\r\n\r\n");
    }
}
