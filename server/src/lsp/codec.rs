//! `Content-Length` framing used by the language-protocol transport.

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Largest accepted frame body (16 MiB).
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Longest header line accepted before the frame is declared malformed.
const MAX_HEADER_LINE: u64 = 1024;

/// `Some(len)` for a `Content-Length` header, `None` for any other header.
fn content_length(line: &str) -> Result<Option<usize>> {
    let Some((name, value)) = line.split_once(':') else {
        bail!("malformed header line {line:?}");
    };
    if !name.trim().eq_ignore_ascii_case("Content-Length") {
        return Ok(None);
    }
    let len = value
        .trim()
        .parse()
        .with_context(|| format!("invalid Content-Length {value:?}"))?;
    Ok(Some(len))
}

pub(crate) struct FrameReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::new(),
        }
    }

    /// Read one header line, or `None` at EOF.
    async fn header_line(&mut self) -> Result<Option<String>> {
        self.line.clear();
        let read = (&mut self.reader)
            .take(MAX_HEADER_LINE)
            .read_until(b'\n', &mut self.line)
            .await
            .context("reading frame header")?;
        if read == 0 {
            return Ok(None);
        }
        if self.line.last() != Some(&b'\n') {
            bail!("frame header line is unterminated or too long");
        }
        let text = str::from_utf8(&self.line).context("frame header is not UTF-8")?;
        Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Read the next message. `Ok(None)` means the peer closed the stream
    /// between frames.
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Value>> {
        let mut length = None;
        let mut first = true;
        loop {
            let Some(line) = self.header_line().await? else {
                if first {
                    return Ok(None);
                }
                bail!("stream closed inside frame headers");
            };
            first = false;
            if line.is_empty() {
                break;
            }
            if let Some(len) = content_length(&line)? {
                length = Some(len);
            }
        }

        let Some(length) = length else {
            bail!("frame has no Content-Length header");
        };
        if length > MAX_FRAME_BYTES {
            bail!("frame of {length} bytes exceeds the {MAX_FRAME_BYTES} byte limit");
        }

        let mut body = vec![0; length];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;
        serde_json::from_slice(&body)
            .map(Some)
            .context("frame body is not valid JSON")
    }
}

pub(crate) struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self { writer }
    }

    pub(crate) async fn write_frame(&mut self, message: &Value) -> Result<()> {
        let body = serde_json::to_vec(message).context("encoding frame")?;
        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(&body);
        self.writer
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.writer.flush().await.context("flushing frame")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn read_all(input: &[u8]) -> Vec<Result<Option<Value>>> {
        let mut reader = FrameReader::new(input);
        let mut out = Vec::new();
        loop {
            let frame = reader.read_frame().await;
            let stop = !matches!(frame, Ok(Some(_)));
            out.push(frame);
            if stop {
                return out;
            }
        }
    }

    #[tokio::test]
    async fn test_writer_output_is_readable() {
        let mut buf = Vec::new();
        let message = json!({ "jsonrpc": "2.0", "method": "o#/log", "params": { "Message": "é" } });
        FrameWriter::new(&mut buf).write_frame(&message).await.unwrap();

        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("Content-Length: "));

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap(), Some(message));
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_extra_headers_and_case_ignored() {
        let input = b"content-type: application/vscode-jsonrpc\r\ncontent-length: 2\r\n\r\n{}";
        let frames = read_all(input).await;
        assert_eq!(frames[0].as_ref().unwrap(), &Some(json!({})));
    }

    #[tokio::test]
    async fn test_missing_length_is_error() {
        let frames = read_all(b"Content-Type: x\r\n\r\n{}").await;
        assert!(frames[0].is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let input = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let frames = read_all(input.as_bytes()).await;
        assert!(frames[0].is_err());
    }

    #[tokio::test]
    async fn test_eof_inside_headers_is_error() {
        let frames = read_all(b"Content-Length: 2\r\n").await;
        assert!(frames[0].is_err());
    }

    #[test]
    fn test_content_length_parsing() {
        assert_eq!(content_length("Content-Length: 42").unwrap(), Some(42));
        assert_eq!(content_length("Content-Type: utf8").unwrap(), None);
        assert!(content_length("Content-Length: lots").is_err());
        assert!(content_length("garbage").is_err());
    }
}
