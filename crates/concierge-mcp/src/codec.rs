//! Message framing for capability-server stdio channels.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use concierge_types::Framing;

/// Largest frame payload accepted from a server.
pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

const MAX_HEADER_LINE: u64 = 8 * 1024;

/// Reads whole frames from a server's stdout.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    framing: Framing,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, framing: Framing) -> Self {
        Self {
            inner: BufReader::new(reader),
            framing,
            max_frame: MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Next frame payload, or `None` at end of stream.
    pub async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self.framing {
            Framing::Newline => self.next_line().await,
            Framing::ContentLength => self.next_sized().await,
        }
    }

    async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        loop {
            line.clear();
            let limit = (self.max_frame as u64).saturating_add(1);
            if (&mut self.inner).take(limit).read_until(b'\n', &mut line).await? == 0 {
                return Ok(None);
            }
            if line.len() > self.max_frame && line.last() != Some(&b'\n') {
                return Err(oversized(line.len(), self.max_frame));
            }
            let trimmed = line.trim_ascii();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_vec()));
            }
        }
    }

    async fn next_sized(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut length: Option<usize> = None;
        let mut saw_header = false;
        let mut line = String::new();
        loop {
            line.clear();
            let read = (&mut self.inner).take(MAX_HEADER_LINE).read_line(&mut line).await?;
            if read as u64 == MAX_HEADER_LINE && !line.ends_with('\n') {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "frame header line too long"));
            }
            if read == 0 {
                if saw_header {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside frame header",
                    ));
                }
                return Ok(None);
            }
            let header = line.trim_end_matches(['\r', '\n']);
            if header.is_empty() {
                if !saw_header {
                    // Blank separator lines between frames.
                    continue;
                }
                break;
            }
            saw_header = true;
            if let Some((name, value)) = header.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    let parsed = value.trim().parse::<usize>().map_err(|e| {
                        io::Error::new(io::ErrorKind::InvalidData, format!("bad Content-Length: {e}"))
                    })?;
                    length = Some(parsed);
                }
            }
        }

        let length = length.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "frame header without Content-Length")
        })?;
        if length > self.max_frame {
            return Err(oversized(length, self.max_frame));
        }
        let mut body = vec![0u8; length];
        self.inner.read_exact(&mut body).await?;
        Ok(Some(body))
    }
}

fn oversized(length: usize, max: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame of {length} bytes exceeds the {max} byte limit"),
    )
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    framing: Framing,
    payload: &[u8],
) -> io::Result<()> {
    match framing {
        Framing::Newline => {
            writer.write_all(payload).await?;
            writer.write_all(b"\n").await?;
        }
        Framing::ContentLength => {
            let header = format!("Content-Length: {}\r\n\r\n", payload.len());
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(payload).await?;
        }
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_newline_frames_skip_blank_lines() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"{\"a\":1}\n\n  \r\n{\"b\":2}\r\n").await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, Framing::Newline);
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"{\"b\":2}");
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_content_length_written_and_read() {
        let (mut client, server) = tokio::io::duplex(1024);
        write_frame(&mut client, Framing::ContentLength, b"{\"id\":1}").await.unwrap();
        write_frame(&mut client, Framing::ContentLength, b"{\"id\":2}").await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, Framing::ContentLength);
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"{\"id\":1}");
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"{\"id\":2}");
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_content_length_header_is_case_insensitive() {
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"content-length: 2\r\nContent-Type: application/json\r\n\r\n{}")
            .await
            .unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, Framing::ContentLength);
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_content_length_missing_header_is_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"X-Other: 1\r\n\r\n{}").await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, Framing::ContentLength);
        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_content_length_above_limit_is_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"Content-Length: 18446744073709551615\r\n\r\n{}")
            .await
            .unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, Framing::ContentLength);
        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_content_length_respects_custom_limit() {
        let (mut client, server) = tokio::io::duplex(1024);
        write_frame(&mut client, Framing::ContentLength, b"{\"id\":1}").await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, Framing::ContentLength).with_max_frame(4);
        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_newline_frame_above_limit_is_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"{}\n{\"long\":\"xxxxxxxxxxxxxxxx\"}\n").await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, Framing::Newline).with_max_frame(8);
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"{}");
        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_header_line_without_end_is_error() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let header = vec![b'X'; 20 * 1024];
        client.write_all(&header).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, Framing::ContentLength);
        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_newline_writer_appends_terminator() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, Framing::Newline, b"{}").await.unwrap();
        drop(client);
        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"{}\n");
    }
}
