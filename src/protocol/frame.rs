//! Length-prefixed framing
//!
//! A frame is a 4-byte big-endian body length followed by the body. The reader
//! keeps partial frames in its own buffer, so a read abandoned by a timeout
//! loses nothing and the next call resumes where it stopped.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LEN_PREFIX: usize = 4;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame is skipped; the stream stays usable.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max_frame_bytes: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > max_frame_bytes {
        return Err(FrameError::TooLarge {
            len: body.len(),
            max: max_frame_bytes,
        });
    }
    let len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge {
        len: body.len(),
        max: max_frame_bytes,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Cancel-safe frame reader.
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
    /// Bytes of an oversized frame still to be thrown away
    discard: usize,
    max_frame_bytes: usize,
}

impl FrameReader {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(READ_CHUNK),
            discard: 0,
            max_frame_bytes,
        }
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Read the next complete frame body.
    ///
    /// Returns `TooLarge` once per oversized frame, after which its bytes are
    /// skipped by later calls.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Vec<u8>, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(frame);
            }
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(FrameError::Closed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.discard > 0 {
            let skip = self.discard.min(self.buf.len());
            self.buf.drain(..skip);
            self.discard -= skip;
            if self.discard > 0 {
                return Ok(None);
            }
        }

        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > self.max_frame_bytes {
            self.buf.drain(..LEN_PREFIX);
            self.discard = len;
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }

        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let frame = self.buf[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buf.drain(..LEN_PREFIX + len);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let bytes = framed(b"hello frame");
        let mut mock = tokio_test::io::Builder::new()
            .read(&bytes[..3])
            .read(&bytes[3..9])
            .read(&bytes[9..])
            .build();
        let mut reader = FrameReader::new(1024);
        let frame = reader.read_frame(&mut mock).await.unwrap();
        assert_eq!(frame, b"hello frame");
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_two_frames_in_one_read() {
        let mut bytes = framed(b"one");
        bytes.extend(framed(b"two"));
        let mut mock = tokio_test::io::Builder::new().read(&bytes).build();
        let mut reader = FrameReader::new(1024);
        assert_eq!(reader.read_frame(&mut mock).await.unwrap(), b"one");
        assert_eq!(reader.read_frame(&mut mock).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_oversized_frame_skipped() {
        let mut bytes = framed(&[7u8; 40]);
        bytes.extend(framed(b"ok"));
        let mut mock = tokio_test::io::Builder::new().read(&bytes).build();
        let mut reader = FrameReader::new(16);
        assert!(matches!(
            reader.read_frame(&mut mock).await,
            Err(FrameError::TooLarge { len: 40, max: 16 })
        ));
        assert_eq!(reader.read_frame(&mut mock).await.unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_eof_reports_closed() {
        let mut mock = tokio_test::io::Builder::new().read(&[0, 0]).build();
        let mut reader = FrameReader::new(16);
        assert!(matches!(
            reader.read_frame(&mut mock).await,
            Err(FrameError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_write_frame_prefixes_length() {
        let mut mock = tokio_test::io::Builder::new()
            .write(&[0, 0, 0, 5])
            .write(b"abcde")
            .build();
        write_frame(&mut mock, b"abcde", 1024).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_frame_rejects_oversized_body() {
        let mut sink = Vec::new();
        assert!(matches!(
            write_frame(&mut sink, &[0u8; 32], 16).await,
            Err(FrameError::TooLarge { len: 32, max: 16 })
        ));
        assert!(sink.is_empty());
    }
}
