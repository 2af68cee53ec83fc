use std::io::Cursor;

use bytes::{Bytes, BytesMut};
use rmp_serde::decode::Error as RmpDecodeError;
use serde::de::IgnoredAny;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::{CodecType, Header};
use crate::error::{Error, ErrorKind, Result};

/// Upper bound on the bytes buffered while waiting for one value to finish.
pub(crate) const MAX_VALUE_SIZE: usize = 64 << 20;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reading half of a connection.
///
/// Values arrive back to back with no framework-level length prefix; the
/// codec delimits its own values. Incoming bytes accumulate in a buffer and
/// each read hands out exactly one complete value, waiting for more input
/// while the value at the front is still partial. Handing the value out as
/// raw bytes is also the skip operation: a response nobody waits for is
/// consumed and dropped without being decoded.
pub(crate) struct FrameReader {
    read: BufReader<BoxedReader>,
    kind: CodecType,
    buf: BytesMut,
}

impl FrameReader {
    pub fn new(read: BufReader<BoxedReader>, kind: CodecType) -> Self {
        Self {
            read,
            kind,
            buf: BytesMut::with_capacity(8 << 10),
        }
    }

    /// Reads and decodes the header value that starts the next frame.
    ///
    /// # Errors
    ///
    /// `ErrorKind::Eof` when the peer closed the stream between frames.
    pub async fn read_header(&mut self) -> Result<Header> {
        let bytes = self.next_value(true).await?;
        self.kind.decode(&bytes)
    }

    /// Consumes the body value without decoding it.
    pub async fn read_body(&mut self) -> Result<Bytes> {
        self.next_value(false).await
    }

    async fn next_value(&mut self, at_frame_boundary: bool) -> Result<Bytes> {
        loop {
            if let Some(len) = scan_value(self.kind, &self.buf)? {
                return Ok(self.buf.split_to(len).freeze());
            }
            if self.buf.len() >= MAX_VALUE_SIZE {
                return Err(Error::new(
                    ErrorKind::RecvFailed,
                    format!("value is too long: {} bytes buffered", self.buf.len()),
                ));
            }
            let n = self
                .read
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| Error::new(ErrorKind::RecvFailed, e.to_string()))?;
            if n == 0 {
                if at_frame_boundary && self.buf.is_empty() {
                    return Err(Error::new(ErrorKind::Eof, ""));
                }
                return Err(Error::new(ErrorKind::RecvFailed, "stream closed mid-value"));
            }
        }
    }
}

/// How far the value at the front of `buf` extends, once it is complete.
fn scan_value(kind: CodecType, buf: &[u8]) -> Result<Option<usize>> {
    match kind {
        CodecType::Msgpack => scan_msgpack(buf),
        CodecType::Json => Ok(scan_json_line(buf)),
    }
}

/// MessagePack markers carry each value's extent, so a trial parse tells
/// complete from partial: a clean parse yields the consumed length, a
/// parse that ran out of input means more bytes are needed.
fn scan_msgpack(buf: &[u8]) -> Result<Option<usize>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut cursor = Cursor::new(buf);
    match rmp_serde::from_read::<_, IgnoredAny>(&mut cursor) {
        Ok(_) => Ok(Some(cursor.position() as usize)),
        Err(e) if is_truncation(&e) => Ok(None),
        Err(e) => Err(Error::new(
            ErrorKind::DeserializeFailed,
            format!("msgpack scan: {e}"),
        )),
    }
}

fn is_truncation(e: &RmpDecodeError) -> bool {
    matches!(
        e,
        RmpDecodeError::InvalidMarkerRead(io) | RmpDecodeError::InvalidDataRead(io)
            if io.kind() == std::io::ErrorKind::UnexpectedEof
    )
}

/// JSON values end at the newline the encoder appends.
fn scan_json_line(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n').map(|i| i + 1)
}

/// Writing half of a connection.
///
/// A frame is one header value immediately followed by one body value,
/// staged in a scratch buffer and flushed as a single write, so whoever
/// holds the surrounding mutex emits the frame atomically.
pub(crate) struct FrameWriter {
    write: BoxedWriter,
    kind: CodecType,
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new(write: BoxedWriter, kind: CodecType) -> Self {
        Self {
            write,
            kind,
            buf: BytesMut::with_capacity(512),
        }
    }

    /// Encodes and writes one (header, payload) frame.
    pub async fn write_frame<P: serde::Serialize>(
        &mut self,
        header: &Header,
        payload: &P,
    ) -> Result<()> {
        let header_bytes = self.kind.encode(header)?;
        let body_bytes = self.kind.encode(payload)?;
        self.write_pair(&header_bytes, &body_bytes).await
    }

    /// Writes one frame whose body value was encoded earlier.
    pub async fn write_reply_frame(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header_bytes = self.kind.encode(header)?;
        self.write_pair(&header_bytes, body).await
    }

    /// Error responses carry a placeholder body, keeping every frame a
    /// (header, value) pair the peer can skip.
    pub async fn write_error_frame(&mut self, header: &Header) -> Result<()> {
        let header_bytes = self.kind.encode(header)?;
        let body_bytes = self.kind.encode(&())?;
        self.write_pair(&header_bytes, &body_bytes).await
    }

    async fn write_pair(&mut self, header: &[u8], body: &[u8]) -> Result<()> {
        if header.len() + body.len() >= MAX_VALUE_SIZE {
            return Err(Error::new(
                ErrorKind::SendFailed,
                format!("frame is too long: {} bytes", header.len() + body.len()),
            ));
        }
        self.buf.clear();
        self.buf.extend_from_slice(header);
        self.buf.extend_from_slice(body);
        self.write
            .write_all(&self.buf)
            .await
            .map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))?;
        self.write
            .flush()
            .await
            .map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_pair(kind: CodecType) -> (FrameReader, FrameWriter) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (read, _) = tokio::io::split(a);
        let (_, write) = tokio::io::split(b);
        (
            FrameReader::new(BufReader::new(Box::new(read) as BoxedReader), kind),
            FrameWriter::new(Box::new(write) as BoxedWriter, kind),
        )
    }

    fn header(seq: u64, error: &str) -> Header {
        Header {
            service_method: "Foo.Sum".to_string(),
            seq,
            error: error.to_string(),
        }
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        for kind in [CodecType::Msgpack, CodecType::Json] {
            let (mut reader, mut writer) = frame_pair(kind);
            writer.write_frame(&header(1, ""), &(3u32, 4u32)).await.unwrap();

            let got = reader.read_header().await.unwrap();
            assert_eq!(got, header(1, ""));
            let body = reader.read_body().await.unwrap();
            let args: (u32, u32) = kind.decode(&body).unwrap();
            assert_eq!(args, (3, 4));
        }
    }

    #[tokio::test]
    async fn test_error_frame_body_is_skippable() {
        for kind in [CodecType::Msgpack, CodecType::Json] {
            let (mut reader, mut writer) = frame_pair(kind);
            writer
                .write_error_frame(&header(2, "rpc server: can't find method Sum"))
                .await
                .unwrap();
            // a later frame must still parse after the placeholder is skipped
            writer.write_frame(&header(3, ""), &7i64).await.unwrap();

            let got = reader.read_header().await.unwrap();
            assert!(got.error.contains("can't find method Sum"));
            reader.read_body().await.unwrap();

            let got = reader.read_header().await.unwrap();
            assert_eq!(got.seq, 3);
            let body = reader.read_body().await.unwrap();
            let reply: i64 = kind.decode(&body).unwrap();
            assert_eq!(reply, 7);
        }
    }

    #[tokio::test]
    async fn test_value_split_across_reads() {
        let kind = CodecType::Msgpack;
        let (a, b) = tokio::io::duplex(1 << 16);
        let (read, _) = tokio::io::split(a);
        let (_, mut write) = tokio::io::split(b);
        let mut reader = FrameReader::new(BufReader::new(Box::new(read) as BoxedReader), kind);

        let mut wire = kind.encode(&header(9, "")).unwrap().to_vec();
        wire.extend_from_slice(&kind.encode(&(1u8, 2u8)).unwrap());

        let writer_task = tokio::spawn(async move {
            for chunk in wire.chunks(3) {
                write.write_all(chunk).await.unwrap();
                write.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            write
        });

        let got = reader.read_header().await.unwrap();
        assert_eq!(got.seq, 9);
        let body = reader.read_body().await.unwrap();
        let args: (u8, u8) = kind.decode(&body).unwrap();
        assert_eq!(args, (1, 2));
        writer_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_adjacent_json_frames_with_numeric_bodies() {
        let kind = CodecType::Json;
        let (mut reader, mut writer) = frame_pair(kind);
        // two pipelined frames land in the buffer together; the newline
        // terminator keeps the bare-number bodies unambiguous
        writer.write_frame(&header(1, ""), &30i64).await.unwrap();
        writer.write_frame(&header(2, ""), &5i64).await.unwrap();

        assert_eq!(reader.read_header().await.unwrap().seq, 1);
        let first: i64 = kind.decode(&reader.read_body().await.unwrap()).unwrap();
        assert_eq!(first, 30);
        assert_eq!(reader.read_header().await.unwrap().seq, 2);
        let second: i64 = kind.decode(&reader.read_body().await.unwrap()).unwrap();
        assert_eq!(second, 5);
    }

    #[tokio::test]
    async fn test_eof_between_frames() {
        let (mut reader, writer) = frame_pair(CodecType::Msgpack);
        drop(writer);
        let err = reader.read_header().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Eof);
    }

    #[tokio::test]
    async fn test_eof_mid_value() {
        let kind = CodecType::Msgpack;
        let (a, b) = tokio::io::duplex(64);
        let (read, _) = tokio::io::split(a);
        let (_, mut write) = tokio::io::split(b);
        let mut reader = FrameReader::new(BufReader::new(Box::new(read) as BoxedReader), kind);

        let encoded = kind.encode(&header(4, "")).unwrap();
        write.write_all(&encoded[..encoded.len() - 1]).await.unwrap();
        drop(write);

        let err = reader.read_header().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RecvFailed);
    }

    #[tokio::test]
    async fn test_invalid_msgpack_marker() {
        let (a, b) = tokio::io::duplex(64);
        let (read, _) = tokio::io::split(a);
        let (_, mut write) = tokio::io::split(b);
        let mut reader = FrameReader::new(
            BufReader::new(Box::new(read) as BoxedReader),
            CodecType::Msgpack,
        );

        // 0xc1 is the one marker MessagePack never assigns
        write.write_all(&[0xc1]).await.unwrap();
        drop(write);

        let err = reader.read_header().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeserializeFailed);
    }
}
