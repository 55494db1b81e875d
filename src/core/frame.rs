//! # Frame Codec
//!
//! Delimiter-based framing for a single message per connection.
//!
//! ## Wire Format
//! ```text
//! [payload bytes]? ["Bluetooth Nonce"]? [UTF-8 JSON message]
//! ```
//!
//! There are no length prefixes. The delimiter is present iff a payload was
//! sent, and the end of a frame is the end of the stream: the sender
//! half-closes once the message is written and the receiver reads to EOF.
//!
//! Decoding scans for the first delimiter. In-memory payloads that contain
//! the delimiter are refused at encode time. The message side is escaped: any
//! delimiter text inside a JSON string is written as `Bluetooth\u0020Nonce`,
//! which parses back to the same string. Streamed payloads are not inspected.
//!
//! ## Security
//! - Frames larger than the configured maximum are rejected while buffering
//! - Zero bytes is always an error, never an empty frame

use crate::config::{DELIMITER, MAX_FRAME_SIZE};
use crate::core::message::Message;
use crate::error::{constants, LinkError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, instrument};

const READ_CHUNK: usize = 8 * 1024;
const ESCAPED_DELIMITER: &[u8] = b"Bluetooth\\u0020Nonce";

/// One decoded frame: the optional raw payload and the message that follows it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Option<Bytes>,
    pub message: Message,
}

impl Frame {
    pub fn new(message: Message, payload: Option<Bytes>) -> Self {
        Self { payload, message }
    }

    /// Move the payload into the message
    pub fn into_message(self) -> Message {
        let mut message = self.message;
        if let Some(payload) = self.payload {
            message.set_payload(payload);
        }
        message
    }
}

/// Tokio codec for link frames
///
/// `decode` only buffers: a frame is complete when the stream ends, so the
/// frame is produced by `decode_eof`.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn check_size(&self, len: usize) -> Result<()> {
        if len > self.max_frame_size {
            return Err(LinkError::OversizedFrame(len));
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        self.check_size(src.len())?;
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.is_empty() {
            return Ok(None);
        }
        self.check_size(src.len())?;

        let (payload, message) = split_frame(src.split().freeze())?;
        Ok(Some(Frame { payload, message }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = LinkError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if let Some(payload) = &frame.payload {
            check_payload(payload)?;
        }
        let json = message_bytes(&frame.message)?;
        let payload_len = frame
            .payload
            .as_ref()
            .map(|p| p.len() + DELIMITER.len())
            .unwrap_or(0);
        self.check_size(payload_len + json.len())?;

        dst.reserve(payload_len + json.len());
        if let Some(payload) = frame.payload {
            dst.put_slice(&payload);
            dst.put_slice(DELIMITER);
        }
        dst.put_slice(&json);
        Ok(())
    }
}

/// Position of the first delimiter in `haystack`
pub fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
}

fn check_payload(payload: &[u8]) -> Result<()> {
    match find_delimiter(payload) {
        Some(index) => Err(LinkError::MalformedFrame(format!(
            "{} at offset {index}",
            constants::ERR_DELIMITER_IN_PAYLOAD
        ))),
        None => Ok(()),
    }
}

/// Serialized message with every delimiter occurrence escaped
///
/// The delimiter is plain ASCII, so in serializer output it can only sit
/// inside a string literal, where the space may be spelled `\u0020`.
fn message_bytes(message: &Message) -> Result<Vec<u8>> {
    let json = message.to_json()?;
    if find_delimiter(&json).is_none() {
        return Ok(json);
    }

    let mut escaped = Vec::with_capacity(json.len() + 8);
    let mut rest = &json[..];
    while let Some(index) = find_delimiter(rest) {
        escaped.extend_from_slice(&rest[..index]);
        escaped.extend_from_slice(ESCAPED_DELIMITER);
        rest = &rest[index + DELIMITER.len()..];
    }
    escaped.extend_from_slice(rest);
    Ok(escaped)
}

fn split_frame(bytes: Bytes) -> Result<(Option<Bytes>, Message)> {
    if bytes.is_empty() {
        return Err(LinkError::EmptyFrame);
    }

    match find_delimiter(&bytes) {
        Some(index) => {
            let payload = bytes.slice(..index);
            let json = bytes.slice(index + DELIMITER.len()..);
            if json.is_empty() {
                return Err(LinkError::MalformedFrame(
                    "Frame ends at the delimiter with no message".into(),
                ));
            }
            Ok((Some(payload), Message::from_json(&json)?))
        }
        None => Ok((None, Message::from_json(&bytes)?)),
    }
}

/// Encode `message` with an optional in-memory payload into one frame
///
/// Fails with [`LinkError::MalformedFrame`] when the payload contains the
/// delimiter.
pub fn encode(message: &Message, payload: Option<&[u8]>) -> Result<Vec<u8>> {
    let json = message_bytes(message)?;
    let mut frame = match payload {
        Some(payload) => {
            check_payload(payload)?;
            let mut frame = Vec::with_capacity(payload.len() + DELIMITER.len() + json.len());
            frame.extend_from_slice(payload);
            frame.extend_from_slice(DELIMITER);
            frame
        }
        None => Vec::with_capacity(json.len()),
    };
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// Decode a complete frame into `(payload, message)`
///
/// Fails with [`LinkError::EmptyFrame`] on zero bytes.
pub fn decode(bytes: &[u8]) -> Result<(Option<Bytes>, Message)> {
    split_frame(Bytes::copy_from_slice(bytes))
}

/// Source of a payload written ahead of the delimiter
pub enum Payload {
    Bytes(Bytes),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl Payload {
    pub fn stream<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Payload::Stream(Box::new(reader))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Payload::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

fn is_disconnect(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

/// Read one frame, buffering until the peer stops sending
///
/// Returns the frame and the number of bytes it occupied on the wire. Any
/// read error counts as end of stream: the bytes received so far are
/// decoded. Zero bytes fails with [`LinkError::EmptyFrame`].
#[instrument(level = "debug", skip_all)]
pub async fn read_frame<R>(reader: &mut R, codec: &mut FrameCodec) -> Result<(Frame, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);

    loop {
        buffer.reserve(READ_CHUNK);
        match reader.read_buf(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => debug!(bytes = n, buffered = buffer.len(), "Read chunk"),
            Err(e) if is_disconnect(&e) => {
                debug!(error = %e, buffered = buffer.len(), "Peer disconnected, treating as end of frame");
                break;
            }
            Err(e) => {
                debug!(error = %e, kind = ?e.kind(), buffered = buffer.len(), "Read failed, treating as end of frame");
                break;
            }
        }
        codec.check_size(buffer.len())?;
    }

    let wire_len = buffer.len() as u64;
    let frame = codec
        .decode_eof(&mut buffer)?
        .ok_or(LinkError::EmptyFrame)?;
    Ok((frame, wire_len))
}

/// Write one frame and half-close the writer
///
/// Returns the number of bytes written. Stream payloads are copied through
/// without buffering the whole payload.
#[instrument(level = "debug", skip_all, fields(kind = %message.kind()))]
pub async fn write_frame<W>(writer: &mut W, message: &Message, payload: Option<Payload>) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let json = message_bytes(message)?;
    let mut written = 0u64;

    if let Some(payload) = payload {
        written += match payload {
            Payload::Bytes(bytes) => {
                check_payload(&bytes)?;
                writer.write_all(&bytes).await?;
                bytes.len() as u64
            }
            Payload::Stream(mut reader) => tokio::io::copy(&mut reader, writer).await?,
        };
        writer.write_all(DELIMITER).await?;
        written += DELIMITER.len() as u64;
    }

    writer.write_all(&json).await?;
    written += json.len() as u64;

    writer.flush().await?;
    writer.shutdown().await?;

    debug!(bytes = written, "Frame written");
    Ok(written)
}

/// Reject a declared payload size that cannot fit in a frame
pub fn check_payload_size(size: u64, max_frame_size: usize) -> Result<usize> {
    usize::try_from(size)
        .ok()
        .filter(|size| *size <= max_frame_size)
        .ok_or_else(|| {
            LinkError::MalformedFrame(format!(
                "{}: declared payload of {size} bytes exceeds {max_frame_size}",
                constants::ERR_OVERSIZED_PAYLOAD
            ))
        })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use crate::core::message::MessageType;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    #[test]
    fn test_identity_without_payload() {
        let message = Message::with_id(1, MessageType::Identity).with_field("deviceId", "B");
        let bytes = encode(&message, None).unwrap();
        assert!(find_delimiter(&bytes).is_none());

        let (payload, decoded) = decode(&bytes).unwrap();
        assert!(payload.is_none());
        assert_eq!(decoded.kind(), &MessageType::Identity);
        assert_eq!(decoded.device_id(), Some("B"));
    }

    #[test]
    fn test_ten_byte_payload_then_ping() {
        let payload = [7u8; 10];
        let message = Message::new(MessageType::application("ping"));
        let bytes = encode(&message, Some(&payload)).unwrap();

        assert_eq!(find_delimiter(&bytes), Some(10));

        let (decoded_payload, decoded) = decode(&bytes).unwrap();
        assert_eq!(decoded_payload.as_deref(), Some(&payload[..]));
        assert_eq!(decoded.kind().as_str(), "ping");
    }

    #[test]
    fn test_empty_buffer_is_an_error() {
        assert!(matches!(decode(&[]), Err(LinkError::EmptyFrame)));
    }

    #[test]
    fn test_empty_payload_keeps_delimiter() {
        let message = Message::new(MessageType::application("ping"));
        let bytes = encode(&message, Some(&[])).unwrap();
        assert!(bytes.starts_with(DELIMITER));

        let (payload, _) = decode(&bytes).unwrap();
        assert_eq!(payload, Some(Bytes::new()));
    }

    #[test]
    fn test_delimiter_without_message_is_malformed() {
        let mut bytes = b"payload".to_vec();
        bytes.extend_from_slice(DELIMITER);
        assert!(matches!(decode(&bytes), Err(LinkError::MalformedFrame(_))));
    }

    #[test]
    fn test_garbage_is_a_framing_error() {
        let err = decode(b"not json").unwrap_err();
        assert!(err.is_framing());
    }

    #[test]
    fn test_codec_waits_for_eof() {
        let mut codec = FrameCodec::default();
        let message = Message::new(MessageType::application("ping"));
        let mut buffer = BytesMut::from(&encode(&message, None).unwrap()[..]);

        assert!(codec.decode(&mut buffer).unwrap().is_none());
        assert!(!buffer.is_empty());

        let frame = codec.decode_eof(&mut buffer).unwrap().unwrap();
        assert_eq!(frame.message, message);
        assert!(buffer.is_empty());
        assert!(codec.decode_eof(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_oversized_buffer() {
        let mut codec = FrameCodec::new(1024);
        let mut buffer = BytesMut::from(&vec![b'x'; 2048][..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(LinkError::OversizedFrame(2048))
        ));
    }

    #[test]
    fn test_encoder_matches_free_function() {
        let mut codec = FrameCodec::default();
        let message = Message::with_id(3, MessageType::application("share"));
        let payload = Bytes::from_static(b"abc");

        let mut dst = BytesMut::new();
        codec
            .encode(Frame::new(message.clone(), Some(payload.clone())), &mut dst)
            .unwrap();

        assert_eq!(&dst[..], &encode(&message, Some(&payload)).unwrap()[..]);
    }

    #[tokio::test]
    async fn test_write_then_read_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let message = Message::new(MessageType::application("share")).with_field("name", "a.txt");

        let sent = message.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut client, &sent, Some(Payload::stream(&b"streamed"[..]))).await
        });

        let (frame, read) = read_frame(&mut server, &mut FrameCodec::default())
            .await
            .unwrap();
        let written = writer.await.unwrap().unwrap();
        assert_eq!(read, written);

        assert_eq!(frame.payload.as_deref(), Some(&b"streamed"[..]));
        assert_eq!(frame.message, message);
        assert_eq!(written as usize, 8 + DELIMITER.len() + message.to_json().unwrap().len());
    }

    #[test]
    fn test_delimiter_text_in_message_roundtrips() {
        let message = Message::new(MessageType::application("ping"))
            .with_field("note", "Bluetooth Nonce")
            .with_field("Bluetooth Nonce", "key");

        let bytes = encode(&message, None).unwrap();
        assert!(find_delimiter(&bytes).is_none());
        let (payload, decoded) = decode(&bytes).unwrap();
        assert!(payload.is_none());
        assert_eq!(decoded, message);

        let bytes = encode(&message, Some(b"abc")).unwrap();
        assert_eq!(find_delimiter(&bytes), Some(3));
        let (payload, decoded) = decode(&bytes).unwrap();
        assert_eq!(payload.as_deref(), Some(&b"abc"[..]));
        assert_eq!(decoded.field("note"), Some("Bluetooth Nonce"));
    }

    #[test]
    fn test_payload_with_delimiter_is_refused() {
        let message = Message::new(MessageType::application("ping"));
        let mut payload = b"head".to_vec();
        payload.extend_from_slice(DELIMITER);

        assert!(matches!(
            encode(&message, Some(&payload)),
            Err(LinkError::MalformedFrame(_))
        ));

        let mut dst = BytesMut::new();
        let result = FrameCodec::default().encode(Frame::new(message, Some(payload.into())), &mut dst);
        assert!(matches!(result, Err(LinkError::MalformedFrame(_))));
        assert!(dst.is_empty());
    }

    #[tokio::test]
    async fn test_write_refuses_payload_with_delimiter() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let message = Message::new(MessageType::application("share"));

        let result = write_frame(&mut client, &message, Some(DELIMITER.to_vec().into())).await;
        assert!(matches!(result, Err(LinkError::MalformedFrame(_))));

        drop(client);
        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    struct FailingReader {
        data: Option<Vec<u8>>,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            match self.data.take() {
                Some(data) => {
                    buf.put_slice(&data);
                    std::task::Poll::Ready(Ok(()))
                }
                None => std::task::Poll::Ready(Err(std::io::Error::other("link dropped"))),
            }
        }
    }

    #[tokio::test]
    async fn test_read_error_ends_frame() {
        let message = Message::new(MessageType::application("ping"));
        let bytes = encode(&message, Some(b"xyz")).unwrap();
        let mut reader = FailingReader { data: Some(bytes.clone()) };

        let (frame, read) = read_frame(&mut reader, &mut FrameCodec::default())
            .await
            .unwrap();
        assert_eq!(read, bytes.len() as u64);
        assert_eq!(frame.payload.as_deref(), Some(&b"xyz"[..]));
        assert_eq!(frame.message, message);

        let mut reader = FailingReader { data: None };
        let result = read_frame(&mut reader, &mut FrameCodec::default()).await;
        assert!(matches!(result, Err(LinkError::EmptyFrame)));
    }

    #[tokio::test]
    async fn test_read_of_closed_stream_is_empty_frame() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let result = read_frame(&mut server, &mut FrameCodec::default()).await;
        assert!(matches!(result, Err(LinkError::EmptyFrame)));
    }

    #[tokio::test]
    async fn test_framed_read_yields_single_frame() {
        let message = Message::new(MessageType::application("ping"));
        let bytes = encode(&message, Some(b"xyz")).unwrap();

        let mut framed = FramedRead::new(&bytes[..], FrameCodec::default());
        let frame = framed.next().await.unwrap().unwrap();
        assert_eq!(frame.payload.as_deref(), Some(&b"xyz"[..]));
        assert!(framed.next().await.is_none());
    }
}
