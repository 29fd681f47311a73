//! Putting DNS messages onto a stream and taking them off again.
//!
//! The transport itself is agnostic of how messages are framed on the
//! stream. It delegates this to a [`StreamCodec`]. The codec used by
//! default, [`LengthPrefixed`], implements the framing of DNS over TCP
//! described in RFC 1035, section 4.2.2 and RFC 7766: every message is
//! preceded by a two octet length field in network byte order.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::sync::Arc;
use std::vec::Vec;

use bytes::{Buf, BytesMut};
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;
use crate::message::Message;

/// The length of the length prefix in octets.
const PREFIX_LEN: usize = 2;

//------------ StreamCodec ----------------------------------------------------

/// Serializes requests onto and parses responses off a byte stream.
pub trait StreamCodec: Send + Sync + 'static {
    /// Writes a single request to the stream and flushes it.
    fn write_request<'a>(
        &'a self,
        stream: &'a mut (dyn AsyncWrite + Send + Unpin),
        request: &'a Message,
    ) -> BoxFuture<'a, Result<(), Error>>;

    /// Reads a single complete response from the stream.
    ///
    /// The buffer is owned by the caller and kept between calls so that
    /// octets read beyond the end of one message are available for the
    /// next one.
    ///
    /// If the stream ends cleanly before the first octet of a message,
    /// [`Error::ConnectionClosed`] is returned.
    fn read_response<'a>(
        &'a self,
        stream: &'a mut (dyn AsyncRead + Send + Unpin),
        buf: &'a mut BytesMut,
    ) -> BoxFuture<'a, Result<Message, Error>>;
}

//------------ LengthPrefixed -------------------------------------------------

/// The DNS over TCP message framing.
#[derive(Clone, Copy, Debug, Default)]
pub struct LengthPrefixed;

impl LengthPrefixed {
    /// Creates a new codec.
    pub fn new() -> Self {
        LengthPrefixed
    }

    /// Reads from the stream until the buffer holds at least `len` octets.
    async fn fill(
        stream: &mut (dyn AsyncRead + Send + Unpin),
        buf: &mut BytesMut,
        len: usize,
    ) -> Result<(), Error> {
        if buf.len() < len {
            buf.reserve(len - buf.len());
        }
        while buf.len() < len {
            let read = stream
                .read_buf(buf)
                .await
                .map_err(|err| Error::StreamReadError(Arc::new(err)))?;
            if read == 0 {
                return Err(if buf.is_empty() {
                    Error::ConnectionClosed
                } else {
                    Error::StreamUnexpectedEndOfData
                });
            }
        }
        Ok(())
    }
}

impl StreamCodec for LengthPrefixed {
    fn write_request<'a>(
        &'a self,
        stream: &'a mut (dyn AsyncWrite + Send + Unpin),
        request: &'a Message,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let len = u16::try_from(request.size())
                .map_err(|_| Error::StreamLongMessage)?;

            // Prefix and message go out in one write so that they end up
            // in the same segment if at all possible.
            let mut wire = Vec::with_capacity(PREFIX_LEN + request.size());
            wire.extend_from_slice(&len.to_be_bytes());
            wire.extend_from_slice(request.as_slice());

            stream
                .write_all(&wire)
                .await
                .map_err(|err| Error::StreamWriteError(Arc::new(err)))?;
            stream
                .flush()
                .await
                .map_err(|err| Error::StreamWriteError(Arc::new(err)))
        })
    }

    fn read_response<'a>(
        &'a self,
        stream: &'a mut (dyn AsyncRead + Send + Unpin),
        buf: &'a mut BytesMut,
    ) -> BoxFuture<'a, Result<Message, Error>> {
        Box::pin(async move {
            Self::fill(stream, buf, PREFIX_LEN).await?;
            let len = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
            Self::fill(stream, buf, PREFIX_LEN + len).await?;
            buf.advance(PREFIX_LEN);
            Message::from_octets(buf.split_to(len))
        })
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::HEADER_LEN;

    fn query(id: u16, extra: &[u8]) -> Message {
        let mut octets = vec![0; HEADER_LEN];
        octets.extend_from_slice(extra);
        let mut msg = Message::from_slice(&octets).unwrap();
        msg.set_id(id);
        msg
    }

    #[tokio::test]
    async fn write_prefixes_length() {
        let msg = query(0x0102, b"abc");
        let mut out: Vec<u8> = Vec::new();
        LengthPrefixed.write_request(&mut out, &msg).await.unwrap();
        assert_eq!(&out[..2], &[0, 15]);
        assert_eq!(&out[2..4], &[1, 2]);
        assert_eq!(&out[14..], b"abc");
    }

    #[tokio::test]
    async fn read_back_to_back() {
        let mut wire: Vec<u8> = Vec::new();
        LengthPrefixed
            .write_request(&mut wire, &query(7, b"x"))
            .await
            .unwrap();
        LengthPrefixed
            .write_request(&mut wire, &query(8, b"yz"))
            .await
            .unwrap();

        let mut stream = wire.as_slice();
        let mut buf = BytesMut::new();
        let first = LengthPrefixed
            .read_response(&mut stream, &mut buf)
            .await
            .unwrap();
        let second = LengthPrefixed
            .read_response(&mut stream, &mut buf)
            .await
            .unwrap();
        assert_eq!((first.id(), first.size()), (7, HEADER_LEN + 1));
        assert_eq!((second.id(), second.size()), (8, HEADER_LEN + 2));
        assert!(matches!(
            LengthPrefixed.read_response(&mut stream, &mut buf).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn read_truncated() {
        let mut wire: Vec<u8> = Vec::new();
        LengthPrefixed
            .write_request(&mut wire, &query(7, b"xyz"))
            .await
            .unwrap();
        wire.truncate(wire.len() - 1);

        let mut stream = wire.as_slice();
        let mut buf = BytesMut::new();
        assert!(matches!(
            LengthPrefixed.read_response(&mut stream, &mut buf).await,
            Err(Error::StreamUnexpectedEndOfData)
        ));
    }

    #[tokio::test]
    async fn read_short_message() {
        let wire: &[u8] = &[0, 3, 1, 2, 3];
        let mut stream = wire;
        let mut buf = BytesMut::new();
        assert!(matches!(
            LengthPrefixed.read_response(&mut stream, &mut buf).await,
            Err(Error::ShortMessage)
        ));
    }

    #[tokio::test]
    async fn write_too_long() {
        let msg = query(1, &vec![0; usize::from(u16::MAX)]);
        let mut out: Vec<u8> = Vec::new();
        assert!(matches!(
            LengthPrefixed.write_request(&mut out, &msg).await,
            Err(Error::StreamLongMessage)
        ));
        assert!(out.is_empty());
    }
}
