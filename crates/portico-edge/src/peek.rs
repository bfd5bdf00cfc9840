//! ClientHello peeking without byte loss
//!
//! Reads exactly one TLS record off a fresh connection, parses the
//! ClientHello far enough to pull out the SNI, and hands back a stream whose
//! reads first drain the peeked bytes and then fall through to the socket.
//! Whatever consumes the connection afterwards (the TLS terminator or a raw
//! passthrough splice) sees the byte stream from byte zero.

use std::io::Cursor;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// TLS record header: content type, protocol version, record length.
const RECORD_HEADER_LEN: usize = 5;
/// Maximum TLS plaintext record body (RFC 8446 §5.1).
const MAX_RECORD_LEN: usize = 16384;

const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;
const EXTENSION_SERVER_NAME: u16 = 0;
const SERVER_NAME_TYPE_HOSTNAME: u8 = 0;

#[derive(Debug, Error)]
pub enum PeekError {
    #[error("malformed ClientHello: {0}")]
    MalformedHello(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn malformed(msg: impl Into<String>) -> PeekError {
    PeekError::MalformedHello(msg.into())
}

/// What the peek learned about the connection.
#[derive(Debug, Clone, Default)]
pub struct ClientHello {
    /// SNI hostname; empty when the extension is absent.
    pub server_name: String,
}

/// Parse the ClientHello from `stream` without consuming it. The returned
/// stream re-delivers every peeked byte, in order, ahead of the live socket.
pub async fn peek_client_hello<S>(
    stream: S,
) -> Result<(ClientHello, ReplayedStream<S>), PeekError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = ReplayedStream::new(stream);

    stream.fill_to(RECORD_HEADER_LEN).await?;
    let header = stream.peeked();
    if header[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(malformed(format!(
            "not a TLS handshake record: content type {}",
            header[0]
        )));
    }
    if header[1] != 3 {
        return Err(malformed(format!(
            "unsupported TLS record version {}.{}",
            header[1], header[2]
        )));
    }
    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if record_len == 0 || record_len > MAX_RECORD_LEN {
        return Err(malformed(format!("invalid record length {record_len}")));
    }

    stream.fill_to(RECORD_HEADER_LEN + record_len).await?;
    let server_name =
        parse_server_name(&stream.peeked()[RECORD_HEADER_LEN..RECORD_HEADER_LEN + record_len])?;

    Ok((ClientHello { server_name }, stream))
}

/// Walk the handshake inside a single record and extract the SNI hostname.
/// A hello without the extension yields an empty name; framing violations
/// are malformed.
fn parse_server_name(handshake: &[u8]) -> Result<String, PeekError> {
    let mut cursor = Cursor::new(handshake);

    if cursor.remaining() < 4 {
        return Err(malformed("record too short for a handshake header"));
    }
    let handshake_type = cursor.get_u8();
    let _handshake_len = cursor.get_uint(3) as usize;
    if handshake_type != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(malformed(format!(
            "not a ClientHello: handshake type {handshake_type}"
        )));
    }

    // Client version and random.
    if cursor.remaining() < 2 + 32 {
        return Err(malformed("truncated ClientHello body"));
    }
    cursor.advance(2 + 32);

    // Session id.
    if cursor.remaining() < 1 {
        return Err(malformed("truncated session id"));
    }
    let session_id_len = cursor.get_u8() as usize;
    if cursor.remaining() < session_id_len {
        return Err(malformed("truncated session id"));
    }
    cursor.advance(session_id_len);

    // Cipher suites.
    if cursor.remaining() < 2 {
        return Err(malformed("truncated cipher suites"));
    }
    let cipher_suites_len = cursor.get_u16() as usize;
    if cursor.remaining() < cipher_suites_len {
        return Err(malformed("truncated cipher suites"));
    }
    cursor.advance(cipher_suites_len);

    // Compression methods.
    if cursor.remaining() < 1 {
        return Err(malformed("truncated compression methods"));
    }
    let compression_len = cursor.get_u8() as usize;
    if cursor.remaining() < compression_len {
        return Err(malformed("truncated compression methods"));
    }
    cursor.advance(compression_len);

    // Extensions are optional; an old-style hello simply ends here.
    if cursor.remaining() < 2 {
        return Ok(String::new());
    }
    let extensions_len = cursor.get_u16() as usize;
    if cursor.remaining() < extensions_len {
        return Err(malformed("truncated extensions"));
    }
    let extensions_end = cursor.position() as usize + extensions_len;

    while (cursor.position() as usize) < extensions_end {
        if cursor.remaining() < 4 {
            return Err(malformed("truncated extension header"));
        }
        let extension_type = cursor.get_u16();
        let extension_len = cursor.get_u16() as usize;
        if cursor.remaining() < extension_len {
            return Err(malformed("truncated extension body"));
        }

        if extension_type == EXTENSION_SERVER_NAME {
            return parse_sni_extension(&mut cursor, extension_len);
        }
        cursor.advance(extension_len);
    }

    Ok(String::new())
}

fn parse_sni_extension(cursor: &mut Cursor<&[u8]>, extension_len: usize) -> Result<String, PeekError> {
    let extension_end = cursor.position() as usize + extension_len;

    if cursor.remaining() < 2 {
        return Err(malformed("truncated server name list"));
    }
    let _list_len = cursor.get_u16() as usize;

    while (cursor.position() as usize) < extension_end {
        if cursor.remaining() < 3 {
            return Err(malformed("truncated server name entry"));
        }
        let name_type = cursor.get_u8();
        let name_len = cursor.get_u16() as usize;
        if cursor.remaining() < name_len {
            return Err(malformed("truncated server name"));
        }

        if name_type == SERVER_NAME_TYPE_HOSTNAME {
            let mut name = vec![0u8; name_len];
            cursor.copy_to_slice(&mut name);
            return String::from_utf8(name)
                .map_err(|_| malformed("server name is not valid UTF-8"));
        }
        cursor.advance(name_len);
    }

    Ok(String::new())
}

/// A stream whose reads drain the peek buffer before touching the inner
/// stream; writes pass straight through, so `shutdown` half-closes the
/// underlying socket.
pub struct ReplayedStream<S> {
    inner: S,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ReplayedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(RECORD_HEADER_LEN + 1024),
        }
    }

    /// Bytes peeked so far and not yet consumed by a reader.
    fn peeked(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Grow the peek buffer to at least `n` bytes without consuming any.
    async fn fill_to(&mut self, n: usize) -> Result<(), PeekError> {
        while self.buf.len() < n {
            let read = (&mut self.inner).read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(malformed("connection closed mid-record"));
            }
        }
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
