//! Websocket transport shared by the relay and the bridge.
//!
//! The HTTP upgrade is left to tungstenite. After it, frames are read and
//! written one at a time and never reassembled or validated as text, so a
//! relay can pass any payload through untouched.
//!
//! Every error, including an expired deadline, surfaces as [`std::io::Error`].

use std::io::{Cursor, Error, ErrorKind, Result};
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        lookup_host,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time::timeout,
};
use tokio_tungstenite::{
    accept_hdr_async, client_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        handshake::server::Callback,
        protocol::{
            frame::coding::{Control, Data, OpCode},
            frame::{Frame, FrameHeader},
            Role,
        },
    },
};

pub(crate) fn ws_error(e: tungstenite::Error) -> Error {
    match e {
        tungstenite::Error::Io(e) => e,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            Error::new(ErrorKind::ConnectionAborted, "websocket closed")
        }
        e => Error::new(ErrorKind::Other, e),
    }
}

/// Frames carrying application bytes: text, binary and continuations.
pub fn is_data(frame: &Frame) -> bool {
    matches!(frame.header().opcode, OpCode::Data(_))
}

/// An unfragmented data frame.
pub fn data_frame(data: Vec<u8>, opcode: Data) -> Frame {
    Frame::message(data, OpCode::Data(opcode), true)
}

/// Reads frames off one direction of a connection.
///
/// Reading is cancel safe, a partially received frame stays buffered.
pub struct FrameReader<R> {
    io: R,
    buf: Vec<u8>,
    max_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R, max_size: usize) -> Self {
        Self {
            io,
            buf: Vec::new(),
            max_size,
        }
    }

    /// Next frame with its payload unmasked.
    ///
    /// A close frame or end of stream is an error, as is a payload larger
    /// than the buffer size.
    pub async fn read(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.parse()? {
                if frame.header().opcode == OpCode::Control(Control::Close) {
                    return Err(Error::new(ErrorKind::ConnectionAborted, "websocket closed"));
                }
                return Ok(frame);
            }

            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(Error::new(ErrorKind::ConnectionAborted, "connection closed"));
            }
        }
    }

    /// Next frame, bounded by `deadline`.
    pub async fn read_timeout(&mut self, deadline: Duration) -> Result<Frame> {
        timeout(deadline, self.read())
            .await
            .map_err(|_| Error::new(ErrorKind::TimedOut, "timeout reading frame"))?
    }

    fn parse(&mut self) -> Result<Option<Frame>> {
        let mut cursor = Cursor::new(self.buf.as_slice());
        let (mut header, len) = match FrameHeader::parse(&mut cursor).map_err(ws_error)? {
            Some(h) => h,
            None => return Ok(None),
        };

        if len > self.max_size as u64 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds buffer size {}", len, self.max_size),
            ));
        }

        let start = cursor.position() as usize;
        let end = start + len as usize;
        if self.buf.len() < end {
            return Ok(None);
        }

        let mut payload = self.buf[start..end].to_vec();
        self.buf.drain(..end);

        if let Some(mask) = header.mask.take() {
            for (i, b) in payload.iter_mut().enumerate() {
                *b ^= mask[i % 4];
            }
        }

        Ok(Some(Frame::from_payload(header, payload)))
    }
}

/// Writes frames onto one direction of a connection.
///
/// Frames sent from the client side are masked.
pub struct FrameWriter<W> {
    io: W,
    role: Role,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W, role: Role) -> Self {
        Self { io, role }
    }

    pub async fn write(&mut self, mut frame: Frame) -> Result<()> {
        let header = frame.header_mut();
        header.mask = match self.role {
            Role::Client => Some(rand::random()),
            Role::Server => None,
        };

        let mut buf = Vec::with_capacity(frame.len());
        frame.format(&mut buf).map_err(ws_error)?;
        self.io.write_all(&buf).await?;
        self.io.flush().await
    }

    /// [`write`](Self::write) bounded by `deadline`.
    pub async fn write_timeout(&mut self, frame: Frame, deadline: Duration) -> Result<()> {
        timeout(deadline, self.write(frame))
            .await
            .map_err(|_| Error::new(ErrorKind::TimedOut, "timeout writing frame"))?
    }

    /// Send a close frame and shut the stream down, bounded by `deadline`.
    /// Errors are not interesting here.
    pub async fn close(&mut self, deadline: Duration) {
        let _ = timeout(deadline, async {
            self.write(Frame::close(None)).await?;
            self.io.shutdown().await
        })
        .await;
    }
}

pub type Reader = FrameReader<OwnedReadHalf>;
pub type Writer = FrameWriter<OwnedWriteHalf>;

/// Complete the server side upgrade and split the connection.
///
/// `callback` can reject the request, e.g. for a wrong path.
pub async fn accept<C>(mut stream: TcpStream, callback: C, max_size: usize) -> Result<(Reader, Writer)>
where
    C: Callback + Unpin,
{
    // clients only send frames after our response, nothing is buffered past it
    drop(accept_hdr_async(&mut stream, callback).await.map_err(ws_error)?);

    let (r, w) = stream.into_split();
    Ok((FrameReader::new(r, max_size), FrameWriter::new(w, Role::Server)))
}

/// Dial a `ws://` url and split the connection.
pub async fn connect(url: &str, max_size: usize) -> Result<(Reader, Writer)> {
    let request = url.into_client_request().map_err(ws_error)?;
    let uri = request.uri();
    if uri.scheme_str() != Some("ws") {
        return Err(Error::new(ErrorKind::Other, format!("unsupported url {}", url)));
    }

    let host = uri
        .host()
        .ok_or_else(|| Error::new(ErrorKind::Other, format!("no host in {}", url)))?;
    let ip_host = host.trim_start_matches('[').trim_end_matches(']');
    let addr = lookup_host((ip_host, uri.port_u16().unwrap_or(80)))
        .await?
        .next()
        .ok_or_else(|| Error::new(ErrorKind::Other, format!("{} resolve fail", host)))?;

    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    drop(client_async(request, &mut stream).await.map_err(ws_error)?);

    let (r, w) = stream.into_split();
    Ok((FrameReader::new(r, max_size), FrameWriter::new(w, Role::Client)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> Vec<u8> {
        let mut buf = Vec::new();
        frame.format(&mut buf).unwrap();
        buf
    }

    fn masked(data: &[u8], opcode: Data) -> Vec<u8> {
        let mut frame = data_frame(data.to_vec(), opcode);
        frame.header_mut().mask = Some([1, 2, 3, 4]);
        encode(frame)
    }

    #[tokio::test]
    async fn test_read_unmasks_raw_text() {
        let wire = masked(&[0xff, 0xfe, 0x01], Data::Text);
        let mut r = FrameReader::new(wire.as_slice(), 1600);

        let frame = r.read().await.unwrap();
        assert_eq!(frame.header().opcode, OpCode::Data(Data::Text));
        assert!(frame.header().mask.is_none());
        assert_eq!(frame.payload().as_slice(), &[0xff, 0xfe, 0x01]);
    }

    #[tokio::test]
    async fn test_read_frames_in_order() {
        let mut wire = masked(b"one", Data::Binary);
        wire.extend(encode(Frame::ping(vec![9])));
        wire.extend(masked(b"two", Data::Text));
        let mut r = FrameReader::new(wire.as_slice(), 1600);

        assert_eq!(r.read().await.unwrap().into_data(), b"one");
        assert!(!is_data(&r.read().await.unwrap()));
        assert_eq!(r.read().await.unwrap().into_data(), b"two");

        let e = r.read().await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_read_close() {
        let mut wire = encode(Frame::close(None));
        wire.extend(masked(b"late", Data::Binary));
        let mut r = FrameReader::new(wire.as_slice(), 1600);

        let e = r.read().await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_read_oversized() {
        let wire = masked(&[0; 1601], Data::Binary);
        let mut r = FrameReader::new(wire.as_slice(), 1600);

        let e = r.read().await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_read_split_across_reads() {
        let wire = masked(&[7; 300], Data::Binary);
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut r = FrameReader::new(rx, 1600);

        let write = tokio::spawn(async move { tx.write_all(&wire).await });
        assert_eq!(r.read().await.unwrap().into_data(), vec![7; 300]);
        write.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (_tx, rx) = tokio::io::duplex(64);
        let mut r = FrameReader::new(rx, 1600);

        let e = r.read_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_client_writes_masked() {
        let mut w = FrameWriter::new(Vec::new(), Role::Client);
        w.write(data_frame(b"abc".to_vec(), Data::Binary)).await.unwrap();
        assert_eq!(w.io[1] & 0x80, 0x80);

        let mut r = FrameReader::new(w.io.as_slice(), 1600);
        assert_eq!(r.read().await.unwrap().into_data(), b"abc");

        let mut w = FrameWriter::new(Vec::new(), Role::Server);
        w.write(data_frame(b"abc".to_vec(), Data::Binary)).await.unwrap();
        assert_eq!(w.io[1] & 0x80, 0);
    }
}
