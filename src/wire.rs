//! Binary codec for the 7 Speed Daemon frame types.
//!
//! Every multibyte integer is big-endian. Strings are length-prefixed
//! with a single `u8` (0-255 ASCII bytes, no terminator). A frame starts
//! with a one-byte tag; there is no frame-length prefix, so a frame is
//! fully self-delimiting once its tag and fixed fields are known.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Tag bytes for the 7 frame variants, in wire order.
pub mod tag {
    pub const ERROR: u8 = 0x10;
    pub const PLATE: u8 = 0x20;
    pub const TICKET: u8 = 0x21;
    pub const WANT_HEARTBEAT: u8 = 0x40;
    pub const HEARTBEAT: u8 = 0x41;
    pub const I_AM_CAMERA: u8 = 0x80;
    pub const I_AM_DISPATCHER: u8 = 0x81;
}

/// Errors distinct from a clean end-of-stream at a frame boundary.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o error reading or writing a frame")]
    Io(#[from] std::io::Error),

    #[error("unknown frame tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

impl WireError {
    /// An EOF that happened mid-frame (as opposed to cleanly at a frame
    /// boundary) is a malformed frame, not a graceful close.
    fn from_read_error(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Malformed("eof mid-frame")
        } else {
            WireError::Io(err)
        }
    }
}

async fn read_str<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, WireError> {
    let len = r.read_u8().await.map_err(WireError::from_read_error)?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)
        .await
        .map_err(WireError::from_read_error)?;
    String::from_utf8(buf).map_err(|_| WireError::Malformed("plate is not ASCII"))
}

async fn write_str<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> Result<(), WireError> {
    let len = u8::try_from(s.len()).map_err(|_| WireError::Malformed("string exceeds 255 bytes"))?;
    w.write_u8(len).await?;
    w.write_all(s.as_bytes()).await?;
    Ok(())
}

/// A decoded or to-be-encoded frame, tagged by variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Error(Error),
    Plate(Plate),
    Ticket(Ticket),
    WantHeartbeat(WantHeartbeat),
    Heartbeat,
    IAmCamera(IAmCamera),
    IAmDispatcher(IAmDispatcher),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub msg: String,
}

impl Error {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plate {
    pub plate: String,
    pub timestamp: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub plate: String,
    pub road: u16,
    pub mile1: u16,
    pub timestamp1: u32,
    pub mile2: u16,
    pub timestamp2: u32,
    pub speed: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WantHeartbeat {
    pub interval: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAmCamera {
    pub road: u16,
    pub mile: u16,
    pub limit: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IAmDispatcher {
    pub roads: Vec<u16>,
}

/// Read exactly one frame from `r`.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary (nothing had
/// been read yet for this frame) — that terminates the connection
/// normally. Any other failure, including EOF partway through a frame,
/// is a malformed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Frame>, WireError> {
    let tag = match r.read_u8().await {
        Ok(tag) => tag,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let frame = match tag {
        tag::PLATE => {
            let plate = read_str(r).await?;
            let timestamp = r.read_u32().await.map_err(WireError::from_read_error)?;
            Frame::Plate(Plate { plate, timestamp })
        }
        tag::WANT_HEARTBEAT => {
            let interval = r.read_u32().await.map_err(WireError::from_read_error)?;
            Frame::WantHeartbeat(WantHeartbeat { interval })
        }
        tag::I_AM_CAMERA => {
            let road = r.read_u16().await.map_err(WireError::from_read_error)?;
            let mile = r.read_u16().await.map_err(WireError::from_read_error)?;
            let limit = r.read_u16().await.map_err(WireError::from_read_error)?;
            Frame::IAmCamera(IAmCamera { road, mile, limit })
        }
        tag::I_AM_DISPATCHER => {
            let num_roads = r.read_u8().await.map_err(WireError::from_read_error)?;
            let mut roads = Vec::with_capacity(num_roads as usize);
            for _ in 0..num_roads {
                roads.push(r.read_u16().await.map_err(WireError::from_read_error)?);
            }
            Frame::IAmDispatcher(IAmDispatcher { roads })
        }
        other => return Err(WireError::UnknownTag(other)),
    };

    Ok(Some(frame))
}

/// Write `frame` to `w`. Server-to-client variants (`Error`, `Ticket`,
/// `Heartbeat`) are the only ones a well-behaved session ever writes;
/// encoding the client-to-server variants is kept for symmetry and
/// round-trip tests.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &Frame,
) -> Result<(), WireError> {
    match frame {
        Frame::Error(e) => {
            w.write_u8(tag::ERROR).await?;
            write_str(w, &e.msg).await?;
        }
        Frame::Plate(p) => {
            w.write_u8(tag::PLATE).await?;
            write_str(w, &p.plate).await?;
            w.write_u32(p.timestamp).await?;
        }
        Frame::Ticket(t) => {
            w.write_u8(tag::TICKET).await?;
            write_str(w, &t.plate).await?;
            w.write_u16(t.road).await?;
            w.write_u16(t.mile1).await?;
            w.write_u32(t.timestamp1).await?;
            w.write_u16(t.mile2).await?;
            w.write_u32(t.timestamp2).await?;
            w.write_u16(t.speed).await?;
        }
        Frame::WantHeartbeat(h) => {
            w.write_u8(tag::WANT_HEARTBEAT).await?;
            w.write_u32(h.interval).await?;
        }
        Frame::Heartbeat => {
            w.write_u8(tag::HEARTBEAT).await?;
        }
        Frame::IAmCamera(c) => {
            w.write_u8(tag::I_AM_CAMERA).await?;
            w.write_u16(c.road).await?;
            w.write_u16(c.mile).await?;
            w.write_u16(c.limit).await?;
        }
        Frame::IAmDispatcher(d) => {
            let num_roads = u8::try_from(d.roads.len())
                .map_err(|_| WireError::Malformed("too many roads for one IAmDispatcher frame"))?;
            w.write_u8(tag::I_AM_DISPATCHER).await?;
            w.write_u8(num_roads).await?;
            for road in &d.roads {
                w.write_u16(*road).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(frame: Frame) {
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        let decoded = read_frame(&mut buf.as_slice()).await.unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn roundtrips_every_variant() {
        roundtrip(Frame::Error(Error::new("bad"))).await;
        roundtrip(Frame::Plate(Plate {
            plate: "UN1X".into(),
            timestamp: 1000,
        }))
        .await;
        roundtrip(Frame::Ticket(Ticket {
            plate: "UN1X".into(),
            road: 66,
            mile1: 100,
            timestamp1: 123_456,
            mile2: 110,
            timestamp2: 123_816,
            speed: 10_000,
        }))
        .await;
        roundtrip(Frame::WantHeartbeat(WantHeartbeat { interval: 10 })).await;
        roundtrip(Frame::Heartbeat).await;
        roundtrip(Frame::IAmCamera(IAmCamera {
            road: 66,
            mile: 100,
            limit: 60,
        }))
        .await;
        roundtrip(Frame::IAmDispatcher(IAmDispatcher {
            roads: vec![66, 368, 5000],
        }))
        .await;
    }

    #[tokio::test]
    async fn decodes_example_ticket_bytes() {
        let bytes: &[u8] = &[
            0x21, 0x04, b'U', b'N', b'1', b'X', 0x00, 0x7b, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x09, 0x00, 0x00, 0x00, 0x2d, 0x1f, 0x40,
        ];
        let frame = read_frame(&mut &*bytes).await.unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Ticket(Ticket {
                plate: "UN1X".into(),
                road: 123,
                mile1: 8,
                timestamp1: 0,
                mile2: 9,
                timestamp2: 45,
                speed: 8000,
            })
        );
    }

    #[tokio::test]
    async fn clean_eof_at_boundary_is_none() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_malformed() {
        // IAmCamera tag with only one field's worth of bytes.
        let mut truncated: &[u8] = &[tag::I_AM_CAMERA, 0x00, 0x42];
        let err = read_frame(&mut truncated).await.unwrap_err();
        assert!(matches!(err, WireError::Malformed(_)));
    }

    #[tokio::test]
    async fn unknown_tag_is_rejected() {
        let mut bytes: &[u8] = &[0xff];
        let err = read_frame(&mut bytes).await.unwrap_err();
        assert!(matches!(err, WireError::UnknownTag(0xff)));
    }
}
