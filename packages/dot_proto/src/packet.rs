//! Packet header framing over any `AsyncRead` / `AsyncWrite`.
//!
//! Wire format: `[u32 BE payload length][u32 BE packet type][payload]`

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

/// Size of the fixed packet header.
pub const HEADER_SIZE: usize = 8;

/// Packet-type catalog. The numeric values are ASCII mnemonics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    Version = b'v' as u32,
    Auth = b'a' as u32,
    GetDriverName = b'n' as u32,
    GetModelIdentifier = b'd' as u32,
    GetDisplaySize = b's' as u32,
    EnterTtyMode = b't' as u32,
    SetFocus = b'F' as u32,
    LeaveTtyMode = b'L' as u32,
    Key = b'k' as u32,
    IgnoreKeyRanges = b'm' as u32,
    AcceptKeyRanges = b'u' as u32,
    Write = b'w' as u32,
    EnterRawMode = b'*' as u32,
    LeaveRawMode = b'#' as u32,
    Packet = b'p' as u32,
    SuspendDriver = b'S' as u32,
    ResumeDriver = b'R' as u32,
    Synchronize = b'Z' as u32,
    ParamValue = b'@' as u32,
    ParamRequest = b'q' as u32,
    ParamUpdate = b'U' as u32,
    Ack = b'A' as u32,
    Error = b'e' as u32,
    Exception = b'E' as u32,
}

impl PacketType {
    pub const ALL: [PacketType; 24] = [
        Self::Version,
        Self::Auth,
        Self::GetDriverName,
        Self::GetModelIdentifier,
        Self::GetDisplaySize,
        Self::EnterTtyMode,
        Self::SetFocus,
        Self::LeaveTtyMode,
        Self::Key,
        Self::IgnoreKeyRanges,
        Self::AcceptKeyRanges,
        Self::Write,
        Self::EnterRawMode,
        Self::LeaveRawMode,
        Self::Packet,
        Self::SuspendDriver,
        Self::ResumeDriver,
        Self::Synchronize,
        Self::ParamValue,
        Self::ParamRequest,
        Self::ParamUpdate,
        Self::Ack,
        Self::Error,
        Self::Exception,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }
}

/// One framed message: a raw type code plus its payload.
///
/// The type is kept as the raw `u32` so that unknown types can still be
/// echoed back inside an `Exception`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub ptype: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(ptype: PacketType, payload: Vec<u8>) -> Self {
        Self {
            ptype: ptype.code(),
            payload,
        }
    }

    pub fn empty(ptype: PacketType) -> Self {
        Self::new(ptype, Vec::new())
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_code(self.ptype)
    }

    /// Encode into `[len][type][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.ptype.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Result of reading one frame off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Packet(Packet),
    /// The announced payload exceeded the limit. The payload bytes have been
    /// consumed and discarded so the stream stays in sync.
    Oversized { ptype: u32, len: u32 },
}

/// Read the next frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly on a packet
/// boundary.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::TruncatedHeader(filled));
        }
        filled += n;
    }

    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let ptype = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

    if len as usize > max_payload {
        let discarded = tokio::io::copy(&mut (&mut *reader).take(u64::from(len)), &mut tokio::io::sink()).await?;
        if discarded < u64::from(len) {
            return Err(FrameError::TruncatedPayload);
        }
        return Ok(Some(Frame::Oversized { ptype, len }));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::TruncatedPayload
        } else {
            FrameError::Io(e)
        }
    })?;

    Ok(Some(Frame::Packet(Packet { ptype, payload })))
}

/// Write one packet and flush.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&packet.encode()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_codes_are_unique() {
        for (i, a) in PacketType::ALL.iter().enumerate() {
            for b in &PacketType::ALL[i + 1..] {
                assert_ne!(a.code(), b.code(), "{a:?} and {b:?} share a code");
            }
            assert_eq!(PacketType::from_code(a.code()), Some(*a));
        }
    }

    #[test]
    fn header_layout() {
        let bytes = Packet::new(PacketType::Ack, vec![1, 2, 3]).encode();
        assert_eq!(&bytes[..4], &3u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &(b'A' as u32).to_be_bytes());
        assert_eq!(&bytes[8..], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let mut input: &[u8] = &[];
        assert!(read_frame(&mut input, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_header_is_error() {
        let mut input: &[u8] = &[0, 0, 0];
        let err = read_frame(&mut input, 64).await.unwrap_err();
        assert!(matches!(err, FrameError::TruncatedHeader(3)));
    }

    #[tokio::test]
    async fn eof_inside_payload_is_error() {
        let mut bytes = Packet::new(PacketType::Write, vec![0; 10]).encode();
        bytes.truncate(12);
        let mut input: &[u8] = &bytes;
        let err = read_frame(&mut input, 64).await.unwrap_err();
        assert!(matches!(err, FrameError::TruncatedPayload));
    }

    #[tokio::test]
    async fn oversized_payload_is_skipped_and_stream_stays_in_sync() {
        let mut bytes = Packet::new(PacketType::Write, vec![0xAA; 100]).encode();
        bytes.extend(Packet::empty(PacketType::Synchronize).encode());
        let mut input: &[u8] = &bytes;

        let first = read_frame(&mut input, 64).await.unwrap().unwrap();
        assert_eq!(
            first,
            Frame::Oversized {
                ptype: PacketType::Write.code(),
                len: 100
            }
        );

        let second = read_frame(&mut input, 64).await.unwrap().unwrap();
        assert_eq!(
            second,
            Frame::Packet(Packet::empty(PacketType::Synchronize))
        );
    }

    #[tokio::test]
    async fn write_then_read() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let packet = Packet::new(PacketType::Key, 42u64.to_be_bytes().to_vec());
        write_packet(&mut client, &packet).await.unwrap();
        let frame = read_frame(&mut server, 64).await.unwrap().unwrap();
        assert_eq!(frame, Frame::Packet(packet));
    }
}
