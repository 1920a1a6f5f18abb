//! Typed request and response messages.
//!
//! Decoding validates every length and bound explicitly; a packet that
//! decodes is structurally sound, and any remaining checks (geometry, tty
//! state, ownership) belong to the server.

use bitflags::bitflags;

use crate::MAX_TTY_DEPTH;
use crate::error::{DecodeError, ErrorCode};
use crate::keys::{KeyCode, KeyRange};
use crate::packet::{Packet, PacketType};
use crate::param::ParamFlags;

bitflags! {
    /// Sections present in a `Write` payload, in wire order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u32 {
        const REGION = 0x01;
        const TEXT = 0x02;
        const AND_MASK = 0x04;
        const OR_MASK = 0x08;
        const CURSOR = 0x10;
    }
}

/// Credential schemes offered during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AuthMethod {
    None = b'N' as u32,
    Key = b'K' as u32,
}

impl AuthMethod {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            c if c == Self::None.code() => Some(Self::None),
            c if c == Self::Key.code() => Some(Self::Key),
            _ => None,
        }
    }
}

/// Body of a `Write` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteRequest {
    /// 1-based first cell and cell count. `None` means the whole display.
    pub region: Option<(u32, u32)>,
    pub text: Option<String>,
    pub and_mask: Option<Vec<u8>>,
    pub or_mask: Option<Vec<u8>>,
    /// `-1` leaves the cursor alone, `0` hides it, `n` puts it on cell `n`.
    pub cursor: Option<i32>,
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Version { version: u32 },
    Auth { method: AuthMethod, credential: Vec<u8> },
    GetDriverName,
    GetModelIdentifier,
    GetDisplaySize,
    EnterTtyMode { path: Vec<u32>, keycodes: bool },
    SetFocus { tty: u32 },
    LeaveTtyMode,
    IgnoreKeyRanges(Vec<KeyRange>),
    AcceptKeyRanges(Vec<KeyRange>),
    Write(WriteRequest),
    EnterRawMode { driver: String },
    LeaveRawMode,
    Packet(Vec<u8>),
    SuspendDriver { driver: String },
    ResumeDriver,
    /// Set a parameter value.
    ParamValue {
        flags: ParamFlags,
        param: u32,
        subparam: u64,
        value: Vec<u8>,
    },
    /// Get and/or (un)subscribe.
    ParamRequest {
        flags: ParamFlags,
        param: u32,
        subparam: u64,
    },
    Synchronize,
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Version(u32),
    AuthMethods(Vec<AuthMethod>),
    Ack,
    Error(ErrorCode),
    Exception {
        code: ErrorCode,
        ptype: u32,
        payload: Vec<u8>,
    },
    Key(KeyCode),
    DriverName(String),
    ModelIdentifier(String),
    DisplaySize { columns: u32, rows: u32 },
    Packet(Vec<u8>),
    /// Reply to a `Get`.
    ParamValue {
        flags: ParamFlags,
        param: u32,
        subparam: u64,
        value: Vec<u8>,
    },
    /// Unsolicited change notification.
    ParamUpdate {
        flags: ParamFlags,
        param: u32,
        subparam: u64,
        value: Vec<u8>,
    },
}

struct PayloadReader<'a> {
    ptype: PacketType,
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(ptype: PacketType, buf: &'a [u8]) -> Self {
        Self { ptype, buf }
    }

    fn malformed(&self, reason: &'static str) -> DecodeError {
        DecodeError::Malformed {
            ptype: self.ptype,
            reason,
        }
    }

    fn take(&mut self, n: usize, reason: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(self.malformed(reason));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1, "truncated u8")?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4, "truncated u32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8, "truncated u64")?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    /// `u32` length prefix followed by that many bytes.
    fn sized(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u32()? as usize;
        self.take(len, "length prefix exceeds payload")
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn utf8(&self, bytes: &[u8]) -> Result<String, DecodeError> {
        String::from_utf8(bytes.to_vec()).map_err(|_| self.malformed("invalid UTF-8"))
    }

    fn finish(&self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(self.malformed("trailing bytes"))
        }
    }
}

#[derive(Default)]
struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    fn u8(mut self, v: u8) -> Self {
        self.buf.push(v);
        self
    }

    fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn i32(self, v: i32) -> Self {
        self.u32(v as u32)
    }

    fn u64(mut self, v: u64) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn bytes(mut self, v: &[u8]) -> Self {
        self.buf.extend_from_slice(v);
        self
    }

    fn sized(self, v: &[u8]) -> Self {
        self.u32(v.len() as u32).bytes(v)
    }

    fn into_packet(self, ptype: PacketType) -> Packet {
        Packet::new(ptype, self.buf)
    }
}

fn decode_ranges(r: &mut PayloadReader<'_>) -> Result<Vec<KeyRange>, DecodeError> {
    if r.buf.len() % 16 != 0 {
        return Err(r.malformed("key range list is not a multiple of 16 bytes"));
    }
    let mut ranges = Vec::with_capacity(r.buf.len() / 16);
    while !r.buf.is_empty() {
        let range = KeyRange::new(r.u64()?, r.u64()?);
        if !range.is_valid() {
            return Err(r.malformed("key range bounds reversed"));
        }
        ranges.push(range);
    }
    Ok(ranges)
}

fn encode_ranges(ranges: &[KeyRange]) -> PayloadWriter {
    ranges
        .iter()
        .fold(PayloadWriter::default(), |w, r| w.u64(r.first).u64(r.last))
}

fn decode_write(r: &mut PayloadReader<'_>) -> Result<WriteRequest, DecodeError> {
    let raw_flags = r.u32()?;
    let flags =
        WriteFlags::from_bits(raw_flags).ok_or_else(|| r.malformed("unknown write flags"))?;
    let mut write = WriteRequest::default();

    if flags.contains(WriteFlags::REGION) {
        let begin = r.u32()?;
        let size = r.u32()?;
        if begin == 0 || size == 0 {
            return Err(r.malformed("empty or zero-based region"));
        }
        write.region = Some((begin, size));
    }
    if flags.contains(WriteFlags::TEXT) {
        let bytes = r.sized()?;
        write.text = Some(r.utf8(bytes)?);
    }
    if flags.contains(WriteFlags::AND_MASK) {
        write.and_mask = Some(r.sized()?.to_vec());
    }
    if flags.contains(WriteFlags::OR_MASK) {
        write.or_mask = Some(r.sized()?.to_vec());
    }
    if flags.contains(WriteFlags::CURSOR) {
        let cursor = r.i32()?;
        if cursor < -1 {
            return Err(r.malformed("cursor below -1"));
        }
        write.cursor = Some(cursor);
    }
    r.finish()?;
    Ok(write)
}

fn encode_write(write: &WriteRequest) -> PayloadWriter {
    let mut flags = WriteFlags::empty();
    flags.set(WriteFlags::REGION, write.region.is_some());
    flags.set(WriteFlags::TEXT, write.text.is_some());
    flags.set(WriteFlags::AND_MASK, write.and_mask.is_some());
    flags.set(WriteFlags::OR_MASK, write.or_mask.is_some());
    flags.set(WriteFlags::CURSOR, write.cursor.is_some());

    let mut w = PayloadWriter::default().u32(flags.bits());
    if let Some((begin, size)) = write.region {
        w = w.u32(begin).u32(size);
    }
    if let Some(text) = &write.text {
        w = w.sized(text.as_bytes());
    }
    if let Some(mask) = &write.and_mask {
        w = w.sized(mask);
    }
    if let Some(mask) = &write.or_mask {
        w = w.sized(mask);
    }
    if let Some(cursor) = write.cursor {
        w = w.i32(cursor);
    }
    w
}

impl Request {
    /// Decode a packet received from a client.
    pub fn decode(packet: &Packet) -> Result<Self, DecodeError> {
        let ptype = packet
            .packet_type()
            .ok_or(DecodeError::UnknownType(packet.ptype))?;
        let mut r = PayloadReader::new(ptype, &packet.payload);

        let request = match ptype {
            PacketType::Version => Self::Version { version: r.u32()? },
            PacketType::Auth => {
                let code = r.u32()?;
                let method =
                    AuthMethod::from_code(code).ok_or_else(|| r.malformed("unknown auth method"))?;
                Self::Auth {
                    method,
                    credential: r.rest().to_vec(),
                }
            }
            PacketType::GetDriverName => Self::GetDriverName,
            PacketType::GetModelIdentifier => Self::GetModelIdentifier,
            PacketType::GetDisplaySize => Self::GetDisplaySize,
            PacketType::EnterTtyMode => {
                let count = r.u32()? as usize;
                if count > MAX_TTY_DEPTH {
                    return Err(r.malformed("tty path too deep"));
                }
                let mut path = Vec::with_capacity(count);
                for _ in 0..count {
                    path.push(r.u32()?);
                }
                let keycodes = match r.u8()? {
                    0 => false,
                    1 => true,
                    _ => return Err(r.malformed("keycodes flag must be 0 or 1")),
                };
                Self::EnterTtyMode { path, keycodes }
            }
            PacketType::SetFocus => Self::SetFocus { tty: r.u32()? },
            PacketType::LeaveTtyMode => Self::LeaveTtyMode,
            PacketType::IgnoreKeyRanges => Self::IgnoreKeyRanges(decode_ranges(&mut r)?),
            PacketType::AcceptKeyRanges => Self::AcceptKeyRanges(decode_ranges(&mut r)?),
            PacketType::Write => Self::Write(decode_write(&mut r)?),
            PacketType::EnterRawMode => {
                let bytes = r.rest();
                Self::EnterRawMode {
                    driver: r.utf8(bytes)?,
                }
            }
            PacketType::LeaveRawMode => Self::LeaveRawMode,
            PacketType::Packet => Self::Packet(r.rest().to_vec()),
            PacketType::SuspendDriver => {
                let bytes = r.rest();
                Self::SuspendDriver {
                    driver: r.utf8(bytes)?,
                }
            }
            PacketType::ResumeDriver => Self::ResumeDriver,
            PacketType::ParamValue => {
                let flags = ParamFlags::from_bits_truncate(r.u32()?);
                let param = r.u32()?;
                let subparam = r.u64()?;
                Self::ParamValue {
                    flags,
                    param,
                    subparam,
                    value: r.rest().to_vec(),
                }
            }
            PacketType::ParamRequest => {
                let flags = ParamFlags::from_bits_truncate(r.u32()?);
                let param = r.u32()?;
                let subparam = r.u64()?;
                Self::ParamRequest {
                    flags,
                    param,
                    subparam,
                }
            }
            PacketType::Synchronize => Self::Synchronize,
            PacketType::Key
            | PacketType::ParamUpdate
            | PacketType::Ack
            | PacketType::Error
            | PacketType::Exception => return Err(DecodeError::WrongDirection { ptype }),
        };
        r.finish()?;
        Ok(request)
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Version { .. } => PacketType::Version,
            Self::Auth { .. } => PacketType::Auth,
            Self::GetDriverName => PacketType::GetDriverName,
            Self::GetModelIdentifier => PacketType::GetModelIdentifier,
            Self::GetDisplaySize => PacketType::GetDisplaySize,
            Self::EnterTtyMode { .. } => PacketType::EnterTtyMode,
            Self::SetFocus { .. } => PacketType::SetFocus,
            Self::LeaveTtyMode => PacketType::LeaveTtyMode,
            Self::IgnoreKeyRanges(_) => PacketType::IgnoreKeyRanges,
            Self::AcceptKeyRanges(_) => PacketType::AcceptKeyRanges,
            Self::Write(_) => PacketType::Write,
            Self::EnterRawMode { .. } => PacketType::EnterRawMode,
            Self::LeaveRawMode => PacketType::LeaveRawMode,
            Self::Packet(_) => PacketType::Packet,
            Self::SuspendDriver { .. } => PacketType::SuspendDriver,
            Self::ResumeDriver => PacketType::ResumeDriver,
            Self::ParamValue { .. } => PacketType::ParamValue,
            Self::ParamRequest { .. } => PacketType::ParamRequest,
            Self::Synchronize => PacketType::Synchronize,
        }
    }

    /// Encode for sending to a server.
    pub fn to_packet(&self) -> Packet {
        let w = PayloadWriter::default();
        let w = match self {
            Self::Version { version } => w.u32(*version),
            Self::Auth { method, credential } => w.u32(method.code()).bytes(credential),
            Self::GetDriverName
            | Self::GetModelIdentifier
            | Self::GetDisplaySize
            | Self::LeaveTtyMode
            | Self::LeaveRawMode
            | Self::ResumeDriver
            | Self::Synchronize => w,
            Self::EnterTtyMode { path, keycodes } => path
                .iter()
                .fold(w.u32(path.len() as u32), |w, tty| w.u32(*tty))
                .u8(u8::from(*keycodes)),
            Self::SetFocus { tty } => w.u32(*tty),
            Self::IgnoreKeyRanges(ranges) | Self::AcceptKeyRanges(ranges) => encode_ranges(ranges),
            Self::Write(write) => encode_write(write),
            Self::EnterRawMode { driver } | Self::SuspendDriver { driver } => {
                w.bytes(driver.as_bytes())
            }
            Self::Packet(data) => w.bytes(data),
            Self::ParamValue {
                flags,
                param,
                subparam,
                value,
            } => w.u32(flags.bits()).u32(*param).u64(*subparam).bytes(value),
            Self::ParamRequest {
                flags,
                param,
                subparam,
            } => w.u32(flags.bits()).u32(*param).u64(*subparam),
        };
        w.into_packet(self.packet_type())
    }
}

impl Response {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Version(_) => PacketType::Version,
            Self::AuthMethods(_) => PacketType::Auth,
            Self::Ack => PacketType::Ack,
            Self::Error(_) => PacketType::Error,
            Self::Exception { .. } => PacketType::Exception,
            Self::Key(_) => PacketType::Key,
            Self::DriverName(_) => PacketType::GetDriverName,
            Self::ModelIdentifier(_) => PacketType::GetModelIdentifier,
            Self::DisplaySize { .. } => PacketType::GetDisplaySize,
            Self::Packet(_) => PacketType::Packet,
            Self::ParamValue { .. } => PacketType::ParamValue,
            Self::ParamUpdate { .. } => PacketType::ParamUpdate,
        }
    }

    /// Encode for sending to a client.
    pub fn to_packet(&self) -> Packet {
        let w = PayloadWriter::default();
        let w = match self {
            Self::Version(version) => w.u32(*version),
            Self::AuthMethods(methods) => methods.iter().fold(w, |w, m| w.u32(m.code())),
            Self::Ack => w,
            Self::Error(code) => w.u32(code.code()),
            Self::Exception {
                code,
                ptype,
                payload,
            } => w.u32(code.code()).u32(*ptype).bytes(payload),
            Self::Key(code) => w.u64(*code),
            Self::DriverName(name) | Self::ModelIdentifier(name) => w.bytes(name.as_bytes()),
            Self::DisplaySize { columns, rows } => w.u32(*columns).u32(*rows),
            Self::Packet(data) => w.bytes(data),
            Self::ParamValue {
                flags,
                param,
                subparam,
                value,
            }
            | Self::ParamUpdate {
                flags,
                param,
                subparam,
                value,
            } => w.u32(flags.bits()).u32(*param).u64(*subparam).bytes(value),
        };
        w.into_packet(self.packet_type())
    }

    /// Decode a packet received from a server.
    pub fn decode(packet: &Packet) -> Result<Self, DecodeError> {
        let ptype = packet
            .packet_type()
            .ok_or(DecodeError::UnknownType(packet.ptype))?;
        let mut r = PayloadReader::new(ptype, &packet.payload);

        let response = match ptype {
            PacketType::Version => Self::Version(r.u32()?),
            PacketType::Auth => {
                if r.buf.len() % 4 != 0 {
                    return Err(r.malformed("auth method list is not a multiple of 4 bytes"));
                }
                let mut methods = Vec::new();
                while !r.buf.is_empty() {
                    let code = r.u32()?;
                    methods.push(
                        AuthMethod::from_code(code)
                            .ok_or_else(|| r.malformed("unknown auth method"))?,
                    );
                }
                Self::AuthMethods(methods)
            }
            PacketType::Ack => Self::Ack,
            PacketType::Error => {
                let code = r.u32()?;
                Self::Error(ErrorCode::from_code(code).ok_or_else(|| r.malformed("unknown error code"))?)
            }
            PacketType::Exception => {
                let code = r.u32()?;
                let code =
                    ErrorCode::from_code(code).ok_or_else(|| r.malformed("unknown error code"))?;
                let ptype = r.u32()?;
                Self::Exception {
                    code,
                    ptype,
                    payload: r.rest().to_vec(),
                }
            }
            PacketType::Key => Self::Key(r.u64()?),
            PacketType::GetDriverName => {
                let bytes = r.rest();
                Self::DriverName(r.utf8(bytes)?)
            }
            PacketType::GetModelIdentifier => {
                let bytes = r.rest();
                Self::ModelIdentifier(r.utf8(bytes)?)
            }
            PacketType::GetDisplaySize => Self::DisplaySize {
                columns: r.u32()?,
                rows: r.u32()?,
            },
            PacketType::Packet => Self::Packet(r.rest().to_vec()),
            PacketType::ParamValue | PacketType::ParamUpdate => {
                let flags = ParamFlags::from_bits_truncate(r.u32()?);
                let param = r.u32()?;
                let subparam = r.u64()?;
                let value = r.rest().to_vec();
                if ptype == PacketType::ParamValue {
                    Self::ParamValue {
                        flags,
                        param,
                        subparam,
                        value,
                    }
                } else {
                    Self::ParamUpdate {
                        flags,
                        param,
                        subparam,
                        value,
                    }
                }
            }
            PacketType::EnterTtyMode
            | PacketType::SetFocus
            | PacketType::LeaveTtyMode
            | PacketType::IgnoreKeyRanges
            | PacketType::AcceptKeyRanges
            | PacketType::Write
            | PacketType::EnterRawMode
            | PacketType::LeaveRawMode
            | PacketType::SuspendDriver
            | PacketType::ResumeDriver
            | PacketType::ParamRequest
            | PacketType::Synchronize => return Err(DecodeError::WrongDirection { ptype }),
        };
        r.finish()?;
        Ok(response)
    }
}
