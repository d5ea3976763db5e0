use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use smallvec::SmallVec;

use crate::buffer::{Buffer, Pool};
use crate::error::{Result, TrestleError};

/// Wire header: `[seq:i32 BE][mt:u8][dataSz:u16 BE]`. Payload starts here.
pub const HEADER_SZ: usize = 7;

/// Low 3 bits of the `mt` byte select the message type.
pub const TYPE_MASK: u8 = 0x07;
/// ACK payload begins with a 2-byte RTT value.
pub const FLAG_RTT: u8 = 0x08;
/// One count-prefixed ack-range block precedes the HELLO or DATA payload.
pub const FLAG_INLINE_ACK: u8 = 0x10;

/// Encoded size of one ack range (`start:i32 end:i32`).
pub const ACK_RANGE_SZ: usize = 8;
/// Encoded size of an inline-ack block holding a single range.
pub const INLINE_ACK_SZ: usize = 1 + ACK_RANGE_SZ;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Hello,
    Ack,
    Data,
    Keepalive,
    Close,
}

impl MessageType {
    pub fn from_wire(mt: u8) -> Option<MessageType> {
        match mt & TYPE_MASK {
            0 => Some(MessageType::Hello),
            1 => Some(MessageType::Ack),
            2 => Some(MessageType::Data),
            3 => Some(MessageType::Keepalive),
            4 => Some(MessageType::Close),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            MessageType::Hello => 0,
            MessageType::Ack => 1,
            MessageType::Data => 2,
            MessageType::Keepalive => 3,
            MessageType::Close => 4,
        }
    }
}

/// A contiguous inclusive run of accepted sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRange {
    pub start: i32,
    pub end: i32,
}

impl AckRange {
    pub fn single(seq: i32) -> Self {
        AckRange { start: seq, end: seq }
    }

    pub fn contains(&self, seq: i32) -> bool {
        self.start <= seq && seq <= self.end
    }
}

/// HELLO payload: `{version:u8, profile:u8}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub version: u8,
    pub profile: u8,
}

pub type AckList = SmallVec<[AckRange; 4]>;

/// A decoded (or about-to-be-encoded) view over one pooled datagram buffer.
///
/// The buffer's first [`HEADER_SZ`] bytes hold the on-wire header; the
/// payload follows. Whoever drew the message from a pool owns it
/// exclusively; alias it across workers via `Arc<WireMessage>`.
pub struct WireMessage {
    pub seq: i32,
    mt: u8,
    buffer: Buffer,
}

impl WireMessage {
    pub fn hello(seq: i32, hello: Hello, ack: Option<AckRange>, pool: &Pool) -> Result<WireMessage> {
        let mut wm = WireMessage {
            seq,
            mt: MessageType::Hello.to_wire(),
            buffer: pool.get(),
        };
        if wm.buffer.capacity() < HEADER_SZ {
            return Err(TrestleError::short(HEADER_SZ, wm.buffer.capacity()));
        }
        let mut off = HEADER_SZ;
        if let Some(a) = ack {
            wm.mt |= FLAG_INLINE_ACK;
            off += encode_acks(&[a], &mut wm.buffer.raw_mut()[off..])?;
        }
        off += encode_hello(hello, &mut wm.buffer.raw_mut()[off..])?;
        wm.encode_header((off - HEADER_SZ) as u16)?;
        Ok(wm)
    }

    pub fn ack(
        ranges: &[AckRange],
        rx_portal_sz: i32,
        rtt: Option<u16>,
        pool: &Pool,
    ) -> Result<WireMessage> {
        let mut wm = WireMessage {
            seq: -1,
            mt: MessageType::Ack.to_wire(),
            buffer: pool.get(),
        };
        if wm.buffer.capacity() < HEADER_SZ {
            return Err(TrestleError::short(HEADER_SZ, wm.buffer.capacity()));
        }
        let mut off = HEADER_SZ;
        if let Some(rtt) = rtt {
            if wm.buffer.capacity() < off + 2 {
                return Err(TrestleError::short(off + 2, wm.buffer.capacity()));
            }
            wm.mt |= FLAG_RTT;
            BigEndian::write_u16(&mut wm.buffer.raw_mut()[off..off + 2], rtt);
            off += 2;
        }
        off += encode_acks(ranges, &mut wm.buffer.raw_mut()[off..])?;
        if wm.buffer.capacity() < off + 4 {
            return Err(TrestleError::short(off + 4, wm.buffer.capacity()));
        }
        BigEndian::write_i32(&mut wm.buffer.raw_mut()[off..off + 4], rx_portal_sz);
        off += 4;
        wm.encode_header((off - HEADER_SZ) as u16)?;
        Ok(wm)
    }

    pub fn data(seq: i32, payload: &[u8], pool: &Pool) -> Result<WireMessage> {
        let mut wm = WireMessage {
            seq,
            mt: MessageType::Data.to_wire(),
            buffer: pool.get(),
        };
        if payload.len() > u16::MAX as usize {
            return Err(TrestleError::short(payload.len(), u16::MAX as usize));
        }
        if wm.buffer.capacity() < HEADER_SZ + payload.len() {
            return Err(TrestleError::short(
                HEADER_SZ + payload.len(),
                wm.buffer.capacity(),
            ));
        }
        wm.buffer.raw_mut()[HEADER_SZ..HEADER_SZ + payload.len()].copy_from_slice(payload);
        wm.encode_header(payload.len() as u16)?;
        Ok(wm)
    }

    pub fn keepalive(seq: i32, pool: &Pool) -> Result<WireMessage> {
        let mut wm = WireMessage {
            seq,
            mt: MessageType::Keepalive.to_wire(),
            buffer: pool.get(),
        };
        wm.encode_header(0)?;
        Ok(wm)
    }

    pub fn close(seq: i32, pool: &Pool) -> Result<WireMessage> {
        let mut wm = WireMessage {
            seq,
            mt: MessageType::Close.to_wire(),
            buffer: pool.get(),
        };
        wm.encode_header(0)?;
        Ok(wm)
    }

    /// Decodes the header of a received datagram. The buffer's used-length
    /// must cover the advertised payload; trailing bytes are discarded.
    pub fn decode(mut buffer: Buffer) -> Result<WireMessage> {
        if buffer.used() < HEADER_SZ {
            return Err(TrestleError::short(HEADER_SZ, buffer.used()));
        }
        let data_sz = BigEndian::read_u16(&buffer.bytes()[5..HEADER_SZ]) as usize;
        if HEADER_SZ + data_sz > buffer.used() {
            return Err(TrestleError::short(HEADER_SZ + data_sz, buffer.used()));
        }
        let seq = BigEndian::read_i32(&buffer.bytes()[0..4]);
        let mt = buffer.bytes()[4];
        buffer.set_used(HEADER_SZ + data_sz);
        Ok(WireMessage { seq, mt, buffer })
    }

    fn encode_header(&mut self, data_sz: u16) -> Result<()> {
        if self.buffer.capacity() < HEADER_SZ + data_sz as usize {
            return Err(TrestleError::short(
                HEADER_SZ + data_sz as usize,
                self.buffer.capacity(),
            ));
        }
        let mt = self.mt;
        let seq = self.seq;
        let raw = self.buffer.raw_mut();
        BigEndian::write_i32(&mut raw[0..4], seq);
        raw[4] = mt;
        BigEndian::write_u16(&mut raw[5..HEADER_SZ], data_sz);
        self.buffer.set_used(HEADER_SZ + data_sz as usize);
        Ok(())
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_wire(self.mt)
    }

    /// The low 3 bits of the `mt` byte, unvalidated.
    pub fn raw_type(&self) -> u8 {
        self.mt & TYPE_MASK
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.mt & flag != 0
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.mt |= flag;
        let mt = self.mt;
        self.buffer.raw_mut()[4] = mt;
    }

    pub fn clear_flag(&mut self, flag: u8) {
        self.mt &= !flag;
        let mt = self.mt;
        self.buffer.raw_mut()[4] = mt;
    }

    /// The full encoded datagram, ready for the socket.
    pub fn wire_bytes(&self) -> &[u8] {
        self.buffer.bytes()
    }

    /// Payload bytes beyond the header (inline-ack block included).
    pub fn payload(&self) -> &[u8] {
        &self.buffer.bytes()[HEADER_SZ..]
    }

    pub fn data_len(&self) -> usize {
        self.buffer.used() - HEADER_SZ
    }

    pub fn as_hello(&self) -> Result<(Hello, AckList)> {
        if self.message_type() != Some(MessageType::Hello) {
            return Err(TrestleError::UnexpectedMessageType(self.raw_type()));
        }
        let mut d = self.payload();
        let mut acks = AckList::new();
        if self.has_flag(FLAG_INLINE_ACK) {
            let (decoded, consumed) = decode_acks(d)?;
            acks = decoded;
            d = &d[consumed..];
        }
        let hello = decode_hello(d)?;
        Ok((hello, acks))
    }

    pub fn as_ack(&self) -> Result<(AckList, i32, Option<u16>)> {
        if self.message_type() != Some(MessageType::Ack) {
            return Err(TrestleError::UnexpectedMessageType(self.raw_type()));
        }
        let mut d = self.payload();
        let mut rtt = None;
        if self.has_flag(FLAG_RTT) {
            if d.len() < 2 {
                return Err(TrestleError::short(2, d.len()));
            }
            rtt = Some(BigEndian::read_u16(&d[..2]));
            d = &d[2..];
        }
        let (acks, consumed) = decode_acks(d)?;
        d = &d[consumed..];
        if d.len() < 4 {
            return Err(TrestleError::short(4, d.len()));
        }
        let rx_portal_sz = BigEndian::read_i32(&d[..4]);
        Ok((acks, rx_portal_sz, rtt))
    }

    /// Splits a DATA payload into its inline acks (if any) and the
    /// application bytes.
    pub fn as_data(&self) -> Result<(AckList, &[u8])> {
        if self.message_type() != Some(MessageType::Data) {
            return Err(TrestleError::UnexpectedMessageType(self.raw_type()));
        }
        let mut d = self.payload();
        let mut acks = AckList::new();
        if self.has_flag(FLAG_INLINE_ACK) {
            let (decoded, consumed) = decode_acks(d)?;
            acks = decoded;
            d = &d[consumed..];
        }
        Ok((acks, d))
    }

    /// Shifts the existing payload right and places `extra` at its start.
    /// The header's dataSz field is rewritten to match.
    pub fn insert_data(&mut self, extra: &[u8]) -> Result<()> {
        let used = self.buffer.used();
        let k = extra.len();
        if used + k > self.buffer.capacity() || used + k - HEADER_SZ > u16::MAX as usize {
            return Err(TrestleError::short(used + k, self.buffer.capacity()));
        }
        let raw = self.buffer.raw_mut();
        raw.copy_within(HEADER_SZ..used, HEADER_SZ + k);
        raw[HEADER_SZ..HEADER_SZ + k].copy_from_slice(extra);
        BigEndian::write_u16(&mut raw[5..HEADER_SZ], (used + k - HEADER_SZ) as u16);
        self.buffer.set_used(used + k);
        Ok(())
    }

    /// Appends `extra` after the existing payload, rewriting dataSz.
    pub fn append_data(&mut self, extra: &[u8]) -> Result<()> {
        let used = self.buffer.used();
        let k = extra.len();
        if used + k > self.buffer.capacity() || used + k - HEADER_SZ > u16::MAX as usize {
            return Err(TrestleError::short(used + k, self.buffer.capacity()));
        }
        let raw = self.buffer.raw_mut();
        raw[used..used + k].copy_from_slice(extra);
        BigEndian::write_u16(&mut raw[5..HEADER_SZ], (used + k - HEADER_SZ) as u16);
        self.buffer.set_used(used + k);
        Ok(())
    }
}

impl fmt::Debug for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireMessage")
            .field("seq", &self.seq)
            .field("mt", &format_args!("{:#04x}", self.mt))
            .field("data_len", &self.data_len())
            .finish()
    }
}

/// Writes a count-prefixed ack-range block; returns bytes written.
pub fn encode_acks(acks: &[AckRange], out: &mut [u8]) -> Result<usize> {
    let needed = 1 + acks.len() * ACK_RANGE_SZ;
    if acks.len() > u8::MAX as usize || out.len() < needed {
        return Err(TrestleError::short(needed, out.len()));
    }
    out[0] = acks.len() as u8;
    let mut off = 1;
    for a in acks {
        BigEndian::write_i32(&mut out[off..off + 4], a.start);
        BigEndian::write_i32(&mut out[off + 4..off + 8], a.end);
        off += ACK_RANGE_SZ;
    }
    Ok(needed)
}

/// Reads a count-prefixed ack-range block; returns the ranges and the
/// number of bytes consumed.
pub fn decode_acks(d: &[u8]) -> Result<(AckList, usize)> {
    if d.is_empty() {
        return Err(TrestleError::short(1, 0));
    }
    let count = d[0] as usize;
    let needed = 1 + count * ACK_RANGE_SZ;
    if d.len() < needed {
        return Err(TrestleError::short(needed, d.len()));
    }
    let mut acks = AckList::new();
    for i in 0..count {
        let off = 1 + i * ACK_RANGE_SZ;
        acks.push(AckRange {
            start: BigEndian::read_i32(&d[off..off + 4]),
            end: BigEndian::read_i32(&d[off + 4..off + 8]),
        });
    }
    Ok((acks, needed))
}

fn encode_hello(hello: Hello, out: &mut [u8]) -> Result<usize> {
    if out.len() < 2 {
        return Err(TrestleError::short(2, out.len()));
    }
    out[0] = hello.version;
    out[1] = hello.profile;
    Ok(2)
}

fn decode_hello(d: &[u8]) -> Result<Hello> {
    if d.len() < 2 {
        return Err(TrestleError::short(2, d.len()));
    }
    Ok(Hello {
        version: d[0],
        profile: d[1],
    })
}
