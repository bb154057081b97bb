use zerocopy::byteorder::big_endian::{I16 as I16BE, I32 as I32BE};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constant::{FrameFlags, Opcode, ProtocolVersion};
use crate::error::{Error, Result};

/// v3+ frame header (zero-copy)
///
/// Layout matches the CQL native wire protocol, all big-endian:
/// - version: 1 byte (top bit set on responses)
/// - flags: 1 byte
/// - stream: 2 bytes signed
/// - opcode: 1 byte
/// - length: 4 bytes signed (body length)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub stream: I16BE,
    pub opcode: u8,
    pub length: I32BE,
}

pub const FRAME_HEADER_SIZE: usize = 9;

/// Upper bound on a sane body length; anything larger defuncts the
/// connection before we try to allocate it.
pub const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

impl FrameHeader {
    pub fn request(
        version: ProtocolVersion,
        flags: FrameFlags,
        stream: i16,
        opcode: Opcode,
        length: usize,
    ) -> Self {
        Self {
            version: version.request_byte(),
            flags: flags.bits(),
            stream: I16BE::new(stream),
            opcode: opcode as u8,
            length: I32BE::new(length as i32),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(Error::UnexpectedEof);
        }
        Self::ref_from_bytes(&data[..FRAME_HEADER_SIZE])
            .map_err(|_| Error::InvalidFrame("bad frame header"))
    }

    pub fn length(&self) -> usize {
        self.length.get().max(0) as usize
    }
}

/// A fully-read response frame, header fields validated, body still encoded.
#[derive(Debug)]
pub struct ResponseFrame {
    pub version: ProtocolVersion,
    pub flags: FrameFlags,
    pub stream: i16,
    pub opcode: Opcode,
    pub body: Vec<u8>,
}

impl ResponseFrame {
    /// Validate a response header against the connection's negotiated
    /// version and return `(stream, opcode, flags, body_length)`.
    pub fn parse_header(
        header: &FrameHeader,
        expected: ProtocolVersion,
    ) -> Result<(i16, Opcode, FrameFlags, usize)> {
        if header.version & 0x80 == 0 {
            return Err(Error::InvalidFrame("response frame without direction bit"));
        }
        let version = ProtocolVersion::from_response_byte(header.version)?;
        if version != expected {
            return Err(Error::InvalidFrame("response version mismatch"));
        }
        let opcode = Opcode::from_byte(header.opcode)?;
        let flags = FrameFlags::from_bits_truncate(header.flags);
        let length = header.length();
        if length > MAX_FRAME_LENGTH {
            return Err(Error::InvalidFrame("frame body too large"));
        }
        Ok((header.stream.get(), opcode, flags, length))
    }
}

/// Reserve header space at the front of `out`, to be patched by
/// [`patch_header`] once the body length is known.
pub fn reserve_header(out: &mut Vec<u8>) {
    out.resize(FRAME_HEADER_SIZE, 0);
}

/// Patch the reserved header space with a finished request header.
pub fn patch_header(
    out: &mut [u8],
    version: ProtocolVersion,
    flags: FrameFlags,
    stream: i16,
    opcode: Opcode,
) {
    let body_len = out.len() - FRAME_HEADER_SIZE;
    let header = FrameHeader::request(version, flags, stream, opcode, body_len);
    out[..FRAME_HEADER_SIZE].copy_from_slice(header.as_bytes());
}
