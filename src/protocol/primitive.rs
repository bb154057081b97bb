//! Byte-level primitives of the CQL native protocol.
//!
//! All multi-byte integers are big-endian. Readers take a slice and return
//! `(value, rest)`, never reading past the end of the input; writers append
//! to a `Vec<u8>`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use simdutf8::basic::from_utf8;
use uuid::Uuid;

use crate::constant::Consistency;
use crate::error::{Error, Result};

/// Read 1-byte unsigned integer
pub fn read_u8(data: &[u8]) -> Result<(u8, &[u8])> {
    if data.is_empty() {
        return Err(Error::UnexpectedEof);
    }
    Ok((data[0], &data[1..]))
}

/// Read 1-byte signed integer
pub fn read_i8(data: &[u8]) -> Result<(i8, &[u8])> {
    let (v, rest) = read_u8(data)?;
    Ok((v as i8, rest))
}

/// Read 2-byte big-endian unsigned integer
pub fn read_u16(data: &[u8]) -> Result<(u16, &[u8])> {
    if data.len() < 2 {
        return Err(Error::UnexpectedEof);
    }
    Ok((u16::from_be_bytes([data[0], data[1]]), &data[2..]))
}

/// Read 2-byte big-endian signed integer
pub fn read_i16(data: &[u8]) -> Result<(i16, &[u8])> {
    let (v, rest) = read_u16(data)?;
    Ok((v as i16, rest))
}

/// Read 4-byte big-endian signed integer
pub fn read_i32(data: &[u8]) -> Result<(i32, &[u8])> {
    if data.len() < 4 {
        return Err(Error::UnexpectedEof);
    }
    Ok((
        i32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        &data[4..],
    ))
}

/// Read 4-byte big-endian unsigned integer
pub fn read_u32(data: &[u8]) -> Result<(u32, &[u8])> {
    let (v, rest) = read_i32(data)?;
    Ok((v as u32, rest))
}

/// Read 8-byte big-endian signed integer
pub fn read_i64(data: &[u8]) -> Result<(i64, &[u8])> {
    if data.len() < 8 {
        return Err(Error::UnexpectedEof);
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[..8]);
    Ok((i64::from_be_bytes(bytes), &data[8..]))
}

/// Read 4-byte big-endian float
pub fn read_f32(data: &[u8]) -> Result<(f32, &[u8])> {
    let (v, rest) = read_i32(data)?;
    Ok((f32::from_bits(v as u32), rest))
}

/// Read 8-byte big-endian double
pub fn read_f64(data: &[u8]) -> Result<(f64, &[u8])> {
    let (v, rest) = read_i64(data)?;
    Ok((f64::from_bits(v as u64), rest))
}

/// Read a fixed number of raw bytes
pub fn read_raw(data: &[u8], len: usize) -> Result<(&[u8], &[u8])> {
    if data.len() < len {
        return Err(Error::UnexpectedEof);
    }
    Ok((&data[..len], &data[len..]))
}

/// Read `[string]`: u16 length + UTF-8 bytes
pub fn read_string(data: &[u8]) -> Result<(&str, &[u8])> {
    let (len, rest) = read_u16(data)?;
    let (bytes, rest) = read_raw(rest, len as usize)?;
    let s = from_utf8(bytes).map_err(|_| Error::InvalidFrame("string is not UTF-8"))?;
    Ok((s, rest))
}

/// Read `[long string]`: i32 length + UTF-8 bytes
pub fn read_long_string(data: &[u8]) -> Result<(&str, &[u8])> {
    let (len, rest) = read_i32(data)?;
    if len < 0 {
        return Err(Error::InvalidFrame("negative long-string length"));
    }
    let (bytes, rest) = read_raw(rest, len as usize)?;
    let s = from_utf8(bytes).map_err(|_| Error::InvalidFrame("string is not UTF-8"))?;
    Ok((s, rest))
}

/// Read `[bytes]`: i32 length + bytes; a negative length is null
pub fn read_bytes(data: &[u8]) -> Result<(Option<&[u8]>, &[u8])> {
    let (len, rest) = read_i32(data)?;
    if len < 0 {
        return Ok((None, rest));
    }
    let (bytes, rest) = read_raw(rest, len as usize)?;
    Ok((Some(bytes), rest))
}

/// Read `[short bytes]`: u16 length + bytes
pub fn read_short_bytes(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let (len, rest) = read_u16(data)?;
    read_raw(rest, len as usize)
}

/// Read `[string list]`: u16 count + strings
pub fn read_string_list(data: &[u8]) -> Result<(Vec<String>, &[u8])> {
    let (count, mut rest) = read_u16(data)?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (s, r) = read_string(rest)?;
        out.push(s.to_string());
        rest = r;
    }
    Ok((out, rest))
}

/// Read `[string map]`: u16 count + (string, string) pairs
pub fn read_string_map(data: &[u8]) -> Result<(HashMap<String, String>, &[u8])> {
    let (count, mut rest) = read_u16(data)?;
    let mut out = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let (k, r) = read_string(rest)?;
        let (v, r) = read_string(r)?;
        out.insert(k.to_string(), v.to_string());
        rest = r;
    }
    Ok((out, rest))
}

/// Read `[string multimap]`: u16 count + (string, string list) pairs
pub fn read_string_multimap(data: &[u8]) -> Result<(HashMap<String, Vec<String>>, &[u8])> {
    let (count, mut rest) = read_u16(data)?;
    let mut out = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let (k, r) = read_string(rest)?;
        let (v, r) = read_string_list(r)?;
        out.insert(k.to_string(), v);
        rest = r;
    }
    Ok((out, rest))
}

/// Read `[bytes map]`: u16 count + (string, bytes) pairs (custom payloads)
pub fn read_bytes_map(data: &[u8]) -> Result<(HashMap<String, Vec<u8>>, &[u8])> {
    let (count, mut rest) = read_u16(data)?;
    let mut out = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let (k, r) = read_string(rest)?;
        let (v, r) = read_bytes(r)?;
        out.insert(k.to_string(), v.unwrap_or_default().to_vec());
        rest = r;
    }
    Ok((out, rest))
}

/// Read `[uuid]`: 16 raw bytes
pub fn read_uuid(data: &[u8]) -> Result<(Uuid, &[u8])> {
    let (bytes, rest) = read_raw(data, 16)?;
    let mut buf = [0u8; 16];
    buf.copy_from_slice(bytes);
    Ok((Uuid::from_bytes(buf), rest))
}

/// Read a bare inet address: u8 length (4 or 16) + octets
pub fn read_inetaddr(data: &[u8]) -> Result<(IpAddr, &[u8])> {
    let (len, rest) = read_u8(data)?;
    match len {
        4 => {
            let (bytes, rest) = read_raw(rest, 4)?;
            let mut buf = [0u8; 4];
            buf.copy_from_slice(bytes);
            Ok((IpAddr::V4(Ipv4Addr::from(buf)), rest))
        }
        16 => {
            let (bytes, rest) = read_raw(rest, 16)?;
            let mut buf = [0u8; 16];
            buf.copy_from_slice(bytes);
            Ok((IpAddr::V6(Ipv6Addr::from(buf)), rest))
        }
        _ => Err(Error::InvalidFrame("inet address length must be 4 or 16")),
    }
}

/// Read `[inet]`: address + i32 port
pub fn read_inet(data: &[u8]) -> Result<(SocketAddr, &[u8])> {
    let (addr, rest) = read_inetaddr(data)?;
    let (port, rest) = read_i32(rest)?;
    if !(0..=u16::MAX as i32).contains(&port) {
        return Err(Error::InvalidFrame("inet port out of range"));
    }
    Ok((SocketAddr::new(addr, port as u16), rest))
}

/// Read `[consistency]`: u16 wire value
pub fn read_consistency(data: &[u8]) -> Result<(Consistency, &[u8])> {
    let (v, rest) = read_u16(data)?;
    Ok((Consistency::from_u16(v)?, rest))
}

/// Read an unsigned vint. The number of leading 1-bits in the first byte is
/// the number of extra bytes that follow; the remaining bits of the first
/// byte are the most significant bits of the value.
pub fn read_vint(data: &[u8]) -> Result<(u64, &[u8])> {
    let (first, rest) = read_u8(data)?;
    let extra = first.leading_ones() as usize;
    if extra == 0 {
        return Ok((first as u64, rest));
    }
    let (bytes, rest) = read_raw(rest, extra)?;
    let mut value = (first & (0xFFu8.checked_shr(extra as u32).unwrap_or(0))) as u64;
    for &b in bytes {
        value = (value << 8) | b as u64;
    }
    Ok((value, rest))
}

/// Read a signed vint (zigzag over the unsigned form)
pub fn read_vint_signed(data: &[u8]) -> Result<(i64, &[u8])> {
    let (z, rest) = read_vint(data)?;
    Ok((zigzag_decode(z), rest))
}

/// Read a decimal cell: i32 scale followed by the big-endian
/// two's-complement unscaled value, which spans the remainder of the cell.
/// The unscaled value is returned as raw bytes; interpreting it is codec
/// territory.
pub fn read_decimal(data: &[u8]) -> Result<(i32, &[u8])> {
    let (scale, unscaled) = read_i32(data)?;
    Ok((scale, unscaled))
}

/// Write a decimal cell
pub fn write_decimal(out: &mut Vec<u8>, scale: i32, unscaled: &[u8]) {
    write_i32(out, scale);
    out.extend_from_slice(unscaled);
}

/// A CQL duration: three independently-signed components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqlDuration {
    pub months: i32,
    pub days: i32,
    pub nanos: i64,
}

/// Read `[duration]`: three signed vints (months, days, nanoseconds)
pub fn read_duration(data: &[u8]) -> Result<(CqlDuration, &[u8])> {
    let (months, rest) = read_vint_signed(data)?;
    let (days, rest) = read_vint_signed(rest)?;
    let (nanos, rest) = read_vint_signed(rest)?;
    Ok((
        CqlDuration {
            months: months as i32,
            days: days as i32,
            nanos,
        },
        rest,
    ))
}

/// Write 1-byte integer
pub fn write_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

/// Write 2-byte big-endian integer
pub fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Write 2-byte big-endian signed integer
pub fn write_i16(out: &mut Vec<u8>, value: i16) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Write 4-byte big-endian signed integer
pub fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Write 8-byte big-endian signed integer
pub fn write_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Write `[string]`
pub fn write_string(out: &mut Vec<u8>, s: &str) {
    write_u16(out, s.len() as u16);
    out.extend_from_slice(s.as_bytes());
}

/// Write `[long string]`
pub fn write_long_string(out: &mut Vec<u8>, s: &str) {
    write_i32(out, s.len() as i32);
    out.extend_from_slice(s.as_bytes());
}

/// Write `[bytes]`; `None` is the null marker (-1)
pub fn write_bytes(out: &mut Vec<u8>, data: Option<&[u8]>) {
    match data {
        Some(data) => {
            write_i32(out, data.len() as i32);
            out.extend_from_slice(data);
        }
        None => write_i32(out, -1),
    }
}

/// Write the v4+ "not set" bytes marker (-2)
pub fn write_bytes_unset(out: &mut Vec<u8>) {
    write_i32(out, -2);
}

/// Write `[short bytes]`
pub fn write_short_bytes(out: &mut Vec<u8>, data: &[u8]) {
    write_u16(out, data.len() as u16);
    out.extend_from_slice(data);
}

/// Write `[string list]`
pub fn write_string_list(out: &mut Vec<u8>, list: &[&str]) {
    write_u16(out, list.len() as u16);
    for s in list {
        write_string(out, s);
    }
}

/// Write `[string map]`. Entries are written in the iteration order given.
pub fn write_string_map<'a>(out: &mut Vec<u8>, entries: &[(&'a str, &'a str)]) {
    write_u16(out, entries.len() as u16);
    for (k, v) in entries {
        write_string(out, k);
        write_string(out, v);
    }
}

/// Write `[bytes map]` (custom payloads)
pub fn write_bytes_map<'a>(out: &mut Vec<u8>, entries: impl Iterator<Item = (&'a str, &'a [u8])>) {
    let count_pos = out.len();
    write_u16(out, 0);
    let mut count: u16 = 0;
    for (k, v) in entries {
        write_string(out, k);
        write_bytes(out, Some(v));
        count += 1;
    }
    out[count_pos..count_pos + 2].copy_from_slice(&count.to_be_bytes());
}

/// Write an unsigned vint
pub fn write_vint(out: &mut Vec<u8>, value: u64) {
    if value < 0x80 {
        out.push(value as u8);
        return;
    }
    let bit_len = 64 - value.leading_zeros() as usize;
    // extra bytes needed: first byte keeps 7 - extra bits (0 when extra == 8)
    let extra = (bit_len - 7).div_ceil(7).min(8);
    if extra == 8 {
        out.push(0xFF);
        out.extend_from_slice(&value.to_be_bytes());
    } else {
        let prefix = (0xFFu8 << (8 - extra)) & 0xFF;
        out.push(prefix | (value >> (8 * extra)) as u8);
        for i in (0..extra).rev() {
            out.push((value >> (8 * i)) as u8);
        }
    }
}

/// Write a signed vint (zigzag)
pub fn write_vint_signed(out: &mut Vec<u8>, value: i64) {
    write_vint(out, zigzag_encode(value));
}

/// Write `[duration]` as three signed vints
pub fn write_duration(out: &mut Vec<u8>, duration: CqlDuration) {
    write_vint_signed(out, duration.months as i64);
    write_vint_signed(out, duration.days as i64);
    write_vint_signed(out, duration.nanos);
}

pub const fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub const fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
