//! Binary array files holding one shard's adjacency and feature buffers.
//!
//! Layout: a 24-byte header (magic, format version, element type, row and
//! column counts), the little-endian payload, then a CRC32 of the payload.
//! Files are written once by the partitioner and read once at server start.

use std::fs;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TesseraError};

/// Magic bytes opening every tessera array file.
pub const ARRAY_MAGIC: [u8; 4] = *b"TSRA";
/// Current array file format version.
pub const ARRAY_FORMAT_VERSION: u16 = 1;

const HEADER_LEN: usize = 24;
const TRAILER_LEN: usize = 4;

/// Element type of an array file.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Dtype {
    /// 32-bit float features.
    F32,
    /// 32-bit integer features.
    I32,
    /// 64-bit unsigned adjacency words.
    U64,
}

impl Dtype {
    fn code(self) -> u8 {
        match self {
            Dtype::F32 => 0,
            Dtype::I32 => 1,
            Dtype::U64 => 2,
        }
    }

    fn from_code(code: u8, path: &Path) -> Result<Dtype> {
        match code {
            0 => Ok(Dtype::F32),
            1 => Ok(Dtype::I32),
            2 => Ok(Dtype::U64),
            other => Err(TesseraError::ShardIntegrity(format!(
                "{}: unknown element type {other}",
                path.display()
            ))),
        }
    }

    fn width(self) -> usize {
        match self {
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::U64 => 8,
        }
    }
}

fn encode_header(buf: &mut BytesMut, dtype: Dtype, rows: u64, cols: u64) {
    buf.put_slice(&ARRAY_MAGIC);
    buf.put_u16_le(ARRAY_FORMAT_VERSION);
    buf.put_u8(dtype.code());
    buf.put_u8(0);
    buf.put_u64_le(rows);
    buf.put_u64_le(cols);
}

fn write_file(path: &Path, dtype: Dtype, rows: usize, cols: usize, payload: BytesMut) -> Result<()> {
    let crc = crc32fast::hash(&payload);
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    encode_header(&mut out, dtype, rows as u64, cols as u64);
    out.extend_from_slice(&payload);
    out.put_u32_le(crc);
    fs::write(path, &out)?;
    Ok(())
}

/// Writes an f32 array of shape `(rows, cols)`.
pub fn write_f32(path: &Path, rows: usize, cols: usize, data: &[f32]) -> Result<()> {
    check_shape(path, Dtype::F32, rows, cols, data.len())?;
    let mut payload = BytesMut::with_capacity(data.len() * 4);
    for &v in data {
        payload.put_f32_le(v);
    }
    write_file(path, Dtype::F32, rows, cols, payload)
}

/// Writes an i32 array of shape `(rows, cols)`.
pub fn write_i32(path: &Path, rows: usize, cols: usize, data: &[i32]) -> Result<()> {
    check_shape(path, Dtype::I32, rows, cols, data.len())?;
    let mut payload = BytesMut::with_capacity(data.len() * 4);
    for &v in data {
        payload.put_i32_le(v);
    }
    write_file(path, Dtype::I32, rows, cols, payload)
}

/// Writes a u64 array of shape `(rows, 1)`.
pub fn write_u64(path: &Path, data: &[u64]) -> Result<()> {
    let mut payload = BytesMut::with_capacity(data.len() * 8);
    for &v in data {
        payload.put_u64_le(v);
    }
    write_file(path, Dtype::U64, data.len(), 1, payload)
}

fn check_shape(path: &Path, dtype: Dtype, rows: usize, cols: usize, len: usize) -> Result<()> {
    if rows * cols != len {
        return Err(TesseraError::InvalidArgument(format!(
            "{}: {dtype:?} payload has {len} elements, shape says {rows}x{cols}",
            path.display()
        )));
    }
    Ok(())
}

struct RawArray {
    dtype: Dtype,
    rows: usize,
    cols: usize,
    payload: Vec<u8>,
}

fn read_file(path: &Path, want: Dtype) -> Result<RawArray> {
    let blob = fs::read(path)?;
    if blob.len() < HEADER_LEN + TRAILER_LEN {
        return Err(TesseraError::ShardIntegrity(format!(
            "{}: truncated ({} bytes)",
            path.display(),
            blob.len()
        )));
    }
    let mut head = &blob[..HEADER_LEN];
    let mut magic = [0u8; 4];
    head.copy_to_slice(&mut magic);
    if magic != ARRAY_MAGIC {
        return Err(TesseraError::ShardIntegrity(format!(
            "{}: bad magic {magic:02x?}",
            path.display()
        )));
    }
    let version = head.get_u16_le();
    if version != ARRAY_FORMAT_VERSION {
        return Err(TesseraError::ShardIntegrity(format!(
            "{}: format version {version}, expected {ARRAY_FORMAT_VERSION}",
            path.display()
        )));
    }
    let dtype = Dtype::from_code(head.get_u8(), path)?;
    let _reserved = head.get_u8();
    let rows = head.get_u64_le() as usize;
    let cols = head.get_u64_le() as usize;
    if dtype != want {
        return Err(TesseraError::ShardIntegrity(format!(
            "{}: element type {dtype:?}, expected {want:?}",
            path.display()
        )));
    }
    let expect_len = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(dtype.width()))
        .ok_or_else(|| {
            TesseraError::ShardIntegrity(format!(
                "{}: shape {rows}x{cols} overflows",
                path.display()
            ))
        })?;
    if blob.len() != HEADER_LEN + expect_len + TRAILER_LEN {
        return Err(TesseraError::ShardIntegrity(format!(
            "{}: {} payload bytes, shape {rows}x{cols} wants {expect_len}",
            path.display(),
            blob.len() - HEADER_LEN - TRAILER_LEN
        )));
    }
    let payload = &blob[HEADER_LEN..HEADER_LEN + expect_len];
    let mut trailer = &blob[HEADER_LEN + expect_len..];
    let stored_crc = trailer.get_u32_le();
    let actual_crc = crc32fast::hash(payload);
    if stored_crc != actual_crc {
        return Err(TesseraError::ShardIntegrity(format!(
            "{}: crc mismatch, stored {stored_crc:#010x}, computed {actual_crc:#010x}",
            path.display()
        )));
    }
    Ok(RawArray {
        dtype,
        rows,
        cols,
        payload: payload.to_vec(),
    })
}

/// Reads an f32 array, returning `(rows, cols, data)`.
pub fn read_f32(path: &Path) -> Result<(usize, usize, Vec<f32>)> {
    let raw = read_file(path, Dtype::F32)?;
    let mut data = Vec::with_capacity(raw.rows * raw.cols);
    let mut buf = raw.payload.as_slice();
    while buf.remaining() >= raw.dtype.width() {
        data.push(buf.get_f32_le());
    }
    Ok((raw.rows, raw.cols, data))
}

/// Reads an i32 array, returning `(rows, cols, data)`.
pub fn read_i32(path: &Path) -> Result<(usize, usize, Vec<i32>)> {
    let raw = read_file(path, Dtype::I32)?;
    let mut data = Vec::with_capacity(raw.rows * raw.cols);
    let mut buf = raw.payload.as_slice();
    while buf.remaining() >= raw.dtype.width() {
        data.push(buf.get_i32_le());
    }
    Ok((raw.rows, raw.cols, data))
}

/// Reads a u64 array written by [`write_u64`].
pub fn read_u64(path: &Path) -> Result<Vec<u64>> {
    let raw = read_file(path, Dtype::U64)?;
    let mut data = Vec::with_capacity(raw.rows);
    let mut buf = raw.payload.as_slice();
    while buf.remaining() >= raw.dtype.width() {
        data.push(buf.get_u64_le());
    }
    Ok(data)
}
