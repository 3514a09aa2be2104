//! On-disk cache tile format and the checksum embedded in its filename.
//!
//! Spec §4.12 (Writer) describes the embedded digest as "a 64-bit checksum
//! over the pixel buffer", while §4.13 (FileChecker) and §7 call the same
//! value "an MD5 digest" — inconsistent, since MD5 produces a 128-bit (32
//! hex digit) value but §6's filename format reserves 16 hex digits. One
//! function is used by both Writer and FileChecker here rather than two
//! divergent ones; see DESIGN.md for the resolution.
//!
//! The cache file itself is a small fixed header (shape, dtype, channel
//! count) followed by the raw `f32` pixel buffer, row-major `(Y, X, C)`.
//! This is a narrow stand-in for the teacher's real raster file formats
//! (GeoTIFF, DDS) — there is no georeferencing metadata to preserve here.

use std::io::{self, Read, Write};

use crate::descriptor::DType;

const MAGIC: [u8; 4] = *b"RSTC";

/// Streaming 64-bit checksum, matching spec §4.12's "np.add.reduce"-style
/// accumulation: each 4-byte little-endian chunk of the buffer is widened
/// to `u64` and summed, with a rotation so that byte order within the
/// stream still affects the result.
pub fn checksum64(bytes: &[u8]) -> u64 {
    let mut acc: u64 = 0;
    for (i, chunk) in bytes.chunks(4).enumerate() {
        let mut buf = [0u8; 4];
        buf[..chunk.len()].copy_from_slice(chunk);
        let word = u32::from_le_bytes(buf) as u64;
        acc = acc.rotate_left(1) ^ word.wrapping_mul(0x9E37_79B1);
        let _ = i;
    }
    acc
}

fn dtype_tag(dtype: DType) -> u8 {
    match dtype {
        DType::U8 => 0,
        DType::U16 => 1,
        DType::I16 => 2,
        DType::F32 => 3,
    }
}

fn dtype_from_tag(tag: u8) -> Option<DType> {
    match tag {
        0 => Some(DType::U8),
        1 => Some(DType::U16),
        2 => Some(DType::I16),
        3 => Some(DType::F32),
        _ => None,
    }
}

pub struct CacheFileHeader {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub dtype: DType,
}

/// Serializes header + pixel buffer and returns the checksum computed over
/// the pixel buffer alone (the filename digest, spec §6).
pub fn encode(header: &CacheFileHeader, data: &[f32]) -> (Vec<u8>, u64) {
    let mut body = Vec::with_capacity(data.len() * 4);
    for v in data {
        body.extend_from_slice(&v.to_le_bytes());
    }
    let checksum = checksum64(&body);

    let mut out = Vec::with_capacity(MAGIC.len() + 13 + body.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&header.width.to_le_bytes());
    out.extend_from_slice(&header.height.to_le_bytes());
    out.extend_from_slice(&header.channels.to_le_bytes());
    out.push(dtype_tag(header.dtype));
    out.extend_from_slice(&body);
    (out, checksum)
}

pub fn write_to(path: &std::path::Path, header: &CacheFileHeader, data: &[f32]) -> io::Result<u64> {
    let (bytes, checksum) = encode(header, data);
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(checksum)
}

#[derive(Debug)]
pub struct DecodedFile {
    pub header: CacheFileHeader,
    pub data: Vec<f32>,
    pub checksum: u64,
}

#[derive(Debug)]
pub enum DecodeError {
    Io(io::Error),
    Truncated,
    BadMagic,
    BadDtype,
}

impl From<io::Error> for DecodeError {
    fn from(e: io::Error) -> Self {
        DecodeError::Io(e)
    }
}

pub fn read_from(path: &std::path::Path) -> Result<DecodedFile, DecodeError> {
    let mut f = std::fs::File::open(path)?;
    let mut bytes = Vec::new();
    f.read_to_end(&mut bytes)?;
    decode(&bytes)
}

pub fn decode(bytes: &[u8]) -> Result<DecodedFile, DecodeError> {
    if bytes.len() < MAGIC.len() + 13 {
        return Err(DecodeError::Truncated);
    }
    if bytes[..4] != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let width = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let height = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let channels = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
    let dtype = dtype_from_tag(bytes[16]).ok_or(DecodeError::BadDtype)?;
    let body = &bytes[17..];
    let checksum = checksum64(body);
    let expected_len = width as usize * height as usize * channels as usize * 4;
    if body.len() != expected_len {
        return Err(DecodeError::Truncated);
    }
    let data = body
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Ok(DecodedFile {
        header: CacheFileHeader {
            width,
            height,
            channels,
            dtype,
        },
        data,
        checksum,
    })
}

/// Builds the content-addressed filename for a cache tile (spec §6:
/// `<prefix>_<hex16>.<ext>`).
pub fn filename(prefix: &str, checksum: u64) -> String {
    format!("{prefix}_{checksum:016x}.rstc")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_order_sensitive() {
        let a = checksum64(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let b = checksum64(&[5, 6, 7, 8, 1, 2, 3, 4]);
        assert_ne!(a, b);
    }

    #[test]
    fn round_trip_preserves_data_and_checksum() {
        let header = CacheFileHeader {
            width: 2,
            height: 2,
            channels: 1,
            dtype: DType::F32,
        };
        let data = vec![1.0, 2.0, 3.0, 4.0];
        let (bytes, checksum) = encode(&header, &data);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.data, data);
        assert_eq!(decoded.checksum, checksum);
        assert_eq!(decoded.header.width, 2);
    }

    #[test]
    fn truncated_file_is_rejected() {
        let header = CacheFileHeader {
            width: 2,
            height: 2,
            channels: 1,
            dtype: DType::F32,
        };
        let (bytes, _) = encode(&header, &[1.0, 2.0, 3.0, 4.0]);
        let truncated = &bytes[..bytes.len() - 4];
        assert!(matches!(decode(truncated), Err(DecodeError::Truncated)));
    }
}
