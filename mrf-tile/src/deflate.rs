//! Secondary page compression.
//!
//! Pages produced by the primary codec can be deflated once more before they
//! are written. The stream is zlib wrapped by default; gzip and raw deflate
//! streams are also supported.

use flate2::Compression as Level;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use snafu::{ResultExt, Snafu, ensure};
use std::io::{self, Cursor, Read, Write};
use std::ops::Range;

/// Space needed past the input, on top of the input size, to deflate in place.
pub const DEFLATE_SLACK: usize = 64;

/// Room added to the page size when inflating, a packed page can be slightly
/// larger than the raw one.
pub const INFLATE_SLACK: usize = 1440;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Errors from [`deflate_block()`] and [`inflate_block()`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DeflateError {
    #[snafu(display("cannot deflate {len} bytes"))]
    Deflate { len: usize, source: io::Error },

    #[snafu(display("deflated page of {size} bytes does not fit in {capacity} bytes"))]
    NoRoom { size: usize, capacity: usize },

    #[snafu(display("cannot inflate page"))]
    Inflate { source: io::Error },

    #[snafu(display("input of {len} bytes is past the end of a {capacity} byte buffer"))]
    InputTooLong { len: usize, capacity: usize },
}

/// Stream framing of the secondary compression.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DeflateFormat {
    #[default]
    Zlib,
    Gzip,
    Raw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeflateFlags {
    /// Compression level, 0 to 9.
    pub level: u32,
    pub format: DeflateFormat,
}

impl DeflateFlags {
    #[must_use]
    pub fn new(level: u32, format: DeflateFormat) -> Self {
        Self {
            level: level.min(9),
            format,
        }
    }

    /// Maps a 0 to 100 quality setting onto a zlib level.
    #[must_use]
    pub fn from_quality(quality: u8) -> Self {
        Self::new(u32::from(quality.min(100)) / 10, DeflateFormat::Zlib)
    }

    #[must_use]
    pub fn with_format(mut self, format: DeflateFormat) -> Self {
        self.format = format;
        self
    }
}

impl Default for DeflateFlags {
    fn default() -> Self {
        Self::from_quality(85)
    }
}

/// Deflates `buf[..len]`, using `buf[len..]` as output space when it is large
/// enough.
///
/// When fewer than `len + DEFLATE_SLACK` bytes follow the input, the data is
/// packed into a temporary buffer and copied back over the start of `buf`.
/// Returns the range of `buf` that holds the packed bytes.
///
/// On error the content of `buf[..len]` is left untouched and must be treated
/// as not deflated.
pub fn deflate_block(
    buf: &mut [u8],
    len: usize,
    flags: DeflateFlags,
) -> Result<Range<usize>, DeflateError> {
    ensure!(
        len <= buf.len(),
        InputTooLongSnafu {
            len,
            capacity: buf.len()
        }
    );

    let extra = buf.len() - len;

    if extra < len + DEFLATE_SLACK {
        let mut tmp = vec![0u8; len + DEFLATE_SLACK];
        let size = pack(&buf[..len], &mut tmp, flags).context(DeflateSnafu { len })?;

        ensure!(
            size <= buf.len(),
            NoRoomSnafu {
                size,
                capacity: buf.len()
            }
        );

        buf[..size].copy_from_slice(&tmp[..size]);
        return Ok(0..size);
    }

    let (src, dst) = buf.split_at_mut(len);
    let size = pack(src, dst, flags).context(DeflateSnafu { len })?;

    Ok(len..len + size)
}

/// Inflates `src`, producing at most `capacity` bytes.
///
/// Zlib and gzip streams are told apart by their header, raw streams have to
/// be requested through `flags`.
pub fn inflate_block(
    src: &[u8],
    capacity: usize,
    flags: DeflateFlags,
) -> Result<Vec<u8>, DeflateError> {
    let mut out = Vec::with_capacity(capacity);
    let limit = capacity as u64;

    let result = match flags.format {
        DeflateFormat::Raw => DeflateDecoder::new(src).take(limit).read_to_end(&mut out),
        DeflateFormat::Zlib | DeflateFormat::Gzip if src.starts_with(&GZIP_MAGIC) => {
            GzDecoder::new(src).take(limit).read_to_end(&mut out)
        }
        DeflateFormat::Zlib | DeflateFormat::Gzip => {
            ZlibDecoder::new(src).take(limit).read_to_end(&mut out)
        }
    };

    result.context(InflateSnafu)?;

    Ok(out)
}

/// Compresses `src` into `dst`, failing if the stream does not fit.
fn pack(src: &[u8], dst: &mut [u8], flags: DeflateFlags) -> io::Result<usize> {
    let level = Level::new(flags.level);
    let cursor = Cursor::new(dst);

    let cursor = match flags.format {
        DeflateFormat::Zlib => {
            let mut encoder = ZlibEncoder::new(cursor, level);
            encoder.write_all(src)?;
            encoder.finish()?
        }
        DeflateFormat::Gzip => {
            let mut encoder = GzEncoder::new(cursor, level);
            encoder.write_all(src)?;
            encoder.finish()?
        }
        DeflateFormat::Raw => {
            let mut encoder = DeflateEncoder::new(cursor, level);
            encoder.write_all(src)?;
            encoder.finish()?
        }
    };

    Ok(cursor.position() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i / 7 % 13) as u8).collect()
    }

    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x2545_f491_u32;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    #[rstest]
    #[case(DeflateFormat::Zlib)]
    #[case(DeflateFormat::Gzip)]
    #[case(DeflateFormat::Raw)]
    fn test_deflate_in_trailing_space(#[case] format: DeflateFormat) {
        let data = sample(4096);
        let mut buf = data.clone();
        buf.resize(2 * data.len() + DEFLATE_SLACK, 0);

        let flags = DeflateFlags::new(6, format);
        let range = deflate_block(&mut buf, data.len(), flags).unwrap();

        assert_eq!(range.start, data.len());
        assert!(range.len() < data.len());
        assert_eq!(&buf[..data.len()], &data[..]);

        let back = inflate_block(&buf[range], data.len() + INFLATE_SLACK, flags).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_deflate_through_temporary() {
        let data = sample(4096);
        let mut buf = data.clone();
        buf.resize(data.len() + 16, 0);

        let flags = DeflateFlags::default();
        let range = deflate_block(&mut buf, data.len(), flags).unwrap();

        assert_eq!(range.start, 0);
        let back = inflate_block(&buf[range], data.len(), flags).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_deflate_without_room_fails() {
        let data = noise(2048);
        let mut buf = data.clone();

        let err = deflate_block(&mut buf, data.len(), DeflateFlags::new(9, DeflateFormat::Zlib))
            .unwrap_err();

        assert!(matches!(err, DeflateError::NoRoom { .. }));
        assert_eq!(buf, data);
    }

    #[test]
    fn test_deflate_input_past_buffer_end() {
        let mut buf = vec![7u8; 16];

        assert!(matches!(
            deflate_block(&mut buf, 17, DeflateFlags::from_quality(60)),
            Err(DeflateError::InputTooLong {
                len: 17,
                capacity: 16
            })
        ));
        assert_eq!(buf, [7; 16]);
    }

    #[test]
    fn test_inflate_rejects_raw_payload() {
        let data = sample(512);
        assert!(inflate_block(&data, 1024, DeflateFlags::default()).is_err());
    }

    #[test]
    fn test_inflate_is_bounded() {
        let data = sample(4096);
        let mut buf = data.clone();
        buf.resize(3 * data.len(), 0);

        let flags = DeflateFlags::default();
        let range = deflate_block(&mut buf, data.len(), flags).unwrap();
        let back = inflate_block(&buf[range], 100, flags).unwrap();

        assert_eq!(back.len(), 100);
        assert_eq!(&back[..], &data[..100]);
    }

    #[test]
    fn test_quality_mapping() {
        assert_eq!(DeflateFlags::from_quality(85).level, 8);
        assert_eq!(DeflateFlags::from_quality(100).level, 9);
        assert_eq!(DeflateFlags::from_quality(5).level, 0);
    }
}
