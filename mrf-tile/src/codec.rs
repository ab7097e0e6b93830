//! Primary page codecs.
//!
//! A codec turns one decoded page into a compressed byte stream and back. The
//! decoded side is always exactly [`page_size_bytes`] long.
//!
//! [`page_size_bytes`]: crate::image::ImageDesc::page_size_bytes

use flate2::Compression as Level;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use snafu::{ResultExt, Snafu, ensure};
use std::fmt::{Display, Formatter};
use std::io::{Cursor, Read, Write};

/// Errors from a [`PageCodec`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CodecError {
    #[snafu(display("compressed page does not fit in {capacity} bytes"))]
    Overflow { capacity: usize, source: std::io::Error },

    #[snafu(display("page of {size} bytes does not fit in {capacity} bytes"))]
    NoRoom { size: usize, capacity: usize },

    #[snafu(display("page of {actual} bytes cannot be decoded into {expected} bytes"))]
    SizeMismatch { expected: usize, actual: usize },

    #[snafu(display("corrupted page stream"))]
    Corrupted { source: std::io::Error },
}

/// Page compression recorded for a pyramid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Pages are stored as is.
    #[default]
    None,
    /// Pages are stored as zlib streams.
    Deflate,
}

impl Compression {
    #[must_use]
    pub const fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Deflate),
            _ => None,
        }
    }

    #[must_use]
    pub const fn raw(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Deflate => 1,
        }
    }

    /// Whether stored pages keep the sample byte order of the pyramid, so a
    /// host with the other order has to swap them.
    #[must_use]
    pub const fn is_endianness_dependent(self) -> bool {
        match self {
            Self::None | Self::Deflate => true,
        }
    }

    /// Returns a codec instance for pages of this kind.
    #[must_use]
    pub fn codec(self, quality: u8) -> Box<dyn PageCodec> {
        match self {
            Self::None => Box::new(RawCodec),
            Self::Deflate => Box::new(DeflateCodec::new(quality)),
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Deflate => "deflate",
        })
    }
}

/// Encodes and decodes single pages.
pub trait PageCodec: Send {
    /// Compresses `src` into `dst`, returning the number of bytes written.
    fn compress(&mut self, dst: &mut [u8], src: &[u8]) -> Result<usize, CodecError>;

    /// Decompresses `src` into `dst`. Succeeds only if exactly `dst.len()`
    /// bytes were produced.
    fn decompress(&mut self, dst: &mut [u8], src: &[u8]) -> Result<(), CodecError>;
}

/// Stores pages without any transformation.
#[derive(Debug, Default)]
pub struct RawCodec;

impl PageCodec for RawCodec {
    fn compress(&mut self, dst: &mut [u8], src: &[u8]) -> Result<usize, CodecError> {
        ensure!(
            src.len() <= dst.len(),
            NoRoomSnafu {
                size: src.len(),
                capacity: dst.len()
            }
        );

        dst[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    fn decompress(&mut self, dst: &mut [u8], src: &[u8]) -> Result<(), CodecError> {
        ensure!(
            src.len() == dst.len(),
            SizeMismatchSnafu {
                expected: dst.len(),
                actual: src.len()
            }
        );

        dst.copy_from_slice(src);
        Ok(())
    }
}

/// Compresses pages into zlib streams.
#[derive(Debug)]
pub struct DeflateCodec {
    level: u32,
}

impl DeflateCodec {
    /// The zlib level is derived from a 0 to 100 quality.
    #[must_use]
    pub fn new(quality: u8) -> Self {
        Self {
            level: u32::from(quality.min(100)) / 10,
        }
    }
}

impl PageCodec for DeflateCodec {
    fn compress(&mut self, dst: &mut [u8], src: &[u8]) -> Result<usize, CodecError> {
        let capacity = dst.len();
        let mut encoder = ZlibEncoder::new(Cursor::new(dst), Level::new(self.level));

        encoder
            .write_all(src)
            .context(OverflowSnafu { capacity })?;

        let cursor = encoder.finish().context(OverflowSnafu { capacity })?;

        Ok(cursor.position() as usize)
    }

    fn decompress(&mut self, dst: &mut [u8], src: &[u8]) -> Result<(), CodecError> {
        let mut decoder = ZlibDecoder::new(src);
        let mut filled = 0;

        while filled < dst.len() {
            match decoder.read(&mut dst[filled..]).context(CorruptedSnafu)? {
                0 => break,
                n => filled += n,
            }
        }

        // The stream must end exactly at the page boundary.
        let mut probe = [0u8; 1];
        let extra = decoder.read(&mut probe).context(CorruptedSnafu)?;

        ensure!(
            filled == dst.len() && extra == 0,
            SizeMismatchSnafu {
                expected: dst.len(),
                actual: filled + extra
            }
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Vec<u8> {
        (0..4096).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_raw_codec() {
        let src = page();
        let mut dst = vec![0u8; src.len() + 10];
        let mut codec = Compression::None.codec(85);

        let n = codec.compress(&mut dst, &src).unwrap();
        assert_eq!(n, src.len());

        let mut back = vec![0u8; src.len()];
        codec.decompress(&mut back, &dst[..n]).unwrap();
        assert_eq!(back, src);

        assert!(codec.compress(&mut [0u8; 16], &src).is_err());
        assert!(codec.decompress(&mut back, &dst[..n - 1]).is_err());
    }

    #[test]
    fn test_deflate_codec() {
        let src = page();
        let mut dst = vec![0u8; src.len() * 2];
        let mut codec = Compression::Deflate.codec(60);

        let n = codec.compress(&mut dst, &src).unwrap();
        assert!(n < src.len());

        let mut back = vec![0u8; src.len()];
        codec.decompress(&mut back, &dst[..n]).unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn test_deflate_codec_size_mismatch() {
        let src = page();
        let mut dst = vec![0u8; src.len() * 2];
        let mut codec = DeflateCodec::new(85);
        let n = codec.compress(&mut dst, &src).unwrap();

        let mut short = vec![0u8; src.len() - 1];
        assert!(matches!(
            codec.decompress(&mut short, &dst[..n]),
            Err(CodecError::SizeMismatch { .. })
        ));

        let mut long = vec![0u8; src.len() + 1];
        assert!(matches!(
            codec.decompress(&mut long, &dst[..n]),
            Err(CodecError::SizeMismatch { .. })
        ));

        assert!(codec.decompress(&mut long, &src[..64]).is_err());
    }

    #[test]
    fn test_compression_raw_values() {
        for c in [Compression::None, Compression::Deflate] {
            assert_eq!(Compression::from_raw(c.raw()), Some(c));
            assert!(c.is_endianness_dependent());
        }
        assert_eq!(Compression::from_raw(9), None);
    }
}
