use crate::codec::Compression;
use crate::deflate::{DeflateFlags, DeflateFormat};
use crate::image::{ByteOrder, DataType, DescError, ImageDesc, PageSize, Size};
use crate::raster::GeoTransform;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use zerocopy::byteorder::little_endian::{F64, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Errors when parsing a pyramid header from bytes.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("source buffer is too short to read the header"))]
    ReadHeaderFailed,

    #[snafu(display("invalid magic"))]
    InvalidMagic,

    #[snafu(display("unsupported version {version}"))]
    UnsupportedVersion { version: u32 },

    #[snafu(display("unknown data type {raw}"))]
    UnknownDataType { raw: u8 },

    #[snafu(display("unknown byte order {raw}"))]
    UnknownByteOrder { raw: u8 },

    #[snafu(display("unknown compression {raw}"))]
    UnknownCompression { raw: u8 },

    #[snafu(display("source path is not valid UTF-8"))]
    InvalidSourcePath,

    #[snafu(display("invalid image description"))]
    InvalidDesc { source: DescError },
}

/// Errors when serializing a pyramid header.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum WriteError {
    #[snafu(display("source path is not valid UTF-8"))]
    NonUtf8SourcePath,

    #[snafu(display("source path of {len} bytes exceeds {SOURCE_CAPACITY} bytes"))]
    SourcePathTooLong { len: usize },
}

pub const MAGIC: [u8; 4] = *b"MRFH";

const VERSION: u32 = 1;
const SOURCE_CAPACITY: usize = 256;

/// The size of the header on disk.
pub const HEADER_SIZE: usize = size_of::<HeaderRaw>();

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct HeaderRaw {
    magic: [u8; 4],                 // 0x00
    version: U32,                   // 0x04
    size_x: U64,                    // 0x08
    size_y: U64,                    // 0x10
    page_x: U32,                    // 0x18
    page_y: U32,                    // 0x1C
    page_c: U32,                    // 0x20
    bands: U32,                     // 0x24
    levels: U32,                    // 0x28
    flags: U32,                     // 0x2C
    data_type: u8,                  // 0x30
    order: u8,                      // 0x31
    compression: u8,                // 0x32
    quality: u8,                    // 0x33
    deflate_level: u8,              // 0x34
    reserved: [u8; 3],              // 0x35
    nodata: F64,                    // 0x38
    scale: F64,                     // 0x40
    geo: [F64; 6],                  // 0x48
    source_len: U32,                // 0x78
    source: [u8; SOURCE_CAPACITY],  // 0x7C
}

/// Optional settings stored in the header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct HeaderFlags(u32);

bitflags::bitflags! {
    impl HeaderFlags: u32 {
        const DEFLATE = 0x01;
        const GZIP = 0x02;
        const RAW_DEFLATE = 0x04;
        const NODATA = 0x08;
        const CLONE = 0x10;
        const GEO = 0x20;
    }
}

impl Display for HeaderFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "(none)");
        }

        let mut first = true;

        for (name, _) in self.iter_names() {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            f.write_str(name)?;
        }

        Ok(())
    }
}

/// Where missing tiles of a pyramid come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceRef {
    pub path: PathBuf,
    /// The source is a pyramid with the same structure whose tiles are copied
    /// verbatim.
    pub clone: bool,
}

/// Everything a pyramid header records.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub desc: ImageDesc,
    pub geo: Option<GeoTransform>,
    pub source: Option<SourceRef>,
}

impl Header {
    #[must_use]
    pub fn new(desc: ImageDesc) -> Self {
        Self {
            desc,
            geo: None,
            source: None,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ReadError> {
        let (raw, _) =
            HeaderRaw::read_from_prefix(data).map_err(|_| ReadHeaderFailedSnafu.build())?;

        ensure!(raw.magic == MAGIC, InvalidMagicSnafu);

        let version = raw.version.get();
        ensure!(version == VERSION, UnsupportedVersionSnafu { version });

        let flags = HeaderFlags::from_bits_truncate(raw.flags.get());

        let data_type =
            DataType::from_raw(raw.data_type).context(UnknownDataTypeSnafu { raw: raw.data_type })?;
        let order = ByteOrder::from_raw(raw.order).context(UnknownByteOrderSnafu { raw: raw.order })?;
        let compression = Compression::from_raw(raw.compression).context(UnknownCompressionSnafu {
            raw: raw.compression,
        })?;

        let deflate = flags.contains(HeaderFlags::DEFLATE).then(|| {
            let format = if flags.contains(HeaderFlags::GZIP) {
                DeflateFormat::Gzip
            } else if flags.contains(HeaderFlags::RAW_DEFLATE) {
                DeflateFormat::Raw
            } else {
                DeflateFormat::Zlib
            };

            DeflateFlags::new(u32::from(raw.deflate_level), format)
        });

        let desc = ImageDesc {
            size: Size::new(raw.size_x.get() as usize, raw.size_y.get() as usize),
            page: PageSize::new(
                raw.page_x.get() as usize,
                raw.page_y.get() as usize,
                raw.page_c.get() as usize,
            ),
            bands: raw.bands.get() as usize,
            data_type,
            order,
            nodata: flags
                .contains(HeaderFlags::NODATA)
                .then(|| raw.nodata.get()),
            compression,
            quality: raw.quality,
            deflate,
            levels: raw.levels.get() as usize,
            scale: raw.scale.get(),
        };

        desc.validate().context(InvalidDescSnafu)?;

        let geo = flags
            .contains(HeaderFlags::GEO)
            .then(|| GeoTransform(raw.geo.map(|v| v.get())));

        let len = (raw.source_len.get() as usize).min(SOURCE_CAPACITY);
        let source = if len == 0 {
            None
        } else {
            let path = std::str::from_utf8(&raw.source[..len])
                .ok()
                .context(InvalidSourcePathSnafu)?;

            Some(SourceRef {
                path: PathBuf::from(path),
                clone: flags.contains(HeaderFlags::CLONE),
            })
        };

        Ok(Self { desc, geo, source })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WriteError> {
        let desc = &self.desc;
        let mut flags = HeaderFlags::empty();
        let mut raw = HeaderRaw::new_zeroed();

        raw.magic = MAGIC;
        raw.version = U32::new(VERSION);
        raw.size_x = U64::new(desc.size.x as u64);
        raw.size_y = U64::new(desc.size.y as u64);
        raw.page_x = U32::new(desc.page.x as u32);
        raw.page_y = U32::new(desc.page.y as u32);
        raw.page_c = U32::new(desc.page.c as u32);
        raw.bands = U32::new(desc.bands as u32);
        raw.levels = U32::new(desc.levels as u32);
        raw.data_type = desc.data_type.raw();
        raw.order = desc.order.raw();
        raw.compression = desc.compression.raw();
        raw.quality = desc.quality;
        raw.scale = F64::new(desc.scale);

        if let Some(deflate) = desc.deflate {
            flags |= HeaderFlags::DEFLATE;
            flags |= match deflate.format {
                DeflateFormat::Zlib => HeaderFlags::empty(),
                DeflateFormat::Gzip => HeaderFlags::GZIP,
                DeflateFormat::Raw => HeaderFlags::RAW_DEFLATE,
            };
            raw.deflate_level = deflate.level as u8;
        }

        if let Some(nodata) = desc.nodata {
            flags |= HeaderFlags::NODATA;
            raw.nodata = F64::new(nodata);
        }

        if let Some(geo) = self.geo {
            flags |= HeaderFlags::GEO;
            raw.geo = geo.0.map(F64::new);
        }

        if let Some(source) = &self.source {
            let path = source.path.to_str().context(NonUtf8SourcePathSnafu)?;
            let len = path.len();

            ensure!(len <= SOURCE_CAPACITY, SourcePathTooLongSnafu { len });

            raw.source[..len].copy_from_slice(path.as_bytes());
            raw.source_len = U32::new(len as u32);

            if source.clone {
                flags |= HeaderFlags::CLONE;
            }
        }

        raw.flags = U32::new(flags.bits());

        Ok(raw.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Header {
        let desc = ImageDesc::new(Size::new(1000, 700), PageSize::new(256, 256, 3), 3, DataType::UInt16)
            .with_nodata(-1.0)
            .with_order(ByteOrder::Big)
            .with_compression(Compression::Deflate)
            .with_quality(60)
            .with_deflate(DeflateFlags::new(6, DeflateFormat::Gzip))
            .with_full_pyramid();

        Header {
            desc,
            geo: Some(GeoTransform::new(-180.0, 0.36, 90.0, -0.36)),
            source: Some(SourceRef {
                path: PathBuf::from("../base/world.mrf"),
                clone: true,
            }),
        }
    }

    #[test]
    fn test_round_trip() {
        let header = header();
        let bytes = header.to_bytes().unwrap();

        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[..4], b"MRFH");
        assert_eq!(Header::from_bytes(&bytes).unwrap(), header);

        let plain = Header::new(ImageDesc::new(
            Size::new(10, 10),
            PageSize::new(8, 8, 1),
            1,
            DataType::Byte,
        ));
        let back = Header::from_bytes(&plain.to_bytes().unwrap()).unwrap();

        assert_eq!(back, plain);
        assert_eq!(back.desc.deflate, None);
    }

    #[test]
    fn test_rejects_invalid_headers() {
        let bytes = header().to_bytes().unwrap();

        assert!(matches!(
            Header::from_bytes(&bytes[..HEADER_SIZE - 1]),
            Err(ReadError::ReadHeaderFailed)
        ));

        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(Header::from_bytes(&bad), Err(ReadError::InvalidMagic)));

        let mut bad = bytes.clone();
        bad[0x04] = 2;
        assert!(matches!(
            Header::from_bytes(&bad),
            Err(ReadError::UnsupportedVersion { version: 2 })
        ));

        let mut bad = bytes.clone();
        bad[0x30] = 42;
        assert!(matches!(
            Header::from_bytes(&bad),
            Err(ReadError::UnknownDataType { raw: 42 })
        ));

        let mut bad = bytes;
        bad[0x24] = 2;
        assert!(matches!(
            Header::from_bytes(&bad),
            Err(ReadError::InvalidDesc { .. })
        ));
    }

    #[test]
    fn test_long_source_path() {
        let mut header = header();
        header.source = Some(SourceRef {
            path: PathBuf::from("x".repeat(SOURCE_CAPACITY + 1)),
            clone: false,
        });

        assert!(matches!(
            header.to_bytes(),
            Err(WriteError::SourcePathTooLong { len: 257 })
        ));
    }

    #[test]
    fn test_flags_display() {
        assert_eq!(HeaderFlags::empty().to_string(), "(none)");
        assert_eq!(
            (HeaderFlags::DEFLATE | HeaderFlags::CLONE).to_string(),
            "DEFLATE, CLONE"
        );
    }
}
