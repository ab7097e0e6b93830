//! Tile index and tile storage.
//!
//! Every tile of a pyramid has one 16 byte record in the index file: the
//! offset of its bytes in the data file followed by their size, both
//! big-endian. A record can be in three states, see [`TileState`].
//!
//! The data file starts with [`DATA_MAGIC`] so that a stored tile never sits
//! at offset zero.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use snafu::{ResultExt, Snafu, ensure};
use std::fs::File;
use std::io::{self, Cursor, ErrorKind, Read, Seek, SeekFrom, Write};

/// First bytes of every data file.
pub const DATA_MAGIC: [u8; 4] = *b"MRFD";

/// Size of one index record.
pub const RECORD_SIZE: u64 = 16;

/// Offset recorded for tiles that were marked empty before ever being stored.
const EMPTY_MARKER: u64 = 1;

/// Errors from a [`TileStore`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum StoreError {
    #[snafu(display("cannot read index record #{pos}"))]
    ReadIndex { pos: u64, source: io::Error },

    #[snafu(display("cannot write index record #{pos}"))]
    WriteIndex { pos: u64, source: io::Error },

    #[snafu(display("cannot read {size} bytes at offset {offset:#x}"))]
    ReadData {
        offset: u64,
        size: u64,
        source: io::Error,
    },

    #[snafu(display("cannot append {size} bytes to the data file"))]
    WriteData { size: usize, source: io::Error },

    #[snafu(display("buffer of {len} bytes cannot hold a tile of {size} bytes"))]
    BufferSize { size: u64, len: usize },

    #[snafu(display("index is open read-only"))]
    ReadOnlyIndex,

    #[snafu(display("data file is open read-only"))]
    ReadOnlyData,

    #[snafu(display("cannot read data file marker"))]
    ReadMarker { source: io::Error },

    #[snafu(display("data file has an invalid marker"))]
    InvalidMarker,

    #[snafu(display("cannot flush tile storage"))]
    Flush { source: io::Error },
}

/// Address of one page: column, row, plane, band group and level.
///
/// `band_group` is the band index divided by the number of channels per page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub x: usize,
    pub y: usize,
    pub z: usize,
    pub band_group: usize,
    pub level: usize,
}

impl TileCoord {
    #[must_use]
    pub const fn new(x: usize, y: usize, band_group: usize, level: usize) -> Self {
        Self {
            x,
            y,
            z: 0,
            band_group,
            level,
        }
    }
}

/// One index record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TileIdx {
    pub offset: u64,
    pub size: u64,
}

/// State of an index record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileState {
    /// Never written, the tile may be fetched from a source.
    Hole,
    /// Known to hold only nodata, nothing is stored.
    Empty,
    /// Stored in the data file.
    Present,
}

impl TileIdx {
    #[must_use]
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    #[must_use]
    pub const fn state(&self) -> TileState {
        match (self.offset, self.size) {
            (0, 0) => TileState::Hole,
            (_, 0) => TileState::Empty,
            _ => TileState::Present,
        }
    }
}

/// Whether a file is open for writing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// Storage for the index records and the tile bytes of one pyramid.
pub trait TileStore {
    /// Reads the record at `pos`. Positions past the end of the index are
    /// holes.
    fn read_tile_idx(&mut self, pos: u64) -> Result<TileIdx, StoreError>;

    /// Records the tile at `pos`.
    ///
    /// With a payload, the bytes are appended to the data file. Without one
    /// (or with an empty one), the tile is marked empty, keeping the offset
    /// already recorded if there is one.
    fn write_tile(&mut self, payload: Option<&[u8]>, pos: u64) -> Result<TileIdx, StoreError>;

    /// Reads exactly `idx.size` bytes at `idx.offset` into `buf`.
    fn read_tile(&mut self, idx: TileIdx, buf: &mut [u8]) -> Result<(), StoreError>;

    fn index_mode(&self) -> Mode;

    fn data_mode(&self) -> Mode;

    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A [`TileStore`] over a pair of seekable streams.
#[derive(Debug)]
pub struct Store<I, D> {
    index: I,
    data: D,
    index_mode: Mode,
    data_mode: Mode,
}

/// A store kept in memory.
pub type MemoryStore = Store<Cursor<Vec<u8>>, Cursor<Vec<u8>>>;

/// A store backed by an index file and a data file.
pub type FileStore = Store<File, File>;

impl<I, D> Store<I, D>
where
    I: Read + Write + Seek,
    D: Read + Write + Seek,
{
    /// Initializes an empty store, both streams must be empty and writable.
    pub fn create(index: I, mut data: D) -> Result<Self, StoreError> {
        data.write_all(&DATA_MAGIC)
            .context(WriteDataSnafu {
                size: DATA_MAGIC.len(),
            })?;

        Ok(Self {
            index,
            data,
            index_mode: Mode::Write,
            data_mode: Mode::Write,
        })
    }

    /// Opens an existing store.
    pub fn open(
        index: I,
        mut data: D,
        index_mode: Mode,
        data_mode: Mode,
    ) -> Result<Self, StoreError> {
        let mut marker = [0u8; 4];

        data.seek(SeekFrom::Start(0))
            .and_then(|_| data.read_exact(&mut marker))
            .context(ReadMarkerSnafu)?;

        ensure!(marker == DATA_MAGIC, InvalidMarkerSnafu);

        Ok(Self {
            index,
            data,
            index_mode,
            data_mode,
        })
    }

    pub fn into_parts(self) -> (I, D) {
        (self.index, self.data)
    }

    fn write_record(&mut self, pos: u64, idx: TileIdx) -> Result<(), StoreError> {
        let index = &mut self.index;

        index
            .seek(SeekFrom::Start(pos * RECORD_SIZE))
            .and_then(|_| index.write_u64::<BigEndian>(idx.offset))
            .and_then(|_| index.write_u64::<BigEndian>(idx.size))
            .context(WriteIndexSnafu { pos })
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let mut data = Cursor::new(DATA_MAGIC.to_vec());
        data.set_position(DATA_MAGIC.len() as u64);

        Self {
            index: Cursor::new(Vec::new()),
            data,
            index_mode: Mode::Write,
            data_mode: Mode::Write,
        }
    }

    /// Changes the access modes, as if the store was reopened.
    #[must_use]
    pub fn with_modes(mut self, index_mode: Mode, data_mode: Mode) -> Self {
        self.index_mode = index_mode;
        self.data_mode = data_mode;
        self
    }

    /// Size of the data file, marker included.
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.data.get_ref().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, D> TileStore for Store<I, D>
where
    I: Read + Write + Seek,
    D: Read + Write + Seek,
{
    fn read_tile_idx(&mut self, pos: u64) -> Result<TileIdx, StoreError> {
        let index = &mut self.index;
        let mut record = [0u8; RECORD_SIZE as usize];

        index
            .seek(SeekFrom::Start(pos * RECORD_SIZE))
            .context(ReadIndexSnafu { pos })?;

        match index.read_exact(&mut record) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(TileIdx::default()),
            Err(e) => return Err(e).context(ReadIndexSnafu { pos }),
        }

        let mut src = &record[..];
        let offset = src.read_u64::<BigEndian>().context(ReadIndexSnafu { pos })?;
        let size = src.read_u64::<BigEndian>().context(ReadIndexSnafu { pos })?;

        Ok(TileIdx::new(offset, size))
    }

    fn write_tile(&mut self, payload: Option<&[u8]>, pos: u64) -> Result<TileIdx, StoreError> {
        ensure!(self.index_mode == Mode::Write, ReadOnlyIndexSnafu);

        let idx = match payload {
            Some(bytes) if !bytes.is_empty() => {
                ensure!(self.data_mode == Mode::Write, ReadOnlyDataSnafu);

                let data = &mut self.data;
                let size = bytes.len();
                let offset = data
                    .seek(SeekFrom::End(0))
                    .and_then(|offset| data.write_all(bytes).map(|_| offset))
                    .context(WriteDataSnafu { size })?;

                TileIdx::new(offset, size as u64)
            }
            _ => {
                let prior = self.read_tile_idx(pos)?;
                let offset = match prior.offset {
                    0 => EMPTY_MARKER,
                    v => v,
                };

                TileIdx::new(offset, 0)
            }
        };

        self.write_record(pos, idx)?;

        Ok(idx)
    }

    fn read_tile(&mut self, idx: TileIdx, buf: &mut [u8]) -> Result<(), StoreError> {
        ensure!(
            buf.len() as u64 == idx.size,
            BufferSizeSnafu {
                size: idx.size,
                len: buf.len()
            }
        );

        let data = &mut self.data;

        data.seek(SeekFrom::Start(idx.offset))
            .and_then(|_| data.read_exact(buf))
            .context(ReadDataSnafu {
                offset: idx.offset,
                size: idx.size,
            })
    }

    fn index_mode(&self) -> Mode {
        self.index_mode
    }

    fn data_mode(&self) -> Mode {
        self.data_mode
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.index.flush().context(FlushSnafu)?;
        self.data.flush().context(FlushSnafu)
    }
}
