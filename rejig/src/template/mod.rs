//! The binary `.template` format: DESC table model and decoder.
//!
//! A template file carries everything about the image that is not a
//! component file: an ASCII header, a stream of compressed chunks holding
//! the verbatim data regions, and a trailer-indexed `DESC` table describing
//! how data regions and component files partition the image.
//!
//! Sizes inside the format are 6-byte little-endian integers ("u48"). The
//! table is found by reading the last 6 bytes of the file, which give the
//! table's total size including its own header.

mod decoder;
mod reader;

pub use decoder::{read_desc_table, write_data_blocks};

use std::io;

use crate::compress::CompressError;
use crate::hash::Md5;

/// Entry type tags in the DESC table.
pub(crate) const ENTRY_IMAGE_INFO_LEGACY: u8 = 1;
pub(crate) const ENTRY_DATA: u8 = 2;
pub(crate) const ENTRY_FILE_LEGACY: u8 = 3;
pub(crate) const ENTRY_IMAGE_INFO: u8 = 5;
pub(crate) const ENTRY_FILE: u8 = 6;

/// Errors from template parsing and data-stream extraction.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// The file does not begin with the supported version-1 header line.
    #[error("not a version-1 template file")]
    BadHeader,

    /// The header's CRLF-terminated preamble ended prematurely.
    #[error("template header is truncated")]
    TruncatedHeader,

    /// The trailer pointed at something other than a `DESC` table.
    #[error("DESC table tag missing at the indexed position")]
    MissingDescTag,

    /// The size field inside the table disagrees with the trailer.
    #[error("DESC table size mismatch: trailer says {trailer}, header says {header}")]
    TableSizeMismatch { trailer: u64, header: u64 },

    /// The table ended in the middle of an entry.
    #[error("DESC table is truncated")]
    TruncatedTable,

    /// An entry type byte outside the known set.
    #[error("unknown DESC entry type {type_byte}")]
    UnknownEntryType { type_byte: u8 },

    /// Entries must describe at least one byte of the image.
    #[error("DESC entry of type {type_byte} has zero size")]
    ZeroEntrySize { type_byte: u8 },

    /// The terminal image-info summary was missing or not last.
    #[error("DESC table is not terminated by an image-info entry")]
    MissingImageInfo,

    /// The image-info size does not equal the sum of the preceding entries.
    #[error("image size {size} does not match entry total {total}")]
    SizeMismatch { size: u64, total: u64 },

    /// A data-stream chunk had a tag other than `DATA`, `BZIP`, or `DESC`.
    #[error("unknown data-stream chunk tag {tag:?}")]
    UnknownChunkTag { tag: [u8; 4] },

    /// A chunk frame's sizes were inconsistent.
    #[error("data-stream chunk framing is invalid")]
    BadChunkFrame,

    /// The stream produced a different byte count than the Data entries need.
    #[error("data stream produced {produced} bytes, Data entries need {expected}")]
    StreamSizeMismatch { expected: u64, produced: u64 },

    /// The combined Data entries would overflow the image.
    #[error("data regions ({data} bytes) exceed the image size ({image})")]
    DataExceedsImage { data: u64, image: u64 },

    /// Decompression of a chunk failed.
    #[error(transparent)]
    Decode(#[from] CompressError),

    /// Underlying file I/O failed.
    #[error("template I/O error: {0}")]
    Io(#[from] io::Error),

    /// Writing decompressed regions into the image failed.
    #[error(transparent)]
    Image(#[from] crate::image::ImageError),
}

/// The terminal summary record of a DESC table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    /// Total length of the reconstructed image.
    pub size: u64,
    /// Whole-image MD5.
    pub md5: Md5,
    /// rsync64 rolling-sum block length; 0 for legacy tables.
    pub rsync64_block_len: u32,
}

/// A verbatim data region supplied by the template's compressed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlock {
    /// Byte offset within the image.
    pub offset: u64,
    /// Length of the region.
    pub size: u64,
}

/// A component file to be fetched and written at its offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePart {
    /// Byte offset within the image.
    pub offset: u64,
    /// Length of the file.
    pub size: u64,
    /// MD5 of the file contents.
    pub md5: Md5,
    /// rsync64 sum of the initial block; 0 for legacy entries.
    pub rsync64_initial: u64,
}

/// A fully parsed DESC table, split by entry kind.
///
/// Offsets are assigned while parsing as the running sum of the preceding
/// entries' sizes, so the blocks and parts together partition
/// `[0, image_info.size)`.
#[derive(Debug, Clone)]
pub struct DescTable {
    /// The terminal summary entry.
    pub image_info: ImageInfo,
    /// Verbatim data regions, in image order.
    pub data_blocks: Vec<DataBlock>,
    /// Component files, in image order.
    pub files: Vec<FilePart>,
}

impl DescTable {
    /// Total number of bytes covered by Data entries.
    pub fn data_bytes(&self) -> u64 {
        self.data_blocks.iter().map(|b| b.size).sum()
    }

    /// Total number of bytes covered by File entries.
    pub fn file_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}
