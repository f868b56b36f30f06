//! The output image file: sizing, range mapping, and flushing.
//!
//! The image is written in place. Every DESC entry owns a disjoint byte
//! range, so workers and the template decoder each map their own window of
//! the file and never contend. Page alignment of the underlying `mmap` is
//! delegated to `memmap2`, which applies the usual base/offset split; the
//! windows handed out here are exactly the requested ranges.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::hash::Md5;

/// Errors from sizing or mapping the output image.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// The image file could not be opened or created.
    #[error("failed to open image {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    /// Neither reserved allocation nor the sparse fallback succeeded.
    #[error("failed to allocate {size} bytes for image {path}: {source}")]
    Allocate {
        path: PathBuf,
        size: u64,
        source: io::Error,
    },

    /// A range of the image could not be mapped.
    #[error("failed to map image range at offset {offset} ({len} bytes): {source}")]
    Map {
        offset: u64,
        len: u64,
        source: io::Error,
    },

    /// Flushing mapped writes back to disk failed.
    #[error("failed to flush image range to disk: {0}")]
    Flush(#[source] io::Error),
}

/// An open, read-write image file sized to the reconstruction target.
#[derive(Debug)]
pub struct ImageFile {
    file: File,
    path: PathBuf,
    len: u64,
    existing: bool,
}

impl ImageFile {
    /// Open (or create) the image at `path` and ensure it spans `len` bytes.
    ///
    /// Space is reserved up front where the filesystem supports it, with a
    /// sparse one-byte write at `len - 1` as the fallback. If the file was
    /// already at least `len` bytes long, [`ImageFile::existing`] reports
    /// `true` and resume verification becomes worthwhile.
    pub fn create(path: &Path, len: u64) -> Result<ImageFile, ImageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| ImageError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let on_disk = file
            .metadata()
            .map_err(|source| ImageError::Open {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        let existing = on_disk >= len;

        if !existing && len > 0 {
            if file.allocate(len).is_err() {
                // Sparse fallback: force the length with a single byte.
                let sparse = (&file)
                    .seek(SeekFrom::Start(len - 1))
                    .and_then(|_| (&file).write_all(&[0u8]));
                sparse.map_err(|source| ImageError::Allocate {
                    path: path.to_path_buf(),
                    size: len,
                    source,
                })?;
            }
        }

        Ok(ImageFile {
            file,
            path: path.to_path_buf(),
            len,
            existing,
        })
    }

    /// Target length of the image in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the image is zero-length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path the image was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file already covered the target length when opened.
    pub fn existing(&self) -> bool {
        self.existing
    }

    /// Map `len` bytes at `offset` for writing.
    pub fn map_range(&self, offset: u64, len: u64) -> Result<MappedRange, ImageError> {
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(len as usize)
                .map_mut(&self.file)
        }
        .map_err(|source| ImageError::Map {
            offset,
            len,
            source,
        })?;

        Ok(MappedRange { map })
    }

    /// Map `len` bytes at `offset` read-only, for verification.
    pub fn map_range_ro(&self, offset: u64, len: u64) -> Result<Mmap, ImageError> {
        unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(len as usize)
                .map(&self.file)
        }
        .map_err(|source| ImageError::Map {
            offset,
            len,
            source,
        })
    }

    /// Whole-file MD5 of the current on-disk contents.
    pub fn md5(&self) -> Md5 {
        Md5::of_file(&self.file)
    }

    /// Synchronously flush all outstanding writes before close.
    pub fn sync(&self) -> Result<(), ImageError> {
        self.file.sync_data().map_err(ImageError::Flush)
    }
}

/// A writable window over one entry's byte range.
#[derive(Debug)]
pub struct MappedRange {
    map: MmapMut,
}

impl MappedRange {
    /// The mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.map[..]
    }

    /// The mapped bytes, writable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map[..]
    }

    /// Schedule writeback without waiting for it.
    pub fn flush_async(&self) -> Result<(), ImageError> {
        self.map.flush_async().map_err(ImageError::Flush)
    }

    /// Flush and wait until the bytes are durable.
    pub fn flush_sync(&self) -> Result<(), ImageError> {
        self.map.flush().map_err(ImageError::Flush)
    }
}
