//! One-shot decompression for the template data stream, plus transparent
//! gunzip of textual manifests.
//!
//! Template data chunks are zlib or bzip2 streams whose decompressed size is
//! known up front, so everything here decompresses into caller-sized buffers
//! with no incremental state. Gzip only appears as a whole-file wrapper
//! around `.jigdo` manifests and is handled by [`open_plain`].

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::{Decompress as ZlibDecompress, FlushDecompress, Status as ZlibStatus};

/// Compression codecs used by template data chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// zlib-framed deflate (`DATA` chunks).
    Zlib,
    /// bzip2 (`BZIP` chunks).
    Bzip2,
}

impl Codec {
    fn name(self) -> &'static str {
        match self {
            Codec::Zlib => "zlib",
            Codec::Bzip2 => "bzip2",
        }
    }
}

/// Errors from decompression or the gzip file transform.
#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    /// The codec library rejected the stream.
    #[error("{codec} stream is corrupt: {reason}")]
    Corrupt { codec: &'static str, reason: String },

    /// The stream was truncated or did not fill the expected output.
    #[error("{codec} stream produced {written} bytes, expected {expected}")]
    ShortOutput {
        codec: &'static str,
        expected: usize,
        written: usize,
    },

    /// I/O failure while reading or rewriting a file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Decompress `input` into `output` in one shot.
///
/// `output` must be sized to exactly the expected decompressed length; a
/// stream that overflows it or falls short of filling it is an error.
/// Returns the number of bytes written (always `output.len()` on success).
pub fn decompress(codec: Codec, input: &[u8], output: &mut [u8]) -> Result<usize, CompressError> {
    let written = match codec {
        Codec::Zlib => inflate_zlib(input, output)?,
        Codec::Bzip2 => inflate_bzip2(input, output)?,
    };

    if written != output.len() {
        return Err(CompressError::ShortOutput {
            codec: codec.name(),
            expected: output.len(),
            written,
        });
    }

    Ok(written)
}

fn inflate_zlib(input: &[u8], output: &mut [u8]) -> Result<usize, CompressError> {
    let mut stream = ZlibDecompress::new(true);

    let status = stream
        .decompress(input, output, FlushDecompress::Finish)
        .map_err(|e| CompressError::Corrupt {
            codec: "zlib",
            reason: e.to_string(),
        })?;

    if status != ZlibStatus::StreamEnd {
        return Err(CompressError::Corrupt {
            codec: "zlib",
            reason: "stream did not end at the expected length".to_string(),
        });
    }

    Ok(stream.total_out() as usize)
}

fn inflate_bzip2(input: &[u8], output: &mut [u8]) -> Result<usize, CompressError> {
    let mut stream = bzip2::Decompress::new(false);

    let status = stream
        .decompress(input, output)
        .map_err(|e| CompressError::Corrupt {
            codec: "bzip2",
            reason: format!("{:?}", e),
        })?;

    if status != bzip2::Status::StreamEnd {
        return Err(CompressError::Corrupt {
            codec: "bzip2",
            reason: "stream did not end at the expected length".to_string(),
        });
    }

    Ok(stream.total_out() as usize)
}

/// Open a file as plain text, inflating it first if it is gzip-framed.
///
/// A gzipped file is decompressed into an anonymous scratch file that is
/// deleted when the handle closes; a plain file is returned as-is. Used for
/// `.jigdo` manifests, which are commonly distributed gzipped. Templates
/// never go through here: their inner streams are chunk-framed.
pub fn open_plain(path: &Path) -> Result<File, CompressError> {
    let mut file = File::open(path)?;

    let mut magic = [0u8; 2];
    let got = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    if got < 2 || magic != [0x1f, 0x8b] {
        return Ok(file);
    }

    let mut decoder = flate2::read::GzDecoder::new(io::BufReader::new(file));
    let mut scratch = tempfile::tempfile()?;
    io::copy(&mut decoder, &mut scratch)?;
    scratch.seek(SeekFrom::Start(0))?;

    Ok(scratch)
}
