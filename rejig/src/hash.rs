//! MD5 digests and the 22-character base64 encoding used by jigdo manifests.
//!
//! Jigdo identifies every component file by its MD5 sum, written in manifests
//! as 22 unpadded base64 symbols. The format predates the URL-safe alphabet
//! standard but happens to match it (`-` for 62, `_` for 63); plain base64
//! (`+`/`/`) also appears in the wild, so both alphabets are accepted.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;

/// Number of base64 symbols in an encoded digest (16 bytes, unpadded).
const BASE64_DIGEST_LEN: usize = 22;

/// Hash window size for file digests: 1024 pages of 4 KiB.
const FILE_WINDOW: usize = 1024 * 4096;

const ENGINE_CONFIG: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_decode_padding_mode(DecodePaddingMode::Indifferent)
    .with_decode_allow_trailing_bits(true);

/// Engine for the jigdo alphabet (`-`/`_`).
const JIGDO_ENGINE: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, ENGINE_CONFIG);

/// Engine for the standard alphabet (`+`/`/`).
const STANDARD_ENGINE: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, ENGINE_CONFIG);

/// Errors from decoding a textual digest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Md5DecodeError {
    /// The encoded form must be exactly 22 symbols.
    #[error("encoded digest has {len} symbols, expected 22")]
    BadLength { len: usize },

    /// A symbol outside both accepted alphabets (or mixed alphabets).
    #[error("encoded digest contains invalid base64 symbols")]
    BadSymbol,

    /// A hex digest string that is not 32 hex digits.
    #[error("hex digest is not 32 hexadecimal digits")]
    BadHex,
}

/// A raw 16-byte MD5 digest.
///
/// Ordering is lexicographic over the raw bytes, which is what keeps the
/// manifest's file list binary-searchable.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Md5(pub [u8; 16]);

impl Md5 {
    /// Sentinel returned by file hashing on I/O failure.
    ///
    /// Callers always compare against a digest taken from a manifest or
    /// template, so the sentinel can never spuriously match.
    pub const SENTINEL: Md5 = Md5([0xff; 16]);

    /// Digest of an in-memory byte slice.
    pub fn of_bytes(bytes: &[u8]) -> Md5 {
        Md5(md5::compute(bytes).0)
    }

    /// Digest of an open file, reading in page-aligned mapped windows.
    ///
    /// Falls back to buffered reads if the file cannot be mapped (pipes,
    /// zero-length files). Returns [`Md5::SENTINEL`] on I/O failure.
    pub fn of_file(file: &File) -> Md5 {
        let len = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(_) => return Md5::SENTINEL,
        };

        let mut ctx = md5::Context::new();
        let mut pos = 0u64;
        while pos < len {
            let window = FILE_WINDOW.min((len - pos) as usize);
            match unsafe { memmap2::MmapOptions::new().offset(pos).len(window).map(file) } {
                Ok(map) => ctx.consume(&map[..]),
                Err(_) => return Self::of_file_buffered(file, pos, len, ctx),
            }
            pos += window as u64;
        }

        Md5(ctx.compute().0)
    }

    /// Digest of the file at `path`, or [`Md5::SENTINEL`] if it cannot be read.
    pub fn of_path(path: &Path) -> Md5 {
        match File::open(path) {
            Ok(file) => Self::of_file(&file),
            Err(_) => Md5::SENTINEL,
        }
    }

    fn of_file_buffered(file: &File, resume_at: u64, len: u64, mut ctx: md5::Context) -> Md5 {
        use std::io::Seek;

        let mut file = file;
        if file.seek(std::io::SeekFrom::Start(resume_at)).is_err() {
            return Md5::SENTINEL;
        }

        let mut remaining = len - resume_at;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            match file.read(&mut buf[..want]) {
                Ok(0) => return Md5::SENTINEL,
                Ok(n) => {
                    ctx.consume(&buf[..n]);
                    remaining -= n as u64;
                }
                Err(_) => return Md5::SENTINEL,
            }
        }

        Md5(ctx.compute().0)
    }

    /// Decode the 22-symbol unpadded base64 form.
    ///
    /// Both the jigdo alphabet and standard base64 are accepted; a string
    /// mixing symbols from the two is rejected.
    pub fn from_base64(encoded: &str) -> Result<Md5, Md5DecodeError> {
        if encoded.len() != BASE64_DIGEST_LEN {
            return Err(Md5DecodeError::BadLength { len: encoded.len() });
        }

        let decoded = JIGDO_ENGINE
            .decode(encoded)
            .or_else(|_| STANDARD_ENGINE.decode(encoded))
            .map_err(|_| Md5DecodeError::BadSymbol)?;

        let mut sum = [0u8; 16];
        sum.copy_from_slice(&decoded);
        Ok(Md5(sum))
    }
}

impl fmt::Display for Md5 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Md5 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Md5({})", self)
    }
}

impl FromStr for Md5 {
    type Err = Md5DecodeError;

    /// Parse the 32-digit lowercase/uppercase hex form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(Md5DecodeError::BadHex);
        }

        let mut sum = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16).ok_or(Md5DecodeError::BadHex)?;
            let lo = (chunk[1] as char).to_digit(16).ok_or(Md5DecodeError::BadHex)?;
            sum[i] = (hi * 16 + lo) as u8;
        }
        Ok(Md5(sum))
    }
}
