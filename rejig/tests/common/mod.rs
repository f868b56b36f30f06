//! Shared fixtures: synthetic template files and a scriptable fetcher.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use rejig::fetch::{FetchError, Fetcher};
use rejig::hash::Md5;

/// Encode a u48 as its 6 little-endian bytes.
pub fn u48(value: u64) -> [u8; 6] {
    let mut bytes = [0u8; 6];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = (value >> (i * 8)) as u8;
    }
    bytes
}

/// A plausible version-1 template header: version line plus comment block.
pub fn header() -> Vec<u8> {
    b"JigsawDownload template 1.1 jigdo-file/1.3.3\r\n\
      See http://example.invalid/ for details about jigdo\r\n\r\n"
        .to_vec()
}

/// A `DATA` (zlib) chunk carrying `data`.
pub fn zlib_chunk(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    let compressed = encoder.finish().unwrap();

    let mut chunk = b"DATA".to_vec();
    chunk.extend_from_slice(&u48(16 + compressed.len() as u64));
    chunk.extend_from_slice(&u48(data.len() as u64));
    chunk.extend_from_slice(&compressed);
    chunk
}

/// A `BZIP` chunk carrying `data`.
pub fn bzip_chunk(data: &[u8]) -> Vec<u8> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(data).unwrap();
    let compressed = encoder.finish().unwrap();

    let mut chunk = b"BZIP".to_vec();
    chunk.extend_from_slice(&u48(16 + compressed.len() as u64));
    chunk.extend_from_slice(&u48(data.len() as u64));
    chunk.extend_from_slice(&compressed);
    chunk
}

/// A type-2 Data entry.
pub fn entry_data(size: u64) -> Vec<u8> {
    let mut entry = vec![2u8];
    entry.extend_from_slice(&u48(size));
    entry
}

/// A type-6 File entry.
pub fn entry_file(size: u64, md5: Md5, rsync64: u64) -> Vec<u8> {
    let mut entry = vec![6u8];
    entry.extend_from_slice(&u48(size));
    entry.extend_from_slice(&rsync64.to_le_bytes());
    entry.extend_from_slice(&md5.0);
    entry
}

/// A type-5 ImageInfo entry.
pub fn entry_image_info(size: u64, md5: Md5, block_len: u32) -> Vec<u8> {
    let mut entry = vec![5u8];
    entry.extend_from_slice(&u48(size));
    entry.extend_from_slice(&md5.0);
    entry.extend_from_slice(&block_len.to_le_bytes());
    entry
}

/// Frame entries as a DESC table (tag, size, entries, trailing size).
pub fn desc_table(entries: &[Vec<u8>]) -> Vec<u8> {
    let body_len: usize = entries.iter().map(|e| e.len()).sum();
    let table_size = (10 + body_len + 6) as u64;

    let mut table = b"DESC".to_vec();
    table.extend_from_slice(&u48(table_size));
    for entry in entries {
        table.extend_from_slice(entry);
    }
    table.extend_from_slice(&u48(table_size));
    table
}

/// Write a complete template file and return its path.
pub fn write_template(dir: &Path, chunks: &[Vec<u8>], entries: &[Vec<u8>]) -> PathBuf {
    let mut bytes = header();
    for chunk in chunks {
        bytes.extend_from_slice(chunk);
    }
    bytes.extend_from_slice(&desc_table(entries));

    let path = dir.join("image.template");
    std::fs::write(&path, bytes).unwrap();
    path
}

/// A fetcher that serves canned responses by exact URL and records every
/// request it sees.
pub struct StubFetcher {
    responses: HashMap<String, Vec<u8>>,
    calls: Mutex<Vec<String>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        StubFetcher {
            responses: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_response(mut self, url: &str, body: &[u8]) -> Self {
        self.responses.insert(url.to_string(), body.to_vec());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Fetcher for StubFetcher {
    fn fetch(
        &self,
        url: &str,
        dest: &mut [u8],
        on_progress: &mut dyn FnMut(u64),
    ) -> Result<u64, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());

        let body = self.responses.get(url).ok_or(FetchError::Status {
            url: url.to_string(),
            status: 404,
        })?;

        let n = body.len().min(dest.len());
        dest[..n].copy_from_slice(&body[..n]);
        on_progress(n as u64);
        Ok(n as u64)
    }
}
