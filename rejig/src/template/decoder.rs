//! Template decoding: header validation, DESC table parsing, and extraction
//! of the compressed data stream into the image.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};

use tracing::{debug, info};

use crate::compress::{self, Codec};
use crate::image::ImageFile;

use super::reader::{u48_from_le, Reader};
use super::{
    DataBlock, DescTable, FilePart, ImageInfo, TemplateError, ENTRY_DATA, ENTRY_FILE,
    ENTRY_FILE_LEGACY, ENTRY_IMAGE_INFO, ENTRY_IMAGE_INFO_LEGACY,
};

/// Exact prefix of the version line. Anything else, including a 2.x
/// template, is unsupported.
const HEADER_V1: &[u8; 26] = b"JigsawDownload template 1.";

/// Tag + two u48 size fields preceding each compressed chunk's payload.
const CHUNK_FRAME_LEN: u64 = 16;

/// `DESC` tag plus the table's own leading size field.
const TABLE_HEADER_LEN: u64 = 10;

/// Trailing copy of the table size at the end of the file.
const TABLE_TRAILER_LEN: u64 = 6;

/// Parse the DESC table from the trailer of an open template file.
///
/// The last 6 bytes of the file give the table's total size; the table is
/// validated against its own leading tag and size copy, then consumed entry
/// by entry. Offsets are assigned as the running sum of entry sizes, and
/// the terminal image-info entry must account for every preceding byte.
pub fn read_desc_table(file: &mut File) -> Result<DescTable, TemplateError> {
    let file_len = file.seek(SeekFrom::End(0))?;
    if file_len < TABLE_HEADER_LEN + TABLE_TRAILER_LEN {
        return Err(TemplateError::TruncatedTable);
    }

    file.seek(SeekFrom::End(-(TABLE_TRAILER_LEN as i64)))?;
    let mut trailer = [0u8; 6];
    file.read_exact(&mut trailer)?;
    let table_size = u48_from_le(&trailer);

    if table_size < TABLE_HEADER_LEN + TABLE_TRAILER_LEN || table_size > file_len {
        return Err(TemplateError::TruncatedTable);
    }

    file.seek(SeekFrom::Start(file_len - table_size))?;
    let mut table = vec![0u8; table_size as usize];
    file.read_exact(&mut table)?;

    if &table[..4] != b"DESC" {
        return Err(TemplateError::MissingDescTag);
    }

    let header_size = u48_from_le(&table[4..10]);
    if header_size != table_size {
        return Err(TemplateError::TableSizeMismatch {
            trailer: table_size,
            header: header_size,
        });
    }

    parse_entries(&table[TABLE_HEADER_LEN as usize..(table_size - TABLE_TRAILER_LEN) as usize])
}

fn parse_entries(region: &[u8]) -> Result<DescTable, TemplateError> {
    let mut reader = Reader::new(region);
    let mut data_blocks = Vec::new();
    let mut files = Vec::new();
    let mut image_info: Option<ImageInfo> = None;
    let mut offset = 0u64;

    while reader.remaining() > 0 {
        // The summary entry terminates the table; nothing may follow it.
        if image_info.is_some() {
            return Err(TemplateError::MissingImageInfo);
        }

        let type_byte = reader.u8()?;
        let entry_size = reader.u48_le()?;
        if entry_size == 0 {
            return Err(TemplateError::ZeroEntrySize { type_byte });
        }

        match type_byte {
            ENTRY_IMAGE_INFO_LEGACY | ENTRY_IMAGE_INFO => {
                let md5 = reader.md5()?;
                let rsync64_block_len = if type_byte == ENTRY_IMAGE_INFO {
                    reader.u32_le()?
                } else {
                    0
                };

                // The image length must equal the sum of the preceding
                // entries, which is exactly the running offset. The offset
                // is left as that sum and never advanced by the image size.
                if offset != entry_size {
                    return Err(TemplateError::SizeMismatch {
                        size: entry_size,
                        total: offset,
                    });
                }

                image_info = Some(ImageInfo {
                    size: entry_size,
                    md5,
                    rsync64_block_len,
                });
            }

            ENTRY_DATA => {
                data_blocks.push(DataBlock {
                    offset,
                    size: entry_size,
                });
                offset += entry_size;
            }

            ENTRY_FILE_LEGACY | ENTRY_FILE => {
                let rsync64_initial = if type_byte == ENTRY_FILE {
                    reader.u64_le()?
                } else {
                    0
                };
                let md5 = reader.md5()?;

                files.push(FilePart {
                    offset,
                    size: entry_size,
                    md5,
                    rsync64_initial,
                });
                offset += entry_size;
            }

            _ => return Err(TemplateError::UnknownEntryType { type_byte }),
        }
    }

    let image_info = image_info.ok_or(TemplateError::MissingImageInfo)?;

    info!(
        data_blocks = data_blocks.len(),
        files = files.len(),
        image_size = image_info.size,
        "parsed template DESC table"
    );

    Ok(DescTable {
        image_info,
        data_blocks,
        files,
    })
}

/// Decode the compressed data stream and scatter-write every verbatim
/// region into its image offset.
///
/// Returns the number of image bytes written. The stream must produce
/// exactly the total of the table's Data entry sizes.
pub fn write_data_blocks(
    file: &mut File,
    image: &ImageFile,
    table: &DescTable,
) -> Result<u64, TemplateError> {
    file.seek(SeekFrom::Start(0))?;
    let mut stream = BufReader::new(file);

    validate_header(&mut stream)?;

    let total = table.data_bytes();
    if total > table.image_info.size {
        return Err(TemplateError::DataExceedsImage {
            data: total,
            image: table.image_info.size,
        });
    }

    let decompressed = inflate_stream(&mut stream, total)?;

    // Copy each region through a shared writable window at its offset.
    let mut copied = 0usize;
    for block in &table.data_blocks {
        let mut range = image.map_range(block.offset, block.size)?;
        range
            .as_mut_slice()
            .copy_from_slice(&decompressed[copied..copied + block.size as usize]);
        range.flush_async()?;
        copied += block.size as usize;
    }

    info!(
        bytes = total,
        regions = table.data_blocks.len(),
        "wrote verbatim data regions"
    );

    Ok(total)
}

/// Validate the ASCII header and leave the stream at the first chunk.
///
/// The version line is terminated by one CRLF and the comment block by two
/// more; everything between the version prefix and the third CRLF is
/// ignored.
fn validate_header<R: BufRead>(stream: &mut R) -> Result<(), TemplateError> {
    let mut prefix = [0u8; HEADER_V1.len()];
    stream.read_exact(&mut prefix).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TemplateError::TruncatedHeader
        } else {
            TemplateError::Io(e)
        }
    })?;

    if &prefix != HEADER_V1 {
        return Err(TemplateError::BadHeader);
    }

    for _ in 0..3 {
        skip_past_crlf(stream)?;
    }

    Ok(())
}

/// Consume bytes up to and including the next CRLF pair.
fn skip_past_crlf<R: BufRead>(stream: &mut R) -> Result<(), TemplateError> {
    let mut prev = 0u8;
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte)? {
            0 => return Err(TemplateError::TruncatedHeader),
            _ => {
                if byte[0] == b'\n' && prev == b'\r' {
                    return Ok(());
                }
                prev = byte[0];
            }
        }
    }
}

/// Walk `DATA`/`BZIP` chunks until the `DESC` tag, decompressing each into
/// a single buffer sized to the Data entries' total.
fn inflate_stream<R: BufRead>(stream: &mut R, total: u64) -> Result<Vec<u8>, TemplateError> {
    let mut buf = vec![0u8; total as usize];
    let mut done = 0u64;
    let mut payload = Vec::new();

    loop {
        let mut tag = [0u8; 4];
        stream.read_exact(&mut tag).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TemplateError::BadChunkFrame
            } else {
                TemplateError::Io(e)
            }
        })?;

        let codec = match &tag {
            b"DATA" => Codec::Zlib,
            b"BZIP" => Codec::Bzip2,
            b"DESC" => break,
            _ => return Err(TemplateError::UnknownChunkTag { tag }),
        };

        let framed = read_u48(stream)?;
        let expanded = read_u48(stream)?;
        if framed < CHUNK_FRAME_LEN || expanded == 0 {
            return Err(TemplateError::BadChunkFrame);
        }

        if done + expanded > total {
            return Err(TemplateError::StreamSizeMismatch {
                expected: total,
                produced: done + expanded,
            });
        }

        let payload_len = (framed - CHUNK_FRAME_LEN) as usize;
        payload.resize(payload_len, 0);
        stream.read_exact(&mut payload)?;

        let slot = &mut buf[done as usize..(done + expanded) as usize];
        compress::decompress(codec, &payload, slot)?;
        debug!(codec = ?codec, compressed = payload_len, expanded, "inflated data chunk");

        done += expanded;
    }

    if done != total {
        return Err(TemplateError::StreamSizeMismatch {
            expected: total,
            produced: done,
        });
    }

    Ok(buf)
}

fn read_u48<R: Read>(stream: &mut R) -> Result<u64, TemplateError> {
    let mut bytes = [0u8; 6];
    stream.read_exact(&mut bytes).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TemplateError::BadChunkFrame
        } else {
            TemplateError::Io(e)
        }
    })?;
    Ok(u48_from_le(&bytes))
}

#[cfg(test)]
mod tests {
    use super::super::reader::u48_to_le;
    use super::*;
    use crate::hash::Md5;
    use std::io::Write;
    use tempfile::TempDir;

    fn entry_data(size: u64) -> Vec<u8> {
        let mut out = vec![ENTRY_DATA];
        out.extend_from_slice(&u48_to_le(size));
        out
    }

    fn entry_file(size: u64, md5: Md5, rsync64: u64) -> Vec<u8> {
        let mut out = vec![ENTRY_FILE];
        out.extend_from_slice(&u48_to_le(size));
        out.extend_from_slice(&rsync64.to_le_bytes());
        out.extend_from_slice(&md5.0);
        out
    }

    fn entry_file_legacy(size: u64, md5: Md5) -> Vec<u8> {
        let mut out = vec![ENTRY_FILE_LEGACY];
        out.extend_from_slice(&u48_to_le(size));
        out.extend_from_slice(&md5.0);
        out
    }

    fn entry_image_info(size: u64, md5: Md5, block_len: u32) -> Vec<u8> {
        let mut out = vec![ENTRY_IMAGE_INFO];
        out.extend_from_slice(&u48_to_le(size));
        out.extend_from_slice(&md5.0);
        out.extend_from_slice(&block_len.to_le_bytes());
        out
    }

    fn entry_image_info_legacy(size: u64, md5: Md5) -> Vec<u8> {
        let mut out = vec![ENTRY_IMAGE_INFO_LEGACY];
        out.extend_from_slice(&u48_to_le(size));
        out.extend_from_slice(&md5.0);
        out
    }

    /// Wrap raw entries in a DESC table frame and append it to `prefix`.
    fn template_with_table(prefix: &[u8], entries: &[u8]) -> Vec<u8> {
        let table_size = (10 + entries.len() + 6) as u64;
        let mut out = prefix.to_vec();
        out.extend_from_slice(b"DESC");
        out.extend_from_slice(&u48_to_le(table_size));
        out.extend_from_slice(entries);
        out.extend_from_slice(&u48_to_le(table_size));
        out
    }

    fn write_template(bytes: &[u8]) -> (TempDir, File) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("image.template");
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        let file = File::options().read(true).open(&path).unwrap();
        (temp, file)
    }

    #[test]
    fn test_read_desc_table_minimal() {
        let mut entries = entry_data(5);
        entries.extend(entry_image_info(5, Md5::of_bytes(b"hello"), 0));
        let bytes = template_with_table(b"", &entries);

        let (_temp, mut file) = write_template(&bytes);
        let table = read_desc_table(&mut file).unwrap();

        assert_eq!(table.image_info.size, 5);
        assert_eq!(table.data_blocks, vec![DataBlock { offset: 0, size: 5 }]);
        assert!(table.files.is_empty());
    }

    #[test]
    fn test_read_desc_table_offsets_are_prefix_sums() {
        let md5a = Md5::of_bytes(b"a");
        let md5b = Md5::of_bytes(b"b");

        let mut entries = entry_data(100);
        entries.extend(entry_file(40, md5a, 7));
        entries.extend(entry_data(10));
        entries.extend(entry_file(50, md5b, 9));
        entries.extend(entry_image_info(200, Md5::of_bytes(b"image"), 1024));
        let bytes = template_with_table(b"", &entries);

        let (_temp, mut file) = write_template(&bytes);
        let table = read_desc_table(&mut file).unwrap();

        assert_eq!(
            table.data_blocks,
            vec![
                DataBlock { offset: 0, size: 100 },
                DataBlock {
                    offset: 140,
                    size: 10
                },
            ]
        );
        assert_eq!(table.files[0].offset, 100);
        assert_eq!(table.files[1].offset, 150);
        assert_eq!(table.files[1].rsync64_initial, 9);
        assert_eq!(table.image_info.rsync64_block_len, 1024);

        // The entry ranges partition [0, size).
        let mut ranges: Vec<(u64, u64)> = table
            .data_blocks
            .iter()
            .map(|b| (b.offset, b.size))
            .chain(table.files.iter().map(|f| (f.offset, f.size)))
            .collect();
        ranges.sort();
        let mut expected_start = 0;
        for (offset, size) in ranges {
            assert_eq!(offset, expected_start);
            expected_start = offset + size;
        }
        assert_eq!(expected_start, table.image_info.size);
    }

    #[test]
    fn test_read_desc_table_mixed_legacy_entries() {
        let md5 = Md5::of_bytes(b"legacy");

        // Modern image info with a legacy file entry.
        let mut entries = entry_file_legacy(30, md5);
        entries.extend(entry_image_info(30, Md5::of_bytes(b"img"), 64));
        let bytes = template_with_table(b"", &entries);
        let (_temp, mut file) = write_template(&bytes);
        let table = read_desc_table(&mut file).unwrap();
        assert_eq!(table.files[0].rsync64_initial, 0);
        assert_eq!(table.image_info.rsync64_block_len, 64);

        // Legacy image info with a modern file entry.
        let mut entries = entry_file(30, md5, 11);
        entries.extend(entry_image_info_legacy(30, Md5::of_bytes(b"img")));
        let bytes = template_with_table(b"", &entries);
        let (_temp, mut file) = write_template(&bytes);
        let table = read_desc_table(&mut file).unwrap();
        assert_eq!(table.files[0].rsync64_initial, 11);
        assert_eq!(table.image_info.rsync64_block_len, 0);
    }

    #[test]
    fn test_read_desc_table_rejects_unknown_type() {
        let mut entries = vec![4u8];
        entries.extend_from_slice(&u48_to_le(10));
        entries.extend(entry_image_info(10, Md5::of_bytes(b"x"), 0));
        let bytes = template_with_table(b"", &entries);

        let (_temp, mut file) = write_template(&bytes);
        assert!(matches!(
            read_desc_table(&mut file),
            Err(TemplateError::UnknownEntryType { type_byte: 4 })
        ));
    }

    #[test]
    fn test_read_desc_table_rejects_zero_size() {
        let mut entries = entry_data(0);
        entries.extend(entry_image_info(0, Md5::of_bytes(b"x"), 0));
        let bytes = template_with_table(b"", &entries);

        let (_temp, mut file) = write_template(&bytes);
        assert!(matches!(
            read_desc_table(&mut file),
            Err(TemplateError::ZeroEntrySize { type_byte: 2 })
        ));
    }

    #[test]
    fn test_read_desc_table_rejects_size_mismatch() {
        // Image info claims 6 bytes but entries only cover 5.
        let mut entries = entry_data(5);
        entries.extend(entry_image_info(6, Md5::of_bytes(b"x"), 0));
        let bytes = template_with_table(b"", &entries);

        let (_temp, mut file) = write_template(&bytes);
        assert!(matches!(
            read_desc_table(&mut file),
            Err(TemplateError::SizeMismatch { size: 6, total: 5 })
        ));
    }

    #[test]
    fn test_read_desc_table_rejects_missing_image_info() {
        let entries = entry_data(5);
        let bytes = template_with_table(b"", &entries);

        let (_temp, mut file) = write_template(&bytes);
        assert!(matches!(
            read_desc_table(&mut file),
            Err(TemplateError::MissingImageInfo)
        ));
    }

    #[test]
    fn test_read_desc_table_rejects_entries_after_image_info() {
        let mut entries = entry_data(5);
        entries.extend(entry_image_info(5, Md5::of_bytes(b"x"), 0));
        entries.extend(entry_data(3));
        let bytes = template_with_table(b"", &entries);

        let (_temp, mut file) = write_template(&bytes);
        assert!(matches!(
            read_desc_table(&mut file),
            Err(TemplateError::MissingImageInfo)
        ));
    }

    #[test]
    fn test_read_desc_table_rejects_bad_tag() {
        let mut bytes = b"XESC".to_vec();
        bytes.extend_from_slice(&u48_to_le(16));
        bytes.extend_from_slice(&u48_to_le(16));

        let (_temp, mut file) = write_template(&bytes);
        assert!(matches!(
            read_desc_table(&mut file),
            Err(TemplateError::MissingDescTag)
        ));
    }

    #[test]
    fn test_read_desc_table_rejects_trailer_disagreement() {
        let mut bytes = b"DESC".to_vec();
        bytes.extend_from_slice(&u48_to_le(99));
        bytes.extend_from_slice(&u48_to_le(16));

        let (_temp, mut file) = write_template(&bytes);
        assert!(matches!(
            read_desc_table(&mut file),
            Err(TemplateError::TableSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_header_accepts_v1() {
        let header = b"JigsawDownload template 1.3 jigdo-file/1.3.3\r\nSee http://example.invalid/ for details\r\n\r\n";
        let mut stream = std::io::Cursor::new(&header[..]);
        validate_header(&mut stream).unwrap();
        assert_eq!(stream.position() as usize, header.len());
    }

    #[test]
    fn test_validate_header_rejects_v2() {
        let header = b"JigsawDownload template 2.0 jigdo-file/2.0.0\r\n\r\n\r\n";
        let mut stream = std::io::Cursor::new(&header[..]);
        assert!(matches!(
            validate_header(&mut stream),
            Err(TemplateError::BadHeader)
        ));
    }

    #[test]
    fn test_validate_header_rejects_garbage() {
        let mut stream = std::io::Cursor::new(&b"not a template at all, really"[..]);
        assert!(matches!(
            validate_header(&mut stream),
            Err(TemplateError::BadHeader)
        ));
    }

    #[test]
    fn test_validate_header_rejects_truncation() {
        let mut stream = std::io::Cursor::new(&b"JigsawDownload template 1.3\r\n"[..]);
        assert!(matches!(
            validate_header(&mut stream),
            Err(TemplateError::TruncatedHeader)
        ));
    }
}
