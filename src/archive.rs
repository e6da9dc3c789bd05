//! Streaming ZIP part access.
//!
//! A minimal ZIP reader tailored to office packages: it reads the central
//! directory once, locates parts by name and exposes streaming DEFLATE
//! decompression with CRC-32 verification. Nothing is extracted to memory
//! unless a caller asks for a whole part.

use crate::error::{Result, SheetError};
use crc32fast::Hasher as Crc32;
use flate2::read::DeflateDecoder;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Take};
use std::path::{Path, PathBuf};

/// ZIP local file header signature
const LOCAL_FILE_HEADER_SIGNATURE: u32 = 0x04034b50;

/// ZIP central directory signature
const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x02014b50;

/// ZIP end of central directory signature
const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x06054b50;

/// Entry in the ZIP central directory
#[derive(Debug, Clone)]
pub struct PartEntry {
    pub name: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub compression_method: u16,
    pub crc32: u32,
    pub offset: u64,
}

/// ZIP archive with part lookup and streaming decompression
pub struct ZipArchive {
    path: PathBuf,
    file: BufReader<File>,
    entries: Vec<PartEntry>,
}

impl ZipArchive {
    /// Open a ZIP file and read its central directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = BufReader::new(File::open(&path)?);
        let entries = Self::read_central_directory(&mut file)?;
        Ok(ZipArchive {
            path,
            file,
            entries,
        })
    }

    /// Open a second, independent handle on the same archive.
    ///
    /// The shared-string loader and the worksheet producer each need their
    /// own decompressor position, so they must never share a handle.
    pub fn reopen(&self) -> Result<Self> {
        let file = BufReader::new(File::open(&self.path)?);
        Ok(ZipArchive {
            path: self.path.clone(),
            file,
            entries: self.entries.clone(),
        })
    }

    /// Find a part by name, tolerating a single leading `/` on either side
    pub fn locate(&self, name: &str) -> Option<&PartEntry> {
        let name = name.strip_prefix('/').unwrap_or(name);
        self.entries
            .iter()
            .find(|e| e.name.strip_prefix('/').unwrap_or(&e.name) == name)
    }

    /// Like [`locate`](Self::locate) but returning an owned entry or a
    /// [`SheetError::MissingPart`]
    pub fn require(&self, name: &str) -> Result<PartEntry> {
        self.locate(name)
            .cloned()
            .ok_or_else(|| SheetError::MissingPart(name.to_string()))
    }

    /// Streaming decompression iterator over one part
    pub fn part_reader(&mut self, entry: &PartEntry) -> Result<PartReader<'_>> {
        // The local header repeats name and extra lengths; the extra field
        // can differ from the central directory copy, so re-read them here.
        self.file.seek(SeekFrom::Start(entry.offset))?;
        let signature = read_u32_le(&mut self.file)?;
        if signature != LOCAL_FILE_HEADER_SIGNATURE {
            return Err(SheetError::BadArchive(format!(
                "invalid local file header signature 0x{:08x} for {}",
                signature, entry.name
            )));
        }
        // version, flags, compression method, mod time/date, CRC-32, sizes
        self.file.seek(SeekFrom::Current(22))?;
        let filename_len = read_u16_le(&mut self.file)? as i64;
        let extra_len = read_u16_le(&mut self.file)? as i64;
        self.file.seek(SeekFrom::Current(filename_len + extra_len))?;

        let limited = (&mut self.file).take(entry.compressed_size);
        let inner = match entry.compression_method {
            8 => Decoder::Deflate(DeflateDecoder::new(limited)),
            0 => Decoder::Stored(limited),
            other => {
                return Err(SheetError::BadArchive(format!(
                    "unsupported compression method {} for {}",
                    other, entry.name
                )))
            }
        };
        Ok(PartReader {
            inner,
            hasher: Crc32::new(),
            stored_crc32: entry.crc32,
            status: PartStatus::More,
        })
    }

    /// Read a whole part into memory, verifying its CRC-32.
    /// Intended for the small metadata parts.
    pub fn read_part(&mut self, entry: &PartEntry) -> Result<Vec<u8>> {
        let expected = entry.uncompressed_size as usize;
        let name = entry.name.clone();
        let mut reader = self.part_reader(entry)?;
        let mut data = Vec::with_capacity(expected);
        let mut chunk = [0u8; 16 * 1024];
        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..n]);
        }
        if !reader.crc_matches() {
            return Err(SheetError::BadArchive(format!(
                "CRC-32 mismatch in {}: stored 0x{:08x}, computed 0x{:08x}",
                name,
                reader.stored_crc32(),
                reader.computed_crc32()
            )));
        }
        Ok(data)
    }

    /// Read the central directory from the ZIP file
    fn read_central_directory(file: &mut BufReader<File>) -> Result<Vec<PartEntry>> {
        let eocd_offset = Self::find_eocd(file)?;
        file.seek(SeekFrom::Start(eocd_offset))?;

        let signature = read_u32_le(file)?;
        if signature != END_OF_CENTRAL_DIRECTORY_SIGNATURE {
            return Err(SheetError::BadArchive(format!(
                "invalid end of central directory signature: 0x{:08x}",
                signature
            )));
        }

        // disk number fields
        file.seek(SeekFrom::Current(4))?;
        let _entries_on_disk = read_u16_le(file)?;
        let total_entries = read_u16_le(file)? as usize;
        let _cd_size = read_u32_le(file)?;
        let cd_offset = read_u32_le(file)? as u64;

        file.seek(SeekFrom::Start(cd_offset))?;

        let mut entries = Vec::with_capacity(total_entries);
        for _ in 0..total_entries {
            let signature = read_u32_le(file)?;
            if signature != CENTRAL_DIRECTORY_SIGNATURE {
                break;
            }

            // version made by, version needed, flags
            file.seek(SeekFrom::Current(6))?;
            let compression_method = read_u16_le(file)?;
            // modification time and date
            file.seek(SeekFrom::Current(4))?;
            let crc32 = read_u32_le(file)?;
            let compressed_size = read_u32_le(file)? as u64;
            let uncompressed_size = read_u32_le(file)? as u64;
            let filename_len = read_u16_le(file)? as usize;
            let extra_len = read_u16_le(file)? as usize;
            let comment_len = read_u16_le(file)? as usize;
            // disk number, internal attributes, external attributes
            file.seek(SeekFrom::Current(8))?;
            let offset = read_u32_le(file)? as u64;

            let mut filename_buf = vec![0u8; filename_len];
            file.read_exact(&mut filename_buf)?;
            let name = String::from_utf8_lossy(&filename_buf).to_string();

            file.seek(SeekFrom::Current((extra_len + comment_len) as i64))?;

            entries.push(PartEntry {
                name,
                compressed_size,
                uncompressed_size,
                compression_method,
                crc32,
                offset,
            });
        }

        Ok(entries)
    }

    /// Locate the end-of-central-directory record.
    ///
    /// The record sits at the very end of the archive, preceded at most
    /// by a 64 KiB comment, so only that tail needs to be searched.
    fn find_eocd(file: &mut BufReader<File>) -> Result<u64> {
        const EOCD_MIN_SIZE: u64 = 22;
        const MAX_COMMENT: u64 = u16::MAX as u64;

        let len = file.seek(SeekFrom::End(0))?;
        if len < EOCD_MIN_SIZE {
            return Err(SheetError::BadArchive(
                "file too short to hold a ZIP central directory".to_string(),
            ));
        }
        let tail_start = len.saturating_sub(EOCD_MIN_SIZE + MAX_COMMENT);
        file.seek(SeekFrom::Start(tail_start))?;
        let mut tail = Vec::with_capacity((len - tail_start) as usize);
        file.read_to_end(&mut tail)?;

        let signature = END_OF_CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes();
        tail.windows(signature.len())
            .rposition(|window| window == signature)
            .map(|pos| tail_start + pos as u64)
            .ok_or_else(|| {
                SheetError::BadArchive("end of central directory not found".to_string())
            })
    }
}

/// Terminal status of a [`PartReader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    /// More bytes may follow
    More,
    /// End of stream reached cleanly
    Done,
    /// The decompressor reported an error
    Error,
}

enum Decoder<'a> {
    Deflate(DeflateDecoder<Take<&'a mut BufReader<File>>>),
    Stored(Take<&'a mut BufReader<File>>),
}

/// Streaming decompression iterator for a single archive part.
///
/// Yields bytes in order; `read` returns zero at end of stream. Once the
/// status is [`PartStatus::Done`], the stored and computed CRC-32 are
/// available for an equality check.
pub struct PartReader<'a> {
    inner: Decoder<'a>,
    hasher: Crc32,
    stored_crc32: u32,
    status: PartStatus,
}

impl PartReader<'_> {
    /// Read decompressed bytes into `buf`, returning the count written,
    /// zero at end of stream
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.status != PartStatus::More {
            return Ok(0);
        }
        let result = match &mut self.inner {
            Decoder::Deflate(d) => d.read(buf),
            Decoder::Stored(s) => s.read(buf),
        };
        match result {
            Ok(0) => {
                self.status = PartStatus::Done;
                Ok(0)
            }
            Ok(n) => {
                self.hasher.update(&buf[..n]);
                Ok(n)
            }
            Err(e) => {
                self.status = PartStatus::Error;
                Err(SheetError::Decompression(e.to_string()))
            }
        }
    }

    /// Current stream status
    pub fn status(&self) -> PartStatus {
        self.status
    }

    /// CRC-32 recorded in the archive for this part
    pub fn stored_crc32(&self) -> u32 {
        self.stored_crc32
    }

    /// CRC-32 of the bytes decompressed so far
    pub fn computed_crc32(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Whether the computed CRC-32 equals the stored one
    pub fn crc_matches(&self) -> bool {
        self.computed_crc32() == self.stored_crc32
    }
}

fn read_u16_le(file: &mut BufReader<File>) -> Result<u16> {
    let mut buf = [0u8; 2];
    file.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32_le(file: &mut BufReader<File>) -> Result<u32> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
