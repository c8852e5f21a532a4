use crc32fast::Hasher as Crc32;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{self, Cursor, Read, Write};
use zip::read::ZipArchive;

/// Result alias for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors surfaced by the in-memory APK container.
#[derive(Debug)]
pub enum ContainerError {
    Io(io::Error),
    Zip(zip::result::ZipError),
    Format(String),
    NotFound(String),
}

impl std::fmt::Display for ContainerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerError::Io(err) => write!(f, "I/O error: {err}"),
            ContainerError::Zip(err) => write!(f, "archive error: {err}"),
            ContainerError::Format(msg) => write!(f, "malformed archive: {msg}"),
            ContainerError::NotFound(name) => write!(f, "no such entry: {name}"),
        }
    }
}

impl std::error::Error for ContainerError {}

impl From<io::Error> for ContainerError {
    fn from(value: io::Error) -> Self {
        ContainerError::Io(value)
    }
}

impl From<zip::result::ZipError> for ContainerError {
    fn from(value: zip::result::ZipError) -> Self {
        ContainerError::Zip(value)
    }
}

/// Compression method of an entry. Anything other than stored or deflated
/// is rejected at open time — reconstructing such archives byte-correctly
/// is not supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryCompression {
    Stored,
    Deflated,
}

impl EntryCompression {
    fn method_id(&self) -> u16 {
        match self {
            EntryCompression::Stored => 0,
            EntryCompression::Deflated => 8,
        }
    }
}

/// A single file entry. `raw` keeps the original compressed block, and the
/// local-header fields (version, flags, timestamp, extra field) are carried
/// verbatim, so an untouched entry's local record round-trips byte-identical
/// without being re-encoded.
#[derive(Clone, Debug)]
pub struct ApkEntry {
    pub name: String,
    pub data: Vec<u8>,
    raw: Vec<u8>,
    pub compression: EntryCompression,
    crc32: u32,
    version_needed: u16,
    flags: u16,
    mod_time: u16,
    mod_date: u16,
    extra: Vec<u8>,
    modified: bool,
}

impl ApkEntry {
    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

/// An in-memory APK (ZIP) container.
///
/// Entries keep their original order so that repeated runs over identical
/// input produce identical output — a requirement for reproducible patch
/// verification. Paths are unique; a duplicate is a format error.
pub struct ApkContainer {
    entries: Vec<ApkEntry>,
}

impl ApkContainer {
    /// Parse an archive held in memory. Directory placeholder entries are
    /// dropped; truncated or structurally broken archives are reported,
    /// never silently skipped.
    pub fn open(bytes: &[u8]) -> ContainerResult<Self> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let mut entries: Vec<ApkEntry> = Vec::with_capacity(archive.len());

        for idx in 0..archive.len() {
            // First pass grabs the stored compressed block untouched, plus
            // the local-header fields straight from the input buffer.
            let (name, compression, crc32, raw, header) = {
                let mut entry = archive.by_index_raw(idx)?;
                if entry.name().ends_with('/') {
                    continue;
                }
                let compression = match entry.compression() {
                    zip::CompressionMethod::Stored => EntryCompression::Stored,
                    zip::CompressionMethod::Deflated => EntryCompression::Deflated,
                    other => {
                        return Err(ContainerError::Format(format!(
                            "entry {} uses unsupported compression {other:?}",
                            entry.name()
                        )))
                    }
                };
                let header = read_local_header(bytes, entry.header_start() as usize)?;
                let mut raw = Vec::with_capacity(entry.compressed_size() as usize);
                entry.read_to_end(&mut raw)?;
                (entry.name().to_string(), compression, entry.crc32(), raw, header)
            };

            if entries.iter().any(|e| e.name == name) {
                return Err(ContainerError::Format(format!("duplicate entry path {name}")));
            }

            // Second pass decompresses for consumers of the entry bytes.
            let mut data = Vec::new();
            archive.by_index(idx)?.read_to_end(&mut data)?;

            entries.push(ApkEntry {
                name,
                data,
                raw,
                compression,
                crc32,
                version_needed: header.version_needed,
                flags: header.flags,
                mod_time: header.mod_time,
                mod_date: header.mod_date,
                extra: header.extra,
                modified: false,
            });
        }

        Ok(ApkContainer { entries })
    }

    /// Entry paths in archive order.
    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = &ApkEntry> {
        self.entries.iter()
    }

    /// Uncompressed bytes of one entry.
    pub fn read_entry(&self, name: &str) -> ContainerResult<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.data.as_slice())
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))
    }

    /// Swap in new bytes for an existing entry. The entry keeps its position
    /// and compression method; its block is re-encoded on serialize.
    pub fn replace_entry(&mut self, name: &str, data: Vec<u8>) -> ContainerResult<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))?;
        entry.data = data;
        entry.raw = Vec::new();
        entry.modified = true;
        Ok(())
    }

    /// Rebuild the archive: original local-header order, untouched entries
    /// emitted from their recorded raw blocks, modified entries recompressed
    /// with a fresh CRC-32, then a central directory and end record.
    pub fn serialize(&self) -> ContainerResult<Vec<u8>> {
        // The end record holds 16-bit counts and this writer has no ZIP64
        // support, so an oversized archive must fail loudly.
        if self.entries.len() > u16::MAX as usize {
            return Err(ContainerError::Format(format!(
                "{} entries exceed the end-of-central-directory limit of {}",
                self.entries.len(),
                u16::MAX
            )));
        }
        let mut buffer = Vec::new();
        let mut central_records = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let record = write_local_entry(&mut buffer, entry)?;
            central_records.push(record);
        }

        let central_start = buffer.len() as u32;
        for record in &central_records {
            write_central_directory_entry(&mut buffer, record);
        }
        let central_size = buffer.len() as u32 - central_start;
        write_end_of_central_directory(&mut buffer, central_records.len(), central_size, central_start);

        Ok(buffer)
    }
}

struct LocalHeader {
    version_needed: u16,
    flags: u16,
    mod_time: u16,
    mod_date: u16,
    extra: Vec<u8>,
}

/// Re-read an entry's local file header from the raw archive buffer. The
/// central directory can disagree with the local record on metadata; the
/// local record is what must round-trip.
fn read_local_header(bytes: &[u8], offset: usize) -> ContainerResult<LocalHeader> {
    let fixed = bytes
        .get(offset..offset + 30)
        .ok_or_else(|| ContainerError::Format("truncated local header".to_string()))?;
    if u32_at(fixed, 0) != 0x04034b50 {
        return Err(ContainerError::Format(format!(
            "no local header signature at offset 0x{offset:x}"
        )));
    }
    let name_len = u16_at(fixed, 26) as usize;
    let extra_len = u16_at(fixed, 28) as usize;
    let extra_start = offset + 30 + name_len;
    let extra = bytes
        .get(extra_start..extra_start + extra_len)
        .ok_or_else(|| ContainerError::Format("truncated local header extra field".to_string()))?
        .to_vec();
    Ok(LocalHeader {
        version_needed: u16_at(fixed, 4),
        // Bit 3 (data descriptor) is dropped: the writer always emits
        // complete sizes in the local header.
        flags: u16_at(fixed, 6) & !0x0008,
        mod_time: u16_at(fixed, 10),
        mod_date: u16_at(fixed, 12),
        extra,
    })
}

#[derive(Clone)]
struct CentralDirectoryRecord {
    file_name: Vec<u8>,
    version_needed: u16,
    flags: u16,
    method: u16,
    mod_time: u16,
    mod_date: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    local_header_offset: u32,
}

fn write_local_entry(buf: &mut Vec<u8>, entry: &ApkEntry) -> ContainerResult<CentralDirectoryRecord> {
    let offset = buf.len() as u32;

    let (block, crc32) = if entry.modified {
        let block = match entry.compression {
            EntryCompression::Stored => entry.data.clone(),
            EntryCompression::Deflated => deflate_bytes(&entry.data)?,
        };
        let mut crc = Crc32::new();
        crc.update(&entry.data);
        (block, crc.finalize())
    } else {
        (entry.raw.clone(), entry.crc32)
    };

    write_u32(buf, 0x04034b50);
    write_u16(buf, entry.version_needed);
    write_u16(buf, entry.flags);
    write_u16(buf, entry.compression.method_id());
    write_u16(buf, entry.mod_time);
    write_u16(buf, entry.mod_date);
    write_u32(buf, crc32);
    write_u32(buf, block.len() as u32);
    write_u32(buf, entry.data.len() as u32);
    write_u16(buf, entry.name.as_bytes().len() as u16);
    write_u16(buf, entry.extra.len() as u16);
    buf.extend_from_slice(entry.name.as_bytes());
    buf.extend_from_slice(&entry.extra);
    buf.extend_from_slice(&block);

    Ok(CentralDirectoryRecord {
        file_name: entry.name.as_bytes().to_vec(),
        version_needed: entry.version_needed,
        flags: entry.flags,
        method: entry.compression.method_id(),
        mod_time: entry.mod_time,
        mod_date: entry.mod_date,
        crc32,
        compressed_size: block.len() as u32,
        uncompressed_size: entry.data.len() as u32,
        local_header_offset: offset,
    })
}

fn write_central_directory_entry(buf: &mut Vec<u8>, record: &CentralDirectoryRecord) {
    write_u32(buf, 0x02014b50);
    write_u16(buf, 0x031E);
    write_u16(buf, record.version_needed);
    write_u16(buf, record.flags);
    write_u16(buf, record.method);
    write_u16(buf, record.mod_time);
    write_u16(buf, record.mod_date);
    write_u32(buf, record.crc32);
    write_u32(buf, record.compressed_size);
    write_u32(buf, record.uncompressed_size);
    write_u16(buf, record.file_name.len() as u16);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u32(buf, 0o644 << 16);
    write_u32(buf, record.local_header_offset);
    buf.extend_from_slice(&record.file_name);
}

fn write_end_of_central_directory(buf: &mut Vec<u8>, entry_count: usize, central_size: u32, central_offset: u32) {
    write_u32(buf, 0x06054b50);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, entry_count as u16);
    write_u16(buf, entry_count as u16);
    write_u32(buf, central_size);
    write_u32(buf, central_offset);
    write_u16(buf, 0);
}

fn deflate_bytes(data: &[u8]) -> ContainerResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn u16_at(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

fn u32_at(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}
