//! Binary codec for the transfer blob handed from the current process to the
//! successor.
//!
//! Two layouts exist, both little-endian:
//!
//! ```text
//! legacy:  i32 count, { u64 name_len, name, u64 size, data }*
//! tagged:  "HOBL", u8 version (2), i32 count, { u8 kind, u64 name_len, name, u64 size, data }*
//! ```
//!
//! In the legacy layout a directory is a zero-size record whose name ends with
//! `/` or `\`. That cannot express an empty file whose name ends with a
//! separator, so encoding such an entry with [`BlobLayout::Legacy`] fails with
//! [`BlobError::AmbiguousEntry`]. The tagged layout carries the kind explicitly
//! and is what [`BlobWriter`] produces by default. [`TransferBlob::decode`]
//! accepts both.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::core::BlobError;

/// Magic prefix of the tagged layout.
pub const TAGGED_MAGIC: &[u8; 4] = b"HOBL";

/// Version byte written after [`TAGGED_MAGIC`].
pub const TAGGED_VERSION: u8 = 2;

const KIND_FILE: u8 = 0;
const KIND_DIRECTORY: u8 = 1;

/// Whether a record is a file or a directory placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One record of the blob. `name` is a relative path with `/` separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub name: String,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

impl BlobEntry {
    pub fn file(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            data: data.into(),
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            data: Vec::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Wire layout selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlobLayout {
    Legacy,
    #[default]
    Tagged,
}

fn ends_with_separator(name: &str) -> bool {
    name.ends_with('/') || name.ends_with('\\')
}

/// Streaming blob encoder.
///
/// The record count is written as a placeholder and patched by
/// [`BlobWriter::finish`], so entries can be appended one at a time.
pub struct BlobWriter<W: Write + Seek> {
    inner: W,
    layout: BlobLayout,
    count_offset: u64,
    count: usize,
}

impl<W: Write + Seek> BlobWriter<W> {
    pub fn new(mut inner: W, layout: BlobLayout) -> Result<Self, BlobError> {
        let start = inner.stream_position()?;
        let count_offset = match layout {
            BlobLayout::Legacy => start,
            BlobLayout::Tagged => {
                inner.write_all(TAGGED_MAGIC)?;
                inner.write_all(&[TAGGED_VERSION])?;
                start + TAGGED_MAGIC.len() as u64 + 1
            }
        };
        inner.write_all(&0i32.to_le_bytes())?;

        Ok(Self {
            inner,
            layout,
            count_offset,
            count: 0,
        })
    }

    /// Appends one record.
    pub fn append(&mut self, name: &str, kind: EntryKind, data: &[u8]) -> Result<(), BlobError> {
        if self.count >= i32::MAX as usize {
            return Err(BlobError::TooManyRecords(self.count + 1));
        }

        let (name, data): (std::borrow::Cow<'_, str>, &[u8]) = match (self.layout, kind) {
            (BlobLayout::Legacy, EntryKind::Directory) if ends_with_separator(name) => {
                (name.into(), &[][..])
            }
            (BlobLayout::Legacy, EntryKind::Directory) => (format!("{name}/").into(), &[][..]),
            (BlobLayout::Legacy, EntryKind::File) if data.is_empty() && ends_with_separator(name) => {
                return Err(BlobError::AmbiguousEntry {
                    name: name.to_string(),
                });
            }
            (_, EntryKind::Directory) => (name.into(), &[][..]),
            (_, EntryKind::File) => (name.into(), data),
        };

        if self.layout == BlobLayout::Tagged {
            let tag = match kind {
                EntryKind::File => KIND_FILE,
                EntryKind::Directory => KIND_DIRECTORY,
            };
            self.inner.write_all(&[tag])?;
        }

        self.inner.write_all(&(name.len() as u64).to_le_bytes())?;
        self.inner.write_all(name.as_bytes())?;
        self.inner.write_all(&(data.len() as u64).to_le_bytes())?;
        self.inner.write_all(data)?;
        self.count += 1;
        Ok(())
    }

    pub fn append_entry(&mut self, entry: &BlobEntry) -> Result<(), BlobError> {
        self.append(&entry.name, entry.kind, &entry.data)
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Patches the record count, flushes and returns the underlying writer.
    pub fn finish(mut self) -> Result<W, BlobError> {
        let end = self.inner.stream_position()?;
        self.inner.seek(SeekFrom::Start(self.count_offset))?;
        self.inner.write_all(&(self.count as i32).to_le_bytes())?;
        self.inner.seek(SeekFrom::Start(end))?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// A fully decoded blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferBlob {
    pub entries: Vec<BlobEntry>,
    pub layout: BlobLayout,
}

fn read_array<const N: usize, R: Read>(
    reader: &mut R,
    what: &'static str,
    index: usize,
) -> Result<[u8; N], BlobError> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(|e| truncated(e, what, index))?;
    Ok(buf)
}

fn truncated(error: io::Error, what: &'static str, index: usize) -> BlobError {
    if error.kind() == io::ErrorKind::UnexpectedEof {
        BlobError::Truncated {
            what,
            index,
        }
    } else {
        BlobError::Io(error)
    }
}

// Bounded by what the stream actually holds, so a corrupt length cannot
// trigger a huge allocation.
fn read_bytes<R: Read>(
    reader: &mut R,
    len: u64,
    what: &'static str,
    index: usize,
) -> Result<Vec<u8>, BlobError> {
    let mut buf = Vec::new();
    reader.take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(BlobError::Truncated {
            what,
            index,
        });
    }
    Ok(buf)
}

/// Streaming decoder yielding one record at a time.
///
/// The header is validated by [`BlobReader::new`]; each record is checked as
/// it is read, so a truncated blob fails at the first incomplete record.
#[derive(Debug)]
pub struct BlobReader<R: Read> {
    reader: R,
    layout: BlobLayout,
    count: usize,
    index: usize,
    failed: bool,
}

impl<R: Read> BlobReader<R> {
    pub fn new(mut reader: R) -> Result<Self, BlobError> {
        let head: [u8; 4] = read_array(&mut reader, "header", 0)?;

        let (layout, count) = if &head == TAGGED_MAGIC {
            let [version] = read_array::<1, _>(&mut reader, "version", 0)?;
            if version != TAGGED_VERSION {
                return Err(BlobError::UnsupportedVersion(version));
            }
            let count = i32::from_le_bytes(read_array(&mut reader, "record count", 0)?);
            (BlobLayout::Tagged, count)
        } else {
            (BlobLayout::Legacy, i32::from_le_bytes(head))
        };

        if count < 0 {
            return Err(BlobError::NegativeCount(count));
        }

        Ok(Self {
            reader,
            layout,
            count: count as usize,
            index: 0,
            failed: false,
        })
    }

    pub fn layout(&self) -> BlobLayout {
        self.layout
    }

    /// Records declared by the header.
    pub fn record_count(&self) -> usize {
        self.count
    }

    pub fn remaining(&self) -> usize {
        self.count - self.index
    }

    fn read_record(&mut self) -> Result<BlobEntry, BlobError> {
        let index = self.index;
        let reader = &mut self.reader;

        let tag = match self.layout {
            BlobLayout::Tagged => {
                let [tag] = read_array::<1, _>(reader, "kind", index)?;
                Some(tag)
            }
            BlobLayout::Legacy => None,
        };

        let name_len = u64::from_le_bytes(read_array(reader, "name length", index)?);
        let name = read_bytes(reader, name_len, "name", index)?;
        let name = String::from_utf8(name).map_err(|_| BlobError::InvalidName {
            index,
        })?;
        let size = u64::from_le_bytes(read_array(reader, "size", index)?);
        let data = read_bytes(reader, size, "data", index)?;

        let kind = match tag {
            Some(KIND_FILE) => EntryKind::File,
            Some(KIND_DIRECTORY) => EntryKind::Directory,
            Some(tag) => {
                return Err(BlobError::UnknownKind {
                    index,
                    tag,
                });
            }
            None if data.is_empty() && ends_with_separator(&name) => EntryKind::Directory,
            None => EntryKind::File,
        };

        Ok(BlobEntry {
            name,
            kind,
            data,
        })
    }
}

impl<R: Read> Iterator for BlobReader<R> {
    type Item = Result<BlobEntry, BlobError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.index >= self.count {
            return None;
        }
        let record = self.read_record();
        match record {
            Ok(_) => self.index += 1,
            Err(_) => self.failed = true,
        }
        Some(record)
    }
}

impl TransferBlob {
    pub fn new(entries: Vec<BlobEntry>) -> Self {
        Self {
            entries,
            layout: BlobLayout::default(),
        }
    }

    /// Encodes every entry with `layout`.
    pub fn encode<W: Write + Seek>(&self, writer: W, layout: BlobLayout) -> Result<W, BlobError> {
        let mut blob = BlobWriter::new(writer, layout)?;
        for entry in &self.entries {
            blob.append_entry(entry)?;
        }
        blob.finish()
    }

    pub fn to_bytes(&self, layout: BlobLayout) -> Result<Vec<u8>, BlobError> {
        Ok(self.encode(io::Cursor::new(Vec::new()), layout)?.into_inner())
    }

    /// Decodes a blob in either layout.
    pub fn decode<R: Read>(reader: R) -> Result<Self, BlobError> {
        let mut records = BlobReader::new(reader)?;
        let layout = records.layout();
        let mut entries = Vec::with_capacity(records.remaining().min(4096));
        for entry in &mut records {
            entries.push(entry?);
        }

        Ok(Self {
            entries,
            layout,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlobError> {
        Self::decode(bytes)
    }
}
