use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use bytes::Bytes;
use tracing::warn;

use super::LogError;

/// `len: u32 LE | crc32(payload): u32 LE`
const HEADER_LEN: usize = 8;

const FILE_PREFIX: &str = "r-";
const FILE_SUFFIX: &str = ".wal";

/// The file name format is "r-{padded_first_index}.wal"
pub(crate) fn file_name(first_index: u64) -> String {
    format!("{FILE_PREFIX}{first_index:020}{FILE_SUFFIX}")
}

pub(crate) fn parse_file_name(name: &str) -> Option<u64> {
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

/// A run of consecutive entries stored in one file, starting at `first_index`.
#[derive(Debug)]
pub(crate) struct Segment {
    path: PathBuf,
    f: File,
    first_index: u64,

    /// Byte offset of every record in the file, followed by the end offset of
    /// the last record. Always holds `len() + 1` values.
    offsets: Vec<u64>,
}

/// The first record that failed validation while scanning a segment.
struct Damage {
    offset: u64,
    reason: &'static str,
}

impl Segment {
    pub(crate) fn create(dir: &Path, first_index: u64) -> Result<Self, io::Error> {
        let path = dir.join(file_name(first_index));
        let f = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&path)?;

        Ok(Self {
            path,
            f,
            first_index,
            offsets: vec![0],
        })
    }

    /// Open an existing segment and index its records.
    ///
    /// With `repair`, a damaged tail (a torn write or a checksum mismatch) is
    /// cut off at the last valid record. Without it, damage is an error.
    pub(crate) fn open(path: PathBuf, first_index: u64, repair: bool) -> Result<Self, LogError> {
        let data = fs::read(&path)?;
        let (offsets, damage) = scan(&data);

        let f = OpenOptions::new().read(true).append(true).open(&path)?;

        if let Some(damage) = damage {
            if !repair {
                return Err(LogError::Corrupt {
                    path,
                    reason: format!("{} at byte {}", damage.reason, damage.offset),
                });
            }
            warn!(
                path = %path.display(),
                offset = damage.offset,
                dropped_bytes = data.len() as u64 - damage.offset,
                reason = damage.reason,
                "truncating damaged segment tail"
            );
            f.set_len(damage.offset)?;
            f.sync_all()?;
        }

        Ok(Self {
            path,
            f,
            first_index,
            offsets,
        })
    }

    pub(crate) fn first_index(&self) -> u64 {
        self.first_index
    }

    /// The index the next appended record will get.
    pub(crate) fn next_index(&self) -> u64 {
        self.first_index + self.len() as u64
    }

    pub(crate) fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the valid part of the file in bytes.
    pub(crate) fn size(&self) -> u64 {
        self.offsets[self.offsets.len() - 1]
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn append(&mut self, payload: &[u8], sync: bool) -> Result<(), io::Error> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("entry of {} bytes does not fit a segment record", payload.len()),
            )
        })?;

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.write_u32::<LittleEndian>(len)?;
        frame.write_u32::<LittleEndian>(crc32fast::hash(payload))?;
        frame.extend_from_slice(payload);

        if let Err(e) = self.write_frame(&frame, sync) {
            // Drop whatever part of the frame reached the file so the next
            // append does not land behind a torn record.
            let _ = self.f.set_len(self.size());
            return Err(e);
        }

        let end = self.size() + frame.len() as u64;
        self.offsets.push(end);
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8], sync: bool) -> Result<(), io::Error> {
        self.f.write_all(frame)?;
        if sync {
            self.f.sync_data()?;
        }
        Ok(())
    }

    /// Read the payload stored at `index`. The caller checks the range.
    pub(crate) fn read(&self, index: u64) -> Result<Bytes, LogError> {
        let pos = (index - self.first_index) as usize;
        let start = self.offsets[pos];
        let end = self.offsets[pos + 1];

        let mut record = vec![0u8; (end - start) as usize];
        let mut f = &self.f;
        f.seek(SeekFrom::Start(start))?;
        f.read_exact(&mut record)?;

        if validate(&record) != Ok(record.len()) {
            return Err(LogError::Corrupt {
                path: self.path.clone(),
                reason: format!("record {index} failed checksum on read"),
            });
        }

        Ok(Bytes::from(record).slice(HEADER_LEN..))
    }

    /// Write the records from `index` onwards into a new segment named after
    /// `index`. The new file is complete on disk before it takes its final
    /// name; removing `self` afterwards is up to the caller.
    pub(crate) fn rewrite_from(&self, dir: &Path, index: u64) -> Result<Self, LogError> {
        let pos = (index - self.first_index) as usize;
        let start = self.offsets[pos];

        let mut tail = vec![0u8; (self.size() - start) as usize];
        let mut f = &self.f;
        f.seek(SeekFrom::Start(start))?;
        f.read_exact(&mut tail)?;

        let path = dir.join(file_name(index));
        let tmp = dir.join(format!("{}.tmp", file_name(index)));
        {
            let mut out = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            out.write_all(&tail)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        let f = OpenOptions::new().read(true).append(true).open(&path)?;
        let offsets = self.offsets[pos..].iter().map(|o| o - start).collect();

        Ok(Self {
            path,
            f,
            first_index: index,
            offsets,
        })
    }

    pub(crate) fn sync(&self) -> Result<(), io::Error> {
        self.f.sync_all()
    }

    /// Close and delete the segment file.
    pub(crate) fn remove(self) -> Result<(), io::Error> {
        let Self { path, f, .. } = self;
        drop(f);
        fs::remove_file(path)
    }
}

/// Walk the records in `data`, returning the offsets of every valid record and
/// the first damaged one, if any.
fn scan(data: &[u8]) -> (Vec<u64>, Option<Damage>) {
    let mut offsets = vec![0u64];
    let mut pos = 0usize;

    while pos < data.len() {
        match validate(&data[pos..]) {
            Ok(record_len) => {
                pos += record_len;
                offsets.push(pos as u64);
            }
            Err(reason) => {
                return (
                    offsets,
                    Some(Damage {
                        offset: pos as u64,
                        reason,
                    }),
                );
            }
        }
    }

    (offsets, None)
}

/// Check the record at the start of `buf`, returning its total length.
fn validate(buf: &[u8]) -> Result<usize, &'static str> {
    if buf.len() < HEADER_LEN {
        return Err("incomplete record header");
    }
    let len = LittleEndian::read_u32(&buf[0..4]) as usize;
    let crc = LittleEndian::read_u32(&buf[4..8]);

    let end = HEADER_LEN + len;
    if buf.len() < end {
        return Err("incomplete record payload");
    }
    if crc32fast::hash(&buf[HEADER_LEN..end]) != crc {
        return Err("record checksum mismatch");
    }
    Ok(end)
}
