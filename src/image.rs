//! # Packed Image Container
//!
//! Single-file image format produced by the `packed-image` assembler and
//! read back by the OCI bundle materializer and `inspect`.
//!
//! ## Layout
//!
//! ```text
//! offset 0     ┌──────────────────────────────┐
//!              │ header (32 bytes)            │  magic, version, table offset/len
//! offset 4096  ├──────────────────────────────┤
//!              │ object 0 (4096-aligned)      │  e.g. squashfs system partition
//!              ├──────────────────────────────┤
//!              │ object 1 ...                 │  labels JSON, definition text
//!              ├──────────────────────────────┤
//!              │ descriptor table (JSON)      │
//!              └──────────────────────────────┘
//! ```
//!
//! All header integers are little-endian. The descriptor table is a JSON
//! array of [`Descriptor`], bounded by [`MAX_DESCRIPTOR_TABLE_SIZE`].
//!
//! The **primary partition** is the first partition descriptor whose
//! partition type is [`PartType::System`]. Only [`FsType::Squashfs`]
//! primary partitions can be mounted.

use crate::bundle::Labels;
use crate::constants::MAX_DESCRIPTOR_TABLE_SIZE;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File magic.
pub const MAGIC: [u8; 8] = *b"IMGBUILD";

/// Current format version.
pub const VERSION: u32 = 1;

/// Object alignment within the file.
pub const ALIGNMENT: u64 = 4096;

const HEADER_LEN: usize = 32;

// =============================================================================
// Descriptors
// =============================================================================

/// Filesystem kind of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsType {
    Squashfs,
    Ext3,
    Raw,
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Squashfs => f.write_str("squashfs"),
            Self::Ext3 => f.write_str("ext3"),
            Self::Raw => f.write_str("raw"),
        }
    }
}

/// Role of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartType {
    System,
    Data,
    Overlay,
}

/// What an object holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectKind {
    Partition {
        name: String,
        fs_type: FsType,
        part_type: PartType,
    },
    /// Labels JSON, keyed by partition name.
    Labels,
    /// Definition text.
    Definition,
}

/// Location and kind of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(flatten)]
    pub kind: ObjectKind,
    pub offset: u64,
    pub length: u64,
}

impl Descriptor {
    /// Filesystem kind, for partition descriptors.
    pub fn fs_type(&self) -> Option<FsType> {
        match &self.kind {
            ObjectKind::Partition { fs_type, .. } => Some(*fs_type),
            _ => None,
        }
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Parsed descriptor table of a packed image.
#[derive(Debug, Clone)]
pub struct PackedImage {
    path: PathBuf,
    descriptors: Vec<Descriptor>,
}

impl PackedImage {
    /// Reads the header and descriptor table of the image at `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        Self::from_file(&mut file, path)
    }

    /// Reads the descriptor table from an already open image.
    pub fn from_file(file: &mut File, path: &Path) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidImage {
            path: path.to_path_buf(),
            reason,
        };

        let mut header = [0u8; HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)
            .map_err(|e| invalid(format!("short header: {}", e)))?;

        if header[..8] != MAGIC {
            return Err(invalid("bad magic".to_string()));
        }
        let version = u32::from_le_bytes(le_array(&header[8..12]));
        if version != VERSION {
            return Err(invalid(format!("unsupported version {}", version)));
        }
        let table_offset = u64::from_le_bytes(le_array(&header[16..24]));
        let table_len = u64::from_le_bytes(le_array(&header[24..32]));
        if table_len > MAX_DESCRIPTOR_TABLE_SIZE {
            return Err(invalid(format!(
                "descriptor table of {} bytes exceeds {}",
                table_len, MAX_DESCRIPTOR_TABLE_SIZE
            )));
        }

        let file_len = file.metadata()?.len();
        if table_offset.saturating_add(table_len) > file_len {
            return Err(invalid("descriptor table past end of file".to_string()));
        }

        let mut table = vec![0u8; table_len as usize];
        file.seek(SeekFrom::Start(table_offset))?;
        file.read_exact(&mut table)?;
        let descriptors: Vec<Descriptor> = serde_json::from_slice(&table)
            .map_err(|e| invalid(format!("descriptor table: {}", e)))?;

        for d in &descriptors {
            if d.offset.saturating_add(d.length) > file_len {
                return Err(invalid(format!("object at {} past end of file", d.offset)));
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            descriptors,
        })
    }

    /// Returns true if the file at `path` starts with the image magic.
    pub fn is_packed_image(path: &Path) -> bool {
        let mut magic = [0u8; 8];
        File::open(path)
            .and_then(|mut f| f.read_exact(&mut magic))
            .is_ok()
            && magic == MAGIC
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// The first system partition.
    pub fn primary_partition(&self) -> Result<&Descriptor> {
        self.descriptors
            .iter()
            .find(|d| {
                matches!(
                    d.kind,
                    ObjectKind::Partition {
                        part_type: PartType::System,
                        ..
                    }
                )
            })
            .ok_or_else(|| Error::NoPrimaryPartition(self.path.clone()))
    }

    /// Reads one object's bytes.
    pub fn read_object(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(descriptor.offset))?;
        let mut data = vec![0u8; descriptor.length as usize];
        file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Labels stored in the image; empty when the image carries none.
    pub fn labels(&self) -> Result<Labels> {
        match self
            .descriptors
            .iter()
            .find(|d| d.kind == ObjectKind::Labels)
        {
            Some(d) => Ok(serde_json::from_slice(&self.read_object(d)?)?),
            None => Ok(Labels::new()),
        }
    }

    /// Definition text stored in the image.
    pub fn definition(&self) -> Result<Option<String>> {
        match self
            .descriptors
            .iter()
            .find(|d| d.kind == ObjectKind::Definition)
        {
            Some(d) => Ok(Some(
                String::from_utf8_lossy(&self.read_object(d)?).into_owned(),
            )),
            None => Ok(None),
        }
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

// =============================================================================
// Writer
// =============================================================================

enum ObjectSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// Builds a packed image from a set of objects.
#[derive(Default)]
pub struct ImageWriter {
    objects: Vec<(ObjectKind, ObjectSource)>,
}

impl ImageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a partition whose contents are the file at `path`.
    pub fn add_partition_file(
        &mut self,
        name: &str,
        path: impl Into<PathBuf>,
        fs_type: FsType,
        part_type: PartType,
    ) -> &mut Self {
        self.objects.push((
            ObjectKind::Partition {
                name: name.to_string(),
                fs_type,
                part_type,
            },
            ObjectSource::File(path.into()),
        ));
        self
    }

    /// Adds a partition from in-memory bytes.
    pub fn add_partition_bytes(
        &mut self,
        name: &str,
        data: Vec<u8>,
        fs_type: FsType,
        part_type: PartType,
    ) -> &mut Self {
        self.objects.push((
            ObjectKind::Partition {
                name: name.to_string(),
                fs_type,
                part_type,
            },
            ObjectSource::Bytes(data),
        ));
        self
    }

    pub fn add_labels(&mut self, labels: &Labels) -> Result<&mut Self> {
        let data = serde_json::to_vec_pretty(labels)?;
        self.objects.push((ObjectKind::Labels, ObjectSource::Bytes(data)));
        Ok(self)
    }

    pub fn add_definition(&mut self, text: &str) -> &mut Self {
        self.objects.push((
            ObjectKind::Definition,
            ObjectSource::Bytes(text.as_bytes().to_vec()),
        ));
        self
    }

    /// Writes the image to `dest`, replacing any existing file. Returns the
    /// size of the written image.
    pub fn write(&self, dest: &Path) -> Result<u64> {
        let mut file = File::create(dest)?;
        let mut descriptors = Vec::with_capacity(self.objects.len());

        let mut offset = ALIGNMENT;
        for (kind, source) in &self.objects {
            file.seek(SeekFrom::Start(offset))?;
            let length = match source {
                ObjectSource::Bytes(data) => {
                    file.write_all(data)?;
                    data.len() as u64
                }
                ObjectSource::File(path) => {
                    let mut src = File::open(path)?;
                    io::copy(&mut src, &mut file)?
                }
            };
            debug!(offset, length, kind = ?kind, "wrote image object");
            descriptors.push(Descriptor {
                kind: kind.clone(),
                offset,
                length,
            });
            offset = align_up(offset + length);
        }

        let table = serde_json::to_vec(&descriptors)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&table)?;

        let mut header = [0u8; HEADER_LEN];
        header[..8].copy_from_slice(&MAGIC);
        header[8..12].copy_from_slice(&VERSION.to_le_bytes());
        header[16..24].copy_from_slice(&offset.to_le_bytes());
        header[24..32].copy_from_slice(&(table.len() as u64).to_le_bytes());
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        file.sync_all()?;

        Ok(offset + table.len() as u64)
    }
}

fn align_up(n: u64) -> u64 {
    n.div_ceil(ALIGNMENT) * ALIGNMENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 4096);
        assert_eq!(align_up(4096), 4096);
        assert_eq!(align_up(4097), 8192);
    }

    #[test]
    fn test_primary_partition_is_first_system_partition() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("img");
        ImageWriter::new()
            .add_partition_bytes("data", vec![1; 10], FsType::Raw, PartType::Data)
            .add_partition_bytes("root", vec![2; 5000], FsType::Squashfs, PartType::System)
            .write(&path)
            .unwrap();

        let image = PackedImage::read(&path).unwrap();
        let primary = image.primary_partition().unwrap();
        assert_eq!(primary.fs_type(), Some(FsType::Squashfs));
        assert_eq!(primary.length, 5000);
        assert_eq!(primary.offset % ALIGNMENT, 0);
        assert_eq!(image.read_object(primary).unwrap(), vec![2; 5000]);
    }

    #[test]
    fn test_no_primary_partition() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("img");
        ImageWriter::new().add_definition("Bootstrap: scratch\n").write(&path).unwrap();

        let image = PackedImage::read(&path).unwrap();
        assert!(matches!(
            image.primary_partition(),
            Err(Error::NoPrimaryPartition(_))
        ));
        assert_eq!(
            image.definition().unwrap().as_deref(),
            Some("Bootstrap: scratch\n")
        );
    }

    #[test]
    fn test_bad_magic() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("img");
        std::fs::write(&path, [0u8; 64]).unwrap();
        assert!(!PackedImage::is_packed_image(&path));
        assert!(matches!(
            PackedImage::read(&path),
            Err(Error::InvalidImage { .. })
        ));
    }
}
