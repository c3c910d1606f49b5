//! Tests for the packed image format.
//!
//! Validates the writer/reader pair, primary partition selection, stored
//! labels and definition text, and rejection of damaged files.

use imgbuild::Labels;
use imgbuild::constants::SYSTEM_PARTITION;
use imgbuild::error::Error;
use imgbuild::image::{ALIGNMENT, FsType, ImageWriter, MAGIC, ObjectKind, PackedImage, PartType};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use tempfile::TempDir;

fn labels() -> Labels {
    let mut system = BTreeMap::new();
    system.insert("maintainer".to_string(), "ops".to_string());
    let mut all = Labels::new();
    all.insert(SYSTEM_PARTITION.to_string(), system);
    all
}

// =============================================================================
// Writer / Reader Tests
// =============================================================================

#[test]
fn test_written_image_is_recognized() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("image.img");

    ImageWriter::new()
        .add_partition_bytes(SYSTEM_PARTITION, vec![7; 100], FsType::Squashfs, PartType::System)
        .write(&path)
        .unwrap();

    assert!(PackedImage::is_packed_image(&path));
    let header = fs::read(&path).unwrap();
    assert_eq!(&header[..8], &MAGIC);
}

#[test]
fn test_plain_file_is_not_an_image() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("notes.txt");
    fs::write(&path, "just text").unwrap();

    assert!(!PackedImage::is_packed_image(&path));
    assert!(matches!(
        PackedImage::read(&path),
        Err(Error::InvalidImage { .. })
    ));
}

#[test]
fn test_objects_are_aligned() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("image.img");

    ImageWriter::new()
        .add_partition_bytes(SYSTEM_PARTITION, vec![1; 5000], FsType::Squashfs, PartType::System)
        .add_labels(&labels())
        .unwrap()
        .add_definition("Bootstrap: scratch\n")
        .write(&path)
        .unwrap();

    let image = PackedImage::read(&path).unwrap();
    assert_eq!(image.descriptors().len(), 3);
    for d in image.descriptors() {
        assert_eq!(d.offset % ALIGNMENT, 0, "object at {} unaligned", d.offset);
    }
}

#[test]
fn test_partition_from_file() {
    let temp = TempDir::new().unwrap();
    let squash = temp.path().join("rootfs.squashfs");
    fs::write(&squash, vec![9u8; 12345]).unwrap();
    let path = temp.path().join("image.img");

    ImageWriter::new()
        .add_partition_file(SYSTEM_PARTITION, &squash, FsType::Squashfs, PartType::System)
        .write(&path)
        .unwrap();

    let image = PackedImage::read(&path).unwrap();
    let primary = image.primary_partition().unwrap();
    assert_eq!(primary.length, 12345);
    assert!(matches!(
        &primary.kind,
        ObjectKind::Partition { name, .. } if name == SYSTEM_PARTITION
    ));
    assert_eq!(image.read_object(primary).unwrap(), vec![9u8; 12345]);
}

#[test]
fn test_labels_and_definition_stored() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("image.img");

    ImageWriter::new()
        .add_partition_bytes(SYSTEM_PARTITION, vec![0; 10], FsType::Squashfs, PartType::System)
        .add_labels(&labels())
        .unwrap()
        .add_definition("Bootstrap: docker\nFrom: alpine\n")
        .write(&path)
        .unwrap();

    let image = PackedImage::read(&path).unwrap();
    assert_eq!(image.labels().unwrap(), labels());
    assert_eq!(
        image.definition().unwrap().as_deref(),
        Some("Bootstrap: docker\nFrom: alpine\n")
    );
}

#[test]
fn test_missing_metadata_objects() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("image.img");

    ImageWriter::new()
        .add_partition_bytes(SYSTEM_PARTITION, vec![0; 10], FsType::Squashfs, PartType::System)
        .write(&path)
        .unwrap();

    let image = PackedImage::read(&path).unwrap();
    assert!(image.labels().unwrap().is_empty());
    assert!(image.definition().unwrap().is_none());
}

// =============================================================================
// Damaged Image Tests
// =============================================================================

#[test]
fn test_data_partition_is_not_primary() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("image.img");

    ImageWriter::new()
        .add_partition_bytes("data", vec![0; 10], FsType::Raw, PartType::Data)
        .write(&path)
        .unwrap();

    let image = PackedImage::read(&path).unwrap();
    assert!(matches!(
        image.primary_partition(),
        Err(Error::NoPrimaryPartition(_))
    ));
}

#[test]
fn test_truncated_image_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("image.img");

    ImageWriter::new()
        .add_partition_bytes(SYSTEM_PARTITION, vec![0; 9000], FsType::Squashfs, PartType::System)
        .write(&path)
        .unwrap();

    let len = fs::metadata(&path).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len / 2).unwrap();

    let err = PackedImage::read(&path).unwrap_err();
    assert!(err.to_string().contains("past end of file"), "{}", err);
}

#[test]
fn test_unknown_version_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("image.img");

    ImageWriter::new()
        .add_definition("x")
        .write(&path)
        .unwrap();

    let mut file = fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(8)).unwrap();
    file.write_all(&99u32.to_le_bytes()).unwrap();
    drop(file);

    let err = PackedImage::read(&path).unwrap_err();
    assert!(err.to_string().contains("unsupported version 99"));
}
