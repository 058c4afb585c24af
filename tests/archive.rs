use std::cell::RefCell;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use assert_matches::assert_matches;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use framepull::archive::{ArchiveExtractor, EntryObserver, ZipExtractor};
use framepull::error::PullError;

fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let file = File::create(path).unwrap();
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for (name, content) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
    }
    writer.finish().unwrap();
}

#[test]
fn extracts_nested_entries_and_reports_each() {
    let temp = tempfile::tempdir().unwrap();
    let archive = temp.path().join("result.zip");
    write_zip(
        &archive,
        &[
            ("frames/", ""),
            ("frames/0001.jpg", "one"),
            ("frames/0002.jpg", "two"),
            ("summary.txt", "done"),
        ],
    );
    let destination = temp.path().join("out");

    let seen = RefCell::new(Vec::new());
    let observer: EntryObserver<'_> = &|done: usize, total: usize| {
        seen.borrow_mut().push((done, total));
    };
    let summary = ZipExtractor
        .extract(&archive, &destination, Some(observer))
        .unwrap();

    assert_eq!(summary.entries, 4);
    assert_eq!(summary.files, 3);
    assert_eq!(
        fs::read_to_string(destination.join("frames/0002.jpg")).unwrap(),
        "two"
    );
    assert!(destination.join("summary.txt").is_file());
    assert_eq!(*seen.borrow(), vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
}

#[test]
fn creates_missing_destination() {
    let temp = tempfile::tempdir().unwrap();
    let archive = temp.path().join("result.zip");
    write_zip(&archive, &[("a.png", "png")]);
    let destination = temp.path().join("deep/er/out");

    ZipExtractor.extract(&archive, &destination, None).unwrap();
    assert!(destination.join("a.png").is_file());
}

#[test]
fn garbage_is_a_corrupt_archive() {
    let temp = tempfile::tempdir().unwrap();
    let archive = temp.path().join("result.zip");
    fs::write(&archive, b"this is not a zip file at all").unwrap();

    let err = ZipExtractor
        .extract(&archive, &temp.path().join("out"), None)
        .unwrap_err();
    assert_matches!(err, PullError::CorruptArchive(_));
}

#[test]
fn truncated_archive_is_corrupt() {
    let temp = tempfile::tempdir().unwrap();
    let archive = temp.path().join("result.zip");
    let content = "frame".repeat(1024);
    write_zip(&archive, &[("a.jpg", content.as_str())]);
    let bytes = fs::read(&archive).unwrap();
    fs::write(&archive, &bytes[..bytes.len() / 2]).unwrap();

    let err = ZipExtractor
        .extract(&archive, &temp.path().join("out"), None)
        .unwrap_err();
    assert_matches!(err, PullError::CorruptArchive(_));
}

#[test]
fn empty_archive_extracts_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let archive = temp.path().join("result.zip");
    write_zip(&archive, &[]);

    let summary = ZipExtractor
        .extract(&archive, &temp.path().join("out"), None)
        .unwrap();
    assert_eq!(summary.entries, 0);
    assert_eq!(summary.files, 0);
}
