use std::fs;
use std::path::Path;
use tempfile::tempdir;

use strongbox_core::catalog::CatalogReader;
use strongbox_core::layout;
use strongbox_core::{
    BackupItem, BackupResult, BackupTask, BlobProblem, CancelToken, CatalogWriter,
    SilentReporter, ValidationState, ValidationTask,
};

fn backed_up(root: &Path) -> (std::path::PathBuf, String) {
    let source = root.join("source");
    let destination = root.join("destination");
    fs::create_dir_all(source.join("inner")).unwrap();
    fs::create_dir_all(&destination).unwrap();
    fs::write(source.join("one.txt"), "first").unwrap();
    fs::write(source.join("two.txt"), "second").unwrap();
    fs::write(source.join("inner").join("three.txt"), "third").unwrap();

    let outcome = BackupTask::new(&destination, vec![BackupItem::new("src", &source)])
        .with_temp_dir(&root.join("temp"))
        .with_cache_dir(&root.join("cache"))
        .run(&CancelToken::new(), &SilentReporter);
    assert_eq!(outcome.result, BackupResult::Successful);
    (destination, outcome.catalog_name.unwrap())
}

fn stored_name_of(destination: &Path, catalog: &str, file: &str) -> String {
    let reader = CatalogReader::open(&destination.join(catalog));
    let root = &reader.folders(None).unwrap()[0];
    reader
        .files(root.id)
        .unwrap()
        .into_iter()
        .find(|f| f.name == file)
        .unwrap()
        .stored_name
}

#[test]
fn test_clean_destination_validates() {
    let tmp = tempdir().unwrap();
    let (destination, _) = backed_up(tmp.path());

    let report = ValidationTask::new(&destination).run(&CancelToken::new(), &SilentReporter);

    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(report.catalogs, 1);
    assert_eq!(report.checked_files, 3);
    assert_eq!(report.unused_files, 0);
}

#[test]
fn test_missing_blob_reported_not_deleted() {
    let tmp = tempdir().unwrap();
    let (destination, catalog) = backed_up(tmp.path());
    let blobs = layout::blob_dir(&destination);
    let missing = stored_name_of(&destination, &catalog, "one.txt");
    fs::remove_file(blobs.join(&missing)).unwrap();
    fs::write(blobs.join("orphan.bin"), "nobody points here").unwrap();

    let report = ValidationTask::new(&destination).run(&CancelToken::new(), &SilentReporter);

    assert_eq!(report.state, ValidationState::Finished);
    assert_eq!(report.error_files.len(), 1);
    let error = &report.error_files[0];
    assert_eq!(error.stored_name, missing);
    assert!(error.is_missing());
    assert_eq!(error.claims.len(), 1);
    assert_eq!(error.claims[0].catalogs, vec![catalog]);

    assert_eq!(report.unused_files, 1);
    assert_eq!(report.deleted_files, 1);
    assert!(!blobs.join("orphan.bin").exists(), "orphans are removed");
    assert_eq!(
        fs::read_dir(&blobs).unwrap().count(),
        2,
        "the two intact referenced blobs stay"
    );
}

#[test]
fn test_corrupt_blob_reported_with_live_hash() {
    let tmp = tempdir().unwrap();
    let (destination, catalog) = backed_up(tmp.path());
    let stored = stored_name_of(&destination, &catalog, "two.txt");
    fs::write(layout::blob_dir(&destination).join(&stored), "tampered").unwrap();

    let report = ValidationTask::new(&destination)
        .keep_unused()
        .run(&CancelToken::new(), &SilentReporter);

    assert_eq!(report.error_files.len(), 1);
    let error = &report.error_files[0];
    assert_eq!(error.stored_name, stored);
    assert!(!error.is_missing());
    assert_eq!(error.problem, BlobProblem::HashMismatch);
    assert_ne!(error.live_hash.as_deref(), Some(error.claims[0].hash.as_str()));
}

#[test]
fn test_blob_claimed_under_two_hashes_is_flagged() {
    let tmp = tempdir().unwrap();
    let (destination, first) = backed_up(tmp.path());
    let shared = stored_name_of(&destination, &first, "one.txt");

    // A later catalog records the same blob under another hash.
    let second = "2099-01-01_00-00-00.db";
    let other_hash = "f".repeat(64);
    let writer = CatalogWriter::create(&destination.join(second)).unwrap();
    let root = writer.add_folder("other", None);
    writer.add_file("renamed.txt", &other_hash, &shared, root.id);
    writer.finish().unwrap();

    let report = ValidationTask::new(&destination).run(&CancelToken::new(), &SilentReporter);

    assert_eq!(report.state, ValidationState::Finished);
    assert_eq!(report.catalogs, 2);
    assert_eq!(report.error_files.len(), 1, "{:?}", report.error_files);
    let error = &report.error_files[0];
    assert_eq!(error.stored_name, shared);
    assert_eq!(error.problem, BlobProblem::Ambiguous);
    assert_eq!(error.claims.len(), 2);
    let claimed_by: Vec<&str> = error
        .claims
        .iter()
        .flat_map(|c| c.catalogs.iter().map(String::as_str))
        .collect();
    assert!(claimed_by.contains(&first.as_str()));
    assert!(claimed_by.contains(&second));
    assert!(error.claims.iter().any(|c| c.hash == other_hash));
    assert!(
        layout::blob_dir(&destination).join(&shared).exists(),
        "flagged blobs are never deleted"
    );
}

#[cfg(unix)]
#[test]
fn test_unreadable_blob_reported_and_validation_continues() {
    let tmp = tempdir().unwrap();
    let (destination, catalog) = backed_up(tmp.path());
    let blobs = layout::blob_dir(&destination);
    let broken = stored_name_of(&destination, &catalog, "two.txt");
    fs::remove_file(blobs.join(&broken)).unwrap();
    std::os::unix::fs::symlink(tmp.path().join("nowhere"), blobs.join(&broken)).unwrap();
    fs::write(blobs.join("orphan.bin"), "nobody points here").unwrap();

    let report = ValidationTask::new(&destination).run(&CancelToken::new(), &SilentReporter);

    assert_eq!(report.state, ValidationState::Finished, "{:?}", report.error);
    assert_eq!(report.checked_files, 3);
    assert_eq!(report.error_files.len(), 1);
    let error = &report.error_files[0];
    assert_eq!(error.stored_name, broken);
    assert!(matches!(error.problem, BlobProblem::Unreadable(_)));
    assert_eq!(error.live_hash, None);
    assert_eq!(report.deleted_files, 1, "orphans are still purged");
    assert!(!blobs.join("orphan.bin").exists());
}

#[test]
fn test_keep_unused_only_counts_orphans() {
    let tmp = tempdir().unwrap();
    let (destination, _) = backed_up(tmp.path());
    let orphan = layout::blob_dir(&destination).join("leftover.dat");
    fs::write(&orphan, "x").unwrap();

    let report = ValidationTask::new(&destination)
        .keep_unused()
        .run(&CancelToken::new(), &SilentReporter);

    assert_eq!(report.unused_files, 1);
    assert_eq!(report.deleted_files, 0);
    assert!(orphan.exists());
}

#[test]
fn test_cancelled_validation() {
    let tmp = tempdir().unwrap();
    let (destination, _) = backed_up(tmp.path());
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = ValidationTask::new(&destination).run(&cancel, &SilentReporter);
    assert_eq!(report.state, ValidationState::Canceled);
}
