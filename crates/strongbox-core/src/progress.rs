use crate::backup::{BackupOutcome, BackupState};
use crate::restore::{RestoreError, RestoreReport};
use crate::validate::{ErrorFile, ValidationReport, ValidationState};
use crate::walker::FileError;
use std::path::Path;

/// Progress of a backup run.
///
/// CLI implements with indicatif bars. All methods have default no-op
/// implementations.
pub trait BackupReporter: Send + Sync {
    fn on_state_change(&self, _state: BackupState) {}
    fn on_item_start(&self, _item: &str, _total_files: usize) {}
    fn on_item_progress(&self, _item: &str, _processed: usize, _total: usize) {}
    fn on_file_error(&self, _error: &FileError) {}
    /// The catalog is in place at the destination and about to be checked
    /// against the rows the run wrote.
    fn on_catalog_published(&self, _name: &str, _path: &Path) {}
    fn on_backup_complete(&self, _outcome: &BackupOutcome) {}
}

/// Progress of a restore. Errors arrive one at a time as they happen.
pub trait RestoreReporter: Send + Sync {
    fn on_restore_start(&self, _total_files: usize) {}
    fn on_restore_progress(&self, _processed: usize, _total: usize) {}
    fn on_restore_error(&self, _error: &RestoreError) {}
    fn on_restore_complete(&self, _report: &RestoreReport) {}
}

pub trait ValidationReporter: Send + Sync {
    fn on_state_change(&self, _state: ValidationState) {}
    fn on_hash_progress(&self, _hashed: usize, _total: usize) {}
    fn on_error_file(&self, _file: &ErrorFile) {}
    fn on_validation_complete(&self, _report: &ValidationReport) {}
}

/// No-op reporter for silent operation.
pub struct SilentReporter;

impl BackupReporter for SilentReporter {}
impl RestoreReporter for SilentReporter {}
impl ValidationReporter for SilentReporter {}
