use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use strongbox_core::restore::RestoreError;
use strongbox_core::validate::{ErrorFile, ValidationState};
use strongbox_core::{
    BackupReporter, BackupState, FileError, RestoreReporter, ValidationReporter,
};

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// Terminal progress for backup, restore and validation.
///
/// - Phases without a known total: spinner
/// - Per-item file processing, restore and blob hashing: progress bar
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        self.bar.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_bar(&self, pb: ProgressBar) {
        let mut guard = self.lock();
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    fn finish_bar(&self) {
        if let Some(pb) = self.lock().take() {
            pb.finish_and_clear();
        }
    }

    fn spinner(&self, message: &str) {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            pb.set_style(style.tick_chars(TICK_CHARS));
        }
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn bar(&self, label: &str, total: usize) {
        let pb = ProgressBar::new(total as u64);
        let template = format!(
            "  {{spinner:.cyan}} {} [{{bar:30.cyan/dim}}] {{pos}}/{{len}} ({{eta}} remaining)",
            label
        );
        if let Ok(style) = ProgressStyle::with_template(&template) {
            pb.set_style(style.progress_chars("━╸─").tick_chars(TICK_CHARS));
        }
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn position(&self, done: usize, total: usize) {
        if let Some(pb) = self.lock().as_ref() {
            if pb.length() != Some(total as u64) {
                pb.set_length(total as u64);
            }
            pb.set_position(done as u64);
        }
    }

    fn println(&self, line: String) {
        match self.lock().as_ref() {
            Some(pb) => pb.println(line),
            None => eprintln!("{}", line),
        }
    }
}

impl BackupReporter for CliReporter {
    fn on_state_change(&self, state: BackupState) {
        match state {
            BackupState::LoadingBackupedFiles => self.spinner("Loading content index..."),
            BackupState::Walking => self.spinner("Walking folders..."),
            BackupState::Flushing => self.spinner("Writing catalog..."),
            BackupState::Finishing => self.spinner("Publishing and validating catalog..."),
            BackupState::NotStarted => {}
            _ => self.finish_bar(),
        }
    }

    fn on_item_start(&self, item: &str, total_files: usize) {
        self.bar(item, total_files);
    }

    fn on_item_progress(&self, _item: &str, processed: usize, total: usize) {
        self.position(processed, total);
    }

    fn on_file_error(&self, error: &FileError) {
        self.println(format!("  \x1b[33m!\x1b[0m {}", error));
    }
}

impl RestoreReporter for CliReporter {
    fn on_restore_start(&self, total_files: usize) {
        self.bar("Restoring", total_files);
    }

    fn on_restore_progress(&self, processed: usize, total: usize) {
        self.position(processed, total);
    }

    fn on_restore_error(&self, error: &RestoreError) {
        self.println(format!(
            "  \x1b[31m✗\x1b[0m {}: {}",
            error.path.display(),
            error.message
        ));
    }

    fn on_restore_complete(&self, _report: &strongbox_core::RestoreReport) {
        self.finish_bar();
    }
}

impl ValidationReporter for CliReporter {
    fn on_state_change(&self, state: ValidationState) {
        match state {
            ValidationState::ReadingCatalogs => self.spinner("Reading catalogs..."),
            ValidationState::LoadingHashes => self.bar("Hashing blobs", 0),
            ValidationState::SearchingErrorFiles => self.spinner("Comparing hashes..."),
            ValidationState::DeletingUnusedFiles => self.spinner("Removing unused blobs..."),
            ValidationState::Finished | ValidationState::Failed | ValidationState::Canceled => {
                self.finish_bar()
            }
            ValidationState::WaitForStart | ValidationState::Starting => {}
        }
    }

    fn on_hash_progress(&self, hashed: usize, total: usize) {
        self.position(hashed, total);
    }

    fn on_error_file(&self, file: &ErrorFile) {
        self.println(format!(
            "  \x1b[31m✗\x1b[0m {} ({})",
            file.stored_name, file.problem
        ));
    }
}
