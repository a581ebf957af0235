pub mod backup;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod error;
pub mod hasher;
pub mod layout;
pub mod pattern;
pub mod platform;
pub mod progress;
pub mod restore;
pub mod store;
pub mod validate;
pub mod walker;

pub use backup::{BackupOutcome, BackupResult, BackupState, BackupTask};
pub use cancel::CancelToken;
pub use catalog::{CatalogReader, CatalogWriter};
pub use config::{AppConfig, BackupItem, SubfolderMode};
pub use error::Error;
pub use layout::{list_catalogs, CatalogEntry};
pub use pattern::PathPattern;
pub use progress::{BackupReporter, RestoreReporter, SilentReporter, ValidationReporter};
pub use restore::{BackupFolder, RestoreReport, RestoreTask};
pub use store::ContentStore;
pub use validate::{BlobProblem, ValidationReport, ValidationState, ValidationTask};
pub use walker::{FileError, FileErrorKind};
