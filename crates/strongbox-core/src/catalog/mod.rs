pub mod models;
pub mod reader;
pub mod writer;

pub use models::{CatalogFileEntry, DbFile, DbFolder, DbFolderFile};
pub use reader::CatalogReader;
pub use writer::CatalogWriter;
