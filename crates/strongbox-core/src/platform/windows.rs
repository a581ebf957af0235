use std::fs::Metadata;
use std::os::windows::fs::MetadataExt;
use std::path::Path;

const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;

pub fn is_hidden(_path: &Path, metadata: &Metadata) -> bool {
    metadata.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0
}
