//! Expand command-line inputs into a list of documents.

use walkdir::WalkDir;

use crate::prelude::*;

/// File suffixes we know how to read.
pub const SUPPORTED_SUFFIXES: &[&str] =
    &["png", "jpg", "jpeg", "tif", "tiff", "bmp", "webp", "pdf"];

/// The input name that means "read one document from standard input".
pub const STDIN_PATH: &str = "-";

/// Is this a document we can read, judging by its suffix?
pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SUPPORTED_SUFFIXES.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Expand files and directories into the documents we will process.
///
/// Files are kept in the order given. A directory expands to the supported
/// files directly inside it (or anywhere below it, if `recursive`), sorted by
/// path. Missing paths and unsupported files are skipped with a warning.
/// [`STDIN_PATH`] is passed through unchanged.
pub fn gather_paths(inputs: &[PathBuf], recursive: bool) -> Vec<PathBuf> {
    let mut paths = vec![];
    for input in inputs {
        if input.as_path() == Path::new(STDIN_PATH) {
            paths.push(input.clone());
        } else if input.is_dir() {
            let mut found = files_in_dir(input, recursive);
            found.sort();
            debug!(dir = %input.display(), count = found.len(), "Expanded directory");
            paths.extend(found);
        } else if input.is_file() {
            if is_supported(input) {
                paths.push(input.clone());
            } else {
                warn!(path = %input.display(), "Skipping unsupported file");
            }
        } else {
            warn!(path = %input.display(), "Skipping missing path");
        }
    }
    paths
}

/// Supported files inside `dir`, unsorted.
fn files_in_dir(dir: &Path, recursive: bool) -> Vec<PathBuf> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(dir = %dir.display(), "Cannot read directory entry: {err}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_supported(entry.path()))
        .map(|entry| entry.into_path())
        .collect()
}
