//! Scan a local directory for files to upload (non-recursive).

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use intake_proto::FileName;

#[derive(Clone, Debug)]
pub struct UploadFile {
    pub path: PathBuf,
    pub name: FileName,
}

/// Regular files in `dir` whose names are valid on the wire, sorted by name.
///
/// OS artifacts such as `.DS_Store` are skipped; the server would ignore them anyway.
pub fn list_uploads(dir: &Path) -> Result<Vec<UploadFile>> {
    let mut out = Vec::new();

    for entry in fs::read_dir(dir).with_context(|| format!("read_dir {:?}", dir))? {
        let entry = entry.context("read_dir entry")?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(raw) = path.file_name().and_then(OsStr::to_str) else {
            tracing::warn!(path = ?path, "skipping file with non-UTF-8 name");
            continue;
        };
        let name = match FileName::parse(raw) {
            Ok(name) if name.is_reserved() => continue,
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "skipping file with unusable name");
                continue;
            }
        };

        out.push(UploadFile { path, name });
    }

    out.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
    Ok(out)
}
