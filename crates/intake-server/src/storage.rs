//! Intake and final storage directories.
//!
//! Uploads are written under the intake directory and moved into storage only once fully
//! received. Every path is built from a [`FileName`], so nothing here can escape either root.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use intake_proto::{FileName, is_reserved_name};

#[derive(Debug, Clone)]
pub struct StorageDirs {
    intake: PathBuf,
    storage: PathBuf,
}

impl StorageDirs {
    pub fn new(intake: impl Into<PathBuf>, storage: impl Into<PathBuf>) -> Self {
        Self {
            intake: intake.into(),
            storage: storage.into(),
        }
    }

    pub fn intake_dir(&self) -> &Path {
        &self.intake
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage
    }

    /// Create both directories up front so startup fails early on a bad path.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.intake)
            .with_context(|| format!("create intake dir {:?}", self.intake))?;
        fs::create_dir_all(&self.storage)
            .with_context(|| format!("create storage dir {:?}", self.storage))?;
        Ok(())
    }

    pub fn intake_path(&self, name: &FileName) -> PathBuf {
        self.intake.join(name.as_str())
    }

    pub fn storage_path(&self, name: &FileName) -> PathBuf {
        self.storage.join(name.as_str())
    }

    /// Create (or truncate) the intake file for `name`.
    pub fn create_intake_file(&self, name: &FileName) -> Result<(File, PathBuf)> {
        fs::create_dir_all(&self.intake)
            .with_context(|| format!("create intake dir {:?}", self.intake))?;
        let path = self.intake_path(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("create intake file {:?}", path))?;
        Ok((file, path))
    }

    /// Move a fully written intake file into storage, replacing any file of the same name.
    pub fn commit(&self, name: &FileName) -> Result<PathBuf> {
        fs::create_dir_all(&self.storage)
            .with_context(|| format!("create storage dir {:?}", self.storage))?;
        let src = self.intake_path(name);
        let dst = self.storage_path(name);
        move_file(&src, &dst).with_context(|| format!("move {:?} -> {:?}", src, dst))?;
        Ok(dst)
    }

    /// Find a file by name, preferring storage over intake.
    pub fn locate(&self, name: &FileName) -> Option<PathBuf> {
        [self.storage_path(name), self.intake_path(name)]
            .into_iter()
            .find(|path| path.is_file())
    }

    /// Sorted, de-duplicated file names across intake and storage.
    ///
    /// `filter` is a case-sensitive substring match. Reserved OS artifacts are hidden.
    pub fn list(&self, filter: Option<&str>) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        for dir in [&self.intake, &self.storage] {
            collect_file_names(dir, &mut names)
                .with_context(|| format!("list directory {:?}", dir))?;
        }
        Ok(names
            .into_iter()
            .filter(|name| !is_reserved_name(name))
            .filter(|name| filter.is_none_or(|f| name.contains(f)))
            .collect())
    }
}

fn collect_file_names(dir: &Path, out: &mut BTreeSet<String>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            out.insert(name.to_string());
        }
    }
    Ok(())
}

/// Rename when possible; fall back to copy + remove across filesystems.
fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::remove_file(dst) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst)?;
    fs::remove_file(src)
}
