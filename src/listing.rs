//! Entry-list construction for the sender
//!
//! Each top-level argument becomes a root named after its final path
//! component; directories are walked in pre-order so every `CreateDirectory`
//! reaches the receiver before the files beneath it.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub kind: EntryKind,
    /// Path sent on the wire, relative to the receive root, `/`-separated.
    pub relative_path: String,
    pub absolute_path: PathBuf,
}

/// Expands the given paths into a flat send list.
pub fn build_entry_list(paths: &[PathBuf]) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for path in paths {
        add_root(path, &mut entries)?;
    }
    Ok(entries)
}

fn add_root(path: &Path, entries: &mut Vec<Entry>) -> Result<()> {
    let root = path
        .canonicalize()
        .with_context(|| format!("path `{}` does not exist", path.display()))?;
    let root_name = match root.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => bail!("path `{}` has no file name", path.display()),
    };

    for entry in WalkDir::new(&root).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk `{}`", root.display()))?;
        let relative_path = match entry.path().strip_prefix(&root) {
            Ok(rest) if rest.as_os_str().is_empty() => root_name.clone(),
            Ok(rest) => format!("{}/{}", root_name, to_wire_path(rest)),
            Err(_) => continue,
        };
        entries.push(Entry {
            kind: if entry.file_type().is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            },
            relative_path,
            absolute_path: entry.path().to_path_buf(),
        });
    }
    Ok(())
}

fn to_wire_path(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}
