//! Side-effect detection in the session workspace.
//!
//! The agent loop snapshots the workspace directory around every tool call;
//! files that appear or change in between are reported as artifacts. Only
//! regular files directly inside the directory are considered.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// Extensions shown inline as images.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp", "svg"];

/// File name to modification time.
pub type FileSnapshot = BTreeMap<String, SystemTime>;

/// Files created or modified between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceDiff {
    pub new: Vec<String>,
    pub modified: Vec<String>,
}

impl WorkspaceDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.modified.is_empty()
    }

    /// New and modified names, in that order.
    pub fn changed(&self) -> impl Iterator<Item = &str> {
        self.new.iter().chain(&self.modified).map(String::as_str)
    }
}

/// A file produced by a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub path: PathBuf,
}

/// Directory owned by one chat session.
#[derive(Debug, Clone)]
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create `<root>/<session_id>` and return it as a workspace.
    pub async fn create(root: &Path, session_id: &str) -> std::io::Result<Self> {
        let dir = root.join(session_id);
        tokio::fs::create_dir_all(&dir).await?;
        let dir = tokio::fs::canonicalize(&dir).await?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot off the async executor.
    pub async fn snapshot(&self) -> FileSnapshot {
        let dir = self.dir.clone();
        match tokio::task::spawn_blocking(move || snapshot(&dir)).await {
            Ok(snap) => snap,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Workspace snapshot task failed");
                FileSnapshot::new()
            }
        }
    }

    /// Split changed files into (images, other files).
    #[must_use]
    pub fn classify(&self, diff: &WorkspaceDiff) -> (Vec<Artifact>, Vec<Artifact>) {
        diff.changed()
            .map(|name| Artifact {
                name: name.to_string(),
                path: self.dir.join(name),
            })
            .partition(|a| is_image(&a.name))
    }
}

/// Regular files directly in `dir` with their mtimes. A missing directory
/// is an empty snapshot.
#[must_use]
pub fn snapshot(dir: &Path) -> FileSnapshot {
    let mut files = FileSnapshot::new();
    if !dir.is_dir() {
        return files;
    }

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let Ok(modified) = entry.metadata().map_err(std::io::Error::from).and_then(|m| m.modified()) else {
            continue;
        };
        files.insert(entry.file_name().to_string_lossy().into_owned(), modified);
    }
    files
}

/// Names present only in `after`, or present in both with a different mtime.
#[must_use]
pub fn diff(before: &FileSnapshot, after: &FileSnapshot) -> WorkspaceDiff {
    let mut out = WorkspaceDiff::default();
    for (name, mtime) in after {
        match before.get(name) {
            None => out.new.push(name.clone()),
            Some(prev) if prev != mtime => out.modified.push(name.clone()),
            Some(_) => {}
        }
    }
    out
}

#[must_use]
pub fn is_image(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|i| i.eq_ignore_ascii_case(ext)))
}

/// Read a file into a `data:` URL for inline model input.
pub async fn data_url(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    let mime_type = mime_guess::from_path(path).first_or_octet_stream();
    Ok(format!("data:{mime_type};base64,{}", STANDARD.encode(bytes)))
}
