//! Resource bundles holding the precompiled backend binaries.

pub mod extract;

use std::borrow::Cow;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

mod embedded {
    include!(concat!(env!("OUT_DIR"), "/embedded_backends.rs"));
}

/// Read-only source of packaged artifacts, addressed by bundle-relative path
/// (e.g. `backend/beacon-backend-linux-amd64`).
pub trait ResourceBundle: Send + Sync {
    /// `Ok(None)` when the bundle has no such resource.
    fn read(&self, path: &str) -> io::Result<Option<Cow<'_, [u8]>>>;

    /// Human readable origin, used in log lines.
    fn describe(&self) -> String;
}

/// Bundle rooted at a directory on disk (an unpacked plugin jar, a dev checkout).
#[derive(Debug, Clone)]
pub struct DirectoryBundle {
    root: PathBuf,
}

impl DirectoryBundle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ResourceBundle for DirectoryBundle {
    fn read(&self, path: &str) -> io::Result<Option<Cow<'_, [u8]>>> {
        let full = path
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |acc, part| acc.join(part));
        match std::fs::read(&full) {
            Ok(bytes) => Ok(Some(Cow::Owned(bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }
}

/// In-memory bundle. `builtin()` serves the artifacts `build.rs` embedded.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedBundle {
    entries: HashMap<String, Cow<'static, [u8]>>,
}

impl EmbeddedBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut bundle = Self::new();
        for (name, bytes) in embedded::BACKENDS {
            bundle.entries.insert((*name).to_string(), Cow::Borrowed(*bytes));
        }
        bundle
    }

    pub fn with_entry(mut self, path: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(path.to_string(), Cow::Owned(bytes.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ResourceBundle for EmbeddedBundle {
    fn read(&self, path: &str) -> io::Result<Option<Cow<'_, [u8]>>> {
        Ok(self.entries.get(path).map(|bytes| Cow::Borrowed(bytes.as_ref())))
    }

    fn describe(&self) -> String {
        format!("embedded bundle ({} artifacts)", self.entries.len())
    }
}
