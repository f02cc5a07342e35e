//! A directory of macro files with rolling backups.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{load, save_as, MacroFormat};
use crate::document::Macro;
use crate::errors::LibraryError;

/// Backups kept per macro file.
pub const MAX_BACKUPS: usize = 10;

const BACKUP_DIR: &str = "backups";

/// Listing entry for a stored macro.
#[derive(Debug, Clone, Serialize)]
pub struct MacroSummary {
    pub path: PathBuf,
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub step_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MacroLibrary {
    root: PathBuf,
    keep_backups: usize,
}

impl MacroLibrary {
    /// Opens (creating if needed) a library rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, LibraryError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| LibraryError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            keep_backups: MAX_BACKUPS,
        })
    }

    /// `~/.macroflow/macros`
    pub fn default_root() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".macroflow").join("macros"))
    }

    pub fn with_backup_limit(mut self, keep: usize) -> Self {
        self.keep_backups = keep;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File name a macro is stored under: sanitized name plus a short id.
    pub fn path_for(&self, document: &Macro, format: MacroFormat) -> PathBuf {
        let name: String = document
            .name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let short_id: String = document.id.chars().filter(|c| *c != '-').take(8).collect();
        self.root.join(format!("{name}_{short_id}.{}", format.extension()))
    }

    /// Saves into the library under its canonical file name.
    pub fn save(&self, document: &Macro) -> Result<PathBuf, LibraryError> {
        let path = self.path_for(document, MacroFormat::Json);
        self.save_to(document, &path)?;
        Ok(path)
    }

    /// Saves to an explicit path, backing up any file it replaces.
    pub fn save_to(&self, document: &Macro, path: &Path) -> Result<(), LibraryError> {
        if path.exists() {
            self.backup(path)?;
        }
        write_file(document, path)?;
        info!("Saved macro '{}' to {}", document.name, path.display());
        Ok(())
    }

    pub fn load(&self, path: &Path) -> Result<Macro, LibraryError> {
        read_file(path)
    }

    /// All readable macros in the library, most recently updated first.
    /// Files that fail to load are logged and skipped.
    pub fn list(&self) -> Result<Vec<MacroSummary>, LibraryError> {
        let entries = fs::read_dir(&self.root).map_err(|source| LibraryError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut summaries = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || !is_macro_file(&path) {
                continue;
            }
            match read_file(&path) {
                Ok(m) => summaries.push(MacroSummary {
                    step_count: m.step_count(),
                    path,
                    id: m.id,
                    name: m.name,
                    description: m.description,
                    created_at: m.created_at,
                    updated_at: m.updated_at,
                }),
                Err(e) => warn!("Skipping unreadable macro file {}: {}", path.display(), e),
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    /// Deletes a macro file. Returns `false` if it did not exist.
    pub fn delete(&self, path: &Path, backup: bool) -> Result<bool, LibraryError> {
        if !path.exists() {
            return Ok(false);
        }
        if backup {
            self.backup(path)?;
        }
        fs::remove_file(path).map_err(|source| LibraryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Deleted macro {}", path.display());
        Ok(true)
    }

    /// Copies an external macro file into the library under a fresh id.
    pub fn import(&self, path: &Path) -> Result<(Macro, PathBuf), LibraryError> {
        let mut document = read_file(path)?;
        document.id = crate::step::new_step_id();
        document.touch();
        let target = self.save(&document)?;
        info!("Imported {} as {}", path.display(), target.display());
        Ok((document, target))
    }

    /// Writes a macro outside the library; the encoding follows the extension.
    pub fn export(&self, document: &Macro, path: &Path) -> Result<(), LibraryError> {
        write_file(document, path)?;
        info!("Exported macro '{}' to {}", document.name, path.display());
        Ok(())
    }

    /// Backups of `path`, oldest first.
    pub fn backups_of(&self, path: &Path) -> Result<Vec<PathBuf>, LibraryError> {
        let dir = self.root.join(BACKUP_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = backup_prefix(path);
        let entries = fs::read_dir(&dir).map_err(|source| LibraryError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut found: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        found.sort();
        Ok(found)
    }

    fn backup(&self, path: &Path) -> Result<PathBuf, LibraryError> {
        let dir = self.root.join(BACKUP_DIR);
        fs::create_dir_all(&dir).map_err(|source| LibraryError::Io {
            path: dir.clone(),
            source,
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%6f");
        let target = dir.join(format!("{}{stamp}.{ext}", backup_prefix(path)));
        fs::copy(path, &target).map_err(|source| LibraryError::Io {
            path: target.clone(),
            source,
        })?;
        debug!("Backed up {} to {}", path.display(), target.display());

        let existing = self.backups_of(path)?;
        if existing.len() > self.keep_backups {
            for old in &existing[..existing.len() - self.keep_backups] {
                if let Err(e) = fs::remove_file(old) {
                    warn!("Failed to prune backup {}: {}", old.display(), e);
                }
            }
        }
        Ok(target)
    }
}

fn backup_prefix(path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("macro");
    format!("{stem}_backup_")
}

fn is_macro_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("json") | Some("yaml") | Some("yml")
    )
}

/// Reads and decodes a macro file.
pub fn read_file(path: &Path) -> Result<Macro, LibraryError> {
    let bytes = fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            LibraryError::NotFound(path.to_path_buf())
        } else {
            LibraryError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    load(&bytes).map_err(|source| LibraryError::Format {
        path: path.to_path_buf(),
        source,
    })
}

/// Encodes a macro (format from the extension) and writes it via a temp file.
pub fn write_file(document: &Macro, path: &Path) -> Result<(), LibraryError> {
    let format = MacroFormat::from_path(path);
    let bytes = save_as(document, format).map_err(|source| LibraryError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| LibraryError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &bytes).map_err(|source| LibraryError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| LibraryError::Io {
        path: path.to_path_buf(),
        source,
    })
}
