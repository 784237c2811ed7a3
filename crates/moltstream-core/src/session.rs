//! Session log management.
//!
//! The conversation lives in a single markdown file, `session.md`, inside the
//! session directory. The editor appends turns to it; this module only owns
//! its lifecycle: creation with a header, size inspection, and rotation into
//! `archive/`. Rotation is always a rename, never a truncate.

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SESSION_FILE: &str = "session.md";
const ARCHIVE_DIR: &str = "archive";

/// Owns `session.md` and its archive directory.
#[derive(Debug, Clone)]
pub struct SessionManager {
    directory: PathBuf,
    max_size_bytes: u64,
    auto_archive: bool,
}

impl SessionManager {
    /// Create a manager rooted at `directory`, creating it and `archive/`.
    ///
    /// A leading `~` in `directory` is expanded.
    pub fn new<P: AsRef<Path>>(directory: P, max_size_bytes: u64, auto_archive: bool) -> Result<Self> {
        let raw = directory.as_ref().to_string_lossy().into_owned();
        let directory = PathBuf::from(shellexpand::tilde(&raw).into_owned());

        fs::create_dir_all(&directory)
            .with_context(|| format!("Failed to create session directory {:?}", directory))?;
        let archive_dir = directory.join(ARCHIVE_DIR);
        fs::create_dir_all(&archive_dir)
            .with_context(|| format!("Failed to create archive directory {:?}", archive_dir))?;

        Ok(Self {
            directory,
            max_size_bytes,
            auto_archive,
        })
    }

    pub fn session_path(&self) -> PathBuf {
        self.directory.join(SESSION_FILE)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.directory.join(ARCHIVE_DIR)
    }

    /// Make sure a session log exists and return its path.
    ///
    /// With auto-archive enabled, a log larger than the size threshold is
    /// archived and replaced by a fresh one.
    pub fn ensure_session(&self) -> Result<PathBuf> {
        let path = self.session_path();

        if !path.exists() {
            self.create_session(&path)?;
            return Ok(path);
        }

        if self.auto_archive {
            let size = self.size()?;
            if size > self.max_size_bytes {
                info!(size, threshold = self.max_size_bytes, "Rotating session log");
                self.archive().context("auto-archive")?;
                self.create_session(&path)?;
            }
        }

        Ok(path)
    }

    /// Move the current log into `archive/`. No-op when there is no log.
    ///
    /// Returns the archived file's path, if anything was moved.
    pub fn archive(&self) -> Result<Option<PathBuf>> {
        let src = self.session_path();
        if !src.exists() {
            debug!("No session log to archive");
            return Ok(None);
        }

        let dst = self.next_archive_path();
        fs::rename(&src, &dst)
            .with_context(|| format!("Failed to move {:?} to {:?}", src, dst))?;
        info!(path = %dst.display(), "Archived session log");
        Ok(Some(dst))
    }

    /// Current log size in bytes; 0 when no log exists.
    pub fn size(&self) -> Result<u64> {
        match fs::metadata(self.session_path()) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).context("Failed to stat session log"),
        }
    }

    fn create_session(&self, path: &Path) -> Result<()> {
        let header = format!(
            "<!-- moltstream session -->\n<!-- id: {} -->\n<!-- created: {} -->\n\n",
            uuid::Uuid::new_v4().simple(),
            Utc::now().to_rfc3339(),
        );
        fs::write(path, header)
            .with_context(|| format!("Failed to create session log {:?}", path))?;
        debug!(path = %path.display(), "Created session log");
        Ok(())
    }

    /// `archive/session-YYYY-MM-DD-HHMMSS.md`, suffixed `-N` if that name is taken.
    fn next_archive_path(&self) -> PathBuf {
        let stamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let dir = self.archive_dir();
        let mut candidate = dir.join(format!("session-{}.md", stamp));
        let mut n = 1;
        while candidate.exists() {
            candidate = dir.join(format!("session-{}-{}.md", stamp, n));
            n += 1;
        }
        candidate
    }
}
