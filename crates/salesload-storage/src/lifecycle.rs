//! Lifecycle areas: incoming -> claimed -> processed/<date> | rejected.
//!
//! Every relocation is a single `rename` inside one filesystem, so a file is
//! always visible in exactly one area. Existing files at a destination are
//! never overwritten; the newcomer gets the first free `<stem>.<n>.<ext>` name.
//! Releasing claims back to incoming never renames.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0} is no longer in the incoming area")]
    Vanished(PathBuf),
    #[error("{0} is already claimed; run `salesload recover` once no loader is running")]
    StaleClaim(PathBuf),
    #[error("creating directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("moving {from} -> {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A regular file found in the incoming area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFile {
    /// File name, lossily decoded for matching and logging.
    pub name: String,
    pub path: PathBuf,
}

/// A file moved into the claimed area by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedFile {
    pub name: String,
    /// Where the file was found; recorded as provenance on its sales lines.
    pub incoming_path: PathBuf,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LifecycleAreas {
    incoming: PathBuf,
    claimed: PathBuf,
    processed: PathBuf,
    rejected: PathBuf,
}

impl LifecycleAreas {
    pub fn new(
        incoming: impl Into<PathBuf>,
        claimed: impl Into<PathBuf>,
        processed: impl Into<PathBuf>,
        rejected: impl Into<PathBuf>,
    ) -> Self {
        Self {
            incoming: incoming.into(),
            claimed: claimed.into(),
            processed: processed.into(),
            rejected: rejected.into(),
        }
    }

    pub fn incoming(&self) -> &Path {
        &self.incoming
    }

    pub fn claimed(&self) -> &Path {
        &self.claimed
    }

    pub fn processed(&self) -> &Path {
        &self.processed
    }

    pub fn rejected(&self) -> &Path {
        &self.rejected
    }

    pub fn processed_dir_for(&self, date: NaiveDate) -> PathBuf {
        self.processed.join(date.format("%Y-%m-%d").to_string())
    }

    pub async fn prepare(&self) -> anyhow::Result<()> {
        for dir in [&self.incoming, &self.claimed, &self.processed, &self.rejected] {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    /// Regular files in the incoming area, in lexicographic name order.
    pub async fn list_incoming(&self) -> anyhow::Result<Vec<IncomingFile>> {
        list_regular_files(&self.incoming).await
    }

    /// Atomically take ownership of an incoming file before it is read.
    pub async fn claim(&self, file: &IncomingFile) -> Result<ClaimedFile, LifecycleError> {
        let target = self.claimed.join(file_name_of(&file.path));
        if fs::try_exists(&target).await.unwrap_or(false) {
            return Err(LifecycleError::StaleClaim(target));
        }
        match fs::rename(&file.path, &target).await {
            Ok(()) => Ok(ClaimedFile {
                name: file.name.clone(),
                incoming_path: file.path.clone(),
                path: target,
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(LifecycleError::Vanished(file.path.clone()))
            }
            Err(source) => Err(LifecycleError::Move {
                from: file.path.clone(),
                to: target,
                source,
            }),
        }
    }

    /// Reject an incoming file without claiming it (its name never matched).
    pub async fn reject_unclaimed(&self, file: &IncomingFile) -> Result<PathBuf, LifecycleError> {
        match relocate(&file.path, &self.rejected).await {
            Err(LifecycleError::Move { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Err(LifecycleError::Vanished(file.path.clone()))
            }
            other => other,
        }
    }

    pub async fn mark_processed(
        &self,
        file: &ClaimedFile,
        date: NaiveDate,
    ) -> Result<PathBuf, LifecycleError> {
        relocate(&file.path, &self.processed_dir_for(date)).await
    }

    pub async fn mark_rejected(&self, file: &ClaimedFile) -> Result<PathBuf, LifecycleError> {
        relocate(&file.path, &self.rejected).await
    }

    /// Return every claimed file to the incoming area under its original name.
    /// Only safe while no loader runs.
    ///
    /// A claim whose name is already taken in incoming stays where it is and is
    /// listed in `conflicts`; renaming it would break the `<shop>_<cash>` pattern.
    pub async fn release_claims(&self) -> anyhow::Result<ReleasedClaims> {
        let mut report = ReleasedClaims::default();
        for file in list_regular_files(&self.claimed).await? {
            let target = self.incoming.join(file_name_of(&file.path));
            if fs::try_exists(&target).await.unwrap_or(true) {
                report.conflicts.push(file.path);
                continue;
            }
            fs::rename(&file.path, &target)
                .await
                .map_err(|source| LifecycleError::Move {
                    from: file.path.clone(),
                    to: target.clone(),
                    source,
                })?;
            report.released.push(target);
        }
        Ok(report)
    }
}

/// Outcome of [`LifecycleAreas::release_claims`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleasedClaims {
    /// New locations in the incoming area.
    pub released: Vec<PathBuf>,
    /// Claimed files left in place because incoming already holds that name.
    pub conflicts: Vec<PathBuf>,
}

fn file_name_of(path: &Path) -> OsString {
    path.file_name()
        .map(OsStr::to_os_string)
        .unwrap_or_else(|| path.as_os_str().to_os_string())
}

async fn list_regular_files(dir: &Path) -> anyhow::Result<Vec<IncomingFile>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        // Follows symlinks, so a link to a regular file is picked up like the file itself.
        let is_file = fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        files.push(IncomingFile {
            name: entry.file_name().to_string_lossy().into_owned(),
            path,
        });
    }
    files.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    Ok(files)
}

/// First path in `dir` named `file_name`, or `<stem>.<n>.<ext>` for the smallest free `n`.
async fn free_destination(dir: &Path, file_name: &OsStr) -> PathBuf {
    let first = dir.join(file_name);
    if !fs::try_exists(&first).await.unwrap_or(false) {
        return first;
    }
    let as_path = Path::new(file_name);
    let stem = as_path.file_stem().unwrap_or(file_name).to_os_string();
    let ext = as_path.extension().map(OsStr::to_os_string);
    let mut n = 1u32;
    loop {
        let mut candidate = stem.clone();
        candidate.push(format!(".{n}"));
        if let Some(ext) = &ext {
            candidate.push(".");
            candidate.push(ext);
        }
        let path = dir.join(candidate);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return path;
        }
        n += 1;
    }
}

async fn relocate(from: &Path, dir: &Path) -> Result<PathBuf, LifecycleError> {
    fs::create_dir_all(dir)
        .await
        .map_err(|source| LifecycleError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
    let to = free_destination(dir, &file_name_of(from)).await;
    fs::rename(from, &to)
        .await
        .map_err(|source| LifecycleError::Move {
            from: from.to_path_buf(),
            to: to.clone(),
            source,
        })?;
    Ok(to)
}
