//! Workspace snapshots, restore and change detection
//!
//! A snapshot is a full copy of the project tree taken at a phase boundary.
//! Layout under the project root:
//!
//! ```text
//! .codehive/
//!   workspaces/{snapshot_id}/metadata.json
//!   workspaces/{snapshot_id}/files/{relative path}
//! ```
//!
//! Files are compared by SHA-256 content hash.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use codehive_core::config::STATE_DIR;
use codehive_core::fail_open::{fail_open, fail_open_with_retries};
use codehive_core::{Artifact, Clock, CodehiveError, Phase, Query, Result, TestCase};
use codehive_git::validate_identifier;
use codehive_store::CycleStore;

const WORKSPACES_DIR: &str = "workspaces";
const CYCLES_DIR: &str = "cycles";
const LOCKS_DIR: &str = "locks";
const METADATA_FILE: &str = "metadata.json";
const FILES_DIR: &str = "files";

/// One captured file; `path` is relative to the project root with `/` separators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    /// UTF-8 text content; `None` for binary files (bytes live in the snapshot copy)
    pub content: Option<String>,
    pub content_hash: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub id: String,
    pub cycle_id: String,
    pub branch_name: String,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    pub files: Vec<FileRecord>,
    #[serde(default)]
    pub tests: Vec<TestCase>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub queries: Vec<Query>,
}

impl WorkspaceSnapshot {
    pub fn file(&self, path: &str) -> Option<&FileRecord> {
        self.files.iter().find(|f| f.path == path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub change_type: ChangeType,
    pub content: Option<String>,
    pub old_content: Option<String>,
}

/// Changes from `previous` to `current`, sorted by path
///
/// Unchanged hashes produce no record.
pub fn diff_files(previous: &[FileRecord], current: &[FileRecord]) -> Vec<FileChange> {
    let before: BTreeMap<&str, &FileRecord> =
        previous.iter().map(|f| (f.path.as_str(), f)).collect();
    let after: BTreeMap<&str, &FileRecord> =
        current.iter().map(|f| (f.path.as_str(), f)).collect();

    let mut changes = Vec::new();
    for (path, new) in &after {
        match before.get(path) {
            None => changes.push(FileChange {
                path: path.to_string(),
                change_type: ChangeType::Create,
                content: new.content.clone(),
                old_content: None,
            }),
            Some(old) if old.content_hash != new.content_hash => changes.push(FileChange {
                path: path.to_string(),
                change_type: ChangeType::Modify,
                content: new.content.clone(),
                old_content: old.content.clone(),
            }),
            Some(_) => {}
        }
    }
    for (path, old) in &before {
        if !after.contains_key(path) {
            changes.push(FileChange {
                path: path.to_string(),
                change_type: ChangeType::Delete,
                content: None,
                old_content: old.content.clone(),
            });
        }
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Snapshot store for one project root
pub struct WorkspaceManager {
    root: PathBuf,
    excludes: Vec<String>,
    cycles: Option<CycleStore>,
    clock: Arc<dyn Clock>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, excludes: Vec<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            excludes,
            cycles: None,
            clock,
        }
    }

    /// Attach cycle records so snapshots carry tests, artifacts and queries
    pub fn with_cycle_store(mut self, cycles: CycleStore) -> Self {
        self.cycles = Some(cycles);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    fn workspaces_dir(&self) -> PathBuf {
        self.state_dir().join(WORKSPACES_DIR)
    }

    fn snapshot_dir(&self, snapshot_id: &str) -> PathBuf {
        self.workspaces_dir().join(snapshot_id)
    }

    /// Directory of a caller-supplied snapshot id; the id must be a single plain name
    fn checked_snapshot_dir(&self, snapshot_id: &str) -> Result<PathBuf> {
        validate_identifier(snapshot_id, "snapshot_id")?;
        if snapshot_id.starts_with('.') {
            return Err(CodehiveError::Validation(format!(
                "snapshot_id cannot start with '.': '{}'",
                snapshot_id
            )));
        }
        Ok(self.snapshot_dir(snapshot_id))
    }

    /// Create the state directories and keep them out of git
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn initialize(&self) -> Result<()> {
        for dir in [CYCLES_DIR, WORKSPACES_DIR, LOCKS_DIR] {
            fs::create_dir_all(self.state_dir().join(dir)).await?;
        }

        let gitignore = self.root.join(".gitignore");
        let entry = format!("{}/", STATE_DIR);
        let existing = match fs::read_to_string(&gitignore).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        if existing.lines().any(|line| line.trim() == entry || line.trim() == STATE_DIR) {
            debug!(".gitignore already ignores {}", STATE_DIR);
            return Ok(());
        }

        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&entry);
        updated.push('\n');
        fs::write(&gitignore, updated).await?;

        info!("Initialized workspace state in {}", self.state_dir().display());
        Ok(())
    }

    /// Write generated content to `relative` under the project root
    pub async fn write_file(&self, relative: &str, content: &str) -> Result<PathBuf> {
        let path = Path::new(relative);
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if relative.is_empty() || escapes {
            return Err(CodehiveError::Validation(format!(
                "Path must stay inside the project: '{}'",
                relative
            )));
        }
        if self.is_excluded(path) {
            return Err(CodehiveError::Validation(format!(
                "Path is inside an excluded directory: '{}'",
                relative
            )));
        }

        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, content).await?;
        debug!("Wrote {}", relative);
        Ok(target)
    }

    fn is_excluded(&self, relative: &Path) -> bool {
        relative.components().any(|c| match c {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                name == STATE_DIR || name == ".git" || self.excludes.iter().any(|e| *e == name)
            }
            _ => false,
        })
    }

    /// Every regular file under the root, with its bytes, sorted by path
    async fn scan_tree(&self) -> Result<Vec<(FileRecord, Vec<u8>)>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let relative = match path.strip_prefix(&self.root) {
                    Ok(r) => r.to_path_buf(),
                    Err(_) => continue,
                };
                if self.is_excluded(&relative) {
                    continue;
                }

                let meta = fs::symlink_metadata(&path).await?;
                if meta.file_type().is_symlink() {
                    debug!("Skipping symlink {}", relative.display());
                    continue;
                }
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }

                let bytes = fs::read(&path).await?;
                let last_modified = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                let record = FileRecord {
                    path: relative_key(&relative),
                    content: String::from_utf8(bytes.clone()).ok(),
                    content_hash: hash_bytes(&bytes),
                    size: meta.len(),
                    last_modified,
                };
                files.push((record, bytes));
            }
        }

        files.sort_by(|a, b| a.0.path.cmp(&b.0.path));
        Ok(files)
    }

    async fn current_files(&self) -> Result<Vec<FileRecord>> {
        Ok(self
            .scan_tree()
            .await?
            .into_iter()
            .map(|(record, _)| record)
            .collect())
    }

    /// Capture the project tree as `snapshot-{cycle_id}-{millis}`
    #[instrument(skip(self))]
    pub async fn create_snapshot(
        &self,
        cycle_id: &str,
        branch_name: &str,
        phase: Phase,
    ) -> Result<WorkspaceSnapshot> {
        fs::create_dir_all(self.workspaces_dir()).await?;

        // Two snapshots in the same millisecond get consecutive ids
        let mut millis = self.clock.now_millis();
        let mut id = format!("snapshot-{}-{}", cycle_id, millis);
        while fs::try_exists(self.snapshot_dir(&id)).await? {
            millis += 1;
            id = format!("snapshot-{}-{}", cycle_id, millis);
        }

        let dir = self.snapshot_dir(&id);
        let files_dir = dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir).await?;

        let scanned = self.scan_tree().await?;
        let mut files = Vec::with_capacity(scanned.len());
        for (record, bytes) in scanned {
            let target = files_dir.join(&record.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&target, &bytes).await?;
            files.push(record);
        }

        let (tests, artifacts, queries) = self.cycle_metadata(cycle_id).await;
        let snapshot = WorkspaceSnapshot {
            id,
            cycle_id: cycle_id.to_string(),
            branch_name: branch_name.to_string(),
            phase,
            created_at: self.clock.now(),
            files,
            tests,
            artifacts,
            queries,
        };

        let metadata = serde_json::to_vec_pretty(&snapshot)?;
        fs::write(dir.join(METADATA_FILE), metadata).await?;

        info!(
            snapshot_id = %snapshot.id,
            files = snapshot.files.len(),
            "Created snapshot"
        );
        Ok(snapshot)
    }

    async fn cycle_metadata(&self, cycle_id: &str) -> (Vec<TestCase>, Vec<Artifact>, Vec<Query>) {
        let Some(cycles) = &self.cycles else {
            return Default::default();
        };
        match fail_open("snapshot cycle metadata", || cycles.details(cycle_id)).await {
            Some(details) => (details.tests, details.artifacts, details.queries),
            None => Default::default(),
        }
    }

    pub async fn get_snapshot(&self, snapshot_id: &str) -> Result<WorkspaceSnapshot> {
        let path = self.checked_snapshot_dir(snapshot_id)?.join(METADATA_FILE);
        let bytes = fs::read(&path)
            .await
            .map_err(|_| CodehiveError::SnapshotNotFound(snapshot_id.to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| CodehiveError::SnapshotNotFound(snapshot_id.to_string()))
    }

    /// Snapshots oldest first, optionally only those of one cycle
    pub async fn list_snapshots(&self, cycle_id: Option<&str>) -> Result<Vec<WorkspaceSnapshot>> {
        let dir = self.workspaces_dir();
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let id = entry.file_name().to_string_lossy().to_string();
            match self.get_snapshot(&id).await {
                Ok(snapshot) => {
                    if cycle_id.map_or(true, |c| snapshot.cycle_id == c) {
                        snapshots.push(snapshot);
                    }
                }
                Err(_) => debug!("Skipping unreadable snapshot {}", id),
            }
        }

        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(snapshots)
    }

    /// Copy every captured file back to its original path
    #[instrument(skip(self))]
    pub async fn restore_snapshot(&self, snapshot_id: &str) -> Result<WorkspaceSnapshot> {
        let snapshot = self.get_snapshot(snapshot_id).await?;
        let files_dir = self.checked_snapshot_dir(snapshot_id)?.join(FILES_DIR);

        for record in &snapshot.files {
            let target = self.root.join(&record.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            let source = files_dir.join(&record.path);
            match fs::read(&source).await {
                Ok(bytes) => fs::write(&target, bytes).await?,
                Err(e) => match &record.content {
                    Some(text) => {
                        warn!("Snapshot copy of {} missing, using recorded text", record.path);
                        fs::write(&target, text).await?
                    }
                    None => return Err(e.into()),
                },
            }
        }

        info!(
            snapshot_id = %snapshot_id,
            files = snapshot.files.len(),
            "Restored snapshot"
        );
        Ok(snapshot)
    }

    /// Changes in the current tree since `previous_snapshot_id`
    #[instrument(skip(self))]
    pub async fn analyze_changes(
        &self,
        cycle_id: &str,
        previous_snapshot_id: Option<&str>,
    ) -> Result<Vec<FileChange>> {
        let Some(previous_id) = previous_snapshot_id else {
            return Ok(Vec::new());
        };
        let previous = self.get_snapshot(previous_id).await?;
        if previous.cycle_id != cycle_id {
            debug!(
                "Snapshot {} belongs to cycle {}, comparing anyway",
                previous_id, previous.cycle_id
            );
        }

        let current = self.current_files().await?;
        Ok(diff_files(&previous.files, &current))
    }

    /// Paths changed by both cycles since each one's first snapshot
    ///
    /// A cycle's changes run from its earliest snapshot to its latest one,
    /// or to the current tree when it has only one snapshot.
    #[instrument(skip(self))]
    pub async fn detect_conflicts(&self, cycle_a: &str, cycle_b: &str) -> Result<Vec<String>> {
        let a = self.changed_paths(cycle_a).await?;
        let b = self.changed_paths(cycle_b).await?;
        let conflicts: Vec<String> = a.intersection(&b).cloned().collect();

        if !conflicts.is_empty() {
            warn!(
                "Cycles {} and {} both changed {} files",
                cycle_a,
                cycle_b,
                conflicts.len()
            );
        }
        Ok(conflicts)
    }

    async fn changed_paths(&self, cycle_id: &str) -> Result<BTreeSet<String>> {
        let snapshots = self.list_snapshots(Some(cycle_id)).await?;
        let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) else {
            return Ok(BTreeSet::new());
        };

        let changes = if snapshots.len() > 1 {
            diff_files(&first.files, &last.files)
        } else {
            diff_files(&first.files, &self.current_files().await?)
        };
        Ok(changes.into_iter().map(|c| c.path).collect())
    }

    /// Remove snapshots created more than `retention_days` ago
    ///
    /// Snapshots with unreadable metadata are left alone.
    #[instrument(skip(self))]
    pub async fn cleanup_old_snapshots(&self, retention_days: u32) -> Result<usize> {
        let dir = self.workspaces_dir();
        if !fs::try_exists(&dir).await? {
            return Ok(0);
        }
        let cutoff = self.clock.now() - ChronoDuration::days(i64::from(retention_days));

        let mut removed = 0;
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let id = entry.file_name().to_string_lossy().to_string();
            let Some(snapshot) = fail_open("snapshot metadata read", || self.get_snapshot(&id)).await
            else {
                continue;
            };
            if snapshot.created_at >= cutoff {
                continue;
            }

            let path = entry.path();
            let deleted = fail_open_with_retries(
                "snapshot removal",
                || {
                    let path = path.clone();
                    async move { fs::remove_dir_all(&path).await.map_err(CodehiveError::from) }
                },
                3,
            )
            .await;
            if deleted.is_some() {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Removed {} snapshots older than {} days", removed, retention_days);
        }
        Ok(removed)
    }
}

fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
