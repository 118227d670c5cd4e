use crate::errors::CheckpointError;
use git2::{
    DiffFormat, DiffOptions, IndexAddOption, ObjectType, Oid, Repository, ResetType, Signature,
    StatusOptions, build::CheckoutBuilder,
};
use std::path::Path;

/// Directory excluded from every commit, status check and clean.
pub const METADATA_DIR: &str = ".tandem";

/// Root-level file holding backend credentials. Never committed, never shown
/// to a role.
pub const SECRETS_FILE: &str = ".env";

pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Result<Self, CheckpointError> {
        let repo = Repository::open(project_dir)?;
        Ok(Self { repo })
    }

    /// Open the repository at `project_dir`, initialising one if missing, and
    /// make sure the metadata directory and secrets file are ignored.
    pub fn open_or_init(project_dir: &Path) -> Result<Self, CheckpointError> {
        let repo = match Repository::open(project_dir) {
            Ok(repo) => repo,
            Err(_) => Repository::init(project_dir)?,
        };
        let tracker = Self { repo };
        tracker.ensure_excluded()?;
        Ok(tracker)
    }

    fn ensure_excluded(&self) -> Result<(), CheckpointError> {
        let info = self.repo.path().join("info");
        let exclude = info.join("exclude");
        let entries = [format!("/{}/", METADATA_DIR), format!("/{}", SECRETS_FILE)];
        let current = std::fs::read_to_string(&exclude).unwrap_or_default();
        let missing: Vec<&String> = entries
            .iter()
            .filter(|entry| !current.lines().any(|l| l.trim() == entry.as_str()))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        for entry in missing {
            updated.push_str(entry);
            updated.push('\n');
        }
        std::fs::create_dir_all(&info)
            .and_then(|_| std::fs::write(&exclude, updated))
            .map_err(|source| CheckpointError::Clean {
                path: exclude.clone(),
                source,
            })
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn get_head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Get current HEAD SHA (returns None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        self.get_head_commit().map(|c| c.id().to_string())
    }

    /// Whether the working tree differs from HEAD, ignoring ignored files.
    pub fn is_dirty(&self) -> Result<bool, CheckpointError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Stage everything and commit it.
    ///
    /// Returns `None` without creating a commit when the staged tree equals
    /// HEAD's tree, so re-issuing a checkpoint for a committed tree is a
    /// no-op. An unborn branch always gets a commit, possibly of an empty
    /// tree.
    pub fn commit_all(&self, message: &str) -> Result<Option<String>, CheckpointError> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        // add_all does not stage deletions
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = self.get_head_commit();
        if let Some(parent) = &parent
            && parent.tree_id() == tree_id
        {
            return Ok(None);
        }
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now("tandem", "tandem@localhost")?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let commit_id = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(Some(commit_id.to_string()))
    }

    pub fn commit_exists(&self, sha: &str) -> bool {
        Oid::from_str(sha)
            .ok()
            .and_then(|oid| self.repo.find_commit(oid).ok())
            .is_some()
    }

    /// Move HEAD, index and working tree to `sha`, then delete untracked
    /// files so the workspace matches the checkpoint exactly. Ignored paths
    /// (including the metadata directory) survive.
    pub fn reset_hard(&self, sha: &str) -> Result<(), CheckpointError> {
        let oid = Oid::from_str(sha).map_err(|_| CheckpointError::UnknownCommit(sha.to_string()))?;
        let target = self
            .repo
            .find_object(oid, Some(ObjectType::Commit))
            .map_err(|_| CheckpointError::UnknownCommit(sha.to_string()))?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        self.repo
            .reset(&target, ResetType::Hard, Some(&mut checkout))?;
        self.clean_untracked()
    }

    fn clean_untracked(&self) -> Result<(), CheckpointError> {
        let Some(workdir) = self.repo.workdir() else {
            return Ok(());
        };
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(false)
            .include_ignored(false);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        for entry in statuses.iter() {
            if !entry.status().is_wt_new() {
                continue;
            }
            let Some(rel) = entry.path() else { continue };
            let path = workdir.join(rel);
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            result.map_err(|source| CheckpointError::Clean {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Unified diff from `since` (or the empty tree) to the working tree,
    /// untracked files included, limited to paths accepted by `include`.
    pub fn diff_since(
        &self,
        since: Option<&str>,
        include: impl Fn(&Path) -> bool,
    ) -> Result<String, CheckpointError> {
        let base_tree = match since {
            Some(sha) => {
                let oid =
                    Oid::from_str(sha).map_err(|_| CheckpointError::UnknownCommit(sha.to_string()))?;
                let commit = self
                    .repo
                    .find_commit(oid)
                    .map_err(|_| CheckpointError::UnknownCommit(sha.to_string()))?;
                Some(commit.tree()?)
            }
            None => None,
        };

        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);
        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(base_tree.as_ref(), Some(&mut opts))?;

        let mut buf = Vec::new();
        diff.print(DiffFormat::Patch, |delta, _hunk, line| {
            let path = delta.new_file().path().or_else(|| delta.old_file().path());
            if !path.is_some_and(|p| include(p)) {
                return true;
            }
            if matches!(line.origin(), '+' | '-' | ' ') {
                buf.push(line.origin() as u8);
            }
            buf.extend_from_slice(line.content());
            true
        })?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
