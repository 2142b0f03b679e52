use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Ok,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub path: PathBuf,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-item outcomes of one batch command. Items never abort the batch; the caller
/// decides the exit status from `has_failures`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub command: String,
    pub items: Vec<ItemReport>,
    /// Set when the batch stopped before visiting every item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<String>,
}

impl BatchReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            items: Vec::new(),
            stopped: None,
        }
    }

    pub fn ok(&mut self, path: &Path, detail: impl Into<Option<String>>) {
        let detail = detail.into();
        tracing::info!(path = %path.display(), detail = detail.as_deref().unwrap_or(""), "done");
        self.push(path, ItemStatus::Ok, detail);
    }

    pub fn skipped(&mut self, path: &Path, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::info!(path = %path.display(), %reason, "skipped");
        self.push(path, ItemStatus::Skipped, Some(reason));
    }

    pub fn failed(&mut self, path: &Path, error: &anyhow::Error) {
        tracing::warn!(path = %path.display(), "failed: {error:#}");
        self.push(path, ItemStatus::Failed, Some(format!("{error:#}")));
    }

    pub fn stop(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(%reason, "batch stopped early");
        self.stopped = Some(reason);
    }

    fn push(&mut self, path: &Path, status: ItemStatus, detail: Option<String>) {
        self.items.push(ItemReport {
            path: path.to_path_buf(),
            status,
            detail,
        });
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|item| item.status == status).count()
    }

    pub fn has_failures(&self) -> bool {
        self.stopped.is_some() || self.count(ItemStatus::Failed) > 0
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ok, {} skipped, {} failed",
            self.command,
            self.count(ItemStatus::Ok),
            self.count(ItemStatus::Skipped),
            self.count(ItemStatus::Failed)
        )?;
        if let Some(reason) = &self.stopped {
            write!(f, " (stopped: {reason})")?;
        }
        Ok(())
    }
}
