use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::capabilities::{FileItem, McplServerConfig, ModelInfo};
use crate::protocol::ToolDefinition;

/// Last known capabilities of the endpoint.
///
/// Written only by the capability poller; everything else reads snapshots.
pub struct CapabilityCache {
    models: RwLock<Vec<ModelInfo>>,
    tools: RwLock<Vec<ToolDefinition>>,
    files: RwLock<Vec<FileItem>>,
    mcpl_servers: RwLock<Vec<McplServerConfig>>,
    interval_secs: u64,
    next_refresh_unix: AtomicU64,
    refreshing: AtomicBool,
}

impl CapabilityCache {
    #[must_use]
    pub fn new(interval_secs: u64) -> Self {
        Self {
            models: RwLock::new(Vec::new()),
            tools: RwLock::new(Vec::new()),
            files: RwLock::new(Vec::new()),
            mcpl_servers: RwLock::new(Vec::new()),
            interval_secs,
            next_refresh_unix: AtomicU64::new(0),
            refreshing: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn models(&self) -> Vec<ModelInfo> {
        self.models.read().clone()
    }

    #[must_use]
    pub fn tools(&self) -> Vec<ToolDefinition> {
        self.tools.read().clone()
    }

    #[must_use]
    pub fn files(&self) -> Vec<FileItem> {
        self.files.read().clone()
    }

    #[must_use]
    pub fn mcpl_servers(&self) -> Vec<McplServerConfig> {
        self.mcpl_servers.read().clone()
    }

    pub fn set_models(&self, models: Vec<ModelInfo>) {
        *self.models.write() = models;
    }

    pub fn set_tools(&self, tools: Vec<ToolDefinition>) {
        *self.tools.write() = tools;
    }

    pub fn set_files(&self, files: Vec<FileItem>) {
        *self.files.write() = files;
    }

    pub fn set_mcpl_servers(&self, servers: Vec<McplServerConfig>) {
        *self.mcpl_servers.write() = servers;
    }

    /// Claim the next refresh slot. Returns `false` while another refresh is
    /// running or the interval has not elapsed since the last one began.
    #[must_use]
    pub fn try_begin_refresh(&self, now: u64) -> bool {
        let next = self.next_refresh_unix.load(Ordering::Relaxed);
        if now < next {
            return false;
        }
        if self.refreshing.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.next_refresh_unix
            .store(now.saturating_add(self.interval_secs), Ordering::Relaxed);
        true
    }

    pub fn finish_refresh(&self) {
        self.refreshing.store(false, Ordering::Release);
    }

    /// Make the next [`CapabilityCache::try_begin_refresh`] succeed regardless
    /// of the interval, e.g. after the endpoint changed.
    pub fn invalidate(&self) {
        self.next_refresh_unix.store(0, Ordering::Relaxed);
    }
}
