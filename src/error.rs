use thiserror::Error;

/// Errors surfaced by atlas allocation and image management.
#[derive(Debug, Clone, Error)]
pub enum AtlasError {
    /// No atlas had room and a new one could not be created.
    #[error("atlas allocation failed: no space for {width}x{height} image")]
    AllocationFailed { width: u32, height: u32 },

    /// Source pixels could not be obtained (initial load or reload).
    #[error("failed to decode pixels for '{key}': {reason}")]
    Decode { key: String, reason: String },

    /// Dimensions that no placement path can accept.
    #[error("invalid image dimensions {width}x{height}")]
    Validation { width: u32, height: u32 },

    /// An internal invariant was violated. This is a bug, not bad input;
    /// callers should treat it as fatal for the affected atlas.
    #[error("atlas consistency violation: {0}")]
    Consistency(String),

    /// The graphics device rejected a surface operation.
    #[error("graphics device error: {0}")]
    Device(String),

    /// Lookup of an unknown image key or stale handle.
    #[error("unknown image '{0}'")]
    UnknownImage(String),
}

impl AtlasError {
    /// True for failures the selection policy may route around by trying
    /// another atlas. Everything else aborts the current placement.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AtlasError::AllocationFailed { .. })
    }
}

/// Outcome of a bulk reload walk after device loss.
///
/// Per-record failures never abort the walk; they evict the affected
/// record and are collected here.
#[derive(Debug, Default)]
pub struct ReloadReport {
    /// Records whose pixels were re-uploaded successfully.
    pub reloaded: usize,
    /// Keys evicted because their pixels could not be re-obtained.
    pub evicted: Vec<String>,
}

impl ReloadReport {
    pub fn is_clean(&self) -> bool {
        self.evicted.is_empty()
    }

    pub fn merge(&mut self, other: ReloadReport) {
        self.reloaded += other.reloaded;
        self.evicted.extend(other.evicted);
    }
}
