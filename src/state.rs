use crate::model::progress::RenderProgress;
use crate::stages::StageKind;

/// Overall state of a render, derived from its shared record.
///
/// The success path is linear: `Pending → Invoking → ChunkRendering → Encoding → Cleanup →
/// DownloadReady → Downloaded`. `Failed` and `Abandoned` are reachable from any non-terminal
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderState {
    Pending,
    Invoking,
    ChunkRendering,
    Encoding,
    Cleanup,
    DownloadReady,
    Downloaded,
    Failed,
    Abandoned,
}

impl RenderState {
    pub fn from_progress(progress: &RenderProgress) -> Self {
        if progress.is_cancelled() {
            Self::Abandoned
        } else if progress.fatal_error_encountered() {
            Self::Failed
        } else if progress.is_downloaded() {
            Self::Downloaded
        } else if progress.is_stage_done(StageKind::Cleanup) {
            Self::DownloadReady
        } else if progress.is_stage_done(StageKind::Encoding) {
            Self::Cleanup
        } else if progress.is_stage_done(StageKind::Chunks) {
            Self::Encoding
        } else if progress.is_stage_done(StageKind::Invoke) {
            Self::ChunkRendering
        } else if progress.lambdas_invoked() > 0 {
            Self::Invoking
        } else {
            Self::Pending
        }
    }

    /// `DownloadReady` counts as terminal: nothing but the caller's download remains.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::DownloadReady | Self::Downloaded | Self::Failed | Self::Abandoned
        )
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::DownloadReady | Self::Downloaded)
    }

    /// Next state on the success path.
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Invoking),
            Self::Invoking => Some(Self::ChunkRendering),
            Self::ChunkRendering => Some(Self::Encoding),
            Self::Encoding => Some(Self::Cleanup),
            Self::Cleanup => Some(Self::DownloadReady),
            Self::DownloadReady => Some(Self::Downloaded),
            Self::Downloaded | Self::Failed | Self::Abandoned => None,
        }
    }

    /// States entered when moving from `self` to `target`, ending with `target`.
    ///
    /// Observers poll at coarse intervals and may see several transitions at once; walking the
    /// path keeps every intermediate state visible. A jump to `Failed`/`Abandoned`, or a target
    /// not ahead on the success path, yields just `[target]`.
    pub fn path_to(self, target: Self) -> Vec<Self> {
        if self == target {
            return Vec::new();
        }
        let mut path = Vec::new();
        let mut cur = self;
        while let Some(next) = cur.successor() {
            path.push(next);
            if next == target {
                return path;
            }
            cur = next;
        }
        vec![target]
    }
}

impl std::fmt::Display for RenderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Invoking => "INVOKING",
            Self::ChunkRendering => "CHUNK_RENDERING",
            Self::Encoding => "ENCODING",
            Self::Cleanup => "CLEANUP",
            Self::DownloadReady => "DOWNLOAD_READY",
            Self::Downloaded => "DOWNLOADED",
            Self::Failed => "FAILED",
            Self::Abandoned => "ABANDONED",
        };
        f.write_str(s)
    }
}
