//! Derivation of the multi-stage progress snapshot shown to presentation layers.
//!
//! [`make_multi_progress`] is a pure function of one [`RenderProgress`] record: polling the same
//! record twice yields identical snapshots.

use crate::model::errors::EnhancedErrorInfo;
use crate::model::progress::RenderProgress;
use crate::model::retry::ChunkRetry;
use crate::stages::cleanup::cleanup_progress;
use crate::stages::dispatch::{chunk_progress, invoke_progress};
use crate::stages::encoding::{encoding_progress, time_to_invoke};
use crate::stages::{StageKind, StageProgress};
use crate::state::RenderState;

/// Worker invocation progress plus the number of reissued invocations.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeProgress {
    #[serde(flatten)]
    pub progress: StageProgress,
    pub retries: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingProgress {
    #[serde(flatten)]
    pub progress: StageProgress,
    /// Chunk completion to first frame report; informational only.
    pub time_to_invoke: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupProgress {
    #[serde(flatten)]
    pub progress: StageProgress,
    pub min_files_to_delete: u32,
}

/// Boolean stage: the final artifact was downloaded or it was not.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub out_name: String,
    pub downloaded: bool,
}

impl DownloadProgress {
    pub fn ratio(&self) -> f64 {
        if self.downloaded { 1.0 } else { 0.0 }
    }
}

/// Read-only snapshot of every stage of one render. Hidden stages are `None`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiRenderProgress {
    pub state: RenderState,
    pub lambda_invoke_progress: Option<InvokeProgress>,
    pub chunk_progress: Option<StageProgress>,
    pub encoding_progress: Option<EncodingProgress>,
    pub cleanup_info: Option<CleanupProgress>,
    pub download_progress: Option<DownloadProgress>,
    pub errors: Vec<EnhancedErrorInfo>,
    /// Errors dropped because the record's error cap was reached.
    pub errors_overflowed: u64,
    pub retries: Vec<ChunkRetry>,
}

impl MultiRenderProgress {
    /// Single `0.0..=1.0` figure weighting every applicable stage equally. The download stage only
    /// counts when an output name was requested.
    pub fn overall_progress(&self) -> f64 {
        let stage = |p: Option<&StageProgress>| p.map_or(0.0, StageProgress::ratio);
        let mut sum = stage(self.lambda_invoke_progress.as_ref().map(|p| &p.progress))
            + stage(self.chunk_progress.as_ref())
            + stage(self.encoding_progress.as_ref().map(|p| &p.progress))
            + stage(self.cleanup_info.as_ref().map(|p| &p.progress));
        let mut stages = 4.0;
        if let Some(download) = &self.download_progress {
            sum += download.ratio();
            stages += 1.0;
        }
        (sum / stages).clamp(0.0, 1.0)
    }
}

/// A stage is shown once it has made progress or every stage it depends on has finished.
fn visible(progress: &RenderProgress, stage: StageKind, p: &StageProgress) -> bool {
    p.ratio() > 0.0
        || stage
            .prerequisites()
            .iter()
            .all(|&pre| progress.is_stage_done(pre))
}

fn shown(progress: &RenderProgress, stage: StageKind, p: StageProgress) -> Option<StageProgress> {
    visible(progress, stage, &p).then_some(p)
}

pub fn make_multi_progress(progress: &RenderProgress) -> MultiRenderProgress {
    let lambda_invoke_progress =
        shown(progress, StageKind::Invoke, invoke_progress(progress)).map(|p| InvokeProgress {
            progress: p,
            retries: progress.retries().len() as u32,
        });

    let chunk_progress = shown(progress, StageKind::Chunks, chunk_progress(progress));

    let encoding_progress = shown(progress, StageKind::Encoding, encoding_progress(progress))
        .map(|p| EncodingProgress {
            progress: p,
            time_to_invoke: time_to_invoke(progress),
        });

    let cleanup_info = cleanup_progress(progress)
        .and_then(|p| shown(progress, StageKind::Cleanup, p))
        .map(|p| CleanupProgress {
            progress: p,
            min_files_to_delete: progress
                .cleanup()
                .map(|c| c.min_files_to_delete())
                .unwrap_or(0),
        });

    let download_progress = progress
        .metadata()
        .and_then(|m| m.out_name.clone())
        .filter(|_| {
            StageKind::Download
                .prerequisites()
                .iter()
                .all(|&pre| progress.is_stage_done(pre))
        })
        .map(|out_name| DownloadProgress {
            out_name,
            downloaded: progress.is_downloaded(),
        });

    MultiRenderProgress {
        state: RenderState::from_progress(progress),
        lambda_invoke_progress,
        chunk_progress,
        encoding_progress,
        cleanup_info,
        download_progress,
        errors: progress.errors().entries().to_vec(),
        errors_overflowed: progress.errors().overflowed(),
        retries: progress.retries().entries().to_vec(),
    }
}
