//! Sequential captioning of every clip in a folder.
//!
//! Existing caption files make re-runs cheap: with the default policy they
//! are left untouched and no frames are decoded for them.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::capture::{extract_frames, VideoDecoder};
use crate::config::CaptionSettings;
use crate::error::CaptionError;
use crate::vision::Captioner;

pub(crate) const VIDEO_EXTENSIONS: [&str; 6] = ["mp4", "mov", "avi", "webm", "mkv", "m4v"];
const CAPTION_EXTENSION: &str = "txt";
const SKIP_REASON: &str = "caption exists";

/// Case-insensitive check against [`VIDEO_EXTENSIONS`].
pub(crate) fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(extension))
        })
}

pub(crate) fn caption_path(video: &Path) -> PathBuf {
    video.with_extension(CAPTION_EXTENSION)
}

/// What to do when a clip already has a caption file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConflictPolicy {
    Skip,
    Overwrite,
    /// New caption first, then a blank line, then the old contents.
    Prepend,
}

impl ConflictPolicy {
    /// `prepend_existing` wins when both flags are set.
    pub(crate) fn from_flags(overwrite: bool, prepend_existing: bool) -> Self {
        match (overwrite, prepend_existing) {
            (_, true) => ConflictPolicy::Prepend,
            (true, false) => ConflictPolicy::Overwrite,
            (false, false) => ConflictPolicy::Skip,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BatchOptions {
    pub(crate) settings: CaptionSettings,
    pub(crate) conflict: ConflictPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ItemStatus {
    Skipped,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct BatchItemOutcome {
    pub(crate) file: String,
    pub(crate) status: ItemStatus,
    /// Skip reason, caption file written, or error message.
    pub(crate) detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct BatchReport {
    pub(crate) count: usize,
    pub(crate) results: Vec<BatchItemOutcome>,
}

impl BatchReport {
    fn push(&mut self, outcome: BatchItemOutcome) {
        self.results.push(outcome);
        self.count = self.results.len();
    }

    pub(crate) fn tally(&self, status: ItemStatus) -> usize {
        self.results
            .iter()
            .filter(|outcome| outcome.status == status)
            .count()
    }
}

/// Video files directly inside `folder`, sorted by file name. Symlinks are
/// followed. Entries that cannot be read are logged and skipped.
fn candidates(folder: &Path) -> Result<Vec<(String, PathBuf)>, CaptionError> {
    let entries = fs::read_dir(folder).map_err(|error| {
        warn!(folder = %folder.display(), %error, "cannot list folder");
        CaptionError::InvalidFolder(folder.to_path_buf())
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                warn!(folder = %folder.display(), %error, "skipping unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        if !is_video(&path) || !path.is_file() {
            continue;
        }
        files.push((entry.file_name().to_string_lossy().into_owned(), path));
    }
    files.sort();
    Ok(files)
}

/// Caption every clip in `folder`, one at a time.
///
/// Only an unusable `folder` fails the call. Per-file errors become
/// [`ItemStatus::Failed`] outcomes and the batch moves on.
pub(crate) async fn run_batch<D, C>(
    folder: &Path,
    options: &BatchOptions,
    decoder: &D,
    captioner: &C,
) -> Result<BatchReport, CaptionError>
where
    D: VideoDecoder,
    C: Captioner + ?Sized,
{
    if !folder.is_dir() {
        return Err(CaptionError::InvalidFolder(folder.to_path_buf()));
    }

    let files = candidates(folder)?;
    info!(folder = %folder.display(), files = files.len(), policy = ?options.conflict, "starting batch");

    let mut report = BatchReport::default();
    for (name, video) in files {
        let out = caption_path(&video);

        if options.conflict == ConflictPolicy::Skip && out.exists() {
            info!(file = %name, "caption exists, skipping");
            report.push(BatchItemOutcome {
                file: name,
                status: ItemStatus::Skipped,
                detail: SKIP_REASON.to_owned(),
            });
            continue;
        }

        let outcome = match caption_one(&video, &out, options, decoder, captioner).await {
            Ok(()) => {
                info!(file = %name, "captioned");
                BatchItemOutcome {
                    file: name,
                    status: ItemStatus::Succeeded,
                    detail: out
                        .file_name()
                        .map(|file_name| file_name.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                }
            }
            Err(error) => {
                warn!(file = %name, %error, "captioning failed");
                BatchItemOutcome {
                    file: name,
                    status: ItemStatus::Failed,
                    detail: error.to_string(),
                }
            }
        };
        report.push(outcome);
    }

    info!(
        succeeded = report.tally(ItemStatus::Succeeded),
        skipped = report.tally(ItemStatus::Skipped),
        failed = report.tally(ItemStatus::Failed),
        "batch finished"
    );
    Ok(report)
}

async fn caption_one<D, C>(
    video: &Path,
    out: &Path,
    options: &BatchOptions,
    decoder: &D,
    captioner: &C,
) -> Result<(), CaptionError>
where
    D: VideoDecoder,
    C: Captioner + ?Sized,
{
    let frames = extract_frames(decoder, video, options.settings.sampling)?;
    let caption = captioner.caption(&frames, &options.settings).await?;
    write_caption(out, caption.trim(), options.conflict)
}

fn write_caption(out: &Path, caption: &str, conflict: ConflictPolicy) -> Result<(), CaptionError> {
    let text = match conflict {
        ConflictPolicy::Prepend if out.exists() => {
            let previous = fs::read_to_string(out).unwrap_or_else(|error| {
                warn!(path = %out.display(), %error, "unreadable caption treated as empty");
                String::new()
            });
            if previous.is_empty() {
                caption.to_owned()
            } else {
                format!("{caption}\n\n{previous}")
            }
        }
        _ => caption.to_owned(),
    };
    fs::write(out, text)?;
    Ok(())
}
