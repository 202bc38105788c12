//! Chunker tuning recommender: replays a folder through the chunker over a
//! grid of window triples and scores the dedupe each one achieves.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::warn;
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::chunking::fastcdc::{ChunkerParams, StreamingChunker};
use crate::error::{Error, Result};
use crate::hash::Hash32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TuningGoal {
    #[default]
    Dedupe,
    Throughput,
}

#[derive(Debug, Clone, Default)]
pub struct RecommendOptions {
    pub goal: TuningGoal,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone)]
pub struct RecommendedSettings {
    pub min: usize,
    pub avg: usize,
    pub max: usize,
    pub summary: String,
}

const GRID_MIN: usize = 1024;
const GRID_MAX: usize = 1 << 20;

fn trial_grid() -> Vec<ChunkerParams> {
    let sizes: Vec<usize> = std::iter::successors(Some(GRID_MIN), |&s| {
        (s < GRID_MAX).then_some(s * 2)
    })
    .collect();
    let mut grid = Vec::new();
    for &min in &sizes {
        for &avg in sizes.iter().filter(|&&a| a >= min) {
            for &max in sizes.iter().filter(|&&m| m >= avg) {
                grid.push(ChunkerParams { min, avg, max });
            }
        }
    }
    grid
}

#[derive(Debug, Clone, Copy)]
struct Trial {
    params: ChunkerParams,
    raw: u64,
    unique: u64,
    chunks: u64,
    unique_chunks: u64,
}

impl Trial {
    fn dedupe_ratio(&self) -> f64 {
        if self.unique == 0 {
            1.0
        } else {
            self.raw as f64 / self.unique as f64
        }
    }

    fn mean_size(&self) -> f64 {
        if self.chunks == 0 {
            0.0
        } else {
            self.raw as f64 / self.chunks as f64
        }
    }

    /// Dedupe: favor ratio, penalize the per-chunk overhead of tiny chunks.
    /// Throughput: favor ratio and larger chunks together.
    fn score(&self, goal: TuningGoal) -> f64 {
        if self.chunks == 0 {
            return 0.0;
        }
        let ratio = self.dedupe_ratio();
        let log_mean = self.mean_size().log2();
        match goal {
            TuningGoal::Dedupe => ratio / log_mean,
            TuningGoal::Throughput => ratio * log_mean,
        }
    }
}

fn run_trial(files: &[PathBuf], params: ChunkerParams, cancel: &CancelToken) -> Result<Trial> {
    let mut chunker = StreamingChunker::new(params);
    let mut seen: HashSet<Hash32> = HashSet::new();
    let mut chunk = Vec::with_capacity(params.avg);
    let mut trial = Trial {
        params,
        raw: 0,
        unique: 0,
        chunks: 0,
        unique_chunks: 0,
    };
    for path in files {
        cancel.bail_if_cancelled()?;
        let mut f = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable file");
                continue;
            }
        };
        chunker.reset();
        loop {
            let n = match chunker.next_chunk(&mut f, &mut chunk) {
                Ok(n) => n,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "read failed mid-file, skipping rest");
                    break;
                }
            };
            if n == 0 {
                break;
            }
            trial.raw += n as u64;
            trial.chunks += 1;
            if seen.insert(Hash32::of(&chunk[..n])) {
                trial.unique += n as u64;
                trial.unique_chunks += 1;
            }
        }
    }
    Ok(trial)
}

/// Scan `folder`, run the chunker over every `(min, avg, max)` triple of
/// powers of two in `[1 KiB, 1 MiB]` with `min <= avg <= max`, and pick the
/// best-scoring triple for the requested goal. Reads only; repeated runs
/// over unchanged content produce the same recommendation.
pub fn recommend_chunker_settings(
    folder: &Path,
    opts: &RecommendOptions,
) -> Result<RecommendedSettings> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(folder).follow_links(false) {
        match entry {
            Ok(e) if e.file_type().is_file() => files.push(e.path().to_path_buf()),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "skipping unreadable directory entry"),
        }
    }
    files.sort();
    if files.is_empty() {
        return Err(Error::NotFound(format!(
            "no files to sample under {}",
            folder.display()
        )));
    }

    let grid = trial_grid();
    let trials: Vec<Trial> = grid
        .par_iter()
        .map(|&params| run_trial(&files, params, &opts.cancel))
        .collect::<Result<Vec<_>>>()?;

    let mut best = trials[0];
    for t in &trials[1..] {
        if t.score(opts.goal) > best.score(opts.goal) {
            best = *t;
        }
    }

    let summary = format!(
        "recommended (min, avg, max) = ({}, {}, {}) for goal {:?}\n\
         trials: {} over {} files, {} bytes raw\n\
         winner: dedupe ratio {:.3}, mean chunk {:.0} bytes, {} chunks ({} unique), score {:.4}",
        best.params.min,
        best.params.avg,
        best.params.max,
        opts.goal,
        trials.len(),
        files.len(),
        best.raw,
        best.dedupe_ratio(),
        best.mean_size(),
        best.chunks,
        best.unique_chunks,
        best.score(opts.goal),
    );

    Ok(RecommendedSettings {
        min: best.params.min,
        avg: best.params.avg,
        max: best.params.max,
        summary,
    })
}
