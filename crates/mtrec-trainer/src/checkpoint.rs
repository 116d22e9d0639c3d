//! Checkpoint directories under `save_dir`.

use mtrec_types::MtResult;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::model::MultiTaskModel;

pub const REPORT_FILE: &str = "report.json";

/// Create the first free `save_dir/run<N>` directory, N counting from 0.
pub fn allocate_run_dir(save_dir: &Path) -> MtResult<PathBuf> {
    fs::create_dir_all(save_dir)?;
    let mut n = 0usize;
    loop {
        let candidate = save_dir.join(format!("run{n}"));
        // Existing directories belong to earlier runs.
        match fs::create_dir(&candidate) {
            Ok(()) => {
                info!(path = %candidate.display(), "saving checkpoints");
                return Ok(candidate);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Save the model's weights and `report` into `dir`, replacing an earlier
/// checkpoint of the same run.
pub fn save_checkpoint<M, R>(dir: &Path, model: &M, report: &R) -> MtResult<()>
where
    M: MultiTaskModel + ?Sized,
    R: Serialize,
{
    model.save(dir)?;
    let json = serde_json::to_string_pretty(report)?;
    fs::write(dir.join(REPORT_FILE), json)?;
    Ok(())
}

/// Restore `model` from a checkpoint directory written by
/// [`save_checkpoint`] and return the report saved alongside it.
pub fn load_checkpoint<M>(dir: &Path, model: &mut M) -> MtResult<serde_json::Value>
where
    M: MultiTaskModel + ?Sized,
{
    let report = serde_json::from_slice(&fs::read(dir.join(REPORT_FILE))?)?;
    model.load(dir)?;
    info!(path = %dir.display(), "checkpoint loaded");
    Ok(report)
}
