//! Invocation of the external Hugin `cpfind` control-point detector.
//!
//! `cpfind` is treated as an opaque "find matching points between two
//! images" service. Its RANSAC does not understand a camera that only
//! shifts, so the first attempt runs with `--ransacmode=rpy`; when that
//! yields nothing, a plain run is tried as a last resort. A missing or
//! failing binary is not an error — the caller falls back to brute-force
//! matching.

use std::path::Path;
use std::process::Command;

use crate::progress::Progress;
use crate::pto::{load_control_points, PtoControlPoint};
use crate::CoreResult;

/// Run cpfind over `pto_in`, producing `pto_out`. Returns `None` when the
/// tool is absent or failed, `Some(points)` otherwise.
pub fn run(
    pto_in: &Path,
    pto_out: &Path,
    progress: Option<&Progress>,
) -> CoreResult<Option<Vec<PtoControlPoint>>> {
    for ransac_rpy in [true, false] {
        if let Some(p) = progress {
            p.set_task("executing cpfind", 1);
        }
        let mut cmd = Command::new("cpfind");
        cmd.arg("--fullscale");
        if ransac_rpy {
            cmd.arg("--ransacmode=rpy");
        }
        cmd.arg(pto_in).arg("-o").arg(pto_out);
        let status = match cmd.status() {
            Ok(s) => s,
            Err(e) => {
                if let Some(p) = progress {
                    p.pause_stdout();
                }
                tracing::warn!(error = %e, "failed to execute cpfind");
                if let Some(p) = progress {
                    p.resume_stdout();
                }
                return Ok(None);
            }
        };
        if !status.success() {
            tracing::warn!(?status, "cpfind exited with failure");
            continue;
        }
        match load_control_points(pto_out) {
            Ok(points) if !points.is_empty() => return Ok(Some(points)),
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "could not parse cpfind output");
                continue;
            }
        }
    }
    Ok(None)
}
