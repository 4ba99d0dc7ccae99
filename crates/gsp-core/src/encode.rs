//! Artifact encoders.
//!
//! Two interchangeable backends produce the SPZ sidecar from a PLY:
//! `gsbox p2z` and `3dgsconverter`. The converter backend falls back to
//! gsbox when the binary is missing or fails; gsbox gets a second chance
//! with a vertex-only rewrite when the PLY carries camera elements it
//! cannot parse. A separate `splat-transform` step produces the smaller
//! visibility-filtered PLY used by the share service.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{env_float, env_int, env_str};
use crate::ply;
use crate::tools::{resolve_bin, run_tool, ToolSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpzTool {
    GsBox,
    GsConverter,
}

#[derive(Debug, Clone)]
pub struct SpzExporter {
    pub enabled: bool,
    pub tool: SpzTool,
    pub gsbox_bin: String,
    pub gsbox_quality: i64,
    pub gsbox_version: i64,
    pub gsconverter_bin: String,
    pub gsconverter_compression_level: i64,
    pub timeout: Duration,
}

impl SpzExporter {
    pub fn from_env(enabled: bool) -> Self {
        let tool = match env_str("SPZ_TOOL", "3dgsconverter")
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "gsbox" => SpzTool::GsBox,
            _ => SpzTool::GsConverter,
        };
        Self {
            enabled,
            tool,
            gsbox_bin: env_str("GSBOX_BIN", "gsbox"),
            gsbox_quality: env_int("GSBOX_SPZ_QUALITY", 5),
            gsbox_version: env_int("GSBOX_SPZ_VERSION", 0),
            gsconverter_bin: env_str("GSCONVERTER_BIN", "3dgsconverter"),
            gsconverter_compression_level: env_int("GSCONVERTER_COMPRESSION_LEVEL", 6),
            timeout: Duration::from_secs_f64(env_float("SPZ_TIMEOUT_SECS", 900.0).max(1.0)),
        }
    }

    pub fn disabled() -> Self {
        let mut e = Self::from_env(false);
        e.enabled = false;
        e
    }

    fn gsbox_spec(&self, input: &Path, output: &Path) -> ToolSpec {
        let mut args = vec![
            "p2z".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
        ];
        if self.gsbox_quality > 0 {
            args.push("-q".to_string());
            args.push(self.gsbox_quality.to_string());
        }
        if self.gsbox_version > 0 {
            args.push("-ov".to_string());
            args.push(self.gsbox_version.to_string());
        }
        ToolSpec::new(resolve_bin(&self.gsbox_bin), args).timeout(self.timeout)
    }

    fn run_gsbox(&self, src: &Path, out: &Path) -> bool {
        // gsbox rejects PLYs carrying camera elements; hand it a
        // vertex-only rewrite up front when we can see that coming.
        let mut input = src.to_path_buf();
        if ply::has_non_vertex_elements(src) {
            if let Some(rewritten) = ply::make_vertex_only_binary(src) {
                tracing::debug!(
                    "spz: using vertex-only rewrite | ply={}",
                    src.display()
                );
                input = rewritten;
            }
        }
        match run_tool(&self.gsbox_spec(&input, out)) {
            Ok(()) if is_nonempty(out) => true,
            first_outcome => {
                // One more chance through the rewrite (covers parse errors
                // the header scan did not predict).
                if input == src {
                    if let Some(rewritten) = ply::make_vertex_only_binary(src) {
                        if run_tool(&self.gsbox_spec(&rewritten, out)).is_ok()
                            && is_nonempty(out)
                        {
                            return true;
                        }
                    }
                }
                if let Err(e) = first_outcome {
                    tracing::warn!("spz: gsbox failed | ply={} | err={e}", src.display());
                }
                false
            }
        }
    }

    fn run_gsconverter(&self, src: &Path, out: &Path) -> bool {
        let bin = resolve_bin(&self.gsconverter_bin);
        let args = vec![
            "-i".to_string(),
            src.display().to_string(),
            "-o".to_string(),
            out.display().to_string(),
            "-f".to_string(),
            "spz".to_string(),
            "--compression_level".to_string(),
            self.gsconverter_compression_level.to_string(),
            "--rgb".to_string(),
            "--force".to_string(),
        ];
        match run_tool(&ToolSpec::new(bin, args).timeout(self.timeout)) {
            Ok(()) if is_nonempty(out) => true,
            Ok(()) => false,
            Err(e) => {
                tracing::warn!(
                    "spz: 3dgsconverter failed, falling back to gsbox | err={e}"
                );
                false
            }
        }
    }

    /// Produce `<stem>.spz` next to the PLY. Reuses an existing non-empty
    /// output; returns `None` when disabled or when every backend failed
    /// (the sample then ships without the sidecar).
    pub fn maybe_export(&self, ply_path: &Path) -> Option<PathBuf> {
        if !self.enabled || !is_nonempty(ply_path) {
            return None;
        }
        let out = ply_path.with_extension("spz");
        if is_nonempty(&out) {
            return Some(out);
        }

        let ok = match self.tool {
            SpzTool::GsBox => self.run_gsbox(ply_path, &out),
            SpzTool::GsConverter => {
                self.run_gsconverter(ply_path, &out) || self.run_gsbox(ply_path, &out)
            }
        };
        if ok && is_nonempty(&out) {
            Some(out)
        } else {
            let _ = std::fs::remove_file(&out);
            None
        }
    }
}

/// Visibility-filtered small PLY for the share service, produced by
/// `splat-transform -w <src> --filter-visibility <n> <out>`.
pub fn make_small_ply(
    ply_path: &Path,
    splat_transform_bin: &str,
    filter_visibility: i64,
    timeout: Duration,
) -> Option<PathBuf> {
    if !is_nonempty(ply_path) {
        return None;
    }
    let stem = ply_path.file_stem()?.to_string_lossy();
    let out = ply_path.with_file_name(format!("{stem}.small.gsplat.ply"));
    if is_nonempty(&out) {
        return Some(out);
    }
    let spec = ToolSpec::new(
        resolve_bin(splat_transform_bin),
        vec![
            "-w".to_string(),
            ply_path.display().to_string(),
            "--filter-visibility".to_string(),
            filter_visibility.to_string(),
            out.display().to_string(),
        ],
    )
    .timeout(timeout);
    match run_tool(&spec) {
        Ok(()) if is_nonempty(&out) => Some(out),
        Ok(()) => None,
        Err(e) => {
            tracing::warn!("splat-transform failed | ply={} | err={e}", ply_path.display());
            None
        }
    }
}

fn is_nonempty(p: &Path) -> bool {
    std::fs::metadata(p)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}
