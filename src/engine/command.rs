//! Engine adapter that drives an external program through generated batch scripts.
//!
//! Every job writes a MATLAB batch script into the job's scratch directory
//! and launches `<command> <args..> <script>` there. The default command is
//! the standalone SPM12 runtime, which executes the script in `script` mode.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::EngineError;
use crate::pipeline::config::{EngineConfig, Interpolation, ResampleSpec};

use super::outputs::{OutputKey, OutputRole};
use super::{EngineJob, EngineSettings, StructuralEngine};

/// Name of the generated preprocessing batch script.
pub const BATCH_SCRIPT: &str = "vbm_batch.m";

const VERSION_SCRIPT: &str = "vbm_version.m";
const RESAMPLE_SCRIPT: &str = "vbm_resample.m";

/// Upper bound on the version probe and series conversion.
const AUXILIARY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Bytes of stderr kept in error messages.
const STDERR_TAIL: usize = 2000;

/// Engine that shells out to an external preprocessing program.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    config: EngineConfig,
}

impl CommandEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Writes `body` to `working_dir/script_name` and runs it.
    async fn run_script(
        &self,
        script_name: &str,
        body: &str,
        working_dir: &Path,
    ) -> Result<Output, EngineError> {
        let script_path = working_dir.join(script_name);
        tokio::fs::write(&script_path, body).await?;

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .arg(&script_path)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            command = %self.config.command,
            script = %script_path.display(),
            "Launching engine"
        );

        let output = cmd
            .output()
            .await
            .map_err(|e| EngineError::Spawn(self.config.command.clone(), e.to_string()))?;

        if !output.status.success() {
            return Err(EngineError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL),
            });
        }

        Ok(output)
    }
}

#[async_trait]
impl StructuralEngine for CommandEngine {
    fn name(&self) -> &str {
        "command"
    }

    async fn version(&self) -> Result<String, EngineError> {
        let scratch = tempfile::Builder::new().prefix("vbm-version-").tempdir()?;
        let body = "[name, release] = spm('Ver');\nfprintf('%s.%s\\n', strrep(name, 'SPM', ''), release);\n";

        let output = match tokio::time::timeout(
            AUXILIARY_TIMEOUT,
            self.run_script(VERSION_SCRIPT, body, scratch.path()),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(EngineError::Timeout(AUXILIARY_TIMEOUT)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .unwrap_or_default()
            .to_string();
        info!(version = %version, "Engine version");
        Ok(version)
    }

    async fn run_preprocess(
        &self,
        job: &EngineJob,
        settings: &EngineSettings,
    ) -> Result<(), EngineError> {
        let start = Instant::now();
        let script = preprocess_script(job, settings);
        self.run_script(BATCH_SCRIPT, &script, &job.scratch_dir).await?;
        info!(
            input = %job.input.display(),
            duration_secs = start.elapsed().as_secs_f64(),
            "Engine preprocessing finished"
        );
        Ok(())
    }

    async fn import_series(&self, series_dir: &Path, dest_dir: &Path) -> Result<PathBuf, EngineError> {
        let converter = self
            .config
            .series_converter
            .as_deref()
            .ok_or_else(|| EngineError::Unsupported("device series import".to_string()))?;

        let mut cmd = Command::new(converter);
        cmd.args(["-z", "n", "-f", "series", "-o"])
            .arg(dest_dir)
            .arg(series_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(AUXILIARY_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(EngineError::Spawn(converter.to_string(), e.to_string())),
            Err(_) => return Err(EngineError::Timeout(AUXILIARY_TIMEOUT)),
        };

        if !output.status.success() {
            return Err(EngineError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL),
            });
        }

        first_volume(dest_dir).ok_or_else(|| EngineError::IncompleteOutput {
            missing: vec!["series.nii".to_string()],
        })
    }

    async fn resample(
        &self,
        input: &Path,
        output: &Path,
        spec: &ResampleSpec,
    ) -> Result<(), EngineError> {
        let scratch = tempfile::Builder::new().prefix("vbm-resample-").tempdir()?;
        self.run_script(RESAMPLE_SCRIPT, &resample_script(input, output, spec), scratch.path())
            .await?;

        if !output.is_file() {
            return Err(EngineError::IncompleteOutput {
                missing: vec![output.display().to_string()],
            });
        }
        Ok(())
    }
}

/// First `.nii` file directly inside `dir`, in name order.
fn first_volume(dir: &Path) -> Option<PathBuf> {
    let mut volumes: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.is_file() && p.extension().map(|e| e == "nii").unwrap_or(false))
        .collect();
    if volumes.is_empty() {
        warn!(dir = %dir.display(), "Series conversion produced no volume");
        return None;
    }
    volumes.sort();
    volumes.into_iter().next()
}

fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

/// Quotes a path as a MATLAB character array.
fn quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "''"))
}

fn vector(values: &[f64]) -> String {
    let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(" "))
}

fn flag(on: bool) -> u8 {
    u8::from(on)
}

/// Builds the reorient, segment and smooth batch for one job.
pub fn preprocess_script(job: &EngineJob, settings: &EngineSettings) -> String {
    let reoriented = job.output_dir.join(OutputKey::reoriented().file_name());
    let mut s = String::new();

    s.push_str("spm('defaults', 'FMRI');\nspm_jobman('initcfg');\n");
    s.push_str(&format!("copyfile({}, {});\n", quote(&job.input), quote(&reoriented)));

    // 1: reorient in place
    s.push_str(&format!(
        "matlabbatch{{1}}.spm.util.reorient.srcfiles = {{[{} ',1']}};\n",
        quote(&reoriented)
    ));
    match &settings.transform_matrix {
        Some(mat) => s.push_str(&format!(
            "matlabbatch{{1}}.spm.util.reorient.transform.transF = {{{}}};\n",
            quote(mat)
        )),
        None => s.push_str("matlabbatch{1}.spm.util.reorient.transform.transM = eye(4);\n"),
    }
    s.push_str("matlabbatch{1}.spm.util.reorient.prefix = '';\n");

    // 2: segment and normalise
    let seg = "matlabbatch{2}.spm.spatial.preproc";
    s.push_str(&format!(
        "{seg}.channel.vols = {{[{} ',1']}};\n",
        quote(&reoriented)
    ));
    s.push_str(&format!("{seg}.channel.biasreg = {};\n", settings.bias_regularisation));
    s.push_str(&format!("{seg}.channel.biasfwhm = {};\n", settings.bias_fwhm));
    s.push_str(&format!("{seg}.channel.write = [0 0];\n"));
    for (i, tissue) in settings.tissues.iter().enumerate() {
        let t = format!("{seg}.tissue({})", i + 1);
        s.push_str(&format!(
            "{t}.tpm = {{[{} ',{}']}};\n",
            quote(&settings.tissue_probability_map),
            tissue.index
        ));
        s.push_str(&format!("{t}.ngaus = {};\n", tissue.gaussians));
        s.push_str(&format!(
            "{t}.native = [{} {}];\n",
            flag(tissue.save_native),
            flag(tissue.save_dartel)
        ));
        s.push_str(&format!(
            "{t}.warped = [{} {}];\n",
            flag(tissue.save_normalized),
            flag(tissue.save_modulated)
        ));
    }
    s.push_str(&format!("{seg}.warp.write = [0 0];\n"));

    // 3: smooth warped (and optionally modulated) maps
    let mut to_smooth = Vec::new();
    for tissue in &settings.tissues {
        if tissue.save_normalized {
            to_smooth.push(OutputKey::tissue(OutputRole::Normalized, tissue.index));
        }
        if tissue.save_modulated && settings.smooth_modulated {
            to_smooth.push(OutputKey::tissue(OutputRole::Modulated, tissue.index));
        }
    }
    if !to_smooth.is_empty() {
        let files: Vec<String> = to_smooth
            .iter()
            .map(|k| quote(&job.output_dir.join(k.file_name())))
            .collect();
        s.push_str(&format!(
            "matlabbatch{{3}}.spm.spatial.smooth.data = {{{}}};\n",
            files.join("; ")
        ));
        s.push_str(&format!(
            "matlabbatch{{3}}.spm.spatial.smooth.fwhm = {};\n",
            vector(&settings.fwhm)
        ));
        s.push_str("matlabbatch{3}.spm.spatial.smooth.prefix = 's';\n");
    }

    s.push_str("spm_jobman('run', matlabbatch);\n");
    s
}

/// Builds a reslice script writing `output` at the requested voxel size.
pub fn resample_script(input: &Path, output: &Path, spec: &ResampleSpec) -> String {
    let hold = match spec.method {
        Interpolation::Nearest | Interpolation::Trilinear => spec.method.order() as i32,
        Interpolation::Spline => -(spec.method.order() as i32),
    };
    format!(
        "V = spm_vol({input});\n\
         vx = {vx};\n\
         bb = spm_get_bbox(V);\n\
         dim = round(diff(bb) ./ vx) + 1;\n\
         VO = V;\n\
         VO.fname = {output};\n\
         VO.dim = dim;\n\
         VO.mat = spm_matrix([bb(1,:) 0 0 0 vx]) * spm_matrix([-1 -1 -1]);\n\
         VO = spm_create_vol(VO);\n\
         for z = 1:dim(3)\n\
         \x20 M = inv(spm_matrix([0 0 -z]) * inv(VO.mat) * V.mat);\n\
         \x20 VO = spm_write_plane(VO, spm_slice_vol(V, M, dim(1:2), {hold}), z);\n\
         end\n",
        input = quote(input),
        output = quote(output),
        vx = vector(&spec.voxel_size),
        hold = hold,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::RunConfig;

    fn job() -> EngineJob {
        EngineJob::new("/data/in/scan.nii", "/out/sub-1/anat/vbm_spm12", "/tmp/scratch")
    }

    #[test]
    fn test_preprocess_script_uses_settings() {
        let settings = RunConfig::default().engine_settings();
        let script = preprocess_script(&job(), &settings);

        assert!(script.contains("copyfile('/data/in/scan.nii', '/out/sub-1/anat/vbm_spm12/Re.nii');"));
        assert!(script.contains("channel.biasreg = 0.0001;"));
        assert!(script.contains("channel.biasfwhm = 60;"));
        assert!(script.contains("tissue(4).ngaus = 3;"));
        assert!(script.contains("tissue(6).tpm = {['/opt/spm12/fsroot/spm/spm12/tpm/TPM.nii' ',6']};"));
        assert!(script.contains("smooth.fwhm = [10 10 10];"));
        assert!(script.contains("'/out/sub-1/anat/vbm_spm12/wc1Re.nii'"));
        assert!(!script.contains("mwc1Re.nii"));
        assert!(script.contains("transM = eye(4)"));
    }

    #[test]
    fn test_preprocess_script_smooths_modulated() {
        let mut settings = RunConfig::default().engine_settings();
        settings.smooth_modulated = true;
        settings.transform_matrix = Some(PathBuf::from("/computation/transform.mat"));
        let script = preprocess_script(&job(), &settings);

        assert!(script.contains("'/out/sub-1/anat/vbm_spm12/mwc3Re.nii'"));
        assert!(script.contains("transF = {'/computation/transform.mat'}"));
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(Path::new("/a/it's.nii")), "'/a/it''s.nii'");
    }

    #[test]
    fn test_resample_script() {
        let spec = ResampleSpec {
            voxel_size: [2.0, 2.0, 2.0],
            method: Interpolation::Spline,
        };
        let script = resample_script(Path::new("/a/swc1Re.nii"), Path::new("/a/r.nii"), &spec);
        assert!(script.contains("vx = [2 2 2];"));
        assert!(script.contains("dim(1:2), -4)"));
        assert!(script.contains("VO.fname = '/a/r.nii';"));
    }

    #[test]
    fn test_tail_truncates() {
        assert_eq!(tail("  short  ", 10), "short");
        assert_eq!(tail("abcdefghij", 4), "...ghij");
    }

    #[tokio::test]
    async fn test_missing_command_is_spawn_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let engine = CommandEngine::new(EngineConfig {
            command: "/nonexistent/vbm-engine".to_string(),
            ..EngineConfig::default()
        });
        let err = engine
            .run_script("probe.m", "disp(1);", temp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Spawn(_, _)));
    }

    #[tokio::test]
    async fn test_import_series_requires_converter() {
        let temp = tempfile::TempDir::new().unwrap();
        let engine = CommandEngine::new(EngineConfig::default());
        let err = engine
            .import_series(temp.path(), temp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }

    #[test]
    fn test_first_volume_sorted() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("b.nii"), b"x").unwrap();
        std::fs::write(temp.path().join("a.nii"), b"x").unwrap();
        std::fs::write(temp.path().join("a.json"), b"{}").unwrap();
        assert_eq!(first_volume(temp.path()), Some(temp.path().join("a.nii")));
    }
}
