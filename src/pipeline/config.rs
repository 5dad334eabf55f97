//! Run configuration for the batch orchestrator.
//!
//! A [`RunConfig`] is assembled in layers: YAML file, then environment
//! overrides, then CLI overrides, then [`RunConfig::validate`]. After
//! validation the config is treated as immutable; components receive narrow
//! views ([`EngineSettings`], [`QcConfig`], [`ReportingConfig`],
//! [`RegressionConfig`]) instead of the whole struct.
//!
//! # Example
//!
//! ```rust,ignore
//! use vbm_forge::pipeline::RunConfig;
//!
//! let config = RunConfig::load("run.yaml")?
//!     .with_pass_threshold(0.91)
//!     .with_output_dir("/data/out");
//! config.validate()?;
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::OutputRole;

/// Name of the per-subject output directory under `<id>/[<session>/]anat/`.
pub const SUBJECT_OUTPUT_DIR: &str = "vbm_spm12";

/// Name of the directory packaged into the run archive.
pub const ARCHIVE_DIR: &str = "vbm_outputs";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where subject scans come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSource {
    /// BIDS-style directory: `sub-*/[ses-*/]anat/*_<scan_type>.nii[.gz]`.
    Bids {
        root: PathBuf,
        #[serde(default = "default_scan_type")]
        scan_type: String,
    },
    /// Explicit list of volume files, named `sub-1..sub-N` in order.
    NiftiList { files: Vec<PathBuf> },
    /// Text file with one volume path per line.
    NiftiPathsFile { path: PathBuf },
    /// Directories of device-native image series, one subject each.
    DeviceSeries { directories: Vec<PathBuf> },
}

impl Default for DataSource {
    fn default() -> Self {
        DataSource::NiftiList { files: Vec::new() }
    }
}

fn default_scan_type() -> String {
    "T1w".to_string()
}

/// Gaussian smoothing kernel FWHM in millimetres.
///
/// Accepts a scalar (isotropic) or a per-axis triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SmoothingKernel {
    Isotropic(f64),
    PerAxis([f64; 3]),
}

impl SmoothingKernel {
    /// Kernel width along x, y and z.
    pub fn fwhm(&self) -> [f64; 3] {
        match *self {
            SmoothingKernel::Isotropic(w) => [w, w, w],
            SmoothingKernel::PerAxis(axes) => axes,
        }
    }
}

impl Default for SmoothingKernel {
    fn default() -> Self {
        SmoothingKernel::PerAxis([10.0, 10.0, 10.0])
    }
}

impl fmt::Display for SmoothingKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x, y, z] = self.fwhm();
        write!(f, "[{} {} {}]", x, y, z)
    }
}

impl FromStr for SmoothingKernel {
    type Err = String;

    /// Parses `"8"` or `"8,8,10"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let parse = |p: &str| {
            p.parse::<f64>()
                .map_err(|_| format!("invalid smoothing width '{}'", p))
        };
        match parts.as_slice() {
            [w] => Ok(SmoothingKernel::Isotropic(parse(w)?)),
            [x, y, z] => Ok(SmoothingKernel::PerAxis([parse(x)?, parse(y)?, parse(z)?])),
            _ => Err(format!(
                "expected one or three comma-separated widths, got '{}'",
                s
            )),
        }
    }
}

/// Segmentation settings for one tissue class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TissueClass {
    /// Tissue index within the probability map (1..=6).
    pub index: u8,
    /// Number of Gaussians modelling the class intensity distribution.
    pub gaussians: u8,
    #[serde(default = "default_true")]
    pub save_native: bool,
    #[serde(default)]
    pub save_dartel: bool,
    #[serde(default = "default_true")]
    pub save_normalized: bool,
    #[serde(default = "default_true")]
    pub save_modulated: bool,
}

impl TissueClass {
    pub fn new(index: u8, gaussians: u8) -> Self {
        Self {
            index,
            gaussians,
            save_native: true,
            save_dartel: false,
            save_normalized: true,
            save_modulated: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tissues() -> Vec<TissueClass> {
    [1u8, 1, 2, 3, 4, 2]
        .iter()
        .enumerate()
        .map(|(i, &g)| TissueClass::new(i as u8 + 1, g))
        .collect()
}

/// Named QC threshold presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QcProfile {
    Adult,
    Developmental,
}

impl QcProfile {
    pub fn threshold(&self) -> f64 {
        match self {
            QcProfile::Adult => 0.91,
            QcProfile::Developmental => 0.70,
        }
    }
}

impl FromStr for QcProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "adult" => Ok(QcProfile::Adult),
            "developmental" => Ok(QcProfile::Developmental),
            other => Err(format!("unknown QC profile '{}'", other)),
        }
    }
}

/// Quality-control gate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    /// Minimum rounded similarity for a subject to pass.
    pub pass_threshold: f64,
    /// Tissue class whose smoothed normalized map is scored.
    pub tissue: u8,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 0.90,
            tissue: 1,
        }
    }
}

/// Run-level reporting thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    /// Success or QC pass rate at or below this adds a warning to the message.
    pub warning_threshold: f64,
    /// Success rate must exceed this for the payload to carry the manifest.
    pub inclusion_threshold: f64,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.5,
            inclusion_threshold: 0.5,
        }
    }
}

/// Interpolation used when resampling regression inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    Nearest,
    Trilinear,
    Spline,
}

impl Interpolation {
    /// Interpolation order understood by the engine (0, 1, or 4th-degree B-spline).
    pub fn order(&self) -> u8 {
        match self {
            Interpolation::Nearest => 0,
            Interpolation::Trilinear => 1,
            Interpolation::Spline => 4,
        }
    }
}

/// Optional resampling of the regression input after QC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResampleSpec {
    pub voxel_size: [f64; 3],
    #[serde(default = "default_interpolation")]
    pub method: Interpolation,
}

fn default_interpolation() -> Interpolation {
    Interpolation::Trilinear
}

/// External engine invocation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Program launched for every engine job.
    pub command: String,
    /// Arguments placed before the generated batch script path.
    pub args: Vec<String>,
    /// Upper bound on one engine invocation, in seconds.
    pub timeout_secs: u64,
    /// Engine version required by the pre-flight check, if any.
    pub expected_version: Option<String>,
    /// Converter for device-native series (invoked as `<cmd> -z n -o <dest> <dir>`).
    pub series_converter: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: "/opt/spm12/run_spm12.sh".to_string(),
            args: vec!["/opt/mcr/v92".to_string(), "script".to_string()],
            timeout_secs: 2 * 60 * 60,
            expected_version: None,
            series_converter: None,
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Downstream regression manifest settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressionConfig {
    /// JSON covariates table: header row then one row per subject.
    pub covariates: Option<PathBuf>,
    /// Directory relative covariate file paths are resolved against.
    pub covariates_base_dir: Option<PathBuf>,
    /// Engine output used as the regression input.
    pub input_role: OutputRole,
    pub input_tissue: u8,
    /// Export per-output-type covariate tables into the archive.
    pub export_type_tables: bool,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            covariates: None,
            covariates_base_dir: None,
            input_role: OutputRole::Smoothed,
            input_tissue: 1,
            export_type_tables: true,
        }
    }
}

/// Settings handed to the structural engine for every subject.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub tissue_probability_map: PathBuf,
    pub transform_matrix: Option<PathBuf>,
    pub fwhm: [f64; 3],
    pub bias_regularisation: f64,
    pub bias_fwhm: f64,
    pub tissues: Vec<TissueClass>,
    pub smooth_modulated: bool,
    pub timeout: Duration,
}

/// Configuration for one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub data: DataSource,
    /// Run output root; per-subject trees and run artifacts land here.
    pub output_dir: PathBuf,
    /// Volume the QC similarity is computed against.
    pub reference_template: PathBuf,
    /// Tissue probability map used for segmentation.
    pub tissue_probability_map: PathBuf,
    /// Reorientation matrix applied before segmentation.
    pub transform_matrix: Option<PathBuf>,
    pub smoothing: SmoothingKernel,
    pub bias_regularisation: f64,
    pub bias_fwhm: f64,
    pub tissues: Vec<TissueClass>,
    /// Also smooth the modulated maps (`smwc{k}`).
    pub smooth_modulated: bool,
    pub qc: QcConfig,
    pub reporting: ReportingConfig,
    pub resample: Option<ResampleSpec>,
    pub engine: EngineConfig,
    pub regression: RegressionConfig,
    /// Package the output tree into `vbm_outputs.tar.gz`.
    pub archive: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data: DataSource::default(),
            output_dir: PathBuf::from("./vbm_output"),
            reference_template: PathBuf::from("/opt/spm12/fsroot/spm/spm12/tpm/TPM.nii"),
            tissue_probability_map: PathBuf::from("/opt/spm12/fsroot/spm/spm12/tpm/TPM.nii"),
            transform_matrix: None,
            smoothing: SmoothingKernel::default(),
            bias_regularisation: 0.0001,
            bias_fwhm: 60.0,
            tissues: default_tissues(),
            smooth_modulated: false,
            qc: QcConfig::default(),
            reporting: ReportingConfig::default(),
            resample: None,
            engine: EngineConfig::default(),
            regression: RegressionConfig::default(),
            archive: true,
        }
    }
}

impl RunConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a YAML file. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parses a configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Applies overrides from process environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `VBM_OUTPUT_DIR`: Run output root
    /// - `VBM_REFERENCE_TEMPLATE`: QC reference volume
    /// - `VBM_TPM`: Tissue probability map
    /// - `VBM_QC_THRESHOLD`: QC pass threshold (0.0-1.0)
    /// - `VBM_FWHM`: Smoothing kernel, `"8"` or `"8,8,8"`
    /// - `VBM_ENGINE_COMMAND`: Engine program
    /// - `VBM_ENGINE_TIMEOUT_SECS`: Engine timeout in seconds
    /// - `VBM_ARCHIVE`: Package outputs (true/false)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("VBM_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup("VBM_REFERENCE_TEMPLATE") {
            self.reference_template = PathBuf::from(val);
        }

        if let Some(val) = lookup("VBM_TPM") {
            self.tissue_probability_map = PathBuf::from(val);
        }

        if let Some(val) = lookup("VBM_QC_THRESHOLD") {
            self.qc.pass_threshold = parse_env_value(&val, "VBM_QC_THRESHOLD")?;
        }

        if let Some(val) = lookup("VBM_FWHM") {
            self.smoothing = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "VBM_FWHM".to_string(),
                message,
            })?;
        }

        if let Some(val) = lookup("VBM_ENGINE_COMMAND") {
            self.engine.command = val;
        }

        if let Some(val) = lookup("VBM_ENGINE_TIMEOUT_SECS") {
            self.engine.timeout_secs = parse_env_value(&val, "VBM_ENGINE_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("VBM_ARCHIVE") {
            self.archive = parse_env_bool(&val, "VBM_ARCHIVE")?;
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "output_dir cannot be empty".to_string(),
            ));
        }

        if self.reference_template.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "reference_template cannot be empty".to_string(),
            ));
        }

        if self.smoothing.fwhm().iter().any(|w| !w.is_finite() || *w <= 0.0) {
            return Err(ConfigError::ValidationFailed(
                "smoothing widths must be greater than 0".to_string(),
            ));
        }

        if self.bias_regularisation < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "bias_regularisation cannot be negative".to_string(),
            ));
        }

        if self.bias_fwhm <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "bias_fwhm must be greater than 0".to_string(),
            ));
        }

        if self.tissues.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "tissues cannot be empty".to_string(),
            ));
        }

        let mut seen = [false; 7];
        for tissue in &self.tissues {
            if !(1..=6).contains(&tissue.index) {
                return Err(ConfigError::ValidationFailed(format!(
                    "tissues index {} must be between 1 and 6",
                    tissue.index
                )));
            }
            if seen[tissue.index as usize] {
                return Err(ConfigError::ValidationFailed(format!(
                    "tissues index {} is listed twice",
                    tissue.index
                )));
            }
            seen[tissue.index as usize] = true;
            if tissue.gaussians == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "tissues[{}].gaussians must be greater than 0",
                    tissue.index
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.qc.pass_threshold) {
            return Err(ConfigError::ValidationFailed(
                "qc.pass_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !self.saves_normalized(self.qc.tissue) {
            return Err(ConfigError::ValidationFailed(format!(
                "qc.tissue {} must be a configured tissue with normalized output",
                self.qc.tissue
            )));
        }

        if !(0.0..=1.0).contains(&self.reporting.warning_threshold) {
            return Err(ConfigError::ValidationFailed(
                "reporting.warning_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.reporting.inclusion_threshold) {
            return Err(ConfigError::ValidationFailed(
                "reporting.inclusion_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if let Some(resample) = &self.resample {
            if resample.voxel_size.iter().any(|v| !v.is_finite() || *v <= 0.0) {
                return Err(ConfigError::ValidationFailed(
                    "resample.voxel_size must be greater than 0".to_string(),
                ));
            }
        }

        if self.engine.command.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "engine.command cannot be empty".to_string(),
            ));
        }

        if self.engine.timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "engine.timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.regression.input_role == OutputRole::SmoothedModulated && !self.smooth_modulated {
            return Err(ConfigError::ValidationFailed(
                "regression.input_role smoothed_modulated requires smooth_modulated".to_string(),
            ));
        }

        Ok(())
    }

    fn saves_normalized(&self, index: u8) -> bool {
        self.tissues
            .iter()
            .any(|t| t.index == index && t.save_normalized)
    }

    /// Settings passed to the engine for every subject.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            tissue_probability_map: self.tissue_probability_map.clone(),
            transform_matrix: self.transform_matrix.clone(),
            fwhm: self.smoothing.fwhm(),
            bias_regularisation: self.bias_regularisation,
            bias_fwhm: self.bias_fwhm,
            tissues: self.tissues.clone(),
            smooth_modulated: self.smooth_modulated,
            timeout: self.engine.timeout(),
        }
    }

    pub fn qc(&self) -> &QcConfig {
        &self.qc
    }

    pub fn reporting(&self) -> &ReportingConfig {
        &self.reporting
    }

    pub fn regression(&self) -> &RegressionConfig {
        &self.regression
    }

    /// Builder method to set the data source.
    pub fn with_data(mut self, data: DataSource) -> Self {
        self.data = data;
        self
    }

    /// Builder method to use a BIDS directory with the default scan type.
    pub fn with_bids_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data = DataSource::Bids {
            root: root.into(),
            scan_type: default_scan_type(),
        };
        self
    }

    /// Builder method to set the output directory.
    pub fn with_output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = path.into();
        self
    }

    /// Builder method to set the QC reference template.
    pub fn with_reference_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.reference_template = path.into();
        self
    }

    /// Builder method to set the tissue probability map.
    pub fn with_tissue_probability_map(mut self, path: impl Into<PathBuf>) -> Self {
        self.tissue_probability_map = path.into();
        self
    }

    /// Builder method to set the smoothing kernel.
    pub fn with_smoothing(mut self, kernel: SmoothingKernel) -> Self {
        self.smoothing = kernel;
        self
    }

    /// Builder method to set the QC pass threshold.
    pub fn with_pass_threshold(mut self, threshold: f64) -> Self {
        self.qc.pass_threshold = threshold;
        self
    }

    /// Builder method to set the QC pass threshold from a named profile.
    pub fn with_qc_profile(mut self, profile: QcProfile) -> Self {
        self.qc.pass_threshold = profile.threshold();
        self
    }

    /// Builder method to set the reporting thresholds.
    pub fn with_reporting(mut self, reporting: ReportingConfig) -> Self {
        self.reporting = reporting;
        self
    }

    /// Builder method to enable resampling of regression inputs.
    pub fn with_resample(mut self, spec: ResampleSpec) -> Self {
        self.resample = Some(spec);
        self
    }

    /// Builder method to set the engine command.
    pub fn with_engine_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.engine.command = command.into();
        self.engine.args = args;
        self
    }

    /// Builder method to set the engine timeout.
    pub fn with_engine_timeout(mut self, timeout: Duration) -> Self {
        self.engine.timeout_secs = timeout.as_secs();
        self
    }

    /// Builder method to require an engine version.
    pub fn with_expected_version(mut self, version: impl Into<String>) -> Self {
        self.engine.expected_version = Some(version.into());
        self
    }

    /// Builder method to set the covariates table.
    pub fn with_covariates(mut self, path: impl Into<PathBuf>) -> Self {
        self.regression.covariates = Some(path.into());
        self
    }

    /// Builder method to enable or disable archive packaging.
    pub fn with_archive(mut self, enabled: bool) -> Self {
        self.archive = enabled;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.smoothing.fwhm(), [10.0, 10.0, 10.0]);
        assert!((config.bias_regularisation - 0.0001).abs() < f64::EPSILON);
        assert!((config.bias_fwhm - 60.0).abs() < f64::EPSILON);
        assert_eq!(config.tissues.len(), 6);
        let gaussians: Vec<u8> = config.tissues.iter().map(|t| t.gaussians).collect();
        assert_eq!(gaussians, vec![1, 1, 2, 3, 4, 2]);
        assert!((config.qc.pass_threshold - 0.90).abs() < f64::EPSILON);
        assert_eq!(config.engine.timeout(), Duration::from_secs(7200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_partial_config() {
        let yaml = r#"
output_dir: /tmp/out
smoothing: 8
qc:
  pass_threshold: 0.85
data:
  kind: bids
  root: /data/study
"#;
        let config = RunConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.smoothing.fwhm(), [8.0, 8.0, 8.0]);
        assert!((config.qc.pass_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.qc.tissue, 1);
        assert_eq!(
            config.data,
            DataSource::Bids {
                root: PathBuf::from("/data/study"),
                scan_type: "T1w".to_string(),
            }
        );
    }

    #[test]
    fn test_yaml_per_axis_smoothing() {
        let config = RunConfig::from_yaml("smoothing: [6, 6, 8]\n").unwrap();
        assert_eq!(config.smoothing, SmoothingKernel::PerAxis([6.0, 6.0, 8.0]));
        assert_eq!(config.smoothing.to_string(), "[6 6 8]");
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = RunConfig::from_yaml("  \n").unwrap();
        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("run.yaml");
        std::fs::write(&path, "archive: false\n").unwrap();

        let config = RunConfig::load(&path).unwrap();
        assert!(!config.archive);
    }

    #[test]
    fn test_load_invalid_yaml() {
        let result = RunConfig::from_yaml("qc: [not, a, map]\n");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("VBM_OUTPUT_DIR", "/override"),
            ("VBM_QC_THRESHOLD", "0.75"),
            ("VBM_FWHM", "4,4,6"),
            ("VBM_ENGINE_TIMEOUT_SECS", "60"),
            ("VBM_ARCHIVE", "off"),
        ]
        .into_iter()
        .collect();

        let mut config = RunConfig::default();
        config
            .apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.output_dir, PathBuf::from("/override"));
        assert!((config.qc.pass_threshold - 0.75).abs() < f64::EPSILON);
        assert_eq!(config.smoothing.fwhm(), [4.0, 4.0, 6.0]);
        assert_eq!(config.engine.timeout_secs, 60);
        assert!(!config.archive);
    }

    #[test]
    fn test_override_invalid_value() {
        let mut config = RunConfig::default();
        let err = config
            .apply_overrides_from(|k| (k == "VBM_QC_THRESHOLD").then(|| "high".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("VBM_QC_THRESHOLD"));
    }

    #[test]
    fn test_smoothing_kernel_parse() {
        assert_eq!(
            "10".parse::<SmoothingKernel>().unwrap(),
            SmoothingKernel::Isotropic(10.0)
        );
        assert_eq!(
            "6, 6, 8".parse::<SmoothingKernel>().unwrap(),
            SmoothingKernel::PerAxis([6.0, 6.0, 8.0])
        );
        assert!("6,6".parse::<SmoothingKernel>().is_err());
        assert!("wide".parse::<SmoothingKernel>().is_err());
    }

    #[test]
    fn test_qc_profiles() {
        let config = RunConfig::default().with_qc_profile(QcProfile::Adult);
        assert!((config.qc.pass_threshold - 0.91).abs() < f64::EPSILON);
        assert_eq!("developmental".parse::<QcProfile>().unwrap(), QcProfile::Developmental);
        assert!("elderly".parse::<QcProfile>().is_err());
    }

    #[test]
    fn test_validation_invalid_threshold() {
        let config = RunConfig::default().with_pass_threshold(1.5);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("qc.pass_threshold"));
    }

    #[test]
    fn test_validation_invalid_smoothing() {
        let config = RunConfig::default().with_smoothing(SmoothingKernel::PerAxis([8.0, 0.0, 8.0]));
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("smoothing"));
    }

    #[test]
    fn test_validation_invalid_timeout() {
        let config = RunConfig::default().with_engine_timeout(Duration::from_secs(0));
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("engine.timeout_secs"));
    }

    #[test]
    fn test_validation_empty_engine_command() {
        let config = RunConfig::default().with_engine_command(" ", vec![]);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("engine.command"));
    }

    #[test]
    fn test_validation_duplicate_tissue() {
        let mut config = RunConfig::default();
        config.tissues.push(TissueClass::new(2, 1));
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("listed twice"));
    }

    #[test]
    fn test_validation_tissue_out_of_range() {
        let mut config = RunConfig::default();
        config.tissues[5].index = 7;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("between 1 and 6"));
    }

    #[test]
    fn test_validation_qc_tissue_not_normalized() {
        let mut config = RunConfig::default();
        config.tissues[0].save_normalized = false;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("qc.tissue"));
    }

    #[test]
    fn test_validation_resample_voxel_size() {
        let config = RunConfig::default().with_resample(ResampleSpec {
            voxel_size: [2.0, -1.0, 2.0],
            method: Interpolation::Trilinear,
        });
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("resample.voxel_size"));
    }

    #[test]
    fn test_engine_settings_view() {
        let config = RunConfig::default()
            .with_smoothing(SmoothingKernel::Isotropic(6.0))
            .with_engine_timeout(Duration::from_secs(30));
        let settings = config.engine_settings();
        assert_eq!(settings.fwhm, [6.0, 6.0, 6.0]);
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.tissues.len(), 6);
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("1", "test").unwrap());
        assert!(parse_env_bool("YES", "test").unwrap());
        assert!(!parse_env_bool("off", "test").unwrap());
        assert!(parse_env_bool("maybe", "test").is_err());
    }
}
