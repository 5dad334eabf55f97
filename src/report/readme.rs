//! Readme files written next to each subject's outputs.

use std::path::Path;

use crate::pipeline::config::SmoothingKernel;

pub const OUTPUTS_README: &str = "outputs_description.txt";
pub const QC_README: &str = "quality_control_readme.txt";

const MANUAL_LINKS: &str = "For more info. please refer to spm12 manual here: \
http://www.fil.ion.ucl.ac.uk/spm/doc/manual.pdf and release notes here: \
http://www.fil.ion.ucl.ac.uk/spm/software/spm12/SPM12_Release_Notes.pdf";

/// Describes the output file prefixes and the smoothing kernel that was used.
///
/// `positional_ids` adds a note that `sub-N` follows the order of the input list.
pub fn outputs_description(kernel: &SmoothingKernel, positional_ids: bool) -> String {
    let mut text = String::new();
    if positional_ids {
        text.push_str(
            "sub-1,sub-2,sub-* denotes each nifti file with respect to the order in the nifti paths given\n",
        );
    }
    text.push_str(
        "Prefixes descriptions for segmented images:c1-Grey matter,c2-White matter,\
c3-Cerebro spinal fluid,c4-Bone,c5-Soft tissue,c6-Air(background)\n",
    );
    text.push_str("w-Normalized\nm-Modulated\n");
    text.push_str(&format!("s-Smoothed with fwhm(mm) {}\n", kernel));
    text.push_str("Re-Reoriented input image\n");
    text.push_str(MANUAL_LINKS);
    text.push('\n');
    text
}

/// Explains the correlation score file and the flagged-subjects record.
pub fn qc_readme(threshold: f64, scored_file: &str) -> String {
    format!(
        "In each subject's anat/vbm_spm12 directory, vbm_corr_value.txt gives the correlation value \
of the {} file with the adult brain tissue probability maps (TPM.nii) from SPM12.\n\
If your subjects are kids/adolescents, take this into consideration as the correlation value may not \
pass the threshold. Scans with a correlation value below {:.2} should be manually looked into for \
possible reorientation to the ac-pc line.\n\
Subjects that do not pass this QA metric are saved in vbm_outputs/QA_flagged_subjects.txt\n",
        scored_file, threshold
    )
}

/// Writes both readmes into `dir`.
pub fn write_readmes(
    dir: &Path,
    kernel: &SmoothingKernel,
    positional_ids: bool,
    threshold: f64,
    scored_file: &str,
) -> std::io::Result<()> {
    std::fs::write(dir.join(OUTPUTS_README), outputs_description(kernel, positional_ids))?;
    std::fs::write(dir.join(QC_README), qc_readme(threshold, scored_file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outputs_description_states_kernel() {
        let text = outputs_description(&SmoothingKernel::PerAxis([8.0, 8.0, 10.0]), false);
        assert!(text.contains("fwhm(mm) [8 8 10]"));
        assert!(!text.contains("sub-1,sub-2"));

        let text = outputs_description(&SmoothingKernel::default(), true);
        assert!(text.starts_with("sub-1,sub-2"));
        assert!(text.contains("[10 10 10]"));
    }

    #[test]
    fn test_qc_readme_threshold() {
        assert!(qc_readme(0.9, "swc1Re.nii").contains("below 0.90"));
    }

    #[test]
    fn test_qc_readme_names_scored_file() {
        let text = qc_readme(0.9, "swc2Re.nii");
        assert!(text.contains("of the swc2Re.nii file"));
        assert!(!text.contains("swc1"));
    }

    #[test]
    fn test_write_readmes() {
        let temp = tempfile::TempDir::new().unwrap();
        write_readmes(temp.path(), &SmoothingKernel::default(), false, 0.91, "swc1Re.nii").unwrap();
        assert!(temp.path().join(OUTPUTS_README).is_file());
        assert!(std::fs::read_to_string(temp.path().join(QC_README))
            .unwrap()
            .contains("0.91"));
    }
}
