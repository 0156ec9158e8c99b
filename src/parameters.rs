//! Defines the `ModelParameters` struct, which represents the contents of `model.toml`.
use crate::input::{input_err_msg, read_toml};
use crate::segment::{SchoolSegmentType, SegmentID};
use anyhow::{Context, Result, ensure};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::Deserialize;
use std::path::Path;

const MODEL_PARAMETERS_FILE_NAME: &str = "model.toml";

macro_rules! define_param_default {
    ($name:ident, $type: ty, $value: expr) => {
        fn $name() -> $type {
            $value
        }
    };
}

define_param_default!(default_soa_sample_size, usize, 30);
define_param_default!(default_max_shadow_price_iterations, u32, 1);

/// Represents the contents of the entire model file.
#[derive(Debug, Deserialize, PartialEq)]
pub struct ModelParameters {
    /// Number of draws in each sample of alternatives
    #[serde(default = "default_soa_sample_size")]
    pub soa_sample_size: usize,
    /// Segments of the work domain (e.g. occupation classes)
    pub work_segments: Vec<SegmentID>,
    /// Segments of the school domain, by school segment type
    #[serde(default)]
    pub school_segments: SchoolSegments,
    /// The maximum number of shadow-pricing iterations the outer loop will run
    #[serde(default = "default_max_shadow_price_iterations")]
    pub max_shadow_price_iterations: u32,
}

/// The school segments belonging to each school segment type
#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct SchoolSegments {
    /// Pre-school segments
    #[serde(default)]
    pub preschool: Vec<SegmentID>,
    /// Grade school segments
    #[serde(default)]
    pub grade_school: Vec<SegmentID>,
    /// High school segments
    #[serde(default)]
    pub high_school: Vec<SegmentID>,
    /// Segments for university students of typical age
    #[serde(default)]
    pub university_typical: Vec<SegmentID>,
    /// Segments for university students of non-typical age
    #[serde(default)]
    pub university_non_typical: Vec<SegmentID>,
}

impl SchoolSegments {
    /// The segments of each school segment type
    pub fn by_type(&self) -> IndexMap<SchoolSegmentType, Vec<SegmentID>> {
        [
            (SchoolSegmentType::PreSchool, &self.preschool),
            (SchoolSegmentType::GradeSchool, &self.grade_school),
            (SchoolSegmentType::HighSchool, &self.high_school),
            (SchoolSegmentType::UniversityTypical, &self.university_typical),
            (
                SchoolSegmentType::UniversityNonTypical,
                &self.university_non_typical,
            ),
        ]
        .into_iter()
        .map(|(segment_type, ids)| (segment_type, ids.clone()))
        .collect()
    }

    /// Iterate over all school segments
    pub fn iter(&self) -> impl Iterator<Item = &SegmentID> {
        self.preschool
            .iter()
            .chain(&self.grade_school)
            .chain(&self.high_school)
            .chain(&self.university_typical)
            .chain(&self.university_non_typical)
    }

    /// Whether no school segments are configured
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// Check that the `soa_sample_size` parameter is valid
fn check_soa_sample_size(value: usize) -> Result<()> {
    ensure!(value > 0, "soa_sample_size cannot be zero");

    Ok(())
}

/// Check that the `work_segments` parameter is valid
fn check_work_segments(segments: &[SegmentID]) -> Result<()> {
    ensure!(!segments.is_empty(), "`work_segments` is empty");

    Ok(())
}

/// Check that no segment name is used twice, across both domains
fn check_segments_unique<'a>(segments: impl Iterator<Item = &'a SegmentID>) -> Result<()> {
    let duplicates = segments.duplicates().join(", ");
    ensure!(
        duplicates.is_empty(),
        "Segment names must be unique, but these appear more than once: {duplicates}"
    );

    Ok(())
}

/// Check that the `max_shadow_price_iterations` parameter is valid
fn check_max_shadow_price_iterations(value: u32) -> Result<()> {
    ensure!(value > 0, "max_shadow_price_iterations cannot be zero");

    Ok(())
}

impl ModelParameters {
    /// Read a model file from the specified directory.
    ///
    /// # Arguments
    ///
    /// * `model_dir` - Folder containing model configuration files
    ///
    /// # Returns
    ///
    /// The model file contents as a [`ModelParameters`] struct or an error if the file is invalid
    pub fn from_path<P: AsRef<Path>>(model_dir: P) -> Result<ModelParameters> {
        let file_path = model_dir.as_ref().join(MODEL_PARAMETERS_FILE_NAME);
        let model_params: ModelParameters = read_toml(&file_path)?;

        model_params
            .validate()
            .with_context(|| input_err_msg(file_path))?;

        Ok(model_params)
    }

    /// Validate parameters after reading in file
    pub fn validate(&self) -> Result<()> {
        // soa_sample_size
        check_soa_sample_size(self.soa_sample_size)?;

        // work_segments
        check_work_segments(&self.work_segments)?;

        // school_segments
        check_segments_unique(self.work_segments.iter().chain(self.school_segments.iter()))?;

        // max_shadow_price_iterations
        check_max_shadow_price_iterations(self.max_shadow_price_iterations)?;

        Ok(())
    }

    /// Whether `iteration` (counting from zero) is beyond the last shadow-pricing iteration
    pub fn is_past_final_iteration(&self, iteration: u32) -> bool {
        iteration >= self.max_shadow_price_iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{assert_error, model_parameters};
    use rstest::rstest;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_model_file(dir: &Path, contents: &str) {
        let mut file = File::create(dir.join(MODEL_PARAMETERS_FILE_NAME)).unwrap();
        writeln!(file, "{contents}").unwrap();
    }

    #[test]
    fn test_model_params_from_path() {
        let dir = tempdir().unwrap();
        write_model_file(
            dir.path(),
            r#"
work_segments = ["management", "services"]

[school_segments]
grade_school = ["grade"]
university_typical = ["university"]
"#,
        );

        let model_params = ModelParameters::from_path(dir.path()).unwrap();
        assert_eq!(model_params.soa_sample_size, 30);
        assert_eq!(model_params.max_shadow_price_iterations, 1);
        assert_eq!(
            model_params.work_segments,
            [SegmentID::from("management"), SegmentID::from("services")]
        );
        assert_eq!(model_params.school_segments.iter().count(), 2);

        let by_type = model_params.school_segments.by_type();
        assert_eq!(by_type.len(), 5);
        assert!(by_type[&SchoolSegmentType::PreSchool].is_empty());
        assert_eq!(
            by_type[&SchoolSegmentType::UniversityTypical],
            [SegmentID::from("university")]
        );
    }

    #[test]
    fn test_model_params_from_path_invalid() {
        let dir = tempdir().unwrap();
        write_model_file(dir.path(), "work_segments = []");

        let result = ModelParameters::from_path(dir.path());
        assert_error!(
            result,
            input_err_msg(dir.path().join(MODEL_PARAMETERS_FILE_NAME))
        );
    }

    #[test]
    fn test_model_params_from_path_missing_file() {
        let dir = tempdir().unwrap();
        assert!(ModelParameters::from_path(dir.path()).is_err());
    }

    #[rstest]
    fn test_validate(model_parameters: ModelParameters) {
        assert!(model_parameters.validate().is_ok());
        assert!(!model_parameters.school_segments.is_empty());
    }

    #[rstest]
    #[case(1, true)]
    #[case(30, true)]
    #[case(0, false)]
    fn test_check_soa_sample_size(#[case] value: usize, #[case] expected_valid: bool) {
        assert_eq!(check_soa_sample_size(value).is_ok(), expected_valid);
    }

    #[rstest]
    #[case(1, true)]
    #[case(u32::MAX, true)]
    #[case(0, false)]
    fn test_check_max_shadow_price_iterations(#[case] value: u32, #[case] expected_valid: bool) {
        assert_eq!(
            check_max_shadow_price_iterations(value).is_ok(),
            expected_valid
        );
    }

    #[rstest]
    #[case(0, false)]
    #[case(2, false)]
    #[case(3, true)]
    #[case(10, true)]
    fn test_is_past_final_iteration(
        mut model_parameters: ModelParameters,
        #[case] iteration: u32,
        #[case] expected: bool,
    ) {
        model_parameters.max_shadow_price_iterations = 3;
        assert_eq!(model_parameters.is_past_final_iteration(iteration), expected);
    }

    #[test]
    fn test_check_work_segments() {
        assert!(check_work_segments(&["a".into()]).is_ok());
        assert_error!(check_work_segments(&[]), "`work_segments` is empty");
    }

    #[rstest]
    fn test_check_segments_unique(mut model_parameters: ModelParameters) {
        model_parameters.school_segments.high_school = vec!["office".into()];
        assert_error!(
            model_parameters.validate(),
            "Segment names must be unique, but these appear more than once: office"
        );
    }
}
