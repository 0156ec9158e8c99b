//! Segments are the sub-populations (e.g. occupation classes, school levels) which each have their
//! own size terms and probability tables.
use crate::id::{IDCollection, define_id_type};
use anyhow::{Result, ensure};
use indexmap::IndexMap;
use itertools::Itertools;
use strum::{Display, EnumIter, IntoEnumIterator};

define_id_type! {SegmentID}

/// Maps segment names to their (stable) index in the size-term arrays
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentIndexMap(IndexMap<SegmentID, usize>);

impl SegmentIndexMap {
    /// Create a map in which segments are indexed in the order given
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<SegmentID>,
    {
        let ids: Vec<SegmentID> = names.into_iter().map(Into::into).collect();
        ensure!(ids.iter().all_unique(), "Segment names must be unique");

        Ok(Self(
            ids.into_iter()
                .enumerate()
                .map(|(index, id)| (id, index))
                .collect(),
        ))
    }

    /// Get the index for the named segment
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.0.get_by_str(name).copied()
    }

    /// The number of segments
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no segments
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over segment IDs and their indices
    pub fn iter(&self) -> impl Iterator<Item = (&SegmentID, usize)> {
        self.0.iter().map(|(id, index)| (id, *index))
    }
}

/// The two groups of destination-choice models, each with its own probability tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum Domain {
    /// Usual work location
    #[strum(to_string = "work")]
    Work,
    /// Usual school location
    #[strum(to_string = "school")]
    School,
}

impl Domain {
    /// The task kinds whose models belong to this domain
    pub fn task_kinds(self) -> impl Iterator<Item = TaskKind> {
        TaskKind::iter().filter(move |kind| kind.domain() == self)
    }
}

/// The kinds of task for which pooled model instances are handed out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum TaskKind {
    /// Work location choice
    #[strum(to_string = "workLocationChoice")]
    WorkLocation,
    /// School location choice
    #[strum(to_string = "schoolLocationChoice")]
    SchoolLocation,
    /// Mandatory (work) tour destination choice
    #[strum(to_string = "dcModelWork")]
    MandatoryWork,
    /// Mandatory (school) tour destination choice
    #[strum(to_string = "dcModelSchool")]
    MandatorySchool,
}

impl TaskKind {
    /// The domain whose probability tables this kind of model uses
    pub fn domain(self) -> Domain {
        match self {
            Self::WorkLocation | Self::MandatoryWork => Domain::Work,
            Self::SchoolLocation | Self::MandatorySchool => Domain::School,
        }
    }
}

/// The school segment types, each of which has its own distance utilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum SchoolSegmentType {
    /// Pre-school
    #[strum(to_string = "pre-school")]
    PreSchool,
    /// Grade school
    #[strum(to_string = "grade school")]
    GradeSchool,
    /// High school
    #[strum(to_string = "high school")]
    HighSchool,
    /// University students of typical age
    #[strum(to_string = "university-typical")]
    UniversityTypical,
    /// University students of non-typical age
    #[strum(to_string = "university-non-typical")]
    UniversityNonTypical,
}

impl SchoolSegmentType {
    /// The segment type whose distance utilities this type reuses, if any.
    ///
    /// University students of all ages choose between the same campuses.
    pub fn shares_distance_utilities_with(self) -> Option<SchoolSegmentType> {
        match self {
            Self::UniversityNonTypical => Some(Self::UniversityTypical),
            _ => None,
        }
    }
}
