//! Fixtures for tests

use crate::manager::Collaborators;
use crate::model::{Logsum, SizeLogsumUtility};
use crate::parameters::{ModelParameters, SchoolSegments};
use crate::segment::SegmentIndexMap;
use crate::size::{ShadowPricedSize, SizeTerms};
use crate::soa::{DistanceUtility, DistanceUtilityContext};
use crate::zone::{DistanceSkims, MacroZone, MicroZone, ZoneSystem};
use anyhow::Result;
use parking_lot::Mutex;
use rstest::fixture;
use std::sync::Arc;

/// Assert that an error with the given message occurs
macro_rules! assert_error {
    ($result:expr, $msg:expr) => {
        assert_eq!(
            $result.unwrap_err().chain().next().unwrap().to_string(),
            $msg
        );
    };
}
pub(crate) use assert_error;

/// A distance-utility collaborator which always returns the same matrix and records each request
pub struct FixedDistanceUtility {
    matrix: Vec<Vec<f64>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FixedDistanceUtility {
    pub fn new(matrix: Vec<Vec<f64>>) -> Self {
        Self {
            matrix,
            calls: Arc::default(),
        }
    }

    /// A handle on the log of requests, which stays valid after `self` is moved
    pub fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.calls)
    }
}

impl DistanceUtility for FixedDistanceUtility {
    fn distance_utility_matrix(&self, context: &DistanceUtilityContext) -> Result<Vec<Vec<f64>>> {
        let call = match context {
            DistanceUtilityContext::Work { segment, .. } => segment.to_string(),
            DistanceUtilityContext::School { segment_type } => segment_type.to_string(),
        };
        self.calls.lock().push(call);

        Ok(self.matrix.clone())
    }
}

/// A logsum which is the same for every origin and destination
pub struct ConstantLogsum(pub f64);

impl Logsum for ConstantLogsum {
    fn logsum(&self, _origin: MicroZone, _destination: MicroZone, _segment: usize) -> f64 {
        self.0
    }
}

/// Three macro-zones, each with a single micro-zone
#[fixture]
pub fn zone_system() -> ZoneSystem {
    ZoneSystem::new(3, vec![MacroZone(0), MacroZone(1), MacroZone(2)]).unwrap()
}

#[fixture]
pub fn segment_map() -> SegmentIndexMap {
    SegmentIndexMap::from_names(["office", "university", "school"]).unwrap()
}

fn sizes() -> Vec<Vec<f64>> {
    vec![
        vec![9.0, 0.0, 4.0],
        vec![1.0, 2.0, 3.0],
        vec![1.0, 2.0, 3.0],
    ]
}

#[fixture]
pub fn size_terms(segment_map: SegmentIndexMap) -> SizeTerms {
    SizeTerms::new(segment_map, sizes()).unwrap()
}

#[fixture]
pub fn distance_utility() -> FixedDistanceUtility {
    FixedDistanceUtility::new(vec![
        vec![0.0, -1.0, -2.0],
        vec![-1.0, 0.0, -1.0],
        vec![-2.0, -1.0, 0.0],
    ])
}

#[fixture]
pub fn model_parameters() -> ModelParameters {
    ModelParameters {
        soa_sample_size: 30,
        work_segments: vec!["office".into()],
        school_segments: SchoolSegments {
            university_typical: vec!["university".into()],
            university_non_typical: vec!["school".into()],
            ..SchoolSegments::default()
        },
        max_shadow_price_iterations: 1,
    }
}

#[fixture]
pub fn collaborators(
    zone_system: ZoneSystem,
    distance_utility: FixedDistanceUtility,
    segment_map: SegmentIndexMap,
) -> Collaborators {
    let zones = Arc::new(zone_system);
    let skims = DistanceSkims::new(
        vec![
            vec![0.0, 1.0, 2.0],
            vec![1.0, 0.0, 1.0],
            vec![2.0, 1.0, 0.0],
        ],
        zones.as_ref(),
    )
    .unwrap();

    Collaborators {
        zones,
        distance_utility: Arc::new(distance_utility),
        logsum: Arc::new(ConstantLogsum(0.0)),
        utility: Arc::new(SizeLogsumUtility {
            logsum_coefficient: 1.0,
            distance_coefficient: -0.5,
        }),
        size_terms: Arc::new(ShadowPricedSize::new(segment_map, sizes()).unwrap()),
        skims: Some(Arc::new(skims)),
    }
}
