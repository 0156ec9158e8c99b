//! Helpers shared by the integration tests
#![allow(dead_code)]
use anyhow::Result;
use destchoice::manager::{Collaborators, DestChoiceModelManager};
use destchoice::model::{Logsum, SizeLogsumUtility};
use destchoice::parameters::{ModelParameters, SchoolSegments};
use destchoice::segment::SegmentIndexMap;
use destchoice::size::ShadowPricedSize;
use destchoice::soa::{DistanceUtility, DistanceUtilityContext};
use destchoice::zone::{MacroZone, MicroZone, ZoneSystem};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Silence logging for tests which don't initialise a logger themselves
pub fn quiet_logs() {
    unsafe { std::env::set_var("DESTCHOICE_LOG_LEVEL", "off") };
}

/// A symmetric distance utility which counts how often it is asked for a matrix.
///
/// Each request sleeps briefly so that concurrent callers overlap.
pub struct CountingDistanceUtility {
    matrix: Vec<Vec<f64>>,
    calls: Arc<AtomicUsize>,
}

impl CountingDistanceUtility {
    pub fn new(calls: Arc<AtomicUsize>) -> Self {
        Self {
            matrix: vec![
                vec![0.0, -1.0, -2.0],
                vec![-1.0, 0.0, -1.0],
                vec![-2.0, -1.0, 0.0],
            ],
            calls,
        }
    }
}

impl DistanceUtility for CountingDistanceUtility {
    fn distance_utility_matrix(&self, _context: &DistanceUtilityContext) -> Result<Vec<Vec<f64>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        Ok(self.matrix.clone())
    }
}

pub struct ZeroLogsum;

impl Logsum for ZeroLogsum {
    fn logsum(&self, _origin: MicroZone, _destination: MicroZone, _segment: usize) -> f64 {
        0.0
    }
}

/// Three macro-zones, A, B and C, with one micro-zone each
pub fn zones() -> ZoneSystem {
    ZoneSystem::new(3, vec![MacroZone(0), MacroZone(1), MacroZone(2)]).unwrap()
}

pub fn parameters() -> ModelParameters {
    ModelParameters {
        soa_sample_size: 20,
        work_segments: vec!["office".into()],
        school_segments: SchoolSegments {
            grade_school: vec!["grade".into()],
            ..SchoolSegments::default()
        },
        max_shadow_price_iterations: 3,
    }
}

/// Collaborators whose distance utility reports each request to `calls`.
///
/// Micro-zone sizes of 9, 0 and 4 become macro-zone sizes of 10, 0 and 5 once the presence bonus
/// is added.
pub fn collaborators(calls: Arc<AtomicUsize>) -> Collaborators {
    let segments = SegmentIndexMap::from_names(["office", "grade"]).unwrap();
    let sizes = vec![vec![9.0, 0.0, 4.0], vec![2.0, 2.0, 2.0]];

    Collaborators {
        zones: Arc::new(zones()),
        distance_utility: Arc::new(CountingDistanceUtility::new(calls)),
        logsum: Arc::new(ZeroLogsum),
        utility: Arc::new(SizeLogsumUtility {
            logsum_coefficient: 1.0,
            distance_coefficient: 0.0,
        }),
        size_terms: Arc::new(ShadowPricedSize::new(segments, sizes).unwrap()),
        skims: None,
    }
}

/// A manager which has been set up, along with its count of distance-utility requests
pub fn manager() -> (DestChoiceModelManager, Arc<AtomicUsize>) {
    quiet_logs();
    let calls = Arc::new(AtomicUsize::new(0));
    let manager = DestChoiceModelManager::new();
    manager
        .setup(parameters(), collaborators(Arc::clone(&calls)))
        .unwrap();

    (manager, calls)
}
