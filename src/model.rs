//! The pooled destination-choice model.
//!
//! A [`LocationChoiceModel`] is expensive to build, so the manager hands instances out to worker
//! threads and takes them back for reuse. Each instance chooses destinations in two steps: it
//! draws a sample of alternatives from the shared SOA probability tables and then makes a
//! multinomial-logit choice among the sampled micro-zones, correcting utilities for the sampling.
use crate::manager::Collaborators;
use crate::probability::{
    cumulative_probability_from_weights, exponentiate_utilities, inverse_cumulative_lookup,
    probability_at,
};
use crate::segment::TaskKind;
use crate::size::SizeTerms;
use crate::soa::DomainTables;
use crate::zone::{DistanceSkims, MacroZone, MicroZone, ZoneData};
use anyhow::{Context, Result, ensure};
use log::debug;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

/// Mode-choice logsums, used as the accessibility term of destination utilities
pub trait Logsum: Send + Sync {
    /// The logsum for travel from `origin` to `destination` for a segment
    fn logsum(&self, origin: MicroZone, destination: MicroZone, segment: usize) -> f64;
}

/// Everything known about a sampled alternative when its utility is calculated
#[derive(Debug, Clone, PartialEq)]
pub struct AlternativeAttributes {
    /// Origin micro-zone
    pub origin: MicroZone,
    /// The sampled destination
    pub destination: MicroZone,
    /// Segment index
    pub segment: usize,
    /// Mode-choice logsum from origin to destination
    pub logsum: f64,
    /// Size term of the destination
    pub size: f64,
    /// Distance between origin and destination macro-zones, if skims were provided
    pub distance: Option<f64>,
    /// Sampling correction factor, `ln(frequency / selection probability)`
    pub correction_factor: f64,
}

/// Evaluates the utility of a sampled destination
pub trait DestinationUtility: Send + Sync {
    /// The utility of the alternative (`f64::NEG_INFINITY` if it cannot be chosen)
    fn utility(&self, alternative: &AlternativeAttributes) -> f64;
}

/// A destination utility with coefficients on logsum and distance plus a log-size term.
///
/// A destination with no size cannot be chosen.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeLogsumUtility {
    /// Coefficient applied to the mode-choice logsum
    pub logsum_coefficient: f64,
    /// Coefficient applied to distance (ignored without skims)
    pub distance_coefficient: f64,
}

impl DestinationUtility for SizeLogsumUtility {
    fn utility(&self, alternative: &AlternativeAttributes) -> f64 {
        if alternative.size <= 0.0 {
            return f64::NEG_INFINITY;
        }

        self.logsum_coefficient * alternative.logsum
            + self.distance_coefficient * alternative.distance.unwrap_or(0.0)
            + alternative.size.ln()
            + alternative.correction_factor
    }
}

/// A single draw of the sample of alternatives
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampledDraw {
    /// The micro-zone drawn
    pub micro_zone: MicroZone,
    /// The probability with which it was drawn
    pub probability: f64,
}

/// The result of sampling alternatives for one decision
#[derive(Debug, Default, PartialEq)]
pub struct DestinationSample {
    draws: Vec<SampledDraw>,
    frequency: HashMap<MicroZone, usize>,
    /// Unique micro-zones in order of first appearance, with the index of that first draw
    unique: Vec<(MicroZone, usize)>,
}

impl DestinationSample {
    fn record(&mut self, draw: SampledDraw) {
        let count = self.frequency.entry(draw.micro_zone).or_default();
        if *count == 0 {
            self.unique.push((draw.micro_zone, self.draws.len()));
        }
        *count += 1;
        self.draws.push(draw);
    }

    fn clear(&mut self) {
        self.draws.clear();
        self.frequency.clear();
        self.unique.clear();
    }

    /// Every draw, in order
    pub fn draws(&self) -> &[SampledDraw] {
        &self.draws
    }

    /// How many times `micro_zone` was drawn
    pub fn frequency(&self, micro_zone: MicroZone) -> usize {
        self.frequency.get(&micro_zone).copied().unwrap_or_default()
    }

    /// The distinct micro-zones drawn, in order of first appearance
    pub fn unique_alternatives(&self) -> impl Iterator<Item = MicroZone> + '_ {
        self.unique.iter().map(|(micro_zone, _)| *micro_zone)
    }

    /// Whether nothing was drawn
    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }
}

/// A reusable destination-choice model for one task kind
pub struct LocationChoiceModel {
    task_kind: TaskKind,
    index: usize,
    generation: u64,
    sample_size: usize,
    zones: Arc<dyn ZoneData>,
    logsum: Arc<dyn Logsum>,
    utility: Arc<dyn DestinationUtility>,
    skims: Option<Arc<DistanceSkims>>,
    tables: Arc<DomainTables>,
    size_terms: Arc<SizeTerms>,
    sample: DestinationSample,
}

impl std::fmt::Debug for LocationChoiceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationChoiceModel")
            .field("task_kind", &self.task_kind)
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("sample_size", &self.sample_size)
            .field("skims", &self.skims)
            .field("tables", &self.tables)
            .field("size_terms", &self.size_terms)
            .field("sample", &self.sample)
            .finish_non_exhaustive()
    }
}

impl LocationChoiceModel {
    /// Create a new model.
    ///
    /// # Arguments
    ///
    /// * `task_kind` - The kind of task this model is for
    /// * `index` - Creation-order index within the domain
    /// * `generation` - Identifies the domain state the model was created under
    /// * `sample_size` - Number of draws for each sample of alternatives
    /// * `collaborators` - Shared external collaborators
    /// * `tables` - The domain's current probability tables
    /// * `size_terms` - The size terms for the current iteration
    pub(crate) fn new(
        task_kind: TaskKind,
        index: usize,
        generation: u64,
        sample_size: usize,
        collaborators: &Collaborators,
        tables: Arc<DomainTables>,
        size_terms: Arc<SizeTerms>,
    ) -> Self {
        Self {
            task_kind,
            index,
            generation,
            sample_size,
            zones: Arc::clone(&collaborators.zones),
            logsum: Arc::clone(&collaborators.logsum),
            utility: Arc::clone(&collaborators.utility),
            skims: collaborators.skims.clone(),
            tables,
            size_terms,
            sample: DestinationSample::default(),
        }
    }

    /// The kind of task this model is for
    pub fn task_kind(&self) -> TaskKind {
        self.task_kind
    }

    /// The creation-order index of this model within its domain
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// The probability tables the model is currently using
    pub fn tables(&self) -> &Arc<DomainTables> {
        &self.tables
    }

    /// The size terms the model is currently using
    pub fn size_terms(&self) -> &Arc<SizeTerms> {
        &self.size_terms
    }

    /// The most recent sample of alternatives
    pub fn sample(&self) -> &DestinationSample {
        &self.sample
    }

    /// Point the model at new size terms and tables and forget any previous sample
    pub(crate) fn rebind(&mut self, size_terms: Arc<SizeTerms>, tables: Arc<DomainTables>) {
        self.size_terms = size_terms;
        self.tables = tables;
        self.reset_scratch();
    }

    /// Forget the previous sample of alternatives
    pub fn reset_scratch(&mut self) {
        self.sample.clear();
    }

    /// Draw a sample of alternatives for a decision made from `origin`.
    ///
    /// Each draw first picks a destination macro-zone from the origin's cumulative distance
    /// probabilities, then uses the same random number to pick a micro-zone inside it according to
    /// the micro-zones' size shares.
    ///
    /// # Returns
    ///
    /// The sample, which is empty if no destination can be reached from `origin`.
    pub fn sample_alternatives<R: Rng>(
        &mut self,
        origin: MacroZone,
        segment: usize,
        rng: &mut R,
    ) -> Result<&DestinationSample> {
        self.reset_scratch();
        let tables = Arc::clone(&self.tables);
        let segment_tables = tables.segment(segment)?;
        let row = segment_tables
            .distance_cumulative(origin)
            .with_context(|| format!("Unknown origin macro-zone {origin}"))?;
        if row.is_empty() {
            debug!("No destinations available from macro-zone {origin} for segment {segment}");
            return Ok(&self.sample);
        }

        for _ in 0..self.sample_size {
            let random_number = rng.gen_range(0.0..1.0);
            let chosen = inverse_cumulative_lookup(row, 0.0, random_number)
                .context("Random number outside the distance probability range")?;
            let macro_zone = MacroZone(chosen);
            let macro_zone_probability = probability_at(row, chosen);
            let shares = segment_tables
                .size_shares(macro_zone)
                .with_context(|| format!("Unknown destination macro-zone {macro_zone}"))?;
            ensure!(
                !shares.is_empty(),
                "Macro-zone {macro_zone} was sampled from macro-zone {origin} for segment \
                {segment}, but it has no size"
            );

            // Scale shares into the slice of the cumulative distribution owned by this macro-zone
            let lower_bound = if chosen == 0 { 0.0 } else { row[chosen - 1] };
            let cumulative: Vec<f64> = shares
                .iter()
                .scan(lower_bound, |acc, share| {
                    *acc += share * macro_zone_probability;
                    Some(*acc)
                })
                .collect();
            let member = inverse_cumulative_lookup(&cumulative, lower_bound, random_number)
                .or_else(|| shares.iter().rposition(|share| *share > 0.0))
                .context("No micro-zone with size in sampled macro-zone")?;

            self.sample.record(SampledDraw {
                micro_zone: self.zones.micro_zones_of(macro_zone)[member],
                probability: shares[member] * macro_zone_probability,
            });
        }

        Ok(&self.sample)
    }

    /// Sampling correction factors for each unique alternative in the current sample
    pub fn correction_factors(&self) -> Vec<f64> {
        self.sample
            .unique
            .iter()
            .map(|(micro_zone, first_draw)| {
                let frequency = self.sample.frequency(*micro_zone) as f64;
                (frequency / self.sample.draws[*first_draw].probability).ln()
            })
            .collect()
    }

    /// Choose a destination for a decision maker located in `origin`.
    ///
    /// # Returns
    ///
    /// The chosen micro-zone, or `None` if no destination is available.
    pub fn choose_destination<R: Rng>(
        &mut self,
        origin: MicroZone,
        segment: usize,
        rng: &mut R,
    ) -> Result<Option<MicroZone>> {
        let origin_macro_zone = self.zones.macro_zone_of(origin);
        if self
            .sample_alternatives(origin_macro_zone, segment, rng)?
            .is_empty()
        {
            return Ok(None);
        }

        let sizes = self.size_terms.size_array(segment);
        let utilities: Vec<f64> = self
            .sample
            .unique
            .iter()
            .zip(self.correction_factors())
            .map(|((destination, _), correction_factor)| {
                let distance = self.skims.as_ref().map(|skims| {
                    skims.distance(origin_macro_zone, self.zones.macro_zone_of(*destination))
                });
                self.utility.utility(&AlternativeAttributes {
                    origin,
                    destination: *destination,
                    segment,
                    logsum: self.logsum.logsum(origin, *destination, segment),
                    size: sizes[destination.0],
                    distance,
                    correction_factor,
                })
            })
            .collect();

        // Shift so the best alternative has utility 0; this leaves the probabilities unchanged
        let max_utility = utilities.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max_utility.is_infinite() && max_utility.is_sign_negative() {
            return Ok(None);
        }
        let shifted: Vec<f64> = utilities.iter().map(|utility| utility - max_utility).collect();
        let weights = exponentiate_utilities(&[shifted])
            .with_context(|| format!("Invalid utilities for origin {origin}"))?;
        let cumulative = cumulative_probability_from_weights(&weights[0]);

        let random_number = rng.gen_range(0.0..1.0);
        Ok(inverse_cumulative_lookup(&cumulative, 0.0, random_number)
            .map(|chosen| self.sample.unique[chosen].0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{
        FixedDistanceUtility, assert_error, collaborators, distance_utility, size_terms,
        zone_system,
    };
    use crate::segment::Domain;
    use crate::soa::SoaProbabilityCache;
    use crate::zone::ZoneSystem;
    use float_cmp::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::rstest;

    fn work_tables(
        zone_system: ZoneSystem,
        distance_utility: FixedDistanceUtility,
        size_terms: &SizeTerms,
    ) -> Arc<DomainTables> {
        let mut cache = SoaProbabilityCache::new(Arc::new(zone_system), Arc::new(distance_utility));
        cache
            .recompute_work_domain(size_terms, &["office".into()], 0)
            .unwrap();
        Arc::clone(cache.tables(Domain::Work).unwrap())
    }

    fn model(
        collaborators: &Collaborators,
        tables: Arc<DomainTables>,
        size_terms: SizeTerms,
    ) -> LocationChoiceModel {
        LocationChoiceModel::new(
            TaskKind::WorkLocation,
            0,
            0,
            50,
            collaborators,
            tables,
            Arc::new(size_terms),
        )
    }

    #[rstest]
    fn test_sample_alternatives(
        zone_system: ZoneSystem,
        distance_utility: FixedDistanceUtility,
        size_terms: SizeTerms,
        collaborators: Collaborators,
    ) {
        let tables = work_tables(zone_system, distance_utility, &size_terms);
        let mut model = model(&collaborators, tables, size_terms);
        let mut rng = StdRng::seed_from_u64(42);

        let sample = model
            .sample_alternatives(MacroZone(0), 0, &mut rng)
            .unwrap();
        assert_eq!(sample.draws().len(), 50);

        // Micro-zone 1 has no size so is never drawn
        assert_eq!(sample.frequency(MicroZone(1)), 0);
        assert_eq!(
            sample.frequency(MicroZone(0)) + sample.frequency(MicroZone(2)),
            50
        );

        let total = 10.0 + 5.0 * (-2.0f64).exp();
        for draw in sample.draws() {
            let expected = match draw.micro_zone.0 {
                0 => 10.0 / total,
                _ => 5.0 * (-2.0f64).exp() / total,
            };
            assert_approx_eq!(f64, draw.probability, expected, epsilon = 1e-12);
        }
    }

    #[rstest]
    fn test_sample_alternatives_unknown_origin(
        zone_system: ZoneSystem,
        distance_utility: FixedDistanceUtility,
        size_terms: SizeTerms,
        collaborators: Collaborators,
    ) {
        let tables = work_tables(zone_system, distance_utility, &size_terms);
        let mut model = model(&collaborators, tables, size_terms);
        let mut rng = StdRng::seed_from_u64(42);
        assert_error!(
            model.sample_alternatives(MacroZone(5), 0, &mut rng),
            "Unknown origin macro-zone 5"
        );
    }

    #[rstest]
    fn test_correction_factors(
        zone_system: ZoneSystem,
        distance_utility: FixedDistanceUtility,
        size_terms: SizeTerms,
        collaborators: Collaborators,
    ) {
        let tables = work_tables(zone_system, distance_utility, &size_terms);
        let mut model = model(&collaborators, tables, size_terms);
        let mut rng = StdRng::seed_from_u64(1);
        model
            .sample_alternatives(MacroZone(1), 0, &mut rng)
            .unwrap();

        let factors = model.correction_factors();
        let unique = model.sample().unique_alternatives().collect::<Vec<_>>();
        assert_eq!(factors.len(), unique.len());
        for (micro_zone, factor) in unique.into_iter().zip(factors) {
            let draw = model
                .sample()
                .draws()
                .iter()
                .find(|draw| draw.micro_zone == micro_zone)
                .unwrap();
            let frequency = model.sample().frequency(micro_zone) as f64;
            assert_approx_eq!(f64, factor, (frequency / draw.probability).ln());
        }

        model.reset_scratch();
        assert!(model.sample().is_empty());
        assert!(model.correction_factors().is_empty());
    }

    #[rstest]
    fn test_sample_unreachable_origin(zone_system: ZoneSystem, collaborators: Collaborators) {
        let segments = crate::segment::SegmentIndexMap::from_names(["office"]).unwrap();
        let size_terms = SizeTerms::new(segments, vec![vec![1.0, 0.0, 0.0]]).unwrap();
        let utilities = FixedDistanceUtility::new(vec![
            vec![0.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0],
            vec![-1000.0, -1000.0, 0.0],
        ]);
        let tables = work_tables(zone_system, utilities, &size_terms);
        let mut model = model(&collaborators, tables, size_terms);
        let mut rng = StdRng::seed_from_u64(0);

        assert!(
            model
                .sample_alternatives(MacroZone(2), 0, &mut rng)
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            model.choose_destination(MicroZone(2), 0, &mut rng).unwrap(),
            None
        );
    }

    #[rstest]
    fn test_sample_unknown_segment(
        zone_system: ZoneSystem,
        distance_utility: FixedDistanceUtility,
        size_terms: SizeTerms,
        collaborators: Collaborators,
    ) {
        let tables = work_tables(zone_system, distance_utility, &size_terms);
        let mut model = model(&collaborators, tables, size_terms);
        let mut rng = StdRng::seed_from_u64(0);
        assert_error!(
            model.sample_alternatives(MacroZone(0), 1, &mut rng),
            "No work SOA probabilities for segment index 1"
        );
    }

    #[rstest]
    fn test_choose_destination(
        zone_system: ZoneSystem,
        distance_utility: FixedDistanceUtility,
        size_terms: SizeTerms,
        collaborators: Collaborators,
    ) {
        let tables = work_tables(zone_system, distance_utility, &size_terms);
        let mut model = model(&collaborators, tables, size_terms);
        let mut rng = StdRng::seed_from_u64(7);

        for origin in [MicroZone(0), MicroZone(1), MicroZone(2)] {
            let chosen = model.choose_destination(origin, 0, &mut rng).unwrap();
            assert!(matches!(chosen, Some(MicroZone(0 | 2))));
        }
    }

    #[test]
    fn test_size_logsum_utility() {
        let utility = SizeLogsumUtility {
            logsum_coefficient: 2.0,
            distance_coefficient: -1.0,
        };
        let mut alternative = AlternativeAttributes {
            origin: MicroZone(0),
            destination: MicroZone(1),
            segment: 0,
            logsum: 0.5,
            size: 1.0,
            distance: Some(3.0),
            correction_factor: 0.25,
        };
        assert_approx_eq!(f64, utility.utility(&alternative), 1.0 - 3.0 + 0.25);

        alternative.size = 0.0;
        assert_eq!(utility.utility(&alternative), f64::NEG_INFINITY);
    }
}
