//! The sample-of-alternatives (SOA) probability cache.
//!
//! For every segment of a domain the cache holds two sets of probabilities, which together let a
//! model draw destinations in two stages:
//!
//! * For each origin macro-zone, a cumulative distribution over destination macro-zones, derived
//!   from distance utilities weighted by macro-zone size.
//! * For each macro-zone, the share of its size held by each of its micro-zones.
//!
//! The tables for a domain are built as a single generation and only installed once every segment
//! has been computed, so a failure part-way through never leaves a half-updated cache behind.
use crate::probability::{
    cumulative_probability_from_weights, exponentiate_utilities, size_shares, zone_aggregate_size,
};
use crate::segment::{Domain, SchoolSegmentType, SegmentID};
use crate::size::SizeTerms;
use crate::zone::{MacroZone, ZoneData};
use anyhow::{Context, Result, ensure};
use indexmap::IndexMap;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;

/// What a distance utility matrix is being computed for
#[derive(Debug, Clone, Copy)]
pub enum DistanceUtilityContext<'a> {
    /// A single work segment
    Work {
        /// The segment
        segment: &'a SegmentID,
        /// Total size of each macro-zone for this segment
        macro_zone_size: &'a [f64],
    },
    /// All segments of a school segment type, which share their distance utilities
    School {
        /// The school segment type
        segment_type: SchoolSegmentType,
    },
}

/// Computes raw distance-based utilities between macro-zones
pub trait DistanceUtility: Send + Sync {
    /// A matrix of utilities indexed by origin then destination macro-zone
    fn distance_utility_matrix(&self, context: &DistanceUtilityContext) -> Result<Vec<Vec<f64>>>;
}

/// Probability tables for a single segment
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTables {
    /// The segment the tables were computed for
    id: SegmentID,
    /// Micro-zone size shares by macro-zone (empty where the macro-zone has no size)
    size_shares: Vec<Vec<f64>>,
    /// Cumulative destination macro-zone probabilities by origin macro-zone (empty where nothing
    /// can be reached)
    distance_cumulative: Vec<Vec<f64>>,
}

impl SegmentTables {
    /// Build the tables from exponentiated distance utilities and micro-zone sizes
    fn new(
        id: SegmentID,
        exp_utilities: &[Vec<f64>],
        micro_zone_sizes: &[f64],
        zones: &dyn ZoneData,
    ) -> Self {
        let macro_zone_size = zone_aggregate_size(micro_zone_sizes, zones);
        let distance_cumulative = exp_utilities
            .iter()
            .map(|row| {
                let weights: Vec<f64> = row
                    .iter()
                    .zip(&macro_zone_size)
                    .map(|(exp_utility, size)| exp_utility * size)
                    .collect();
                cumulative_probability_from_weights(&weights)
            })
            .collect();
        let size_shares = zones
            .iter_macro_zones()
            .map(|macro_zone| size_shares(micro_zone_sizes, zones.micro_zones_of(macro_zone)))
            .collect();

        Self {
            id,
            size_shares,
            distance_cumulative,
        }
    }

    /// The segment these tables were computed for
    pub fn id(&self) -> &SegmentID {
        &self.id
    }

    /// Each micro-zone's share of the size of `macro_zone`, or `None` if there is no such
    /// macro-zone
    pub fn size_shares(&self, macro_zone: MacroZone) -> Option<&[f64]> {
        self.size_shares.get(macro_zone.0).map(Vec::as_slice)
    }

    /// The cumulative probability of choosing each destination macro-zone from `origin`, or
    /// `None` if there is no such macro-zone
    pub fn distance_cumulative(&self, origin: MacroZone) -> Option<&[f64]> {
        self.distance_cumulative.get(origin.0).map(Vec::as_slice)
    }
}

/// One generation of probability tables for a domain
#[derive(Debug, PartialEq)]
pub struct DomainTables {
    domain: Domain,
    iteration: u32,
    segments: HashMap<usize, SegmentTables>,
}

impl DomainTables {
    /// The domain these tables belong to
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// The outer iteration for which these tables were computed
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Get the tables for a segment, by its index in the size terms
    pub fn segment(&self, segment: usize) -> Result<&SegmentTables> {
        self.segments.get(&segment).with_context(|| {
            format!(
                "No {} SOA probabilities for segment index {segment}",
                self.domain
            )
        })
    }

    /// The number of segments with tables
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Check that `sizes` gives every segment the index these tables were computed with
    pub fn check_segment_indices(&self, sizes: &SizeTerms) -> Result<()> {
        for (&index, tables) in &self.segments {
            let id = tables.id();
            let size_index = sizes
                .segment_map()
                .index_of(&id.0)
                .with_context(|| format!("No size terms for segment {id}"))?;
            ensure!(
                size_index == index,
                "Size terms for segment {id} have index {size_index}, but the {} SOA \
                probabilities were computed with index {index}",
                self.domain
            );
        }

        Ok(())
    }
}

/// Holds the current generation of probability tables for each domain
pub struct SoaProbabilityCache {
    zones: Arc<dyn ZoneData>,
    distance_utility: Arc<dyn DistanceUtility>,
    work: Option<Arc<DomainTables>>,
    school: Option<Arc<DomainTables>>,
}

impl SoaProbabilityCache {
    /// Create an empty cache
    pub fn new(zones: Arc<dyn ZoneData>, distance_utility: Arc<dyn DistanceUtility>) -> Self {
        Self {
            zones,
            distance_utility,
            work: None,
            school: None,
        }
    }

    /// The current tables for `domain`, if they have been computed
    pub fn tables(&self, domain: Domain) -> Option<&Arc<DomainTables>> {
        match domain {
            Domain::Work => self.work.as_ref(),
            Domain::School => self.school.as_ref(),
        }
    }

    /// Drop this cache's reference to the tables for `domain`.
    ///
    /// The memory is freed once no model instance refers to them either.
    pub fn release(&mut self, domain: Domain) {
        if self.slot(domain).take().is_some() {
            info!("Released {domain} SOA probability tables");
        }
    }

    /// Micro-zone size shares for a segment and macro-zone, if the domain's tables are resident
    pub fn mgra_size_probability(
        &self,
        domain: Domain,
        segment: usize,
        macro_zone: MacroZone,
    ) -> Option<&[f64]> {
        self.tables(domain)?
            .segment(segment)
            .ok()?
            .size_shares(macro_zone)
    }

    /// Cumulative destination macro-zone probabilities for a segment and origin, if the domain's
    /// tables are resident
    pub fn taz_distance_probability(
        &self,
        domain: Domain,
        segment: usize,
        origin: MacroZone,
    ) -> Option<&[f64]> {
        self.tables(domain)?
            .segment(segment)
            .ok()?
            .distance_cumulative(origin)
    }

    /// Recompute the tables for every work segment.
    ///
    /// # Arguments
    ///
    /// * `sizes` - Size terms for this iteration
    /// * `segments` - The work segments
    /// * `iteration` - The outer iteration the tables are for
    pub fn recompute_work_domain(
        &mut self,
        sizes: &SizeTerms,
        segments: &[SegmentID],
        iteration: u32,
    ) -> Result<()> {
        let mut tables = HashMap::new();
        for id in segments {
            info!("Computing work SOA distance and size probabilities for segment {id}");
            let index = sizes.segment_map().index_of(&id.0)?;
            let micro_zone_sizes = sizes.size_array(index);
            let macro_zone_size = zone_aggregate_size(micro_zone_sizes, self.zones.as_ref());
            let context = DistanceUtilityContext::Work {
                segment: id,
                macro_zone_size: &macro_zone_size,
            };
            let exp_utilities = self
                .exponentiated_distance_utilities(&context)
                .with_context(|| format!("Failed to compute distance utilities for segment {id}"))?;
            tables.insert(
                index,
                SegmentTables::new(
                    id.clone(),
                    &exp_utilities,
                    micro_zone_sizes,
                    self.zones.as_ref(),
                ),
            );
        }

        self.work = Some(Arc::new(DomainTables {
            domain: Domain::Work,
            iteration,
            segments: tables,
        }));

        Ok(())
    }

    /// Recompute the tables for every school segment.
    ///
    /// Distance utilities are computed once per school segment type and shared by all segments of
    /// that type (and by any type which reuses another's utilities).
    ///
    /// # Arguments
    ///
    /// * `sizes` - Size terms for this iteration
    /// * `segments` - The school segments of each school segment type
    /// * `iteration` - The outer iteration the tables are for
    pub fn recompute_school_domain(
        &mut self,
        sizes: &SizeTerms,
        segments: &IndexMap<SchoolSegmentType, Vec<SegmentID>>,
        iteration: u32,
    ) -> Result<()> {
        let mut exp_utilities_by_type: HashMap<SchoolSegmentType, Arc<Vec<Vec<f64>>>> =
            HashMap::new();
        let mut tables = HashMap::new();
        for (&segment_type, ids) in segments {
            if ids.is_empty() {
                continue;
            }

            info!("Computing {segment_type} SOA distance and size probabilities");
            let source_type = segment_type
                .shares_distance_utilities_with()
                .unwrap_or(segment_type);
            let exp_utilities = if let Some(exp_utilities) = exp_utilities_by_type.get(&source_type)
            {
                debug!("Reusing {source_type} distance utilities for {segment_type}");
                Arc::clone(exp_utilities)
            } else {
                let context = DistanceUtilityContext::School {
                    segment_type: source_type,
                };
                let exp_utilities = Arc::new(
                    self.exponentiated_distance_utilities(&context)
                        .with_context(|| {
                            format!("Failed to compute distance utilities for {segment_type}")
                        })?,
                );
                exp_utilities_by_type.insert(source_type, Arc::clone(&exp_utilities));
                exp_utilities
            };

            for id in ids {
                let index = sizes.segment_map().index_of(&id.0)?;
                let segment_tables = SegmentTables::new(
                    id.clone(),
                    &exp_utilities,
                    sizes.size_array(index),
                    self.zones.as_ref(),
                );
                tables.insert(index, segment_tables);
            }
        }

        self.school = Some(Arc::new(DomainTables {
            domain: Domain::School,
            iteration,
            segments: tables,
        }));

        Ok(())
    }

    /// Ask the collaborator for distance utilities and exponentiate them
    fn exponentiated_distance_utilities(
        &self,
        context: &DistanceUtilityContext,
    ) -> Result<Vec<Vec<f64>>> {
        let utilities = self.distance_utility.distance_utility_matrix(context)?;
        let num_macro_zones = self.zones.num_macro_zones();
        ensure!(
            utilities.len() == num_macro_zones
                && utilities.iter().all(|row| row.len() == num_macro_zones),
            "Distance utility matrix must be {num_macro_zones} x {num_macro_zones}"
        );

        exponentiate_utilities(&utilities)
    }

    fn slot(&mut self, domain: Domain) -> &mut Option<Arc<DomainTables>> {
        match domain {
            Domain::Work => &mut self.work,
            Domain::School => &mut self.school,
        }
    }
}
