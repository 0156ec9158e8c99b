//! Zones are the spatial units between which destinations are chosen.
//!
//! There are two nested levels: fine-grained micro-zones and the macro-zones which group them. The
//! sample of alternatives is drawn in two stages (first a macro-zone, then a micro-zone within it),
//! so the cache needs to know which micro-zones belong to each macro-zone.
use anyhow::{Result, bail, ensure};
use itertools::Itertools;

/// A fine-grained zone, indexed from zero
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    derive_more::From,
)]
pub struct MicroZone(pub usize);

/// An aggregate zone, indexed from zero
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    derive_more::From,
)]
pub struct MacroZone(pub usize);

/// Provides the zone geography used when building probability tables.
///
/// The membership of micro-zones in macro-zones is immutable for the whole run.
pub trait ZoneData: Send + Sync {
    /// The number of macro-zones
    fn num_macro_zones(&self) -> usize;

    /// The number of micro-zones
    fn num_micro_zones(&self) -> usize;

    /// The micro-zones in `macro_zone`, in a fixed order (may be empty)
    fn micro_zones_of(&self, macro_zone: MacroZone) -> &[MicroZone];

    /// The macro-zone containing `micro_zone`
    fn macro_zone_of(&self, micro_zone: MicroZone) -> MacroZone;

    /// Iterate over all macro-zones in order
    fn iter_macro_zones(&self) -> Box<dyn Iterator<Item = MacroZone> + '_> {
        Box::new((0..self.num_macro_zones()).map(MacroZone))
    }
}

/// A zone system built from an explicit micro-zone to macro-zone correspondence
#[derive(Debug, PartialEq)]
pub struct ZoneSystem {
    members: Vec<Vec<MicroZone>>,
    parents: Vec<MacroZone>,
}

impl ZoneSystem {
    /// Create a zone system.
    ///
    /// # Arguments
    ///
    /// * `num_macro_zones` - Total number of macro-zones (some may have no micro-zones)
    /// * `parents` - The macro-zone of each micro-zone, indexed by micro-zone
    pub fn new(num_macro_zones: usize, parents: Vec<MacroZone>) -> Result<Self> {
        ensure!(num_macro_zones > 0, "Zone system must have at least one macro-zone");
        if let Some((micro_zone, parent)) = parents
            .iter()
            .find_position(|parent| parent.0 >= num_macro_zones)
        {
            bail!(
                "Micro-zone {micro_zone} belongs to macro-zone {parent}, but there are only \
                {num_macro_zones} macro-zones"
            );
        }

        let mut members = vec![Vec::new(); num_macro_zones];
        for (micro_zone, parent) in parents.iter().enumerate() {
            members[parent.0].push(MicroZone(micro_zone));
        }

        Ok(Self { members, parents })
    }
}

impl ZoneData for ZoneSystem {
    fn num_macro_zones(&self) -> usize {
        self.members.len()
    }

    fn num_micro_zones(&self) -> usize {
        self.parents.len()
    }

    fn micro_zones_of(&self, macro_zone: MacroZone) -> &[MicroZone] {
        &self.members[macro_zone.0]
    }

    fn macro_zone_of(&self, micro_zone: MicroZone) -> MacroZone {
        self.parents[micro_zone.0]
    }
}

/// Distances between macro-zones, shared read-only by every model instance
#[derive(Debug, PartialEq)]
pub struct DistanceSkims {
    distances: Vec<Vec<f64>>,
}

impl DistanceSkims {
    /// Create from a square matrix indexed by origin then destination macro-zone
    pub fn new(distances: Vec<Vec<f64>>, zones: &dyn ZoneData) -> Result<Self> {
        let num_macro_zones = zones.num_macro_zones();
        ensure!(
            distances.len() == num_macro_zones
                && distances.iter().all(|row| row.len() == num_macro_zones),
            "Distance skims must be {num_macro_zones} x {num_macro_zones}"
        );

        Ok(Self { distances })
    }

    /// The distance from `origin` to `destination`
    pub fn distance(&self, origin: MacroZone, destination: MacroZone) -> f64 {
        self.distances[origin.0][destination.0]
    }
}
