//! Size terms measure how attractive each micro-zone is as a destination for each segment (e.g.
//! jobs for workers or enrolment for students).
//!
//! The probability cache only ever reads an immutable [`SizeTerms`] snapshot. Shadow pricing
//! adjusts size terms between outer iterations by publishing a new snapshot.
use crate::segment::SegmentIndexMap;
use crate::zone::ZoneData;
use anyhow::{Result, ensure};
use itertools::Itertools;
use log::info;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// A read-only snapshot of size terms for every segment and micro-zone
#[derive(Debug, Clone, PartialEq)]
pub struct SizeTerms {
    segments: SegmentIndexMap,
    sizes: Vec<Vec<f64>>,
}

impl SizeTerms {
    /// Create a new snapshot.
    ///
    /// # Arguments
    ///
    /// * `segments` - Names of segments and their index into `sizes`
    /// * `sizes` - Size terms by segment index then micro-zone
    pub fn new(segments: SegmentIndexMap, sizes: Vec<Vec<f64>>) -> Result<Self> {
        ensure!(
            segments.len() == sizes.len(),
            "There are {} segments but size terms were given for {}",
            segments.len(),
            sizes.len()
        );
        ensure!(
            sizes.iter().map(Vec::len).all_equal(),
            "Size terms must be given for the same number of micro-zones in every segment"
        );
        for (id, index) in segments.iter() {
            ensure!(
                sizes[index].iter().all(|size| size.is_finite() && *size >= 0.0),
                "Size terms for segment {id} must be finite and non-negative"
            );
        }

        Ok(Self { segments, sizes })
    }

    /// The names of segments and their indices
    pub fn segment_map(&self) -> &SegmentIndexMap {
        &self.segments
    }

    /// The size term of every micro-zone for the given segment
    pub fn size_array(&self, segment: usize) -> &[f64] {
        &self.sizes[segment]
    }

    /// Check that there is a size term for every micro-zone in the zone system
    pub fn check_zones(&self, zones: &dyn ZoneData) -> Result<()> {
        if let Some(sizes) = self.sizes.first() {
            ensure!(
                sizes.len() == zones.num_micro_zones(),
                "Size terms are given for {} micro-zones, but the zone system has {}",
                sizes.len(),
                zones.num_micro_zones()
            );
        }

        Ok(())
    }
}

/// Supplies the current size-term snapshot
pub trait SizeTermProvider: Send + Sync {
    /// The size terms to use for the current outer iteration
    fn snapshot(&self) -> Arc<SizeTerms>;
}

/// Size terms which are rescaled between iterations to match modelled destinations to targets.
///
/// Sizes are first balanced so that, for every segment, total size equals the total number of
/// origins (e.g. workers). Each outer iteration then multiplies the size of each micro-zone by a
/// shadow price, which rises where too few destinations were modelled and falls where too many
/// were.
pub struct ShadowPricedSize {
    state: Mutex<ShadowPriceState>,
}

struct ShadowPriceState {
    segments: SegmentIndexMap,
    raw: Vec<Vec<f64>>,
    scaled: Vec<Vec<f64>>,
    shadow_prices: Vec<Vec<f64>>,
    unpriced_segments: HashSet<usize>,
    current: Arc<SizeTerms>,
}

impl ShadowPricedSize {
    /// Create from raw size terms. All shadow prices start at 1.
    pub fn new(segments: SegmentIndexMap, raw_sizes: Vec<Vec<f64>>) -> Result<Self> {
        let current = Arc::new(SizeTerms::new(segments.clone(), raw_sizes.clone())?);
        let shadow_prices = raw_sizes.iter().map(|sizes| vec![1.0; sizes.len()]).collect();

        Ok(Self {
            state: Mutex::new(ShadowPriceState {
                segments,
                raw: raw_sizes.clone(),
                scaled: raw_sizes,
                shadow_prices,
                unpriced_segments: HashSet::new(),
                current,
            }),
        })
    }

    /// Exclude segments from shadow pricing (their sizes stay at the balanced values)
    pub fn set_unpriced_segments(&self, segments: HashSet<usize>) {
        self.state.lock().unpriced_segments = segments;
    }

    /// Scale the sizes of each segment so that they sum to the total number of origins.
    ///
    /// Segments with no size at all are scaled to zero. Shadow prices are reset to 1 and the
    /// balanced sizes are published as the current snapshot.
    ///
    /// # Arguments
    ///
    /// * `origins` - Number of origins (e.g. workers) by segment then home micro-zone
    pub fn balance(&self, origins: &[Vec<f64>]) -> Result<()> {
        let mut state = self.state.lock();
        ensure!(
            origins.len() == state.scaled.len(),
            "Origins were given for {} segments but there are {}",
            origins.len(),
            state.scaled.len()
        );

        let raw = &state.raw;
        let mut scaled = Vec::with_capacity(raw.len());
        for ((id, index), segment_origins) in state.segments.iter().zip(origins) {
            let total_origins: f64 = segment_origins.iter().sum();
            let total_size: f64 = raw[index].iter().sum();
            info!(
                "Segment {id}: total origins {total_origins:.1}, total size before balancing \
                {total_size:.1}"
            );

            scaled.push(if total_size > 0.0 {
                raw[index]
                    .iter()
                    .map(|size| size * total_origins / total_size)
                    .collect()
            } else {
                vec![0.0; raw[index].len()]
            });
        }

        state.shadow_prices = scaled.iter().map(|sizes| vec![1.0; sizes.len()]).collect();
        state.scaled = scaled;
        state.publish()
    }

    /// Adjust shadow prices from the number of destinations chosen in the last iteration.
    ///
    /// Micro-zones where nothing was chosen keep their current shadow price.
    ///
    /// # Arguments
    ///
    /// * `modelled` - Number of chosen destinations by segment then micro-zone
    pub fn update_shadow_prices(&self, modelled: &[Vec<f64>]) -> Result<()> {
        let mut state = self.state.lock();
        ensure!(
            modelled.len() == state.scaled.len(),
            "Modelled destinations were given for {} segments but there are {}",
            modelled.len(),
            state.scaled.len()
        );

        let ShadowPriceState {
            scaled,
            shadow_prices,
            unpriced_segments,
            ..
        } = &mut *state;
        for (segment, (prices, targets)) in shadow_prices.iter_mut().zip(scaled.iter()).enumerate()
        {
            if unpriced_segments.contains(&segment) {
                continue;
            }

            for (price, (target, chosen)) in prices
                .iter_mut()
                .zip(targets.iter().zip(&modelled[segment]))
            {
                if *chosen > 0.0 {
                    *price *= target / chosen;
                }
            }
        }

        Ok(())
    }

    /// Apply the current shadow prices to the balanced sizes and publish a new snapshot
    pub fn update_size_variables(&self) -> Result<()> {
        self.state.lock().publish()
    }

    /// The largest relative difference between modelled and target destinations, by segment.
    ///
    /// Only micro-zones with a positive target are considered. Used to report convergence of
    /// shadow pricing.
    pub fn max_relative_difference(&self, modelled: &[Vec<f64>]) -> Vec<f64> {
        let state = self.state.lock();
        state
            .segments
            .iter()
            .map(|(id, index)| {
                let max_diff = state.scaled[index]
                    .iter()
                    .zip(&modelled[index])
                    .filter(|(target, _)| **target > 0.0)
                    .map(|(target, chosen)| (chosen - target).abs() / target)
                    .fold(0.0, f64::max);
                info!("Segment {id}: maximum relative difference {max_diff:.4}");
                max_diff
            })
            .collect()
    }
}

impl ShadowPriceState {
    /// Build a new snapshot from the balanced sizes and shadow prices
    fn publish(&mut self) -> Result<()> {
        let sizes = self
            .scaled
            .iter()
            .zip(&self.shadow_prices)
            .map(|(scaled, prices)| {
                scaled
                    .iter()
                    .zip(prices)
                    .map(|(size, price)| (size * price).max(0.0))
                    .collect()
            })
            .collect();
        self.current = Arc::new(SizeTerms::new(self.segments.clone(), sizes)?);

        Ok(())
    }
}

impl SizeTermProvider for ShadowPricedSize {
    fn snapshot(&self) -> Arc<SizeTerms> {
        Arc::clone(&self.state.lock().current)
    }
}
