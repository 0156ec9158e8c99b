//! Pure functions for converting size terms and distance utilities into sampling probabilities.
//!
//! None of these functions hold any state; they are called by the probability cache whenever it
//! rebuilds its tables.
use crate::zone::{MicroZone, ZoneData};
use anyhow::{Result, ensure};

/// Utilities below this value contribute nothing, rather than risking underflow in `exp`
pub const UTILITY_FLOOR: f64 = -500.0;

/// The size of a micro-zone once the bonus for having any size at all is applied.
///
/// A micro-zone with size `s > 0` counts as `s + 1`; an empty micro-zone counts as zero.
pub fn size_with_presence_bonus(size: f64) -> f64 {
    if size > 0.0 { size + 1.0 } else { 0.0 }
}

/// Sum micro-zone sizes into a total for each macro-zone.
///
/// # Arguments
///
/// * `micro_zone_sizes` - Size term for each micro-zone
/// * `zones` - Macro-zone membership of micro-zones
///
/// # Returns
///
/// The total size of each macro-zone, including the presence bonus for each non-empty
/// micro-zone.
pub fn zone_aggregate_size(micro_zone_sizes: &[f64], zones: &dyn ZoneData) -> Vec<f64> {
    zones
        .iter_macro_zones()
        .map(|macro_zone| {
            zones
                .micro_zones_of(macro_zone)
                .iter()
                .map(|micro_zone| size_with_presence_bonus(micro_zone_sizes[micro_zone.0]))
                .sum()
        })
        .collect()
}

/// Each micro-zone's share of the total size of the macro-zone which contains it.
///
/// Shares are given in the order of `members`. If the macro-zone has no size at all, the result is
/// empty, which marks the macro-zone as unavailable.
pub fn size_shares(micro_zone_sizes: &[f64], members: &[MicroZone]) -> Vec<f64> {
    let sizes: Vec<f64> = members
        .iter()
        .map(|micro_zone| size_with_presence_bonus(micro_zone_sizes[micro_zone.0]))
        .collect();
    let total: f64 = sizes.iter().sum();
    if total <= 0.0 {
        return Vec::new();
    }

    sizes.into_iter().map(|size| size / total).collect()
}

/// Exponentiate a matrix of raw utilities.
///
/// Utilities below [`UTILITY_FLOOR`] give zero. Non-finite utilities, or utilities so large that
/// they overflow, are an error.
pub fn exponentiate_utilities(utilities: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
    utilities
        .iter()
        .enumerate()
        .map(|(origin, row)| {
            row.iter()
                .enumerate()
                .map(|(destination, &utility)| {
                    ensure!(
                        !utility.is_nan(),
                        "Utility from {origin} to {destination} is not a number"
                    );
                    if utility < UTILITY_FLOOR {
                        return Ok(0.0);
                    }

                    let exp_utility = utility.exp();
                    ensure!(
                        exp_utility.is_finite(),
                        "Utility from {origin} to {destination} ({utility}) overflows when \
                        exponentiated"
                    );
                    Ok(exp_utility)
                })
                .collect()
        })
        .collect()
}

/// Normalise a vector of non-negative weights into a cumulative distribution.
///
/// The result is non-decreasing and every entry from the last positive weight onwards is exactly
/// 1.0. If the weights sum to zero (or there are none) the result is empty, meaning nothing can be
/// sampled.
pub fn cumulative_probability_from_weights(weights: &[f64]) -> Vec<f64> {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Vec::new();
    }

    let mut cumulative: Vec<f64> = weights
        .iter()
        .scan(0.0, |acc, weight| {
            *acc += weight / total;
            Some(*acc)
        })
        .collect();

    // Rounding error can leave the total slightly off. Trailing zero weights must keep zero width.
    if let Some(last_positive) = weights.iter().rposition(|weight| *weight > 0.0) {
        cumulative[last_positive..].fill(1.0);
    }

    cumulative
}

/// Recover the probability of a single entry from a cumulative distribution
pub fn probability_at(cumulative: &[f64], index: usize) -> f64 {
    if index == 0 {
        cumulative[0]
    } else {
        cumulative[index] - cumulative[index - 1]
    }
}

/// Find the entry of a cumulative distribution which contains `random_number`.
///
/// `lower_bound` is the cumulative probability below the first entry (zero for a full
/// distribution). The entry found is the first whose cumulative value is greater than
/// `random_number`, so entries with zero probability are never chosen.
///
/// # Returns
///
/// The index of the chosen entry or `None` if `random_number` lies outside
/// `[lower_bound, last entry)`.
pub fn inverse_cumulative_lookup(
    cumulative: &[f64],
    lower_bound: f64,
    random_number: f64,
) -> Option<usize> {
    let last = *cumulative.last()?;
    if random_number < lower_bound || random_number >= last {
        return None;
    }

    Some(cumulative.partition_point(|&value| value <= random_number))
}
