//! Concurrent destination-choice models for travel-demand microsimulation.
//!
//! The [`manager::DestChoiceModelManager`] hands pooled destination-choice models out to worker
//! threads and keeps the sample-of-alternatives probability tables they share up to date across
//! shadow-pricing iterations.
#![warn(missing_docs)]
use std::path::PathBuf;

pub mod id;
pub mod input;
pub mod log;
pub mod manager;
pub mod model;
pub mod parameters;
pub mod pool;
pub mod probability;
pub mod segment;
pub mod settings;
pub mod size;
pub mod soa;
pub mod zone;

#[cfg(test)]
mod fixture;

/// Get the path to the destchoice config directory.
///
/// Falls back to the current directory if the platform has no config directory.
pub fn get_destchoice_config_dir() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_default();
    path.push("destchoice");

    path
}
