//! randofetch: discover which system fetchers work on this machine, cache
//! them, and pick one at random (optionally with a random image).

pub mod command;
pub mod config;
pub mod error;
pub mod expand;
pub mod fetcher_set;
pub mod library;
pub mod paths;
pub mod probe;
pub mod scan;

pub use error::Error;
pub use fetch_model::{
    ArgTemplate, ExtraRequirement, Fetcher, ProgramDescriptor, VisualizationMethod,
};
pub use fetcher_set::{DiscoveryOptions, FetcherSet, TimingEntry};
