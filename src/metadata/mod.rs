//! Metadata subsystem: authoritative placement records with a read-through
//! cache in front.

mod cache;
mod service;
mod store;

pub use cache::MetadataCache;
pub use service::{MetadataService, MetadataStats};
pub use store::{MetadataStore, PlacementStats, UpsertOutcome};
