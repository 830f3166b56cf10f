//! Failover group merging
//!
//! Combines the packet streams of several redundant sessions into one
//! deduplicated stream, falling back across components by priority.

pub mod merger;

pub use merger::{
    ComponentStats, MergeError, MergeInput, MergeMode, MergedPacket, Merger, MergerConfig,
    MergerStats, Priority,
};
