//! Change Databases
//!
//! Embedded SQLite stores for classified change records (one per worker
//! or node agent) and for merged, de-duplicated output.

pub mod changes;
pub mod merge;

pub use changes::{ChangeDb, NewChange};
pub use merge::{OutputMerger, OutputRow};
