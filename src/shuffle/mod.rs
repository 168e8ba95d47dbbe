//! The shuffle read path (spec.md §4.1): resolving a `QueryStageInput` into
//! partition ranges and opening readers for them against the `ShuffleManager`
//! collaborator. Shuffle writes are the other half of spec.md §6's external
//! shuffle I/O subsystem and are represented purely by the `ShuffleExecutor`
//! trait in `collaborators`; there is no writer type here to mirror it.

mod reader;

pub use reader::{open_readers, preferred_locations_for, resolve_ranges};
