//! The Adaptive Rewriters (spec.md §4.6, §4.7): pure plan-tree transforms
//! the Stage Runtime applies to a stage's child once its inputs' statistics
//! are known.

mod handle_skewed_join;
mod optimize_join;

pub use handle_skewed_join::{handle_skewed_join, MAX_SKEW_SPLITS};
pub use optimize_join::optimize_join;
