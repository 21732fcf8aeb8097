pub mod aggregate;
pub mod continuity;

pub use aggregate::{aggregate, bucket_start, period_in_progress};
pub use continuity::{bar_direction, common_direction, ContinuityEvaluator};
