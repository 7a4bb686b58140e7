pub mod reconcile;

pub use reconcile::{run_classes, run_plans};
