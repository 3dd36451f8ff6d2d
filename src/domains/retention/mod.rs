pub mod service;

pub use service::{PruneReport, RetentionService};
