pub mod repository;

pub use repository::{FindById, MergeableEntityRepository, Versioned};
