pub mod core;
pub mod customer;
pub mod outbox;
pub mod product;
pub mod retention;
pub mod sale;
pub mod sync;
