pub mod repository;
pub mod types;

pub use repository::{CustomerRepository, SqliteCustomerRepository};
pub use types::{Customer, CustomerFilter, NewCustomer, UpdateCustomer};
