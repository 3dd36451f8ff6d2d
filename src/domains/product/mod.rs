pub mod repository;
pub mod types;

pub use repository::{ProductRepository, SqliteProductRepository};
pub use types::{NewProduct, Product, ProductFilter, UpdateProduct};
