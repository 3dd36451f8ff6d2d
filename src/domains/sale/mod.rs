pub mod repository;
pub mod types;

pub use repository::{SaleRepository, SqliteSaleRepository};
pub use types::{NewSale, PaymentMethod, Sale, SaleFilter, SaleLine, SaleStatus, UpdateSale};
