pub mod index;
pub mod price;
