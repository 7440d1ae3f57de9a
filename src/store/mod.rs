pub mod postgres;

pub use postgres::PgStore;
