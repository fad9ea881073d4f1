mod postgres;

pub use postgres::NodeStore;
