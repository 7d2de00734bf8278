pub mod catalog;
pub mod pg_executor;
