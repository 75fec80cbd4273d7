//! Measurement tables and their on-disk format.
pub mod table;
pub mod writer;
