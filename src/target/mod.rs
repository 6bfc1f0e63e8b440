pub mod generator;
pub mod spec;
