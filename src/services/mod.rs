pub mod classifier;
pub mod gallery;
pub mod ingestion;
pub mod interpreter;
pub mod staging;
