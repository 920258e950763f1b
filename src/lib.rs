//! Client for a data grouping service: upload tabular files, follow their
//! analysis, group rows with natural-language instructions and export the
//! groups as CSV.

pub mod cli;
pub mod export;
pub mod model;
pub mod orchestrator;
pub mod prompt_store;
pub mod render;
pub mod service;
