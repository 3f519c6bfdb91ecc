pub mod cli;
pub mod config;
pub mod db;
pub mod enrich;
pub mod error;
pub mod indexer;
pub mod jobs;
pub mod model;
pub mod util;
