pub mod config;
pub mod db;
pub mod encoding;
pub mod error;
pub mod fetcher;
pub mod gazetteer;
pub mod geocoder;
pub mod normalizer;
pub mod pipeline;
pub mod reconcile;
pub mod resolver;
pub mod scheduler;
