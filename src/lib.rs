// src/lib.rs
pub mod config;
pub mod cost;
pub mod db;
pub mod matching;
pub mod merge;
pub mod models;
pub mod orchestrator;
pub mod review;
pub mod utils;
pub mod verification;

#[cfg(test)]
mod testing;
