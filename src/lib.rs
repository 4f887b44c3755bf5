// src/lib.rs

//! bmsync: deduplication, quality-gated re-extraction and offline-first
//! sync for BMS telemetry records.

pub mod cache;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
