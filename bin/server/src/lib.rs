//! Run submission and monitoring server for the silver-telegram workflow
//! runner.

pub mod app;
pub mod config;
pub mod error;
