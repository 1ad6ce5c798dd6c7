//! Pod profiler service: command line parsing and the HTTP surface

pub mod api;
pub mod config;
