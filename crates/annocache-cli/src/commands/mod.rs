//! Command handlers for the CLI

pub mod annotation;
pub mod config;
