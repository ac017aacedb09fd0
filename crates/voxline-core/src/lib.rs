//! Core types, config, errors, and session model for Voxline.

pub mod config;
pub mod context;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod session;
