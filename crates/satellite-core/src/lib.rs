//! Core types, wire protocol, config, errors, and collaborator traits for the
//! voice satellite bridge.

pub mod audio;
pub mod config;
pub mod error;
pub mod keep_alive;
pub mod matcher;
pub mod pipeline;
pub mod protocol;
pub mod timer;
pub mod types;
