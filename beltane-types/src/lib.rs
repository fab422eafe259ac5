//! # beltane-types
//!
//! Shared plain-data types for the Beltane studio core.
//! This crate carries the configuration, error taxonomy and notification
//! event types used by beltane-studio and by anything embedding it.

mod config;
mod error;
mod event;

pub use config::{ConfigError, SampleFormat, StudioConfig, StudioPorts};
pub use error::StudioError;
pub use event::{Level, Notification};
