//! voice-relay library crate
//!
//! This module exposes internal types for integration testing.
//! The main binary is in main.rs.

#[macro_use]
extern crate log;

pub mod backend;
pub mod commands;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod ids;
pub mod lock;
pub mod pipe;
pub mod registry;
pub mod resample;
pub mod session;
pub mod sources;

#[cfg(feature = "discord")]
pub mod discord;
