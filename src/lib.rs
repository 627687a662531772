//! claudemux library crate.
//!
//! This library provides the core functionality for claudemux, including:
//! - One PTY-hosted CLI process per tracked project
//! - Debounced attention detection over each session's visible screen
//! - The session registry, state machine and event fan-out
//! - Persistence of the tracked project list

pub mod attention;
pub mod collaborators;
pub mod config;
pub mod event;
pub mod notify;
pub mod persistence;
pub mod pty;
pub mod registry;
pub mod session;
