//! Session registry and coordinator.

pub mod coordinator;
pub mod error;
pub mod path;

#[cfg(test)]
mod tests;

pub use coordinator::{LifecycleSink, RegistryBuilder, SessionRegistry};
pub use error::RegistryError;
