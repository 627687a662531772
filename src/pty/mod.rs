//! PTY process launching and terminal emulation.

pub mod handler;

pub use handler::PtyLauncher;
