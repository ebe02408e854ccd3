//! Application layer: wiring and the running controller.

pub mod builder;

pub use builder::{App, AppBuilder, BuildError};
