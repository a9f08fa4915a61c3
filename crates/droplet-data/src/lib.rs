//! Data-driven scenario loading for the droplet simulator.
//!
//! A scenario directory holds a `chip` file and an optional `simulation`
//! file, each in RON, TOML or JSON. Channels and fluids are referred to by
//! name and resolved into builder calls.

pub mod loader;
pub mod schema;

pub use loader::{load_chip, load_scenario, DataLoadError, Scenario};
