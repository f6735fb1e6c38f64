#[cfg(feature = "cli")]
pub mod cli;
pub mod solver_config;

#[cfg(feature = "cli")]
pub use cli::{CliConfig, Command};
pub use solver_config::SolverConfig;
