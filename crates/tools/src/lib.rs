//! Support code for the `climate-tools` binary.

pub mod config;
pub mod surface;

pub use config::ToolsConfig;
pub use surface::LoggingSurface;
