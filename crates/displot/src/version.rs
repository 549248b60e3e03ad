//! Version information for displot.

/// displot version from Cargo.toml
pub const DISPLOT_VERSION: &str = env!("CARGO_PKG_VERSION");
