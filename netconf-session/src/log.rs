//! Logging setup.
//!
//! The library logs through `tracing`; this module maps the embedder-facing
//! verbosity levels onto a subscriber filter.

use tracing::level_filters::LevelFilter;

/// Embedder-facing verbosity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// Errors only.
    #[default]
    Error,
    /// Errors and warnings.
    Warning,
    /// Errors, warnings, and progress messages.
    Verbose,
    /// Everything, including per-message traces.
    Debug,
}

impl Verbosity {
    /// The tracing level filter this verbosity corresponds to.
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Verbosity::Error => LevelFilter::ERROR,
            Verbosity::Warning => LevelFilter::WARN,
            Verbosity::Verbose => LevelFilter::INFO,
            Verbosity::Debug => LevelFilter::DEBUG,
        }
    }
}

impl std::str::FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(Verbosity::Error),
            "warning" => Ok(Verbosity::Warning),
            "verbose" => Ok(Verbosity::Verbose),
            "debug" => Ok(Verbosity::Debug),
            other => Err(format!("unknown verbosity {other:?}")),
        }
    }
}

/// Install a global subscriber at the given verbosity.
///
/// Embedders with their own subscriber simply skip this call; a second
/// initialization is ignored.
pub fn init(verbosity: Verbosity) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(verbosity.level_filter())
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_parse() {
        assert_eq!("error".parse::<Verbosity>().unwrap(), Verbosity::Error);
        assert_eq!("debug".parse::<Verbosity>().unwrap(), Verbosity::Debug);
        assert!("loud".parse::<Verbosity>().is_err());
    }

    #[test]
    fn test_verbosity_ordering() {
        assert!(Verbosity::Debug > Verbosity::Verbose);
        assert!(Verbosity::Verbose > Verbosity::Warning);
    }
}
