use std::fmt;

/// Errors that can occur when building a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  /// The cache was configured with a maximum size of zero. A loading cache
  /// must be able to hold at least one entry.
  ZeroMaxSize,
  /// The cache was configured with a zero time-to-live, which would expire
  /// every entry the moment it is loaded.
  ZeroTimeToLive,
  /// A `refresh` interval was configured without a default loader. Background
  /// reload needs a loader it can invoke on its own.
  RefreshWithoutLoader,
  /// The `refresh` interval is not strictly below the time-to-live, so an
  /// entry would always expire before its first reload could fire.
  RefreshNotBelowTimeToLive,
}

impl fmt::Display for BuildError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BuildError::ZeroMaxSize => write!(f, "cache max size cannot be zero"),
      BuildError::ZeroTimeToLive => write!(f, "cache time-to-live cannot be zero"),
      BuildError::RefreshWithoutLoader => {
        write!(f, "a refresh interval requires a default loader")
      }
      BuildError::RefreshNotBelowTimeToLive => write!(
        f,
        "the refresh interval must be strictly below the time-to-live"
      ),
    }
  }
}

impl std::error::Error for BuildError {}
