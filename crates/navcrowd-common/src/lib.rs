//! Common utilities and data structures shared by the navcrowd crates

mod geometry;
mod math;

pub use geometry::*;
pub use math::*;

/// Represents a 3D position
pub type Vec3 = glam::Vec3;

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("navigation mesh error: {0}")]
    NavMesh(String),

    #[error("pathfinding failed: {0}")]
    Pathfinding(String),

    #[error("crowd error: {0}")]
    Crowd(String),

    /// An internal invariant was broken. Not recoverable by retrying.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Result type for navcrowd operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Invariant("empty corridor".to_string());
        assert_eq!(err.to_string(), "invariant violated: empty corridor");

        let err = Error::NavMesh("Invalid parameter".to_string());
        assert_eq!(err.to_string(), "navigation mesh error: Invalid parameter");
    }
}
