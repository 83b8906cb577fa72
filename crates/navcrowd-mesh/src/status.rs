//! Status codes for navigation queries

/// Outcome of a navigation query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation was successful
    Success,
    /// Operation failed due to an unknown reason
    Failure,
    /// Provided parameter was invalid
    InvalidParam,
    /// Query is still running
    InProgress,
    /// Operation partially succeeded, e.g. the path does not reach the goal
    PartialResult,
    /// The result did not fit into the output buffer
    BufferTooSmall,
    /// The search ran out of nodes
    OutOfNodes,
    /// Value does not exist or is not found
    NotFound,
}

impl Status {
    /// Checks if the status is a failure
    pub fn is_failure(&self) -> bool {
        !self.is_success() && !self.is_in_progress()
    }

    /// Checks if the status is a success
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success | Status::PartialResult)
    }

    pub fn is_in_progress(&self) -> bool {
        *self == Status::InProgress
    }

    pub fn is_partial(&self) -> bool {
        *self == Status::PartialResult
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "Success"),
            Status::Failure => write!(f, "Failure"),
            Status::InvalidParam => write!(f, "Invalid parameter"),
            Status::InProgress => write!(f, "Operation in progress"),
            Status::PartialResult => write!(f, "Partial result"),
            Status::BufferTooSmall => write!(f, "Buffer too small"),
            Status::OutOfNodes => write!(f, "Out of nodes"),
            Status::NotFound => write!(f, "Value not found"),
        }
    }
}

/// State of a sliced pathfinding query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlicedPathState {
    /// Path finding is in progress
    InProgress,
    /// Path finding completed successfully
    Success,
    /// Path finding failed
    Failed,
    /// Partial path found (couldn't reach destination)
    PartialPath,
}

impl SlicedPathState {
    pub fn status(&self) -> Status {
        match self {
            SlicedPathState::InProgress => Status::InProgress,
            SlicedPathState::Success => Status::Success,
            SlicedPathState::Failed => Status::Failure,
            SlicedPathState::PartialPath => Status::PartialResult,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(Status::Success.is_success());
        assert!(Status::PartialResult.is_success());
        assert!(!Status::InProgress.is_success());
        assert!(!Status::InProgress.is_failure());
        assert!(Status::OutOfNodes.is_failure());
        assert_eq!(SlicedPathState::PartialPath.status(), Status::PartialResult);
    }
}
