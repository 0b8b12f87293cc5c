use thiserror::Error;

/// Errors raised by the allocation tracker itself.
///
/// All of these indicate incorrect use of the tracker and are not worth retrying.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Tracking was requested while another tracking session is still active in this process.
    #[error("allocation tracking is already active in this process")]
    AlreadyTracking,

    /// The tracking session has been stopped, so there is nothing to capture.
    #[error("allocation tracking is not enabled")]
    TrackingNotEnabled,

    /// The tracking [`Allocator`](crate::Allocator) has not been registered as the global
    /// allocator, so no allocation could ever be observed.
    #[error("the leak_probe::Allocator is not installed as the #[global_allocator]")]
    AllocatorNotInstalled,
}

/// Error returned when probing an operation.
///
/// Failures of the operation under test are surfaced unmodified, as they are diagnostic
/// information in their own right.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProbeError<E> {
    /// The tracker could not capture the measurement.
    #[error(transparent)]
    Tracking(#[from] Error),

    /// The operation under test returned an error.
    #[error(transparent)]
    TargetOperation(E),
}

impl<E> ProbeError<E> {
    /// Returns the error of the operation under test, if that is what failed.
    #[must_use]
    pub fn into_target_error(self) -> Option<E> {
        match self {
            Self::TargetOperation(e) => Some(e),
            Self::Tracking(_) => None,
        }
    }
}

/// A specialized `Result` type for tracker operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
