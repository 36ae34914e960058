//! Operation-with-timeout primitive.

use std::future::Future;
use std::time::Duration;

/// Outcome of racing an operation against a timer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Timed<T> {
    Completed(T),
    TimedOut,
}

impl<T> Timed<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Timed::Completed(value) => Some(value),
            Timed::TimedOut => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Timed::TimedOut)
    }
}

/// Wait for `fut` for at most `limit`.
///
/// On timeout the future is dropped; callers that need a late completion to
/// be ignored rather than dropped must guard it with their own epoch check.
pub async fn with_timeout<F>(limit: Duration, fut: F) -> Timed<F::Output>
where
    F: Future,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(value) => Timed::Completed(value),
        Err(_) => Timed::TimedOut,
    }
}
