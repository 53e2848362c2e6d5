//! Optional per-call deadlines for remote operations.

use std::future::Future;
use std::time::Duration;

/// Await `fut`, failing with `on_elapsed(limit)` if `limit` passes first.
///
/// With `limit == None` the future is awaited unbounded.
pub(crate) async fn bounded<T, E, F>(
    limit: Option<Duration>,
    fut: F,
    on_elapsed: impl FnOnce(Duration) -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match limit {
        None => fut.await,
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(on_elapsed(limit)),
        },
    }
}
