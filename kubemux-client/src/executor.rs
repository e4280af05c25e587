//! Replays one operation against every configured cluster.

use futures::future::join_all;
use std::fmt::Display;
use std::future::Future;
use tracing::error;

/// Something an operation can be replayed against.
pub trait Target {
    fn name(&self) -> &str;
}

/// Run `op` against every target concurrently and wait for all of them.
///
/// A failing target is logged and never cancels or delays the others. Returns
/// the names of the targets that failed.
pub async fn execute<T, F, Fut, E>(targets: &[T], op: F) -> Vec<String>
where
    T: Target,
    F: Fn(&T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let runs = targets.iter().map(|target| {
        let fut = op(target);
        async move {
            match fut.await {
                Ok(()) => None,
                Err(e) => {
                    error!(context = %target.name(), "{}", e);
                    Some(target.name().to_string())
                }
            }
        }
    });

    join_all(runs).await.into_iter().flatten().collect()
}
