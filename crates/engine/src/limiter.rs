//! Bounded concurrent map preserving input order.

use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;

use rlm_domain::Result;

/// Run `f` over `items` with at most `max_concurrency` futures in flight.
///
/// Outputs land at their item's original index. An empty input returns
/// empty without spawning anything; the first error fails the whole map
/// (callers wanting per-item isolation catch inside `f`).
pub async fn bounded_map<T, R, F, Fut>(
    items: Vec<T>,
    max_concurrency: usize,
    f: F,
) -> Result<Vec<R>>
where
    F: Fn(usize, T) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    stream::iter(items.into_iter().enumerate().map(|(i, item)| f(i, item)))
        .buffered(max_concurrency.max(1))
        .try_collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlm_domain::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn preserves_input_order() {
        // Later items finish first; output order must still match input.
        let out = bounded_map(vec![30u64, 20, 10, 0], 4, |i, delay| async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(i)
        })
        .await
        .unwrap();
        assert_eq!(out, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn respects_the_concurrency_cap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let items: Vec<usize> = (0..12).collect();
        bounded_map(items, 3, |_, _| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn empty_input_returns_empty() {
        let out: Vec<usize> = bounded_map(Vec::<usize>::new(), 4, |i, _| async move { Ok(i) })
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn first_error_fails_the_map() {
        let result = bounded_map(vec![1, 2, 3], 2, |_, n| async move {
            if n == 2 {
                Err(Error::Other("worker failed".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert!(result.is_err());
    }
}
