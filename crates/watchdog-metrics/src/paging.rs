//! Continuation-token pagination with bounded retries

use std::future::Future;
use tracing::warn;
use watchdog_common::Result;
use watchdog_platform::Page;

/// Transient-fault budget for one enumeration or load call
pub const ENUMERATION_RETRY_BUDGET: u32 = 5;

/// Walk a paged enumeration to completion.
///
/// Each transient fault consumes one retry and the same page is fetched
/// again; an exhausted budget gives up silently and returns whatever has been
/// accumulated. Any other error propagates.
pub async fn collect_pages<T, F, Fut>(budget: u32, mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut continuation: Option<String> = None;
    let mut retries = budget;
    loop {
        match fetch(continuation.clone()).await {
            Ok(page) => {
                items.extend(page.items);
                match page.continuation {
                    Some(token) => continuation = Some(token),
                    None => return Ok(items),
                }
            }
            Err(e) if e.is_transient() => {
                if retries == 0 {
                    warn!("enumeration retry budget exhausted: {}", e);
                    return Ok(items);
                }
                retries -= 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retry a single fallible call through transient faults
pub async fn retry_transient<T, F, Fut>(budget: u32, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = budget;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && retries > 0 => retries -= 1,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use watchdog_common::Error;

    #[tokio::test]
    async fn collects_across_pages() {
        let calls = AtomicU32::new(0);
        let items = collect_pages(5, |token| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match token.as_deref() {
                    None => Ok(Page {
                        items: vec![1, 2],
                        continuation: Some("2".into()),
                    }),
                    Some("2") => Ok(Page {
                        items: vec![3],
                        continuation: None,
                    }),
                    other => panic!("unexpected token {:?}", other),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_budget_keeps_partial_results() {
        let calls = AtomicU32::new(0);
        let items: Vec<u32> = collect_pages(2, |token| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match (call, token.as_deref()) {
                    (0, None) => Ok(Page {
                        items: vec![1],
                        continuation: Some("1".into()),
                    }),
                    _ => Err(Error::Transient("flaky".into())),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(items, vec![1]);
        // First page plus the budgeted retries of the second.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn not_found_propagates() {
        let result: Result<Vec<u32>> =
            collect_pages(5, |_| async { Err(Error::NotFound("gone".into())) }).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn retry_transient_eventually_succeeds() {
        let calls = AtomicU32::new(0);
        let value = retry_transient(5, || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 3 {
                    Err(Error::Timeout("slow".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn retry_transient_surfaces_exhaustion() {
        let result: Result<u32> =
            retry_transient(2, || async { Err(Error::Transient("still down".into())) }).await;
        assert!(matches!(result, Err(Error::Transient(_))));
    }
}
