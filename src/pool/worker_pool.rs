use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures_util::future::join_all;

use crate::error::Result;

/// Outcome of one item, tagged with its position in the submitted list.
#[derive(Debug)]
pub struct ItemOutcome<R> {
    pub index: usize,
    pub result: Result<R>,
}

/// Running totals reported while a pool drains its items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolProgress {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug)]
pub struct AggregateResult<R> {
    /// One entry per submitted item, ordered by `index`.
    pub outcomes: Vec<ItemOutcome<R>>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl<R> AggregateResult<R> {
    fn empty() -> Self {
        Self {
            outcomes: Vec::new(),
            processed: 0,
            succeeded: 0,
            failed: 0,
        }
    }
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record(&self, ok: bool) -> PoolProgress {
        if ok {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.snapshot()
    }

    fn snapshot(&self) -> PoolProgress {
        PoolProgress {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Drain `items` through `worker` using `concurrency` logical workers, calling
/// `on_progress` with running totals after every item.
///
/// Workers claim the next unclaimed index from a shared atomic cursor until the
/// list is exhausted. A failing item is recorded and the worker moves on; no
/// error ever aborts the pool. Completion order depends on the worker futures,
/// but the returned outcomes are sorted back into submission order.
pub async fn run_bounded<T, R, F, Fut, P>(
    items: Vec<T>,
    worker: F,
    concurrency: usize,
    on_progress: P,
) -> AggregateResult<R>
where
    T: Clone,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R>>,
    P: Fn(PoolProgress),
{
    let total = items.len();
    if total == 0 {
        return AggregateResult::empty();
    }

    let workers = concurrency.clamp(1, total);
    let cursor = AtomicUsize::new(0);
    let counters = Counters::default();
    let (cursor, counters, items, worker, on_progress) =
        (&cursor, &counters, &items, &worker, &on_progress);

    let loops = (0..workers).map(|_| async move {
        let mut local = Vec::new();
        loop {
            let index = cursor.fetch_add(1, Ordering::Relaxed);
            let Some(item) = items.get(index) else { break };
            let result = worker(item.clone()).await;
            on_progress(counters.record(result.is_ok()));
            local.push(ItemOutcome { index, result });
        }
        local
    });

    let mut outcomes: Vec<ItemOutcome<R>> = join_all(loops).await.into_iter().flatten().collect();
    outcomes.sort_by_key(|o| o.index);

    let totals = counters.snapshot();
    AggregateResult {
        outcomes,
        processed: totals.processed,
        succeeded: totals.succeeded,
        failed: totals.failed,
    }
}

/// Split `items` into consecutive batches of `size`, preserving order.
/// The last batch may be shorter. A `size` of 0 is treated as 1.
pub fn partition_batches<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(|c| c.to_vec()).collect()
}
