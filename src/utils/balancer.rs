use crate::error::ConfigError;
use anyhow::{anyhow, bail, Result};
use futures::prelude::*;
use once_cell::sync::OnceCell;
use rayon::ThreadPool;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// This struct helps manage compute on this node.
///
/// With a single worker every task runs on the calling thread, in order.
/// The tokio runtime is only started by the first call to `map_blocking_io`.
pub struct Balancer {
    pub workers: usize,
    pool: Option<ThreadPool>,
    runtime: OnceCell<Runtime>,
}

impl Balancer {
    /// Constructs a new `Balancer` with at most `workers` threads.
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(ConfigError::ZeroWorkers("workers").into());
        }

        // This is the maximum number of threads allowed
        let max_available_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers = if workers > max_available_threads {
            log::warn!(
                "workers provided ({workers}) exceeds max_available_threads, \
                 defaulting to {max_available_threads}"
            );
            max_available_threads
        } else {
            workers
        };

        let pool = match workers > 1 {
            true => Some(rayon::ThreadPoolBuilder::new().num_threads(workers).build()?),
            false => None,
        };

        log::info!("--------- Balancer Activated ---------");
        log::info!("          Workers : {workers}");
        log::info!("--------------------------------------");

        Ok(Balancer {
            workers,
            pool,
            runtime: OnceCell::new(),
        })
    }

    fn runtime(&self) -> Result<&Runtime> {
        let runtime = self.runtime.get_or_try_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(self.workers)
                .max_blocking_threads(self.workers)
                .enable_all()
                .build()
        })?;
        Ok(runtime)
    }

    /// Applies `f` to every item on the thread pool. Results come back over a
    /// channel tagged with the index of their item and are put back in order.
    ///
    /// If any task fails (or panics) the error of the lowest index is returned.
    pub fn map<T, R, F>(&self, items: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> Result<R> + Sync,
    {
        let n = items.len();
        let Some(pool) = &self.pool else {
            return items.into_iter().map(|item| guarded(&f, item)).collect();
        };

        let (sender, receiver) = crossbeam_channel::unbounded();
        pool.scope(|scope| {
            for (index, item) in items.into_iter().enumerate() {
                let sender = sender.clone();
                let f = &f;
                scope.spawn(move |_| {
                    // Receiver outlives the scope
                    let _ = sender.send((index, guarded(f, item)));
                });
            }
        });
        drop(sender);

        merge_indexed(n, receiver.iter().collect())
    }

    /// Runs blocking `f` (e.g. file reads) on every item, with at most
    /// `workers` in flight. Results are returned in item order.
    pub fn map_blocking_io<T, R, F>(&self, items: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Result<R> + Send + Sync + 'static,
    {
        let n = items.len();
        if self.workers == 1 {
            return items.into_iter().map(|item| guarded(&f, item)).collect();
        }
        let runtime = self.runtime()?;

        let f = Arc::new(f);
        let messages = runtime.block_on(async {
            futures::stream::iter(items.into_iter().enumerate().map(|(index, item)| {
                let f = Arc::clone(&f);
                tokio::task::spawn_blocking(move || f(item)).map(move |joined| {
                    let result = joined.unwrap_or_else(|err| {
                        Err(if err.is_panic() {
                            panic_error(err.into_panic())
                        } else {
                            anyhow!("task {index} was cancelled")
                        })
                    });
                    (index, result)
                })
            }))
            .buffered(self.workers)
            .collect::<Vec<_>>()
            .await
        });

        merge_indexed(n, messages)
    }
}

/// Runs `f(item)`, turning a panic into an error.
fn guarded<T, R, F: Fn(T) -> Result<R>>(f: &F, item: T) -> Result<R> {
    catch_unwind(AssertUnwindSafe(|| f(item))).unwrap_or_else(|payload| Err(panic_error(payload)))
}

fn panic_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("unknown panic"));
    anyhow!("worker panicked: {message}")
}

/// Puts `(index, result)` messages back in index order. Every index in
/// `0..n` must appear exactly once.
pub fn merge_indexed<R>(n: usize, mut messages: Vec<(usize, Result<R>)>) -> Result<Vec<R>> {
    messages.sort_by_key(|(index, _)| *index);

    if messages.len() != n {
        bail!("expected {n} task results, received {}", messages.len());
    }

    let mut merged = Vec::with_capacity(n);
    for (expected, (index, result)) in messages.into_iter().enumerate() {
        if index != expected {
            bail!("task result {expected} is missing or duplicated (found {index})");
        }
        merged.push(result?);
    }
    Ok(merged)
}

#[test]
fn test_map_keeps_order() {
    let balancer = Balancer::new(4).unwrap();
    let squares = balancer.map((0..100).collect(), |i: u64| Ok(i * i)).unwrap();
    assert_eq!(squares, (0..100).map(|i| i * i).collect::<Vec<u64>>());
}

#[test]
fn test_single_worker_is_sequential() {
    let balancer = Balancer::new(1).unwrap();
    let order = std::sync::Mutex::new(vec![]);
    balancer
        .map((0..10).collect(), |i: usize| {
            order.lock().unwrap().push(i);
            Ok(())
        })
        .unwrap();
    assert_eq!(order.into_inner().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_lowest_index_error_wins() {
    let balancer = Balancer::new(4).unwrap();
    let result = balancer.map((0..20).collect(), |i: usize| {
        if i % 7 == 3 {
            bail!("failed at {i}")
        }
        Ok(i)
    });
    assert_eq!(result.unwrap_err().to_string(), "failed at 3");
}

#[test]
fn test_panics_become_errors() {
    let balancer = Balancer::new(2).unwrap();
    let result = balancer.map(vec![1, 2], |i: usize| {
        if i == 2 {
            panic!("boom");
        }
        Ok(i)
    });
    assert!(result.unwrap_err().to_string().contains("boom"));

    let result = balancer.map_blocking_io(vec![1, 2], |i: usize| {
        if i == 1 {
            panic!("io boom");
        }
        Ok(i)
    });
    assert!(result.unwrap_err().to_string().contains("io boom"));
}

#[test]
fn test_map_blocking_io_keeps_order() {
    let balancer = Balancer::new(3).unwrap();
    let doubled = balancer
        .map_blocking_io((0..50).collect(), |i: u32| Ok(2 * i))
        .unwrap();
    assert_eq!(doubled, (0..50).map(|i| 2 * i).collect::<Vec<u32>>());
}

#[test]
fn test_runtime_only_starts_for_blocking_io() {
    let balancer = Balancer::new(2).unwrap();
    balancer.map((0..10).collect(), |i: usize| Ok(i)).unwrap();
    assert!(balancer.runtime.get().is_none());

    balancer.map_blocking_io((0..10).collect(), |i: usize| Ok(i)).unwrap();
    assert_eq!(balancer.runtime.get().is_some(), balancer.workers > 1);
}

#[test]
fn test_merge_indexed_checks_indices() {
    let merged = merge_indexed(2, vec![(1, Ok("b")), (0, Ok("a"))]).unwrap();
    assert_eq!(merged, vec!["a", "b"]);
    assert!(merge_indexed(2, vec![(0, Ok(1)), (0, Ok(2))]).is_err());
    assert!(merge_indexed(3, vec![(0, Ok(1)), (1, Ok(2))]).is_err());
}

#[test]
fn test_zero_workers_is_rejected() {
    assert!(Balancer::new(0).is_err());
}
