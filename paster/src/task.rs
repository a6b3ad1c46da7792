//! This module provides the fetch worker pool.

use std::ops::AddAssign;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, AbortHandle, Abortable, Aborted, Future, FutureExt};
use thiserror::Error;
use tracing::Instrument;

use crate::config::Config;
use crate::fetch::{self, FragmentSource, RawFragment};
use crate::fragment::{FragmentStore, Incomplete};

#[derive(Debug, Error)]
pub enum Error {
    #[error("no fragment source to fetch from")]
    NoSource,
    #[error("workers stopped early, {incomplete}")]
    Incomplete {
        incomplete: Incomplete,
        /// The last error a worker gave up on.
        #[source]
        last: Option<fetch::Error>,
    },
    #[error("workers were aborted, {0}")]
    Aborted(Incomplete),
    #[error("worker {id} panicked")]
    Join {
        id: usize,
        #[source]
        source: tokio::task::JoinError,
    },
}

/// What the workers of a pool went through.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Completed fetch attempts, failed ones included.
    pub fetched: usize,
    /// Fragments actually inserted in the store.
    pub inserted: usize,
    /// Valid fragments dropped since already in the store.
    pub duplicates: usize,
    /// Fetch attempts which failed, or returned an unusable fragment.
    pub failures: usize,
}

impl AddAssign for Report {
    fn add_assign(&mut self, other: Self) {
        self.fetched += other.fetched;
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.failures += other.failures;
    }
}

/// A fixed pool of workers filling a [`FragmentStore`] until it is complete.
///
/// Each worker is a task of its own polling one [`FragmentSource`] in a loop, so they run in parallel on a
/// multi-threaded runtime. Fetching and decoding happen concurrently; only the insertion itself is
/// serialized by the store.
///
/// A failed fetch never takes the pool down: it is logged and retried after [`Config::retry_delay()`], and a
/// worker only gives up after [`Config::max_consecutive_failures()`] failures in a row, if ever.
///
/// Dropping the pool, or the future of [`Pool::close()`], aborts every worker still running.
///
/// # Example
/// ```no_run
/// # tokio_test::block_on(async {
/// # use std::sync::Arc;
/// # use paster::{config::{self, Config}, fetch::HttpSource, task::Pool, FragmentStore};
/// let config = Config::default().with_workers(6.try_into().unwrap());
/// let sources = config::default_endpoints(1)?.into_iter().map(|url| Arc::new(HttpSource::new(url))).collect();
/// let store = Arc::new(FragmentStore::new(config.fragments()));
///
/// let pool = Pool::start(&config, sources, Arc::clone(&store))?;
/// let report = pool.close().await?;
///
/// assert!(store.is_complete());
/// assert_eq!(report.inserted, 50);
/// # Ok::<_, Box<dyn std::error::Error>>(())
/// # }).unwrap();
/// ```
#[derive(Debug)]
pub struct Pool {
    /// The pool of workers.
    workers: Vec<Worker>,
    /// The store being filled by the workers.
    store: Arc<FragmentStore>,
}

impl Pool {
    /// Start [`Config::workers()`] workers filling `store`, worker `i` fetching from `sources[i % sources.len()]`.
    pub fn start<S: FragmentSource>(config: &Config, sources: Vec<Arc<S>>, store: Arc<FragmentStore>) -> Result<Self, Error> {
        if sources.is_empty() {
            return Err(Error::NoSource);
        }

        static WORKER_ID: AtomicUsize = AtomicUsize::new(0);
        let size = config.workers().get().into();
        let id = WORKER_ID.fetch_add(size, Ordering::Relaxed);

        let settings = Settings::from(config);

        let workers = (0..size)
            .map(|i| {
                let source = Arc::clone(&sources[i % sources.len()]);
                Worker::new(id.wrapping_add(i), source, Arc::clone(&store), settings)
            })
            .collect();

        Ok(Self { workers, store })
    }

    #[inline]
    pub fn store(&self) -> &Arc<FragmentStore> {
        &self.store
    }

    /// Abort every worker, cancelling in-flight requests.
    pub fn abort(&self) {
        for worker in &self.workers {
            worker.abort_handle.abort();
        }
    }

    /// Wait for every worker to stop, which happens once the store is complete.
    ///
    /// Fails when the workers stopped before, either because they all gave up or because they were aborted.
    pub async fn close(mut self) -> Result<Report, Error> {
        // workers still running are aborted if this future is dropped while waiting
        let workers = std::mem::take(&mut self.workers);
        let abort_handles: Vec<_> = workers.iter().map(|worker| worker.abort_handle.clone()).collect();
        let ids: Vec<_> = workers.iter().map(|worker| worker.id).collect();

        let results = {
            let _guard = AbortOnDrop(abort_handles);
            future::join_all(workers).await
        };

        let mut report = Report::default();
        let mut last = None;
        let mut aborted = false;

        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(Ok(exit)) => {
                    report += exit.report;
                    last = exit.error.or(last);
                }
                Ok(Err(Aborted)) => aborted = true,
                Err(source) => return Err(Error::Join { id, source }),
            }
        }

        tracing::debug!("All workers stopped: {report:?}");

        if self.store.is_complete() {
            return Ok(report);
        }

        let incomplete = Incomplete {
            filled: self.store.filled(),
            capacity: self.store.capacity(),
        };

        if aborted {
            Err(Error::Aborted(incomplete))
        } else {
            Err(Error::Incomplete { incomplete, last })
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.abort();
    }
}

struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Fill a new store from `sources` with a fresh pool, and wait for it to complete.
pub async fn run<S: FragmentSource>(config: &Config, sources: Vec<Arc<S>>) -> Result<(Arc<FragmentStore>, Report), Error> {
    let store = Arc::new(FragmentStore::new(config.fragments()));

    let report = Pool::start(config, sources, Arc::clone(&store))?.close().await?;

    Ok((store, report))
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    timeout: Option<Duration>,
    retry_delay: Duration,
    max_consecutive_failures: Option<u32>,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            timeout: config.timeout(),
            retry_delay: config.retry_delay(),
            max_consecutive_failures: config.max_consecutive_failures().map(|max| max.get()),
        }
    }
}

#[derive(Debug)]
struct Exit {
    report: Report,
    error: Option<fetch::Error>,
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: tokio::task::JoinHandle<Result<Exit, Aborted>>,
    abort_handle: AbortHandle,
}

impl Worker {
    fn new<S: FragmentSource>(id: usize, source: Arc<S>, store: Arc<FragmentStore>, settings: Settings) -> Worker {
        tracing::debug!("Starting worker {id}...");

        let (abort_handle, abort_registration) = AbortHandle::new_pair();

        Worker {
            id,
            handle: tokio::spawn(
                // workers log within the span of whoever started the pool
                Abortable::new(fetch_loop(id, source, store, settings), abort_registration).in_current_span(),
            ),
            abort_handle,
        }
    }
}

impl Future for Worker {
    type Output = Result<Result<Exit, Aborted>, tokio::task::JoinError>;

    #[inline]
    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        self.handle.poll_unpin(cx)
    }
}

async fn fetch_loop<S: FragmentSource>(id: usize, source: Arc<S>, store: Arc<FragmentStore>, settings: Settings) -> Exit {
    let mut report = Report::default();
    let mut failures = 0;

    while !store.is_complete() {
        // whoever fills the last slot cancels every pending request
        let result = tokio::select! {
            biased;
            () = store.completed() => break,
            result = fetch_one(&*source, settings.timeout) => result,
        };

        report.fetched += 1;

        match result.and_then(|raw| insert(&store, raw)) {
            Ok((index, Some(filled))) => {
                failures = 0;
                report.inserted += 1;
                tracing::info!("Worker {id} found fragment {index}, {filled}/{}", store.capacity());
            }
            Ok((index, None)) => {
                failures = 0;
                report.duplicates += 1;
                tracing::trace!("Worker {id} dropped duplicate fragment {index}");
            }
            Err(error) => {
                failures += 1;
                report.failures += 1;
                tracing::warn!("Worker {id} discarded fetch: {error}");

                if settings.max_consecutive_failures.is_some_and(|max| failures >= max) {
                    tracing::debug!("Worker {id} giving up after {failures} failures in a row");

                    return Exit {
                        report,
                        error: Some(error),
                    };
                }

                tokio::select! {
                    () = store.completed() => break,
                    () = tokio::time::sleep(settings.retry_delay) => {}
                }
            }
        }
    }

    tracing::debug!("All fragments found, shutting down worker {id}.");

    Exit { report, error: None }
}

async fn fetch_one<S: FragmentSource>(source: &S, timeout: Option<Duration>) -> Result<RawFragment, fetch::Error> {
    match timeout {
        Some(duration) => tokio::time::timeout(duration, source.fetch())
            .await
            .map_err(|_| fetch::Error::Timeout(duration))?,
        None => source.fetch().await,
    }
}

/// Decode `raw` and insert it, returning its index and the filled slot count if it was new.
fn insert(store: &FragmentStore, raw: RawFragment) -> Result<(usize, Option<usize>), fetch::Error> {
    let fragment = raw.decode()?;
    let index = fragment.index;

    Ok((index, store.try_insert(fragment)?))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::png;

    /// Fails once, then alternates between the two strips of a two-strip image.
    struct Flaky {
        calls: AtomicUsize,
        strip: Bytes,
    }

    impl FragmentSource for Flaky {
        async fn fetch(&self) -> Result<RawFragment, fetch::Error> {
            match self.calls.fetch_add(1, Ordering::Relaxed) {
                0 => Err(fetch::Error::MissingSequence),
                n => Ok(RawFragment {
                    index: n % 2,
                    body: self.strip.clone(),
                }),
            }
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_single_worker() {
        let config = Config::default()
            .with_fragments(2.try_into().unwrap())
            .with_retry_delay(Duration::from_millis(1));
        let source = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            strip: png::sample(2, 1, 0).encode(png::zlib::DEFAULT_LEVEL).unwrap().into(),
        });

        let (store, report) = run(&config, vec![source]).await.unwrap();

        assert!(store.is_complete());
        assert_eq!(
            report,
            Report {
                fetched: 3,
                inserted: 2,
                duplicates: 0,
                failures: 1
            }
        );
        assert!(logs_contain("discarded fetch"));
        assert!(logs_contain("found fragment 1, 1/2"));
        assert!(logs_contain("found fragment 0, 2/2"));
    }

    #[test]
    fn test_report_sum() {
        let mut report = Report {
            fetched: 3,
            inserted: 1,
            duplicates: 1,
            failures: 1,
        };
        report += Report {
            fetched: 2,
            inserted: 2,
            ..Default::default()
        };

        assert_eq!(
            report,
            Report {
                fetched: 5,
                inserted: 3,
                duplicates: 1,
                failures: 1
            }
        );
    }

    #[test]
    fn test_settings() {
        let config = Config::default()
            .with_timeout(Some(Duration::from_secs(2)))
            .with_max_consecutive_failures(Some(5.try_into().unwrap()));
        let settings = Settings::from(&config);

        assert_eq!(settings.timeout, Some(Duration::from_secs(2)));
        assert_eq!(settings.max_consecutive_failures, Some(5));
        assert_eq!(settings.retry_delay, crate::config::DEFAULT_RETRY_DELAY);
    }
}
