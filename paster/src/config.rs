//! Configuration of the fetch pool and of the assembled output.

use std::num::{NonZeroU32, NonZeroU8, NonZeroUsize};
use std::time::Duration;

use url::Url;

use crate::assemble::Layout;
use crate::png::zlib;

/// Number of strips an image is split into, as agreed with the fragment servers.
pub const DEFAULT_FRAGMENTS: NonZeroUsize = match NonZeroUsize::new(50) {
    Some(n) => n,
    None => unreachable!(),
};

pub const DEFAULT_WORKERS: NonZeroU8 = NonZeroU8::MIN;

/// Pause after a failed fetch before the worker tries again.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Number of fragment servers behind [`default_endpoints()`].
pub const SERVERS: u8 = 3;

/// Fetch and assembly settings.
///
/// Every setting has a default, and can be tweaked with a `with_*` builder method:
/// ```
/// # use std::time::Duration;
/// # use paster::config::Config;
/// let config = Config::default()
///     .with_workers(8.try_into().unwrap())
///     .with_timeout(Some(Duration::from_secs(5)));
///
/// assert_eq!(config.workers().get(), 8);
/// assert_eq!(config.fragments().get(), 50);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    workers: NonZeroU8,
    fragments: NonZeroUsize,
    timeout: Option<Duration>,
    retry_delay: Duration,
    max_consecutive_failures: Option<NonZeroU32>,
    compression: u32,
    layout: Layout,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            fragments: DEFAULT_FRAGMENTS,
            timeout: None,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_consecutive_failures: None,
            compression: zlib::DEFAULT_LEVEL,
            layout: Layout::Derived,
        }
    }
}

impl Config {
    /// Number of concurrent fetch workers.
    #[inline]
    pub fn workers(&self) -> NonZeroU8 {
        self.workers
    }

    /// Number of distinct fragments making up the image.
    #[inline]
    pub fn fragments(&self) -> NonZeroUsize {
        self.fragments
    }

    /// Per-request timeout, none by default.
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[inline]
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Number of failed fetches in a row after which a worker gives up, never by default.
    #[inline]
    pub fn max_consecutive_failures(&self) -> Option<NonZeroU32> {
        self.max_consecutive_failures
    }

    /// Output compression level, from 0 to 9.
    #[inline]
    pub fn compression(&self) -> u32 {
        self.compression
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    #[inline]
    pub fn with_workers(self, workers: NonZeroU8) -> Self {
        Self { workers, ..self }
    }

    #[inline]
    pub fn with_fragments(self, fragments: NonZeroUsize) -> Self {
        Self { fragments, ..self }
    }

    #[inline]
    pub fn with_timeout(self, timeout: Option<Duration>) -> Self {
        Self { timeout, ..self }
    }

    #[inline]
    pub fn with_retry_delay(self, retry_delay: Duration) -> Self {
        Self { retry_delay, ..self }
    }

    #[inline]
    pub fn with_max_consecutive_failures(self, max_consecutive_failures: Option<NonZeroU32>) -> Self {
        Self {
            max_consecutive_failures,
            ..self
        }
    }

    #[inline]
    pub fn with_compression(self, compression: u32) -> Self {
        Self {
            compression: compression.min(9),
            ..self
        }
    }

    #[inline]
    pub fn with_layout(self, layout: Layout) -> Self {
        Self { layout, ..self }
    }
}

/// The fragment servers of image `image`, in the order workers are assigned to them.
pub fn default_endpoints(image: u8) -> Result<Vec<Url>, url::ParseError> {
    (1..=SERVERS)
        .map(|server| Url::parse(&format!("http://ece252-{server}.uwaterloo.ca:2520/image?img={image}")))
        .collect()
}
