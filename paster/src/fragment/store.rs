use std::num::NonZeroUsize;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;

use super::Fragment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("fragment index {index} is out of range (expecting {capacity} fragments)")]
pub struct OutOfRange {
    pub index: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("only {filled} out of {capacity} fragments are available")]
pub struct Incomplete {
    pub filled: usize,
    pub capacity: usize,
}

#[derive(Debug)]
struct Slots {
    fragments: Box<[Option<Fragment>]>,
    filled: usize,
    total_len: usize,
}

/// A fixed-capacity registry of fragments by sequence index, shared by every fetch worker.
///
/// Each slot is written at most once: the first fragment delivered for an index wins and later
/// ones are dropped. The lock is only held for the check-and-insert itself, never while fetching
/// or decoding.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use paster::{Fragment, FragmentStore};
/// # use bytes::Bytes;
/// let store = FragmentStore::new(2.try_into().unwrap());
/// let fragment = |index, pixels: &'static [u8]| Fragment { index, width: 1, height: 1, pixels: Bytes::from_static(pixels) };
///
/// assert_eq!(store.try_insert(fragment(1, b"\0late")), Ok(Some(1)));
/// assert_eq!(store.try_insert(fragment(1, b"\0dupe")), Ok(None));
/// assert!(!store.is_complete());
///
/// assert_eq!(store.try_insert(fragment(0, b"\0soon")), Ok(Some(2)));
/// store.completed().await;
///
/// let ordered = store.snapshot_ordered().unwrap();
/// assert_eq!(ordered[0].pixels, b"\0soon"[..]);
/// assert_eq!(ordered[1].pixels, b"\0late"[..]);
/// # })
/// ```
#[derive(Debug)]
pub struct FragmentStore {
    capacity: NonZeroUsize,
    slots: Mutex<Slots>,
    /// Notified once, when the last slot gets filled.
    complete: Notify,
}

impl FragmentStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            slots: Mutex::new(Slots {
                fragments: std::iter::repeat_with(|| None).take(capacity.get()).collect(),
                filled: 0,
                total_len: 0,
            }),
            complete: Notify::new(),
        }
    }

    /// Insert `fragment` unless its slot is already filled.
    ///
    /// Returns the number of filled slots right after the insertion, or `None` for a duplicate, which is
    /// not an error.
    pub fn try_insert(&self, fragment: Fragment) -> Result<Option<usize>, OutOfRange> {
        let index = fragment.index;
        let capacity = self.capacity.get();

        let mut slots = self.lock();

        let slot = slots.fragments.get_mut(index).ok_or(OutOfRange { index, capacity })?;

        if slot.is_some() {
            return Ok(None);
        }

        let len = fragment.len();
        *slot = Some(fragment);

        slots.filled += 1;
        slots.total_len += len;

        let filled = slots.filled;
        drop(slots);

        if filled == capacity {
            self.complete.notify_waiters();
        }

        Ok(Some(filled))
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Number of filled slots.
    pub fn filled(&self) -> usize {
        self.lock().filled
    }

    /// Summed payload length of every inserted fragment.
    pub fn total_len(&self) -> usize {
        self.lock().total_len
    }

    pub fn is_complete(&self) -> bool {
        self.filled() == self.capacity.get()
    }

    /// Wait until every slot has been filled.
    pub async fn completed(&self) {
        let mut notified = pin!(self.complete.notified());

        // register before checking, otherwise the last insert could slip in between
        notified.as_mut().enable();

        if !self.is_complete() {
            notified.await;
        }
    }

    /// Every fragment, by ascending sequence index whatever the order they came in.
    pub fn snapshot_ordered(&self) -> Result<Vec<Fragment>, Incomplete> {
        let slots = self.lock();

        if slots.filled != self.capacity.get() {
            return Err(Incomplete {
                filled: slots.filled,
                capacity: self.capacity.get(),
            });
        }

        Ok(slots.fragments.iter().flatten().cloned().collect())
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // slots are always left consistent, even by a panicking holder
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
