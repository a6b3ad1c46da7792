//! A simple crate reassembling images served strip by strip.
//!
//! An image is split into a fixed number of horizontal strips, each one being a small PNG image of its own.
//! Fragment servers answer every request with a randomly chosen strip, together with its sequence index in
//! a dedicated response header. This crate provides features dedicated to:
//! - reading and writing PNG chunks, with CRC-32 integrity checks,
//! - inflating and deflating image data,
//! - fetching strips concurrently from a pool of servers until each one has been seen,
//! - stacking strips back in order into a single valid PNG image.
//!
//! Here is how data flows from the servers to the output file:
//!
//! ```text
//!     server 1 ─┐                 ┌─ worker 0 ─┐
//!     server 2 ─┼─ random strip ──┼─ worker 1 ─┼─ decode ─ try_insert ─▶ FragmentStore (K slots)
//!     server 3 ─┘   + index       └─ worker …  ┘                              │ once complete
//!                                                                             ▼
//!                                             all.png ◀─ encode ◀─ assemble (index order)
//! ```
//!
//! Workers are [`tokio`] tasks of a [`task::Pool`], polling their server until the shared [`FragmentStore`]
//! is complete. The store is the only shared mutable state: its lock is held while checking and filling one
//! slot, never while fetching or decoding. The first strip received for an index wins, later duplicates are
//! just dropped.
//!
//! Strips must all share the same width. The height of the final image is either the sum of the strip
//! heights, or a fixed value agreed upon with the servers (see [`assemble::Layout`]).
//!
//! The sequential counterpart, stacking local files given in order, lives in [`concat`].

pub mod assemble;
pub mod concat;
pub mod config;
pub mod fetch;
pub mod png;
pub mod task;

mod fragment;
pub use fragment::*;
