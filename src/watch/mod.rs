//! Watch-set matching
//!
//! Decides whether an address is of interest. Two sets exist at runtime: the
//! full-URL set consulted once a request line is visible, and the host-only set
//! derived from it for tunnel decisions. Both use first-match-wins semantics.

pub mod headers;
pub mod pattern;
pub mod set;

pub use headers::{HeaderFilter, HeaderRule};
pub use pattern::WatchPattern;
pub use set::{MatchOutcome, WatchSet};
