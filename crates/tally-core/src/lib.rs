//! tally-core: attendance session engine.
//!
//! Resolves a probe embedding to an enrolled principal, flips the
//! principal's presence state, and folds completed intervals into a
//! per-calendar-day ledger. No I/O happens here; persistence and
//! embedding extraction live behind the daemon.

pub mod extractor;
pub mod ledger;
pub mod presence;
pub mod resolver;
pub mod types;

pub use extractor::{EmbeddingExtractor, ExtractionError, Sample};
pub use ledger::{split_interval, DayChunk, Ledger, LedgerError, LedgerUpdate, SessionInterval, Timing};
pub use presence::{MarkEvent, MarkIntent, Presence, Transition, TransitionError};
pub use resolver::{cosine_distance, CosineMatcher, Matcher, Resolution};
pub use types::{Embedding, Principal, PrincipalId, PrincipalKind, RosterEntry};
