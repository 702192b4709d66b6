//! Append-only session event log for probe.
//!
//! Every session owns one ordered stream of immutable events. Derived session
//! state is never stored: it is recomputed by folding a prefix of the stream
//! through [`reduce`].

pub mod fs;
pub mod log;
pub mod memory;
pub mod reducer;
pub mod store;
pub mod types;

pub use fs::FsEventBackend;
pub use log::EventLog;
pub use memory::MemoryEventBackend;
pub use reducer::{
    FailureEntry, STATUS_NOTE_KEY, SessionSnapshot, SessionState, SessionStatus, fold, reduce,
};
pub use store::{EventBackend, EventStoreError, EventStoreResult, SharedEventBackend};
pub use types::{
    ContentHash, Event, EventBody, EventDraft, EventKind, EventPayload, EventSource,
    FailureRecord, ObservationRecord, Position, SessionId, StoredRecord, UnrecognizedPayload,
    decode_record, encode_draft, timestamp_now,
};
