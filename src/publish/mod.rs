//! Quota-gated publication of roast-flagged artifacts.
//!
//! The [`PublicationGate`] is the single decision point for every publish
//! attempt. It owns the in-memory view of the quota and the published
//! fingerprints and writes every decision to the durable [`HistoryStore`],
//! so restarts never re-publish an artifact or reset the day's count.

pub mod caption;
pub mod clock;
pub mod fingerprint;
pub mod gate;
pub mod history;

pub use caption::{render_caption, CaptionConfig};
pub use clock::{Clock, ManualClock, SystemClock};
pub use fingerprint::fingerprint;
pub use gate::{
    Admission, GateConfig, GateOutcome, IntervalPolicy, PublicationGate, PublicationRequest,
    Publisher, QuotaSnapshot, Receipt, Reservation,
};
pub use history::{HistoryStore, PublicationRecord, PublicationStatus, QuotaState};
