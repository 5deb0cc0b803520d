//! ReconBot Backend Library
//!
//! Three-way match reconciliation: a staged pipeline drives six agents over
//! a shared state record to verify that a purchase order, goods receipt note
//! and supplier invoice agree, with every numerical conclusion cited back to
//! a pixel region of its source document.

pub mod agents;
pub mod bus;
pub mod cancel;
pub mod citations;
pub mod config;
pub mod decimal;
pub mod matching;
pub mod models;
pub mod router;
pub mod state;
pub mod stores;
pub mod supervisor;
pub mod threshold;
pub mod workpaper;

// Re-export the surface the transport layer consumes.
pub use bus::{ProgressBus, ProgressSubscription};
pub use cancel::CancelToken;
pub use state::SessionRecord;
pub use supervisor::{Pipeline, SupervisorConfig};
