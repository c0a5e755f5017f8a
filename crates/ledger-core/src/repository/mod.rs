//! Repositories that combine the local store with the remote authority

mod hybrid;

pub use hybrid::{HybridRepository, PushGate, PushMode, PushOutcome, WriteKind};
