//! Distributed Key Generation (DKG) module
//!
//! Pedersen-style DKG with Feldman verification: every participant deals a
//! random degree `t-1` polynomial, commits to it, and privately sends each
//! peer an evaluation. The ceremony is a one-time, high-stakes event, so any
//! failed check aborts it for operator review instead of recovering.

mod ceremony;
mod dkg;
mod messages;

pub use ceremony::{DkgCeremony, DkgParams};
pub use dkg::run_dkg;
pub use messages::*;

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// DKG ceremony state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DkgStatus {
    /// Own commitments generated, collecting peers'
    Init,
    /// Every participant's commitments verified, shares sent
    CommitmentsExchanged,
    /// Every received share verified against its sender's commitments
    SharesExchanged,
    /// Local key share derived, group key announced
    Verified,
    /// Every participant reported the same group key
    Complete,
    /// A check failed; requires operator intervention
    Aborted,
}

impl DkgStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DkgStatus::Complete | DkgStatus::Aborted)
    }
}

/// Node-wide slot allowing a single key generation ceremony at a time
#[derive(Debug, Clone, Default)]
pub struct CeremonySlot {
    busy: Arc<AtomicBool>,
}

impl CeremonySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot; fails while another ceremony holds it
    pub fn acquire(&self) -> Result<CeremonyGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::CeremonyInProgress)?;
        Ok(CeremonyGuard {
            busy: Arc::clone(&self.busy),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held by a running ceremony; releases the slot when dropped
#[derive(Debug)]
pub struct CeremonyGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for CeremonyGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_is_exclusive() {
        let slot = CeremonySlot::new();
        let guard = slot.acquire().unwrap();
        assert!(slot.is_busy());
        assert!(matches!(slot.acquire(), Err(Error::CeremonyInProgress)));

        drop(guard);
        assert!(!slot.is_busy());
        assert!(slot.acquire().is_ok());
    }

    #[test]
    fn test_terminal_states() {
        assert!(DkgStatus::Complete.is_terminal());
        assert!(DkgStatus::Aborted.is_terminal());
        assert!(!DkgStatus::Verified.is_terminal());
    }
}
