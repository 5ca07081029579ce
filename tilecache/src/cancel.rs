//! Single-flight state for exports and seed runs (§4.G step 6, §4.H,
//! §9 "mutable flags as cancellation tokens"). Replaces the distilled
//! spec's boolean `export` flag everywhere it appears in this codebase:
//! the resolver and HTTP layer never see a raw bool, only this enum.

use std::sync::{Arc, Mutex};
use tilecache_core::concurrency::CancelToken;

/// The state of a per-source export/seed slot.
#[derive(Debug, Clone)]
pub enum CancelState {
	Idle,
	Running(CancelToken),
	CancelRequested(CancelToken),
}

/// One slot per source id, guarding against two concurrent runs for the
/// same id (§7 `Conflict`).
#[derive(Clone, Default)]
pub struct RunSlot(Arc<Mutex<CancelState>>);

impl RunSlot {
	pub fn new() -> Self {
		RunSlot(Arc::new(Mutex::new(CancelState::Idle)))
	}

	/// Starts a run, returning the fresh token, or `None` if one is already
	/// in flight (caller maps this to `CoreError::Conflict`).
	pub fn try_start(&self) -> Option<CancelToken> {
		let mut guard = self.0.lock().unwrap();
		match &*guard {
			CancelState::Idle => {
				let token = CancelToken::new();
				*guard = CancelState::Running(token.clone());
				Some(token)
			}
			CancelState::Running(_) | CancelState::CancelRequested(_) => None,
		}
	}

	/// Requests cancellation of the currently running job, if any. Returns
	/// `true` if a run was actually in flight.
	pub fn request_cancel(&self) -> bool {
		let mut guard = self.0.lock().unwrap();
		match &*guard {
			CancelState::Running(token) => {
				token.cancel();
				*guard = CancelState::CancelRequested(token.clone());
				true
			}
			CancelState::CancelRequested(_) | CancelState::Idle => false,
		}
	}

	/// Marks the slot idle again once a run has finished (success, error,
	/// or cancellation all converge here).
	pub fn finish(&self) {
		*self.0.lock().unwrap() = CancelState::Idle;
	}

	pub fn is_running(&self) -> bool {
		!matches!(&*self.0.lock().unwrap(), CancelState::Idle)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn second_start_is_rejected_while_running() {
		let slot = RunSlot::new();
		assert!(slot.try_start().is_some());
		assert!(slot.try_start().is_none());
		slot.finish();
		assert!(slot.try_start().is_some());
	}

	#[test]
	fn cancel_only_applies_to_a_running_slot() {
		let slot = RunSlot::new();
		assert!(!slot.request_cancel());
		let token = slot.try_start().unwrap();
		assert!(slot.request_cancel());
		assert!(token.is_cancelled());
	}
}
