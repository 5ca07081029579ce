use futures::{StreamExt, stream};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Worker-count conventions for the three workload shapes this crate runs,
/// grounded on the teacher's CPU-scaled sizing (`ConcurrencyLimits`).
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimits {
	pub io_bound: usize,
	pub cpu_bound: usize,
	pub mixed: usize,
}

impl ConcurrencyLimits {
	pub fn new() -> Self {
		let cpus = num_cpus::get().max(1);
		ConcurrencyLimits { io_bound: cpus * 3, cpu_bound: cpus, mixed: (cpus * 3).div_euclid(2) }
	}
}

impl Default for ConcurrencyLimits {
	fn default() -> Self {
		Self::new()
	}
}

/// Cooperative cancel token shared between an exporter/seed run and its
/// caller (§4.D, §9 "mutable flags as cancellation tokens"). Replaces the
/// raw `export` boolean from the distilled spec with an explicit token
/// that also records whether a run is active, for single-flight checks.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
	pub fn new() -> Self {
		CancelToken(Arc::new(AtomicBool::new(false)))
	}

	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

impl Default for CancelToken {
	fn default() -> Self {
		Self::new()
	}
}

/// Progress counters observable to handlers while a bounded batch runs.
#[derive(Debug, Default)]
pub struct Progress {
	pub active: AtomicU64,
	pub complete: AtomicU64,
}

/// Runs `handler` over `items` with at most `concurrency` tasks in flight.
/// Handler errors are logged, not propagated; the whole batch only stops
/// early when `cancel.is_cancelled()` flips between producer steps
/// (in-flight tasks still run to completion, §4.D).
pub async fn run_bounded<T, F, Fut>(items: Vec<T>, concurrency: usize, cancel: CancelToken, progress: Arc<Progress>, handler: F)
where
	T: Send + 'static,
	F: Fn(T, Arc<Progress>) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = anyhow::Result<()>> + Send,
{
	let handler = Arc::new(handler);
	let total = items.len() as u64;
	stream::iter(items.into_iter().enumerate())
		.map(|(i, item)| {
			let handler = handler.clone();
			let progress = progress.clone();
			let cancel = cancel.clone();
			async move {
				if cancel.is_cancelled() {
					return;
				}
				progress.active.fetch_add(1, Ordering::SeqCst);
				if let Err(err) = handler(item, progress.clone()).await {
					log::warn!("item {i} of {total} failed: {err:#}");
				}
				progress.active.fetch_sub(1, Ordering::SeqCst);
				progress.complete.fetch_add(1, Ordering::SeqCst);
			}
		})
		.buffer_unordered(concurrency.max(1))
		.for_each(|()| async {})
		.await;
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	#[tokio::test]
	async fn runs_all_items_with_bounded_concurrency() {
		let counter = Arc::new(AtomicUsize::new(0));
		let progress = Arc::new(Progress::default());
		let items: Vec<usize> = (0..20).collect();
		let counter_clone = counter.clone();
		run_bounded(items, 4, CancelToken::new(), progress.clone(), move |_item, _progress| {
			let counter = counter_clone.clone();
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
		})
		.await;
		assert_eq!(counter.load(Ordering::SeqCst), 20);
		assert_eq!(progress.complete.load(Ordering::SeqCst), 20);
	}

	#[tokio::test]
	async fn handler_errors_do_not_abort_batch() {
		let counter = Arc::new(AtomicUsize::new(0));
		let progress = Arc::new(Progress::default());
		let items: Vec<usize> = (0..5).collect();
		let counter_clone = counter.clone();
		run_bounded(items, 2, CancelToken::new(), progress, move |item, _progress| {
			let counter = counter_clone.clone();
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
				if item == 2 {
					anyhow::bail!("boom");
				}
				Ok(())
			}
		})
		.await;
		assert_eq!(counter.load(Ordering::SeqCst), 5);
	}

	#[tokio::test]
	async fn cancellation_stops_future_dispatch() {
		let cancel = CancelToken::new();
		cancel.cancel();
		let counter = Arc::new(AtomicUsize::new(0));
		let progress = Arc::new(Progress::default());
		let items: Vec<usize> = (0..10).collect();
		let counter_clone = counter.clone();
		run_bounded(items, 4, cancel, progress, move |_item, _progress| {
			let counter = counter_clone.clone();
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
		})
		.await;
		assert_eq!(counter.load(Ordering::SeqCst), 0);
	}
}
