#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Wall-clock source for the room. Every time window is evaluated against it.
pub trait Clock: Send + Sync + std::fmt::Debug {
	fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_ms(&self) -> i64 {
		unix_ms_now()
	}
}

/// Manually advanced clock, used to pin window boundaries in tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
	now_ms: Arc<AtomicI64>,
}

impl ManualClock {
	pub fn new(start_ms: i64) -> Self {
		Self {
			now_ms: Arc::new(AtomicI64::new(start_ms)),
		}
	}

	pub fn set(&self, ms: i64) {
		self.now_ms.store(ms, Ordering::SeqCst);
	}

	pub fn advance(&self, by: Duration) {
		self.now_ms.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
	}
}

impl Clock for ManualClock {
	fn now_ms(&self) -> i64 {
		self.now_ms.load(Ordering::SeqCst)
	}
}
