#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use parley_domain::{PeerId, Pseudonym};

use crate::server::service::ServiceError;

/// Everything a validator may look at for one outgoing message.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
	pub peer: &'a PeerId,
	pub pseudonym: &'a Pseudonym,
	pub content: &'a str,
	pub timestamp: Instant,
}

/// One predicate over outgoing messages.
pub trait MessageValidator: Send + Sync {
	fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), ServiceError>;
}

/// Ordered, short-circuiting composition of [`MessageValidator`]s.
#[derive(Default)]
pub struct ValidationChain {
	validators: Vec<Box<dyn MessageValidator>>,
}

impl ValidationChain {
	pub fn new() -> Self {
		Self::default()
	}

	/// Append a validator; evaluation order is insertion order.
	pub fn with(mut self, validator: impl MessageValidator + 'static) -> Self {
		self.validators.push(Box::new(validator));
		self
	}

	/// Run every validator in order, stopping at the first rejection.
	pub fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), ServiceError> {
		for validator in &self.validators {
			validator.validate(ctx)?;
		}
		Ok(())
	}

	pub fn is_empty(&self) -> bool {
		self.validators.is_empty()
	}
}

/// Bounds the message length (bytes) to `min_len..=max_len`.
#[derive(Debug, Clone, Copy)]
pub struct ContentValidator {
	min_len: usize,
	max_len: usize,
}

impl Default for ContentValidator {
	fn default() -> Self {
		Self {
			min_len: 2,
			max_len: 300,
		}
	}
}

impl ContentValidator {
	pub fn new(min_len: usize, max_len: usize) -> Self {
		Self { min_len, max_len }
	}
}

impl MessageValidator for ContentValidator {
	fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), ServiceError> {
		if ctx.content.len() < self.min_len {
			return Err(ServiceError::InvalidArgument(format!(
				"message is too short (< {} characters)",
				self.min_len
			)));
		}

		if ctx.content.len() > self.max_len {
			return Err(ServiceError::InvalidArgument(format!(
				"message is too long (> {} characters)",
				self.max_len
			)));
		}

		Ok(())
	}
}

/// Enforces a minimum interval between messages per peer.
///
/// The timestamp is recorded only when the check passes, so a rejected
/// burst does not push the allowed send time further out.
pub struct RateLimitValidator {
	min_interval: Duration,
	last_sent: Mutex<HashMap<PeerId, Instant>>,
}

impl RateLimitValidator {
	pub fn new(min_interval: Duration) -> Self {
		Self {
			min_interval,
			last_sent: Mutex::new(HashMap::new()),
		}
	}
}

impl MessageValidator for RateLimitValidator {
	fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), ServiceError> {
		let mut last_sent = self.last_sent.lock();

		if let Some(last) = last_sent.get(ctx.peer) {
			let elapsed = ctx.timestamp.saturating_duration_since(*last);
			if elapsed < self.min_interval {
				return Err(ServiceError::ResourceExhausted(
					"you are sending messages too fast".to_string(),
				));
			}
		}

		last_sent.insert(ctx.peer.clone(), ctx.timestamp);
		Ok(())
	}
}
