use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Failure to move a descriptor out of an [`OwnedFdArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FdTakeError {
	#[error("file descriptor index {0} out of bounds")]
	OutOfBounds(usize),
	#[error("file descriptor at index {0} was already taken")]
	AlreadyTaken(usize),
}

/// The file descriptors received with a single message, in ancillary-data
/// order. Each slot is either still owned by the array or has been taken.
/// Dropping the array closes every still-owned descriptor exactly once.
#[derive(Debug, Default)]
pub struct OwnedFdArray {
	slots: Vec<Option<OwnedFd>>,
}

impl OwnedFdArray {
	pub fn new(fds: impl IntoIterator<Item = OwnedFd>) -> Self {
		Self {
			slots: fds.into_iter().map(Some).collect(),
		}
	}

	/// Wrap raw descriptors received via SCM_RIGHTS.
	///
	/// # Safety
	/// Each fd must be open and owned by the caller; the array closes them.
	pub(crate) unsafe fn from_raw_fds(fds: Vec<RawFd>) -> Self {
		Self {
			slots: fds
				.into_iter()
				.map(|fd| Some(unsafe { OwnedFd::from_raw_fd(fd) }))
				.collect(),
		}
	}

	pub fn len(&self) -> usize {
		self.slots.len()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}

	/// Move the descriptor at `index` out of the array. Each slot can be
	/// taken at most once; the remaining slots stay owned by the array.
	pub fn take(&mut self, index: usize) -> Result<OwnedFd, FdTakeError> {
		match self.slots.get_mut(index) {
			None => Err(FdTakeError::OutOfBounds(index)),
			Some(slot) => slot.take().ok_or(FdTakeError::AlreadyTaken(index)),
		}
	}

	/// Close every descriptor still owned by the array. Idempotent; taken
	/// slots are unaffected and later `take` calls keep failing.
	pub fn close_all(&mut self) {
		for slot in &mut self.slots {
			drop(slot.take());
		}
	}
}

impl FromIterator<OwnedFd> for OwnedFdArray {
	fn from_iter<I: IntoIterator<Item = OwnedFd>>(iter: I) -> Self {
		Self::new(iter)
	}
}

impl PartialEq for OwnedFdArray {
	/// Slot-by-slot comparison by raw descriptor number of still-owned
	/// entries.
	fn eq(&self, other: &Self) -> bool {
		self.slots.len() == other.slots.len()
			&& self
				.slots
				.iter()
				.zip(&other.slots)
				.all(|(a, b)| match (a, b) {
					(Some(a), Some(b)) => a.as_raw_fd() == b.as_raw_fd(),
					(None, None) => true,
					_ => false,
				})
	}
}

impl Eq for OwnedFdArray {}
