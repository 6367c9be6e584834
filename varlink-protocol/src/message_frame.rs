use std::collections::VecDeque;

use crate::fd_array::OwnedFdArray;

/// Raw framed varlink message: the JSON payload bytes (without the trailing
/// NUL) plus the file descriptors received with it.
#[derive(Debug, Default)]
pub struct InboundFrame {
	pub payload: Vec<u8>,
	pub fds: OwnedFdArray,
}

impl InboundFrame {
	pub fn parse(&self) -> Result<serde_json::Value, serde_json::Error> {
		serde_json::from_slice(&self.payload)
	}
}

/// Splits the inbound byte stream on NUL delimiters.
///
/// All descriptors delivered with one chunk attach to the first frame that
/// chunk completes; later frames of the same chunk carry an empty array. A
/// chunk that completes no frame closes its descriptors.
#[derive(Default)]
pub struct FrameReader {
	pending: Vec<u8>,
	ready: VecDeque<InboundFrame>,
}

impl FrameReader {
	pub fn new() -> Self {
		Self::default()
	}

	#[tracing::instrument(skip_all, fields(len = bytes.len(), fds = fds.len()))]
	pub fn feed(&mut self, bytes: &[u8], fds: OwnedFdArray) {
		self.pending.extend_from_slice(bytes);
		let mut fds = (!fds.is_empty()).then_some(fds);
		while let Some(end) = self.pending.iter().position(|b| *b == 0) {
			let mut payload: Vec<u8> = self.pending.drain(..=end).collect();
			payload.pop();
			self.ready.push_back(InboundFrame {
				payload,
				fds: fds.take().unwrap_or_default(),
			});
		}
	}

	pub fn pop(&mut self) -> Option<InboundFrame> {
		self.ready.pop_front()
	}

	/// Carry-over bytes after the latest complete frame.
	pub fn leftover(&self) -> &[u8] {
		&self.pending
	}
}
