//! Message framing layered on a transport.
//!
//! A connection couples a [`VarlinkTransport`] with a [`FrameReader`] and
//! hands out complete NUL-delimited frames together with the descriptors
//! that arrived with them. Backpressure is structural: the owner drives
//! `next_frame` from a single task and fully handles each frame before
//! asking for the next one, so no new bytes are read while a handler is
//! still working.

use std::os::fd::OwnedFd;

use tracing::debug;

use crate::error::ProtocolError;
use crate::message_frame::{FrameReader, InboundFrame};
use crate::transport::{SendCompletion, TransportReceiver, TransportSender, VarlinkTransport};

pub struct VarlinkConnection {
	receiver: Option<TransportReceiver>,
	sender: TransportSender,
	frames: FrameReader,
}

impl VarlinkConnection {
	pub fn new(transport: VarlinkTransport) -> Self {
		let (receiver, sender) = transport.split();
		Self {
			receiver: Some(receiver),
			sender,
			frames: FrameReader::new(),
		}
	}

	/// A clonable handle feeding this connection's ordered send queue.
	pub fn sender(&self) -> TransportSender {
		self.sender.clone()
	}

	/// Return the next framed message, or `None` once the peer closed its
	/// sending side. Descriptor ownership moves to the caller with each
	/// frame. Receive errors close the receiving half; subsequent calls
	/// return `None`.
	pub async fn next_frame(&mut self) -> Result<Option<InboundFrame>, ProtocolError> {
		loop {
			if let Some(frame) = self.frames.pop() {
				return Ok(Some(frame));
			}
			let Some(receiver) = self.receiver.as_mut() else {
				return Ok(None);
			};
			match receiver.recv_chunk().await {
				Ok(Some((bytes, fds))) => self.frames.feed(&bytes, fds),
				Ok(None) => {
					if !self.frames.leftover().is_empty() {
						debug!(
							len = self.frames.leftover().len(),
							"discarding unterminated trailing bytes at end of stream"
						);
					}
					self.receiver = None;
					return Ok(None);
				}
				Err(err) => {
					debug!(%err, "receiving failed");
					self.receiver = None;
					return Err(err.into());
				}
			}
		}
	}

	/// Serialize a message and enqueue it for sending; the framing NUL is
	/// appended here. Descriptors are closed after transmission.
	pub fn send_value(&self, value: &serde_json::Value, fds: Vec<OwnedFd>) -> SendCompletion {
		self.sender.send(encode_frame(value), fds)
	}

	/// Close both directions. Messages already queued are flushed before
	/// the sending descriptor is closed.
	pub fn close(&mut self) {
		self.receiver = None;
		self.sender.shutdown();
	}
}

/// Wire encoding of a message: compact JSON plus the terminating NUL.
pub fn encode_frame(value: &serde_json::Value) -> Vec<u8> {
	let mut data = serde_json::to_vec(value).expect("JSON values always serialize");
	data.push(0);
	data
}
