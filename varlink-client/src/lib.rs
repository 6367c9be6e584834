//! Asynchronous varlink client.
//!
//! A [`VarlinkClient`] issues calls over one connection and matches replies
//! to them in wire order. Oneway calls complete once sent, single calls
//! resolve to one reply, and `more` calls yield a [`ReplyStream`] whose
//! consumer paces the connection: the reader only advances once the previous
//! streamed reply has been taken.

use std::collections::VecDeque;
use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use varlink_protocol::{
	ConversionError, ErrorReply, InboundFrame, MessageError, MethodCall, MethodReply,
	OwnedFdArray, SendCompletion, VarlinkConnection, VarlinkTransport, connect_unix, encode_frame,
};

mod proxy;
pub use proxy::{InterfaceProxy, TypedReplyStream};

/// Client-side call failure.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
	#[error("invalid reply: {0}")]
	InvalidReply(#[from] MessageError),
	#[error("conversion error: {0}")]
	Conversion(#[from] ConversionError),
	/// The peer answered with an error reply.
	#[error(transparent)]
	ErrorReply(#[from] ErrorReply),
	#[error("unknown method {0:?}")]
	UnknownMethod(String),
	#[error("the more modifier selects between call and call_more")]
	WrongCallMode,
	#[error("connection closed")]
	ConnectionClosed,
}

/// A received reply together with the descriptors that arrived with it.
/// Descriptors not taken out of the array are closed when it drops.
#[derive(Debug)]
pub struct CallResult {
	pub reply: MethodReply,
	pub fds: Option<OwnedFdArray>,
}

enum PendingCall {
	Single {
		done: Option<oneshot::Sender<Result<CallResult, ClientError>>>,
		want_fds: bool,
	},
	Stream {
		replies: mpsc::Sender<Result<CallResult, ClientError>>,
	},
}

struct ClientShared {
	pending: Mutex<VecDeque<PendingCall>>,
	closed: AtomicBool,
}

impl ClientShared {
	fn pending(&self) -> MutexGuard<'_, VecDeque<PendingCall>> {
		self.pending.lock().unwrap_or_else(|poison| poison.into_inner())
	}
}

struct ClientInner {
	sender: varlink_protocol::TransportSender,
	shared: Arc<ClientShared>,
	reader: JoinHandle<()>,
}

impl Drop for ClientInner {
	fn drop(&mut self) {
		self.reader.abort();
	}
}

/// Handle to a varlink client connection. Cheap to clone; all clones share
/// the connection and its pending-call queue.
#[derive(Clone)]
pub struct VarlinkClient {
	inner: Arc<ClientInner>,
}

impl VarlinkClient {
	/// Take over a transport. Must be called within a tokio runtime; a
	/// reader task is spawned to match replies to pending calls.
	pub fn new(transport: VarlinkTransport) -> Self {
		let connection = VarlinkConnection::new(transport);
		let sender = connection.sender();
		let shared = Arc::new(ClientShared {
			pending: Mutex::new(VecDeque::new()),
			closed: AtomicBool::new(false),
		});
		let reader = tokio::spawn(run_reader(connection, shared.clone()));
		Self {
			inner: Arc::new(ClientInner {
				sender,
				shared,
				reader,
			}),
		}
	}

	/// Connect to the unix socket at the given path.
	pub fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
		Ok(Self::new(VarlinkTransport::from_socket(connect_unix(path)?)?))
	}

	/// Convenience helper connecting to the default varlink socket path.
	pub fn connect_default() -> io::Result<Self> {
		Self::connect(varlink_protocol::DEFAULT_SOCKET_PATH)
	}

	/// Issue a call. Replies carrying descriptors have them dropped; use
	/// [`VarlinkClient::call_with_fds`] to receive them. A oneway call
	/// resolves to `None` once sent. Calls with the `more` modifier must
	/// use [`VarlinkClient::call_more`].
	pub async fn call(
		&self,
		call: MethodCall,
		fds: Vec<OwnedFd>,
	) -> Result<Option<CallResult>, ClientError> {
		self.issue(call, fds, false).await
	}

	/// Like [`VarlinkClient::call`], but moves the received descriptor
	/// array to the caller.
	pub async fn call_with_fds(
		&self,
		call: MethodCall,
		fds: Vec<OwnedFd>,
	) -> Result<Option<CallResult>, ClientError> {
		self.issue(call, fds, true).await
	}

	async fn issue(
		&self,
		call: MethodCall,
		fds: Vec<OwnedFd>,
		want_fds: bool,
	) -> Result<Option<CallResult>, ClientError> {
		if call.is_more() {
			return Err(ClientError::WrongCallMode);
		}
		if call.is_oneway() {
			self.inner
				.sender
				.send(encode_frame(&call.to_value()), fds)
				.await?;
			return Ok(None);
		}
		let (done, result) = oneshot::channel();
		let completion = {
			// Enqueued under the lock so wire order matches queue order;
			// calls may pipeline freely. The reader drains this queue under
			// the same lock when the connection ends, so a closed check
			// here cannot race with it.
			let mut pending = self.inner.shared.pending();
			if self.inner.shared.closed.load(Ordering::Relaxed) {
				return Err(ClientError::ConnectionClosed);
			}
			pending.push_back(PendingCall::Single {
				done: Some(done),
				want_fds,
			});
			self.inner.sender.send(encode_frame(&call.to_value()), fds)
		};
		completion.await?;
		match result.await {
			Ok(outcome) => outcome.map(Some),
			Err(_) => Err(ClientError::ConnectionClosed),
		}
	}

	/// Issue a call expecting a chain of replies. The call must carry the
	/// `more` modifier. Each streamed reply keeps its descriptor array
	/// alive until the consumer takes the next one.
	pub fn call_more(
		&self,
		call: MethodCall,
		fds: Vec<OwnedFd>,
	) -> Result<ReplyStream, ClientError> {
		if !call.is_more() {
			return Err(ClientError::WrongCallMode);
		}
		let (replies, receiver) = mpsc::channel(1);
		let completion = {
			let mut pending = self.inner.shared.pending();
			if self.inner.shared.closed.load(Ordering::Relaxed) {
				return Err(ClientError::ConnectionClosed);
			}
			pending.push_back(PendingCall::Stream { replies });
			self.inner.sender.send(encode_frame(&call.to_value()), fds)
		};
		Ok(ReplyStream {
			replies: receiver,
			send: Some(completion),
		})
	}

	/// Close the sending side; queued messages are flushed first. Pending
	/// calls resolve once the peer closes in turn.
	pub fn close(&self) {
		self.inner.sender.shutdown();
	}
}

/// Streamed replies of a `more` call. Ends after the final reply
/// (`continues` unset) or an error reply. Dropping the stream severs
/// consumption; varlink has no wire cancellation, so remaining replies are
/// drained and discarded.
pub struct ReplyStream {
	replies: mpsc::Receiver<Result<CallResult, ClientError>>,
	send: Option<SendCompletion>,
}

enum Step {
	Reply(Option<Result<CallResult, ClientError>>),
	Sent(io::Result<()>),
}

impl ReplyStream {
	/// The next streamed reply, or `None` once the stream is finished.
	pub async fn next(&mut self) -> Option<Result<CallResult, ClientError>> {
		// Until the call frame is flushed, also watch the send completion:
		// a send failure would otherwise leave the stream waiting forever
		// on a call the peer never saw.
		if self.send.is_some() {
			let step = {
				let send = self.send.as_mut().expect("checked above");
				tokio::select! {
					reply = self.replies.recv() => Step::Reply(reply),
					sent = send => Step::Sent(sent),
				}
			};
			match step {
				Step::Reply(reply) => return reply,
				Step::Sent(Ok(())) => {
					self.send = None;
				}
				Step::Sent(Err(err)) => {
					self.send = None;
					return Some(Err(err.into()));
				}
			}
		}
		self.replies.recv().await
	}
}

async fn run_reader(mut connection: VarlinkConnection, shared: Arc<ClientShared>) {
	loop {
		match connection.next_frame().await {
			Ok(Some(frame)) => deliver_frame(&shared, frame).await,
			Ok(None) => break,
			Err(err) => {
				debug!(%err, "receiving failed");
				break;
			}
		}
	}
	fail_pending(&shared);
}

enum Delivery {
	Unsolicited,
	Completed,
	Single {
		done: oneshot::Sender<Result<CallResult, ClientError>>,
		want_fds: bool,
	},
	Stream {
		replies: mpsc::Sender<Result<CallResult, ClientError>>,
	},
}

async fn deliver_frame(shared: &ClientShared, frame: InboundFrame) {
	let InboundFrame { payload, fds } = frame;
	let parsed = serde_json::from_slice::<serde_json::Value>(&payload)
		.map_err(ClientError::Json)
		.and_then(|value| MethodReply::from_value(&value).map_err(ClientError::from));
	// An error reply terminates the call even if it claims to continue.
	let is_final = match &parsed {
		Ok(reply) => !reply.continues() || reply.error().is_some(),
		Err(_) => true,
	};
	let delivery = {
		let mut pending = shared.pending();
		if is_final {
			match pending.pop_front() {
				None => Delivery::Unsolicited,
				Some(PendingCall::Single {
					done: Some(done),
					want_fds,
				}) => Delivery::Single { done, want_fds },
				Some(PendingCall::Single { done: None, .. }) => Delivery::Completed,
				Some(PendingCall::Stream { replies }) => Delivery::Stream { replies },
			}
		} else {
			match pending.front_mut() {
				None => Delivery::Unsolicited,
				Some(PendingCall::Single { done, want_fds }) => match done.take() {
					Some(done) => Delivery::Single {
						done,
						want_fds: *want_fds,
					},
					None => Delivery::Completed,
				},
				Some(PendingCall::Stream { replies }) => Delivery::Stream {
					replies: replies.clone(),
				},
			}
		}
	};
	match delivery {
		Delivery::Unsolicited => {
			warn!("discarding a reply without a matching pending call");
		}
		// Extra replies to an already answered single call are ignored.
		Delivery::Completed => {}
		Delivery::Single { done, want_fds } => {
			let result = parsed.map(|reply| CallResult {
				reply,
				fds: keep_fds(fds, want_fds),
			});
			let _ = done.send(result);
		}
		Delivery::Stream { replies } => {
			let result = parsed.map(|reply| CallResult {
				reply,
				fds: keep_fds(fds, true),
			});
			// Suspends until the consumer took the previous reply; a
			// dropped stream just discards the rest of the chain.
			let _ = replies.send(result).await;
		}
	}
}

fn keep_fds(fds: OwnedFdArray, want: bool) -> Option<OwnedFdArray> {
	(want && !fds.is_empty()).then_some(fds)
}

fn fail_pending(shared: &ClientShared) {
	let mut pending = shared.pending();
	shared.closed.store(true, Ordering::Relaxed);
	for entry in pending.drain(..) {
		match entry {
			PendingCall::Single {
				done: Some(done), ..
			} => {
				let _ = done.send(Err(ClientError::ConnectionClosed));
			}
			PendingCall::Single { done: None, .. } => {}
			PendingCall::Stream { replies } => {
				let _ = replies.try_send(Err(ClientError::ConnectionClosed));
			}
		}
	}
}
