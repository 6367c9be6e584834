//! Byte+descriptor transport for varlink connections.
//!
//! A transport is built over a receive endpoint and a send endpoint, which
//! may be the same stream socket (duplicated internally so each half owns its
//! descriptor) or two pipes. Stream sockets carry file descriptors via
//! SCM_RIGHTS; pipes refuse them. Sends go through an ordered queue drained
//! by a background task: consecutive messages without descriptors may share a
//! single writev, while a message carrying descriptors is always its own
//! sendmsg unit.

use std::collections::VecDeque;
use std::future::Future;
use std::io::{self, ErrorKind, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::socket::{
	ControlMessage, ControlMessageOwned, MsgFlags, SockType, getsockopt, recvmsg, sendmsg, sockopt,
};
use nix::sys::uio::writev;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::fd_array::OwnedFdArray;

/// Maximum number of file descriptors accepted with a single received
/// message.
pub const MAX_RECV_FDS: usize = 1024;

/// Size of a single bounded read.
const RECV_BUFFER_SIZE: usize = 4096;

fn io_err(errno: Errno) -> io::Error {
	io::Error::from_raw_os_error(errno as i32)
}

fn clone_io_error(err: &io::Error) -> io::Error {
	match err.raw_os_error() {
		Some(code) => io::Error::from_raw_os_error(code),
		None => io::Error::new(err.kind(), err.to_string()),
	}
}

/// Whether the endpoint supports SCM_RIGHTS. Stream sockets do, non-sockets
/// (pipes) do not, and any other socket type is rejected outright.
fn endpoint_is_socket(fd: BorrowedFd<'_>) -> io::Result<bool> {
	match getsockopt(&fd, sockopt::SockType) {
		Ok(SockType::Stream) => Ok(true),
		Ok(_) => Err(io::Error::new(
			ErrorKind::InvalidInput,
			"endpoint is a socket but not SOCK_STREAM",
		)),
		Err(Errno::ENOTSOCK) => Ok(false),
		Err(errno) => Err(io_err(errno)),
	}
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
	let bits = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(io_err)?;
	let flags = OFlag::from_bits_retain(bits) | OFlag::O_NONBLOCK;
	fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(io_err)?;
	Ok(())
}

/// Receiving half of a transport.
pub struct TransportReceiver {
	fd: AsyncFd<OwnedFd>,
	socket: bool,
}

impl TransportReceiver {
	fn new(fd: OwnedFd, socket: bool) -> io::Result<Self> {
		Ok(Self {
			fd: AsyncFd::with_interest(fd, Interest::READABLE)?,
			socket,
		})
	}

	/// Wait for the next chunk of bytes together with any descriptors that
	/// arrived with it. `None` signals the end of the stream.
	pub async fn recv_chunk(&mut self) -> io::Result<Option<(Vec<u8>, OwnedFdArray)>> {
		loop {
			let mut guard = self.fd.readable().await?;
			let attempt = if self.socket {
				guard.try_io(|inner| recv_socket_chunk(inner.get_ref().as_fd()))
			} else {
				guard.try_io(|inner| recv_pipe_chunk(inner.get_ref().as_fd()))
			};
			match attempt {
				Ok(result) => return result,
				Err(_would_block) => continue,
			}
		}
	}
}

fn recv_socket_chunk(fd: BorrowedFd<'_>) -> io::Result<Option<(Vec<u8>, OwnedFdArray)>> {
	let mut buf = [0u8; RECV_BUFFER_SIZE];
	let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_RECV_FDS]);
	let mut iov = [IoSliceMut::new(&mut buf)];
	let (bytes, fds) = loop {
		match recvmsg::<()>(
			fd.as_raw_fd(),
			&mut iov,
			Some(&mut cmsg_space),
			MsgFlags::empty(),
		) {
			Err(Errno::EINTR) => continue,
			Err(errno) if errno == Errno::EAGAIN || errno == Errno::EWOULDBLOCK => {
				return Err(ErrorKind::WouldBlock.into());
			}
			Err(errno) => return Err(io_err(errno)),
			Ok(msg) => {
				if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
					warn!("ancillary data truncated, dropping excess descriptors");
				}
				let mut raw_fds = Vec::new();
				for cmsg in msg.cmsgs().map_err(io_err)? {
					if let ControlMessageOwned::ScmRights(rights) = cmsg {
						raw_fds.extend(rights);
					}
				}
				let fds = unsafe { OwnedFdArray::from_raw_fds(raw_fds) };
				break (msg.bytes, fds);
			}
		}
	};
	if bytes == 0 {
		// EOF; descriptors received with it (if any) are closed here.
		return Ok(None);
	}
	Ok(Some((iov[0][..bytes].to_vec(), fds)))
}

fn recv_pipe_chunk(fd: BorrowedFd<'_>) -> io::Result<Option<(Vec<u8>, OwnedFdArray)>> {
	let mut buf = [0u8; RECV_BUFFER_SIZE];
	loop {
		match nix::unistd::read(fd.as_raw_fd(), &mut buf) {
			Err(Errno::EINTR) => continue,
			Err(errno) if errno == Errno::EAGAIN || errno == Errno::EWOULDBLOCK => {
				return Err(ErrorKind::WouldBlock.into());
			}
			Err(errno) => return Err(io_err(errno)),
			Ok(0) => return Ok(None),
			Ok(n) => return Ok(Some((buf[..n].to_vec(), OwnedFdArray::default()))),
		}
	}
}

struct OutboundMessage {
	data: Vec<u8>,
	fds: Vec<OwnedFd>,
	done: oneshot::Sender<io::Result<()>>,
}

enum SendItem {
	Message(OutboundMessage),
	Shutdown,
}

/// Resolves once the corresponding message has been fully written to the
/// peer, or failed terminally.
pub struct SendCompletion(CompletionState);

enum CompletionState {
	Pending(oneshot::Receiver<io::Result<()>>),
	Failed(Option<io::Error>),
}

impl SendCompletion {
	fn pending(receiver: oneshot::Receiver<io::Result<()>>) -> Self {
		Self(CompletionState::Pending(receiver))
	}

	fn failed(err: io::Error) -> Self {
		Self(CompletionState::Failed(Some(err)))
	}
}

impl Future for SendCompletion {
	type Output = io::Result<()>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match &mut self.0 {
			CompletionState::Pending(receiver) => Pin::new(receiver).poll(cx).map(|result| {
				match result {
					Ok(outcome) => outcome,
					// The queue was dropped without resolving the entry.
					Err(_) => Err(ErrorKind::BrokenPipe.into()),
				}
			}),
			CompletionState::Failed(err) => Poll::Ready(Err(err
				.take()
				.unwrap_or_else(|| ErrorKind::BrokenPipe.into()))),
		}
	}
}

/// Sending half of a transport. Cheap to clone; all clones feed one ordered
/// queue.
#[derive(Clone)]
pub struct TransportSender {
	queue: mpsc::UnboundedSender<SendItem>,
	socket: bool,
	closing: Arc<AtomicBool>,
}

impl TransportSender {
	/// Enqueue a message for sending. The bytes must include the framing
	/// NUL. The descriptors stay owned by the queue entry and are closed
	/// after transmission.
	pub fn send(&self, data: Vec<u8>, fds: Vec<OwnedFd>) -> SendCompletion {
		if !fds.is_empty() && !self.socket {
			return SendCompletion::failed(io::Error::new(
				ErrorKind::InvalidInput,
				"cannot send file descriptors on a non-socket transport",
			));
		}
		if self.closing.load(Ordering::Relaxed) {
			warn!("attempt to write to a closing transport");
			return SendCompletion::failed(ErrorKind::BrokenPipe.into());
		}
		let (done, completion) = oneshot::channel();
		let message = OutboundMessage { data, fds, done };
		if self.queue.send(SendItem::Message(message)).is_err() {
			return SendCompletion::failed(ErrorKind::BrokenPipe.into());
		}
		SendCompletion::pending(completion)
	}

	/// Two-phase close: new sends are refused immediately, already queued
	/// messages are flushed, then the sending descriptor is closed.
	pub fn shutdown(&self) {
		self.closing.store(true, Ordering::Relaxed);
		let _ = self.queue.send(SendItem::Shutdown);
	}

	pub fn is_closing(&self) -> bool {
		self.closing.load(Ordering::Relaxed)
	}
}

struct SendWorker {
	fd: AsyncFd<OwnedFd>,
	socket: bool,
	queue: mpsc::UnboundedReceiver<SendItem>,
}

impl SendWorker {
	async fn run(mut self) {
		let mut carry: Option<OutboundMessage> = None;
		let mut shutdown = false;
		while !shutdown {
			let first = match carry.take() {
				Some(message) => message,
				None => match self.queue.recv().await {
					Some(SendItem::Message(message)) => message,
					Some(SendItem::Shutdown) | None => break,
				},
			};
			let mut batch = VecDeque::from([first]);
			// Only descriptor-free messages may share a write; a message
			// with descriptors forms its own atomic sendmsg unit.
			if batch[0].fds.is_empty() {
				loop {
					match self.queue.try_recv() {
						Ok(SendItem::Message(message)) if message.fds.is_empty() => {
							batch.push_back(message);
						}
						Ok(SendItem::Message(message)) => {
							carry = Some(message);
							break;
						}
						Ok(SendItem::Shutdown) => {
							shutdown = true;
							break;
						}
						Err(_) => break,
					}
				}
			}
			if let Err(err) = self.write_batch(&mut batch).await {
				debug!(%err, "sending failed");
				for message in batch {
					let _ = message.done.send(Err(clone_io_error(&err)));
				}
				if let Some(message) = carry.take() {
					let _ = message.done.send(Err(clone_io_error(&err)));
				}
				self.fail_queued(&err);
				return;
			}
		}
		// Drain-fail anything that raced past the shutdown marker.
		self.fail_queued(&ErrorKind::BrokenPipe.into());
	}

	fn fail_queued(&mut self, err: &io::Error) {
		self.queue.close();
		while let Ok(item) = self.queue.try_recv() {
			if let SendItem::Message(message) = item {
				let _ = message.done.send(Err(clone_io_error(err)));
			}
		}
	}

	async fn write_batch(&mut self, batch: &mut VecDeque<OutboundMessage>) -> io::Result<()> {
		let mut offset = 0;
		let mut fds_pending = !batch[0].fds.is_empty();
		loop {
			while batch
				.front()
				.is_some_and(|message| message.data.len() == offset)
			{
				let message = batch.pop_front().expect("front checked");
				let _ = message.done.send(Ok(()));
				offset = 0;
			}
			let Some(front) = batch.front() else {
				return Ok(());
			};
			let mut slices = Vec::with_capacity(batch.len());
			slices.push(IoSlice::new(&front.data[offset..]));
			slices.extend(batch.iter().skip(1).map(|m| IoSlice::new(&m.data)));
			let raw_fds: Vec<RawFd> = if fds_pending {
				front.fds.iter().map(AsRawFd::as_raw_fd).collect()
			} else {
				Vec::new()
			};
			let mut guard = self.fd.writable().await?;
			let attempt = guard.try_io(|inner| {
				write_once(inner.get_ref().as_fd(), self.socket, &slices, &raw_fds)
			});
			match attempt {
				Err(_would_block) => continue,
				Ok(Err(err)) => return Err(err),
				Ok(Ok(written)) => {
					if written > 0 {
						// Descriptors ride with the first byte; a retry
						// after a short write must not resend them.
						fds_pending = false;
					}
					offset = advance(batch, offset, written);
				}
			}
		}
	}
}

/// Consume `written` bytes from the front of the batch, resolving fully
/// written messages. Returns the new offset into the (new) front message.
fn advance(batch: &mut VecDeque<OutboundMessage>, mut offset: usize, mut written: usize) -> usize {
	while written > 0 {
		let front_len = match batch.front() {
			Some(message) => message.data.len(),
			None => return 0,
		};
		let remaining = front_len - offset;
		if written >= remaining {
			written -= remaining;
			offset = 0;
			let message = batch.pop_front().expect("front checked");
			let _ = message.done.send(Ok(()));
		} else {
			offset += written;
			written = 0;
		}
	}
	offset
}

fn write_once(
	fd: BorrowedFd<'_>,
	socket: bool,
	slices: &[IoSlice<'_>],
	fds: &[RawFd],
) -> io::Result<usize> {
	loop {
		let result = if socket {
			let cmsg = if fds.is_empty() {
				Vec::new()
			} else {
				vec![ControlMessage::ScmRights(fds)]
			};
			sendmsg::<()>(
				fd.as_raw_fd(),
				slices,
				&cmsg,
				MsgFlags::MSG_NOSIGNAL,
				None,
			)
		} else {
			writev(fd, slices)
		};
		match result {
			Err(Errno::EINTR) => continue,
			Err(errno) if errno == Errno::EAGAIN || errno == Errno::EWOULDBLOCK => {
				return Err(ErrorKind::WouldBlock.into());
			}
			Err(errno) => return Err(io_err(errno)),
			Ok(n) => return Ok(n),
		}
	}
}

/// Bidirectional varlink transport over a pair of endpoints.
pub struct VarlinkTransport {
	receiver: TransportReceiver,
	sender: TransportSender,
}

impl VarlinkTransport {
	/// Construct over distinct receive and send endpoints, e.g. a pair of
	/// pipes. Both are switched to non-blocking mode. Must be called from
	/// within a tokio runtime: the send queue is drained by a spawned task.
	pub fn new(recvfd: OwnedFd, sendfd: OwnedFd) -> io::Result<Self> {
		let recv_socket = endpoint_is_socket(recvfd.as_fd())?;
		let send_socket = endpoint_is_socket(sendfd.as_fd())?;
		set_nonblocking(recvfd.as_fd())?;
		set_nonblocking(sendfd.as_fd())?;
		let receiver = TransportReceiver::new(recvfd, recv_socket)?;
		let (queue_tx, queue_rx) = mpsc::unbounded_channel();
		let worker = SendWorker {
			fd: AsyncFd::with_interest(sendfd, Interest::WRITABLE)?,
			socket: send_socket,
			queue: queue_rx,
		};
		tokio::spawn(worker.run());
		Ok(Self {
			receiver,
			sender: TransportSender {
				queue: queue_tx,
				socket: send_socket,
				closing: Arc::new(AtomicBool::new(false)),
			},
		})
	}

	/// Construct over a single stream socket used for both directions. The
	/// descriptor is duplicated so each half closes its own copy.
	pub fn from_socket(socket: OwnedFd) -> io::Result<Self> {
		let sendfd = socket.try_clone()?;
		Self::new(socket, sendfd)
	}

	pub fn from_unix_stream(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
		Self::from_socket(stream.into())
	}

	pub fn sender(&self) -> TransportSender {
		self.sender.clone()
	}

	pub fn send(&self, data: Vec<u8>, fds: Vec<OwnedFd>) -> SendCompletion {
		self.sender.send(data, fds)
	}

	pub async fn recv_chunk(&mut self) -> io::Result<Option<(Vec<u8>, OwnedFdArray)>> {
		self.receiver.recv_chunk().await
	}

	pub fn split(self) -> (TransportReceiver, TransportSender) {
		(self.receiver, self.sender)
	}
}
