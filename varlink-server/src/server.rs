//! Serving loop: accepts connections and dispatches calls to registered
//! interfaces.
//!
//! Each connection is driven by one task that fully handles a call
//! (including awaiting its reply sends) before taking the next frame, so
//! pipelined calls are answered strictly in arrival order and a pending
//! handler suspends further reads.

use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;

use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use varlink_protocol::{
	ErrorReply, InboundFrame, MethodCall, MethodReply, OwnedFdArray, ProtocolError,
	SendCompletion, TransportSender, VarlinkConnection, VarlinkTransport, VarlinkValue,
	bind_unix_listener, encode_frame,
};

use crate::registry::{MethodHandler, ServedMethod, VarlinkInterfaceRegistry};
use crate::service;

/// Serves the interfaces of a registry over varlink connections.
#[derive(Clone)]
pub struct VarlinkServer {
	registry: VarlinkInterfaceRegistry,
}

impl VarlinkServer {
	pub fn new(registry: VarlinkInterfaceRegistry) -> Self {
		Self { registry }
	}

	pub fn registry(&self) -> &VarlinkInterfaceRegistry {
		&self.registry
	}

	/// Convenience helper binding the default varlink socket path.
	pub async fn listen_default(&self) -> io::Result<()> {
		self.listen_unix(varlink_protocol::DEFAULT_SOCKET_PATH).await
	}

	/// Bind a unix listener at the given path (cleaning up a stale socket
	/// file) and serve until the surrounding task is dropped.
	pub async fn listen_unix(&self, path: impl AsRef<Path>) -> io::Result<()> {
		let listener = bind_unix_listener(path)?;
		self.serve_listener(tokio::net::UnixListener::from_std(listener)?)
			.await
	}

	/// Accept loop; each connection is served on its own task.
	pub async fn serve_listener(&self, listener: tokio::net::UnixListener) -> io::Result<()> {
		loop {
			let (stream, _addr) = listener.accept().await?;
			let transport = VarlinkTransport::from_unix_stream(stream.into_std()?)?;
			let registry = self.registry.clone();
			tokio::spawn(async move {
				if let Err(err) = serve_connection(registry, transport).await {
					debug!(%err, "dropping client connection");
				}
			});
		}
	}
}

/// Serve a single connection until the peer closes its sending side.
pub async fn serve_connection(
	registry: VarlinkInterfaceRegistry,
	transport: VarlinkTransport,
) -> Result<(), ProtocolError> {
	let mut connection = VarlinkConnection::new(transport);
	let sender = connection.sender();
	loop {
		match connection.next_frame().await {
			Ok(Some(frame)) => handle_frame(&registry, &sender, frame).await,
			Ok(None) => break,
			Err(err) => {
				sender.shutdown();
				return Err(err);
			}
		}
	}
	sender.shutdown();
	Ok(())
}

async fn handle_frame(
	registry: &VarlinkInterfaceRegistry,
	sender: &TransportSender,
	frame: InboundFrame,
) {
	let InboundFrame { payload, fds } = frame;
	let value: Value = match serde_json::from_slice(&payload) {
		Ok(value) => value,
		Err(err) => {
			// A frame-local failure: log, close its descriptors, carry on.
			warn!(%err, "discarding undecodable frame");
			return;
		}
	};
	let oneway = value
		.get("oneway")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	let call = match MethodCall::from_value(&value) {
		Ok(call) => call,
		Err(err) => {
			warn!(%err, "protocol violation");
			if !oneway {
				flush(send_reply(
					sender,
					&service::protocol_violation().to_reply(),
					Vec::new(),
				))
				.await;
			}
			return;
		}
	};
	if let Err(error) = dispatch_call(registry, sender, &call, fds).await {
		if !call.is_oneway() {
			flush(send_reply(sender, &error.to_reply(), Vec::new())).await;
		}
	}
}

async fn dispatch_call(
	registry: &VarlinkInterfaceRegistry,
	sender: &TransportSender,
	call: &MethodCall,
	mut fds: OwnedFdArray,
) -> Result<(), ErrorReply> {
	let (interface, index) = registry.lookup_method(call)?;
	let method = interface.method_at(index);
	let parameters = method
		.signature()
		.parameters
		.from_json_object(call.parameters(), Some(&mut fds))
		.map_err(|err| {
			debug!(%err, method = call.method(), "parameter conversion failed");
			service::invalid_parameter(&err.parameter().unwrap_or_default())
		})?;
	// Descriptors the conversion did not move into the parameters are
	// closed here.
	drop(fds);
	match method.handler() {
		MethodHandler::Sync(handler) => {
			let result = handler(parameters)?;
			if !call.is_oneway() {
				send_single(sender, method, result).await?;
			}
		}
		MethodHandler::Async(handler) => {
			let result = handler(parameters).await?;
			if !call.is_oneway() {
				send_single(sender, method, result).await?;
			}
		}
		MethodHandler::SyncStream(handler) => {
			let items = handler(parameters)?;
			stream_replies(sender, method, futures::stream::iter(items)).await?;
		}
		MethodHandler::AsyncStream(handler) => {
			let items = handler(parameters);
			stream_replies(sender, method, items).await?;
		}
	}
	Ok(())
}

async fn send_single(
	sender: &TransportSender,
	method: &ServedMethod,
	value: VarlinkValue,
) -> Result<(), ErrorReply> {
	let (reply, fds) = encode_reply(method, value, false)?;
	flush(send_reply(sender, &reply, fds)).await;
	Ok(())
}

/// Send one reply per streamed item, flagged `continues` except for the
/// last. An empty stream still terminates the call with a final empty
/// reply; an error item becomes the terminal error reply.
async fn stream_replies<S>(
	sender: &TransportSender,
	method: &ServedMethod,
	mut items: S,
) -> Result<(), ErrorReply>
where
	S: Stream<Item = Result<VarlinkValue, ErrorReply>> + Unpin,
{
	let mut previous: Option<VarlinkValue> = None;
	while let Some(item) = items.next().await {
		let value = item?;
		if let Some(ready) = previous.replace(value) {
			let (reply, fds) = encode_reply(method, ready, true)?;
			flush(send_reply(sender, &reply, fds)).await;
		}
	}
	match previous {
		Some(last) => {
			let (reply, fds) = encode_reply(method, last, false)?;
			flush(send_reply(sender, &reply, fds)).await;
		}
		None => {
			flush(send_reply(sender, &MethodReply::new(), Vec::new())).await;
		}
	}
	Ok(())
}

/// Convert a handler result back to wire parameters, collecting outbound
/// descriptors for the reply frame.
fn encode_reply(
	method: &ServedMethod,
	value: VarlinkValue,
	continues: bool,
) -> Result<(MethodReply, Vec<OwnedFd>), ErrorReply> {
	let value = match method.return_parameter() {
		Some(name) => VarlinkValue::record([(name, value)]),
		None => value,
	};
	let mut fds = Vec::new();
	let parameters = method
		.signature()
		.returns
		.to_json_object(value, Some(&mut fds))
		.map_err(|err| {
			warn!(%err, "reply conversion failed");
			service::invalid_parameter(&err.parameter().unwrap_or_default())
		})?;
	Ok((
		MethodReply::new()
			.with_parameters(parameters)
			.with_continues(continues),
		fds,
	))
}

fn send_reply(
	sender: &TransportSender,
	reply: &MethodReply,
	fds: Vec<OwnedFd>,
) -> SendCompletion {
	sender.send(encode_frame(&reply.to_value()), fds)
}

/// Replies are awaited so that per-connection ordering holds; a send
/// failure only means the connection is going away.
async fn flush(completion: SendCompletion) {
	if let Err(err) = completion.await {
		debug!(%err, "sending reply failed");
	}
}
