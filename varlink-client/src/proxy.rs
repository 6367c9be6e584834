//! Typed call layer on top of [`VarlinkClient`].
//!
//! An [`InterfaceProxy`] converts typed argument records to wire parameters
//! and reply parameters back to typed values using an interface descriptor,
//! threading file descriptors through the out-of-band conversion channel in
//! both directions.

use varlink_protocol::{
	ErrorReply, InterfaceDescriptor, MethodCall, MethodSignature, VarlinkValue,
};

use crate::{CallResult, ClientError, ReplyStream, VarlinkClient};

pub struct InterfaceProxy {
	client: VarlinkClient,
	descriptor: InterfaceDescriptor,
}

impl InterfaceProxy {
	/// The descriptor supplies the wire schema; the client can be shared
	/// with other proxies concurrently.
	pub fn new(client: VarlinkClient, descriptor: InterfaceDescriptor) -> Self {
		Self { client, descriptor }
	}

	pub fn descriptor(&self) -> &InterfaceDescriptor {
		&self.descriptor
	}

	fn prepare_parts(
		&self,
		method: &str,
		arguments: VarlinkValue,
	) -> Result<(&MethodSignature, MethodCall, Vec<std::os::fd::OwnedFd>), ClientError> {
		let signature = self
			.descriptor
			.signature(method)
			.ok_or_else(|| ClientError::UnknownMethod(method.to_owned()))?;
		let mut fds = Vec::new();
		let parameters = signature
			.parameters
			.to_json_object(arguments, Some(&mut fds))?;
		let call = MethodCall::new(format!("{}.{}", self.descriptor.name(), method))?
			.with_parameters(parameters);
		Ok((signature, call, fds))
	}

	/// Invoke a single-reply method and convert its result. An error reply
	/// from the peer surfaces as [`ClientError::ErrorReply`].
	pub async fn invoke(
		&self,
		method: &str,
		arguments: VarlinkValue,
	) -> Result<VarlinkValue, ClientError> {
		let (signature, call, fds) = self.prepare_parts(method, arguments)?;
		if signature.streaming {
			return Err(ClientError::WrongCallMode);
		}
		let result = self
			.client
			.call_with_fds(call, fds)
			.await?
			.ok_or(ClientError::ConnectionClosed)?;
		convert_reply(&signature.returns, result)
	}

	/// Invoke a method as oneway: the call is sent and no reply is
	/// expected or matched.
	pub async fn invoke_oneway(
		&self,
		method: &str,
		arguments: VarlinkValue,
	) -> Result<(), ClientError> {
		let (_signature, call, fds) = self.prepare_parts(method, arguments)?;
		let call = call.oneway()?;
		self.client.call(call, fds).await?;
		Ok(())
	}

	/// Invoke a streaming method; each reply is converted as it is taken
	/// from the returned stream.
	pub fn invoke_more(
		&self,
		method: &str,
		arguments: VarlinkValue,
	) -> Result<TypedReplyStream, ClientError> {
		let (signature, call, fds) = self.prepare_parts(method, arguments)?;
		if !signature.streaming {
			return Err(ClientError::WrongCallMode);
		}
		let call = call.more()?;
		let stream = self.client.call_more(call, fds)?;
		Ok(TypedReplyStream {
			stream,
			returns: signature.returns.clone(),
		})
	}
}

/// Streamed replies of a typed `more` call, converted lazily.
pub struct TypedReplyStream {
	stream: ReplyStream,
	returns: varlink_protocol::ObjectType,
}

impl TypedReplyStream {
	pub async fn next(&mut self) -> Option<Result<VarlinkValue, ClientError>> {
		let result = self.stream.next().await?;
		Some(result.and_then(|call_result| convert_reply(&self.returns, call_result)))
	}
}

fn convert_reply(
	returns: &varlink_protocol::ObjectType,
	result: CallResult,
) -> Result<VarlinkValue, ClientError> {
	if let Some(error) = ErrorReply::from_reply(&result.reply) {
		return Err(ClientError::ErrorReply(error));
	}
	let mut fds = result.fds;
	let value = returns.from_json_object(result.reply.parameters(), fds.as_mut())?;
	// Descriptors the conversion did not take are closed here with `fds`.
	Ok(value)
}
