//! Served interfaces and the registry resolving incoming calls to their
//! handlers.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use varlink_protocol::{
	ErrorReply, InterfaceDescriptor, MessageError, MethodCall, MethodSignature, ObjectType,
	VarlinkType, VarlinkValue, validate_interface_name, validate_member_name,
};

use crate::service::{self, ServiceInfo};

/// Outcome of one method invocation or one streamed item.
pub type MethodResult = Result<VarlinkValue, ErrorReply>;

pub type SyncHandler = Box<dyn Fn(VarlinkValue) -> MethodResult + Send + Sync>;
pub type SyncStreamHandler = Box<
	dyn Fn(VarlinkValue) -> Result<Box<dyn Iterator<Item = MethodResult> + Send>, ErrorReply>
		+ Send
		+ Sync,
>;
pub type AsyncHandler = Box<dyn Fn(VarlinkValue) -> BoxFuture<'static, MethodResult> + Send + Sync>;
pub type AsyncStreamHandler =
	Box<dyn Fn(VarlinkValue) -> BoxStream<'static, MethodResult> + Send + Sync>;

/// The four dispatch shapes of a served method. The handler receives the
/// converted parameter record, including ownership of any descriptors the
/// conversion took out of the inbound array.
pub enum MethodHandler {
	/// Plain function, single reply.
	Sync(SyncHandler),
	/// Plain function producing a reply sequence.
	SyncStream(SyncStreamHandler),
	/// Future, single reply.
	Async(AsyncHandler),
	/// Stream of replies.
	AsyncStream(AsyncStreamHandler),
}

impl std::fmt::Debug for MethodHandler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let variant = match self {
			MethodHandler::Sync(_) => "Sync",
			MethodHandler::SyncStream(_) => "SyncStream",
			MethodHandler::Async(_) => "Async",
			MethodHandler::AsyncStream(_) => "AsyncStream",
		};
		f.debug_tuple(variant).finish()
	}
}

impl MethodHandler {
	fn shape(&self) -> (bool, bool) {
		match self {
			MethodHandler::Sync(_) => (false, false),
			MethodHandler::SyncStream(_) => (false, true),
			MethodHandler::Async(_) => (true, false),
			MethodHandler::AsyncStream(_) => (true, true),
		}
	}
}

#[derive(Debug)]
pub struct ServedMethod {
	signature: MethodSignature,
	return_parameter: Option<String>,
	handler: MethodHandler,
}

impl ServedMethod {
	pub fn signature(&self) -> &MethodSignature {
		&self.signature
	}

	pub fn return_parameter(&self) -> Option<&str> {
		self.return_parameter.as_deref()
	}

	pub fn handler(&self) -> &MethodHandler {
		&self.handler
	}
}

/// An interface implementation offered via the registry: method schemas plus
/// handlers, in declaration order.
#[derive(Debug)]
pub struct ServedInterface {
	name: String,
	methods: Vec<(String, ServedMethod)>,
}

impl ServedInterface {
	pub fn new(name: impl Into<String>) -> Result<Self, MessageError> {
		let name = name.into();
		validate_interface_name(&name)?;
		Ok(Self {
			name,
			methods: Vec::new(),
		})
	}

	/// Register a method whose handler returns the full reply record.
	pub fn method(
		self,
		name: impl Into<String>,
		parameters: ObjectType,
		returns: ObjectType,
		handler: MethodHandler,
	) -> Result<Self, MessageError> {
		self.add_method(name.into(), parameters, returns, None, handler)
	}

	/// Register a method whose handler returns a bare value that is wrapped
	/// as `{return_parameter: value}` at the wire boundary.
	pub fn method_wrapping(
		self,
		name: impl Into<String>,
		parameters: ObjectType,
		return_parameter: impl Into<String>,
		return_type: VarlinkType,
		handler: MethodHandler,
	) -> Result<Self, MessageError> {
		let return_parameter = return_parameter.into();
		let returns = ObjectType::new([(return_parameter.clone(), return_type)], []);
		self.add_method(
			name.into(),
			parameters,
			returns,
			Some(return_parameter),
			handler,
		)
	}

	fn add_method(
		mut self,
		name: String,
		parameters: ObjectType,
		returns: ObjectType,
		return_parameter: Option<String>,
		handler: MethodHandler,
	) -> Result<Self, MessageError> {
		validate_member_name(&name)?;
		assert!(
			self.position(&name).is_none(),
			"method {name:?} declared twice"
		);
		let (asynchronous, streaming) = handler.shape();
		let signature = MethodSignature {
			asynchronous,
			streaming,
			parameters,
			returns,
		};
		self.methods.push((
			name,
			ServedMethod {
				signature,
				return_parameter,
				handler,
			},
		));
		Ok(self)
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn position(&self, method: &str) -> Option<usize> {
		self.methods.iter().position(|(name, _)| name == method)
	}

	pub fn method_at(&self, index: usize) -> &ServedMethod {
		&self.methods[index].1
	}

	/// Schema-only view for introspection and client proxies.
	pub fn descriptor(&self) -> InterfaceDescriptor {
		let mut descriptor =
			InterfaceDescriptor::new(&self.name).expect("name validated at construction");
		for (name, method) in &self.methods {
			descriptor = descriptor
				.method(name, method.signature.clone())
				.expect("name validated at construction");
		}
		descriptor
	}
}

pub(crate) struct RegistryInner {
	interfaces: BTreeMap<String, Arc<ServedInterface>>,
}

impl RegistryInner {
	/// Registered interface names, sorted.
	pub(crate) fn names(&self) -> Vec<String> {
		self.interfaces.keys().cloned().collect()
	}

	pub(crate) fn describe(&self, name: &str) -> Option<String> {
		self.interfaces
			.get(name)
			.map(|interface| interface.descriptor().describe())
	}
}

pub(crate) fn read_inner(lock: &RwLock<RegistryInner>) -> RwLockReadGuard<'_, RegistryInner> {
	lock.read().unwrap_or_else(|poison| poison.into_inner())
}

fn write_inner(lock: &RwLock<RegistryInner>) -> RwLockWriteGuard<'_, RegistryInner> {
	lock.write().unwrap_or_else(|poison| poison.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error("an interface named {0} is already registered")]
	DuplicateInterface(String),
}

/// Maps interface names to served interfaces. Cheap to clone; all clones
/// share the same interface table.
#[derive(Clone)]
pub struct VarlinkInterfaceRegistry {
	pub(crate) inner: Arc<RwLock<RegistryInner>>,
}

impl VarlinkInterfaceRegistry {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(RwLock::new(RegistryInner {
				interfaces: BTreeMap::new(),
			})),
		}
	}

	/// A registry that already serves the `org.varlink.service`
	/// introspection interface with the given metadata.
	pub fn with_service(info: ServiceInfo) -> Self {
		let registry = Self::new();
		let service = service::service_interface(registry.downgrade(), info);
		registry
			.register(service)
			.expect("fresh registry has no duplicate interfaces");
		registry
	}

	pub(crate) fn downgrade(&self) -> Weak<RwLock<RegistryInner>> {
		Arc::downgrade(&self.inner)
	}

	/// Register an interface. Names are unique per registry.
	pub fn register(&self, interface: ServedInterface) -> Result<(), RegistryError> {
		let mut inner = write_inner(&self.inner);
		let name = interface.name().to_owned();
		if inner.interfaces.contains_key(&name) {
			return Err(RegistryError::DuplicateInterface(name));
		}
		inner.interfaces.insert(name, Arc::new(interface));
		Ok(())
	}

	/// Registered interface names, sorted.
	pub fn interface_names(&self) -> Vec<String> {
		read_inner(&self.inner).names()
	}

	/// Rendered interface description, if the interface is registered.
	pub fn describe_interface(&self, name: &str) -> Option<String> {
		read_inner(&self.inner).describe(name)
	}

	/// Resolve a call to its served method, or the matching well-known
	/// error: unknown interface, unknown method, or a streaming method
	/// called without the `more` modifier.
	pub fn lookup_method(
		&self,
		call: &MethodCall,
	) -> Result<(Arc<ServedInterface>, usize), ErrorReply> {
		let interface = read_inner(&self.inner)
			.interfaces
			.get(call.interface())
			.cloned()
			.ok_or_else(|| service::interface_not_found(call.interface()))?;
		let index = interface
			.position(call.name())
			.ok_or_else(|| service::method_not_found(call.method()))?;
		if interface.method_at(index).signature().streaming && !call.is_more() {
			return Err(service::expected_more());
		}
		Ok((interface, index))
	}
}

impl Default for VarlinkInterfaceRegistry {
	fn default() -> Self {
		Self::new()
	}
}
