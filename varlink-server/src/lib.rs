//! Varlink service side: an interface registry with type-erased method
//! handlers in four dispatch shapes (sync or async, single or streaming), a
//! per-connection serving loop with strict in-order reply delivery, and the
//! `org.varlink.service` introspection interface.

pub mod registry;
pub mod server;
pub mod service;

pub use registry::{
	AsyncHandler, AsyncStreamHandler, MethodHandler, MethodResult, RegistryError, ServedInterface,
	ServedMethod, SyncHandler, SyncStreamHandler, VarlinkInterfaceRegistry,
};
pub use server::{VarlinkServer, serve_connection};
pub use service::{
	SERVICE_INTERFACE, ServiceInfo, expected_more, interface_not_found, invalid_parameter,
	method_not_found, protocol_violation,
};
