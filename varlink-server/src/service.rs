//! The `org.varlink.service` introspection interface and its well-known
//! errors.

use std::sync::{RwLock, Weak};

use serde_json::{Map, Value};

use varlink_protocol::{ErrorReply, ObjectType, VarlinkType, VarlinkValue};

use crate::registry::{MethodHandler, RegistryInner, ServedInterface, read_inner};

pub const SERVICE_INTERFACE: &str = "org.varlink.service";

fn service_error(name: &str, parameters: Map<String, Value>) -> ErrorReply {
	ErrorReply::new(format!("{SERVICE_INTERFACE}.{name}"))
		.expect("service error names are valid")
		.with_parameters(parameters)
}

fn single_parameter(key: &str, value: &str) -> Map<String, Value> {
	let mut parameters = Map::new();
	parameters.insert(key.to_owned(), Value::String(value.to_owned()));
	parameters
}

/// A method was called on an interface this service does not provide.
pub fn interface_not_found(interface: &str) -> ErrorReply {
	service_error(
		"InterfaceNotFound",
		single_parameter("interface", interface),
	)
}

/// A method was called that the named interface does not provide.
pub fn method_not_found(method: &str) -> ErrorReply {
	service_error("MethodNotFound", single_parameter("method", method))
}

/// A call parameter could not be converted to its declared type.
pub fn invalid_parameter(parameter: &str) -> ErrorReply {
	service_error("InvalidParameter", single_parameter("parameter", parameter))
}

/// A streaming method was called without the `more` modifier.
pub fn expected_more() -> ErrorReply {
	service_error("ExpectedMore", Map::new())
}

/// The inbound frame was not a well-formed call object.
pub fn protocol_violation() -> ErrorReply {
	service_error("ProtocolViolation", Map::new())
}

/// Service metadata reported by `GetInfo`.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
	pub vendor: String,
	pub product: String,
	pub version: String,
	pub url: String,
}

impl ServiceInfo {
	pub fn new(
		vendor: impl Into<String>,
		product: impl Into<String>,
		version: impl Into<String>,
		url: impl Into<String>,
	) -> Self {
		Self {
			vendor: vendor.into(),
			product: product.into(),
			version: version.into(),
			url: url.into(),
		}
	}
}

/// Build the introspection interface. It holds a weak reference back to the
/// registry so that `GetInfo` lists interfaces registered later as well.
pub(crate) fn service_interface(
	registry: Weak<RwLock<RegistryInner>>,
	info: ServiceInfo,
) -> ServedInterface {
	let info_registry = registry.clone();
	ServedInterface::new(SERVICE_INTERFACE)
		.expect("service interface name is valid")
		.method(
			"GetInfo",
			ObjectType::empty(),
			ObjectType::new(
				[
					("interfaces", VarlinkType::list(VarlinkType::String)),
					("product", VarlinkType::String),
					("url", VarlinkType::String),
					("vendor", VarlinkType::String),
					("version", VarlinkType::String),
				],
				[],
			),
			MethodHandler::Sync(Box::new(move |_parameters| {
				let interfaces = info_registry
					.upgrade()
					.map(|inner| read_inner(&inner).names())
					.unwrap_or_default();
				Ok(VarlinkValue::record([
					("vendor", info.vendor.clone().into()),
					("product", info.product.clone().into()),
					("version", info.version.clone().into()),
					("url", info.url.clone().into()),
					(
						"interfaces",
						VarlinkValue::List(
							interfaces.into_iter().map(VarlinkValue::from).collect(),
						),
					),
				]))
			})),
		)
		.expect("GetInfo is a valid member name")
		.method_wrapping(
			"GetInterfaceDescription",
			ObjectType::new([("interface", VarlinkType::String)], []),
			"description",
			VarlinkType::String,
			MethodHandler::Sync(Box::new(move |parameters| {
				let Some(VarlinkValue::String(name)) = parameters
					.into_object()
					.and_then(|mut record| record.remove("interface"))
				else {
					return Err(invalid_parameter("interface"));
				};
				registry
					.upgrade()
					.and_then(|inner| read_inner(&inner).describe(&name))
					.map(VarlinkValue::String)
					.ok_or_else(|| interface_not_found(&name))
			})),
		)
		.expect("GetInterfaceDescription is a valid member name")
}
