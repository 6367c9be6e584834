//! On-wire varlink call and reply objects.
//!
//! Both records are parsed from and emitted as JSON objects by hand so that
//! unknown top-level keys survive a round-trip and invalid shapes are
//! rejected with precise errors.

use serde_json::{Map, Value};

/// Violation of the varlink message object grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
	#[error("message is not a JSON object")]
	NotAnObject,
	#[error("missing required key {0:?}")]
	MissingKey(&'static str),
	#[error("key {0:?} has the wrong type")]
	WrongType(&'static str),
	#[error("invalid interface name {0:?}")]
	InvalidInterfaceName(String),
	#[error("invalid member name {0:?}")]
	InvalidMemberName(String),
	#[error("at most one of oneway, more and upgrade may be set")]
	ConflictingModifiers,
}

fn valid_name_segment(segment: &str, alphabetic_start: bool) -> bool {
	let mut chars = segment.chars();
	let Some(first) = chars.next() else {
		return false;
	};
	let start_ok = if alphabetic_start {
		first.is_ascii_alphabetic()
	} else {
		first.is_ascii_alphanumeric()
	};
	if !start_ok {
		return false;
	}
	let mut last = first;
	for c in chars {
		if !c.is_ascii_alphanumeric() && c != '-' {
			return false;
		}
		last = c;
	}
	last != '-'
}

/// Check a reverse-domain interface name such as `org.varlink.service`.
pub fn validate_interface_name(name: &str) -> Result<(), MessageError> {
	let mut segments = name.split('.');
	let invalid = || MessageError::InvalidInterfaceName(name.to_owned());
	let Some(first) = segments.next() else {
		return Err(invalid());
	};
	if !valid_name_segment(first, true) {
		return Err(invalid());
	}
	let mut rest = 0;
	for segment in segments {
		if !valid_name_segment(segment, false) {
			return Err(invalid());
		}
		rest += 1;
	}
	if rest == 0 {
		return Err(invalid());
	}
	Ok(())
}

/// Check a method or error member name: an upper-case initial followed by
/// ASCII alphanumerics.
pub fn validate_member_name(name: &str) -> Result<(), MessageError> {
	let mut chars = name.chars();
	let ok = chars
		.next()
		.is_some_and(|first| first.is_ascii_uppercase())
		&& chars.all(|c| c.is_ascii_alphanumeric());
	if ok {
		Ok(())
	} else {
		Err(MessageError::InvalidMemberName(name.to_owned()))
	}
}

/// Check a fully qualified `interface.Member` name and return the split
/// point of the final dot.
fn validate_qualified_name(name: &str) -> Result<usize, MessageError> {
	let Some((interface, member)) = name.rsplit_once('.') else {
		return Err(MessageError::InvalidInterfaceName(name.to_owned()));
	};
	validate_interface_name(interface)?;
	validate_member_name(member)?;
	Ok(interface.len())
}

/// A varlink method call object.
///
/// Invariants maintained by the constructors: `method` is a valid qualified
/// name and at most one of the `oneway`, `more` and `upgrade` modifiers is
/// set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCall {
	method: String,
	split: usize,
	parameters: Map<String, Value>,
	oneway: bool,
	more: bool,
	upgrade: bool,
	extensions: Map<String, Value>,
}

impl MethodCall {
	pub fn new(method: impl Into<String>) -> Result<Self, MessageError> {
		let method = method.into();
		let split = validate_qualified_name(&method)?;
		Ok(Self {
			method,
			split,
			parameters: Map::new(),
			oneway: false,
			more: false,
			upgrade: false,
			extensions: Map::new(),
		})
	}

	pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
		self.parameters = parameters;
		self
	}

	pub fn oneway(mut self) -> Result<Self, MessageError> {
		if self.more || self.upgrade {
			return Err(MessageError::ConflictingModifiers);
		}
		self.oneway = true;
		Ok(self)
	}

	pub fn more(mut self) -> Result<Self, MessageError> {
		if self.oneway || self.upgrade {
			return Err(MessageError::ConflictingModifiers);
		}
		self.more = true;
		Ok(self)
	}

	pub fn upgrade(mut self) -> Result<Self, MessageError> {
		if self.oneway || self.more {
			return Err(MessageError::ConflictingModifiers);
		}
		self.upgrade = true;
		Ok(self)
	}

	pub fn method(&self) -> &str {
		&self.method
	}

	/// The interface part of the method name, up to the final dot.
	pub fn interface(&self) -> &str {
		&self.method[..self.split]
	}

	/// The member part of the method name, after the final dot.
	pub fn name(&self) -> &str {
		&self.method[self.split + 1..]
	}

	pub fn parameters(&self) -> &Map<String, Value> {
		&self.parameters
	}

	pub fn extensions(&self) -> &Map<String, Value> {
		&self.extensions
	}

	pub fn is_oneway(&self) -> bool {
		self.oneway
	}

	pub fn is_more(&self) -> bool {
		self.more
	}

	pub fn is_upgrade(&self) -> bool {
		self.upgrade
	}

	pub fn from_value(value: &Value) -> Result<Self, MessageError> {
		let Value::Object(object) = value else {
			return Err(MessageError::NotAnObject);
		};
		let mut method = None;
		let mut parameters = Map::new();
		let mut oneway = false;
		let mut more = false;
		let mut upgrade = false;
		let mut extensions = Map::new();
		for (key, entry) in object {
			match key.as_str() {
				"method" => match entry {
					Value::String(name) => method = Some(name.clone()),
					_ => return Err(MessageError::WrongType("method")),
				},
				"parameters" => match entry {
					Value::Object(map) => parameters = map.clone(),
					_ => return Err(MessageError::WrongType("parameters")),
				},
				"oneway" => oneway = read_bool(entry, "oneway")?,
				"more" => more = read_bool(entry, "more")?,
				"upgrade" => upgrade = read_bool(entry, "upgrade")?,
				_ => {
					extensions.insert(key.clone(), entry.clone());
				}
			}
		}
		let method = method.ok_or(MessageError::MissingKey("method"))?;
		if usize::from(oneway) + usize::from(more) + usize::from(upgrade) > 1 {
			return Err(MessageError::ConflictingModifiers);
		}
		let split = validate_qualified_name(&method)?;
		Ok(Self {
			method,
			split,
			parameters,
			oneway,
			more,
			upgrade,
			extensions,
		})
	}

	/// Emit the wire object. Only set modifiers and non-empty parameter
	/// objects are written.
	pub fn to_value(&self) -> Value {
		let mut object = Map::new();
		object.insert("method".to_owned(), Value::String(self.method.clone()));
		if !self.parameters.is_empty() {
			object.insert(
				"parameters".to_owned(),
				Value::Object(self.parameters.clone()),
			);
		}
		if self.oneway {
			object.insert("oneway".to_owned(), Value::Bool(true));
		}
		if self.more {
			object.insert("more".to_owned(), Value::Bool(true));
		}
		if self.upgrade {
			object.insert("upgrade".to_owned(), Value::Bool(true));
		}
		for (key, value) in &self.extensions {
			object.insert(key.clone(), value.clone());
		}
		Value::Object(object)
	}
}

fn read_bool(value: &Value, key: &'static str) -> Result<bool, MessageError> {
	match value {
		Value::Bool(flag) => Ok(*flag),
		_ => Err(MessageError::WrongType(key)),
	}
}

/// A varlink method reply object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodReply {
	parameters: Map<String, Value>,
	continues: bool,
	error: Option<String>,
	extensions: Map<String, Value>,
}

impl MethodReply {
	pub fn new() -> Self {
		Self::default()
	}

	/// A reply carrying the given qualified error name.
	pub fn for_error(error: impl Into<String>) -> Result<Self, MessageError> {
		let error = error.into();
		validate_qualified_name(&error)?;
		Ok(Self {
			error: Some(error),
			..Self::default()
		})
	}

	pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
		self.parameters = parameters;
		self
	}

	pub fn with_continues(mut self, continues: bool) -> Self {
		self.continues = continues;
		self
	}

	pub fn parameters(&self) -> &Map<String, Value> {
		&self.parameters
	}

	pub fn into_parameters(self) -> Map<String, Value> {
		self.parameters
	}

	pub fn continues(&self) -> bool {
		self.continues
	}

	pub fn error(&self) -> Option<&str> {
		self.error.as_deref()
	}

	pub fn error_interface(&self) -> Option<&str> {
		let error = self.error.as_deref()?;
		error.rsplit_once('.').map(|(interface, _)| interface)
	}

	pub fn error_name(&self) -> Option<&str> {
		let error = self.error.as_deref()?;
		error.rsplit_once('.').map(|(_, name)| name)
	}

	pub fn extensions(&self) -> &Map<String, Value> {
		&self.extensions
	}

	pub fn from_value(value: &Value) -> Result<Self, MessageError> {
		let Value::Object(object) = value else {
			return Err(MessageError::NotAnObject);
		};
		let mut reply = Self::default();
		for (key, entry) in object {
			match key.as_str() {
				"parameters" => match entry {
					Value::Object(map) => reply.parameters = map.clone(),
					_ => return Err(MessageError::WrongType("parameters")),
				},
				"continues" => reply.continues = read_bool(entry, "continues")?,
				"error" => match entry {
					Value::String(name) => {
						validate_qualified_name(name)?;
						reply.error = Some(name.clone());
					}
					_ => return Err(MessageError::WrongType("error")),
				},
				_ => {
					reply.extensions.insert(key.clone(), entry.clone());
				}
			}
		}
		Ok(reply)
	}

	pub fn to_value(&self) -> Value {
		let mut object = Map::new();
		if !self.parameters.is_empty() {
			object.insert(
				"parameters".to_owned(),
				Value::Object(self.parameters.clone()),
			);
		}
		if self.continues {
			object.insert("continues".to_owned(), Value::Bool(true));
		}
		if let Some(error) = &self.error {
			object.insert("error".to_owned(), Value::String(error.clone()));
		}
		for (key, value) in &self.extensions {
			object.insert(key.clone(), value.clone());
		}
		Value::Object(object)
	}
}

/// An error reply raisable from method handlers and surfaced to callers.
/// Carries the qualified error name and its parameter object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
	error: String,
	parameters: Map<String, Value>,
}

impl ErrorReply {
	pub fn new(error: impl Into<String>) -> Result<Self, MessageError> {
		let error = error.into();
		validate_qualified_name(&error)?;
		Ok(Self {
			error,
			parameters: Map::new(),
		})
	}

	pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
		self.parameters = parameters;
		self
	}

	pub fn error(&self) -> &str {
		&self.error
	}

	pub fn parameters(&self) -> &Map<String, Value> {
		&self.parameters
	}

	/// Extract the error carried by a reply, if any.
	pub fn from_reply(reply: &MethodReply) -> Option<Self> {
		reply.error().map(|error| Self {
			error: error.to_owned(),
			parameters: reply.parameters().clone(),
		})
	}

	pub fn to_reply(&self) -> MethodReply {
		MethodReply {
			parameters: self.parameters.clone(),
			continues: false,
			error: Some(self.error.clone()),
			extensions: Map::new(),
		}
	}
}

impl std::fmt::Display for ErrorReply {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "varlink error {}", self.error)
	}
}

impl std::error::Error for ErrorReply {}

impl From<ErrorReply> for MethodReply {
	fn from(error: ErrorReply) -> Self {
		error.to_reply()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn interface_name_grammar() {
		for good in [
			"org.varlink.service",
			"com.example.demo",
			"a.b",
			"de.a-b.c--d",
			"a.0",
		] {
			assert!(validate_interface_name(good).is_ok(), "{good}");
		}
		for bad in ["", "org", "1org.example", "org.", ".org", "org.a-", "org.-a", "org example.a"] {
			assert!(validate_interface_name(bad).is_err(), "{bad}");
		}
	}

	#[test]
	fn member_name_grammar() {
		assert!(validate_member_name("GetInfo").is_ok());
		assert!(validate_member_name("X9").is_ok());
		assert!(validate_member_name("getInfo").is_err());
		assert!(validate_member_name("").is_err());
		assert!(validate_member_name("Get-Info").is_err());
	}

	#[test]
	fn call_round_trip_with_extensions() {
		let value = json!({
			"method": "com.example.demo.Method",
			"parameters": {"argument": "spam"},
			"more": true,
			"x-trace": 7,
		});
		let call = MethodCall::from_value(&value).expect("parse");
		assert_eq!(call.interface(), "com.example.demo");
		assert_eq!(call.name(), "Method");
		assert!(call.is_more());
		assert!(!call.is_oneway());
		assert_eq!(call.extensions().get("x-trace"), Some(&json!(7)));
		assert_eq!(call.to_value(), value);
	}

	#[test]
	fn call_defaults() {
		let call =
			MethodCall::from_value(&json!({"method": "com.example.demo.Method"})).expect("parse");
		assert!(call.parameters().is_empty());
		assert!(!call.is_oneway() && !call.is_more() && !call.is_upgrade());
		assert_eq!(call.to_value(), json!({"method": "com.example.demo.Method"}));
	}

	#[test]
	fn call_rejects_conflicting_modifiers() {
		let value = json!({
			"method": "com.example.demo.Method",
			"oneway": true,
			"more": true,
		});
		assert_eq!(
			MethodCall::from_value(&value),
			Err(MessageError::ConflictingModifiers)
		);
		let call = MethodCall::new("com.example.demo.Method").expect("name");
		assert_eq!(
			call.oneway().and_then(MethodCall::more),
			Err(MessageError::ConflictingModifiers)
		);
	}

	#[test]
	fn call_rejects_bad_shapes() {
		assert_eq!(
			MethodCall::from_value(&json!("no object")),
			Err(MessageError::NotAnObject)
		);
		assert_eq!(
			MethodCall::from_value(&json!({"parameters": {}})),
			Err(MessageError::MissingKey("method"))
		);
		assert_eq!(
			MethodCall::from_value(&json!({"method": "com.example.demo.Method", "oneway": 1})),
			Err(MessageError::WrongType("oneway"))
		);
		assert_eq!(
			MethodCall::from_value(&json!({"method": "com.example.demo.Method", "parameters": []})),
			Err(MessageError::WrongType("parameters"))
		);
		assert!(MethodCall::from_value(&json!({"method": "demo.method"})).is_err());
	}

	#[test]
	fn reply_round_trip() {
		let value = json!({
			"continues": true,
			"parameters": {"result": "spam"},
			"x-extra": null,
		});
		let reply = MethodReply::from_value(&value).expect("parse");
		assert!(reply.continues());
		assert_eq!(reply.error(), None);
		assert_eq!(reply.to_value(), value);
	}

	#[test]
	fn reply_error_names() {
		let reply = MethodReply::from_value(&json!({
			"error": "org.varlink.service.MethodNotFound",
			"parameters": {"method": "X"},
		}))
		.expect("parse");
		assert_eq!(reply.error_interface(), Some("org.varlink.service"));
		assert_eq!(reply.error_name(), Some("MethodNotFound"));
		assert!(MethodReply::from_value(&json!({"error": "notdotted"})).is_err());
	}

	#[test]
	fn error_reply_to_reply() {
		let error = ErrorReply::new("com.example.demo.DemoFailure")
			.expect("name")
			.with_parameters(json!({"detail": "egg"}).as_object().cloned().unwrap());
		let reply = error.to_reply();
		assert_eq!(reply.error(), Some("com.example.demo.DemoFailure"));
		assert_eq!(ErrorReply::from_reply(&reply), Some(error));
	}
}
