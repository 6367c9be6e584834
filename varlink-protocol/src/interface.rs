//! Interface schemas: method signatures bound to their wire types, plus
//! rendering of varlink interface descriptions.

use crate::conversion::ObjectType;
use crate::message::{MessageError, validate_interface_name, validate_member_name};

/// Wire schema of a single method.
#[derive(Debug, Clone)]
pub struct MethodSignature {
	/// Whether the handler is a future/stream rather than a plain function.
	pub asynchronous: bool,
	/// Whether the method replies with a `continues` chain and must be
	/// called with the `more` modifier.
	pub streaming: bool,
	pub parameters: ObjectType,
	pub returns: ObjectType,
}

impl MethodSignature {
	pub fn new(parameters: ObjectType, returns: ObjectType) -> Self {
		Self {
			asynchronous: false,
			streaming: false,
			parameters,
			returns,
		}
	}

	pub fn asynchronous(mut self) -> Self {
		self.asynchronous = true;
		self
	}

	pub fn streaming(mut self) -> Self {
		self.streaming = true;
		self
	}
}

/// A named set of method signatures in declaration order.
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
	name: String,
	methods: Vec<(String, MethodSignature)>,
}

impl InterfaceDescriptor {
	pub fn new(name: impl Into<String>) -> Result<Self, MessageError> {
		let name = name.into();
		validate_interface_name(&name)?;
		Ok(Self {
			name,
			methods: Vec::new(),
		})
	}

	/// Add a method. Panics on a duplicate name; the member name itself is
	/// validated against the varlink grammar.
	pub fn method(
		mut self,
		name: impl Into<String>,
		signature: MethodSignature,
	) -> Result<Self, MessageError> {
		let name = name.into();
		validate_member_name(&name)?;
		assert!(
			self.signature(&name).is_none(),
			"method {name:?} declared twice"
		);
		self.methods.push((name, signature));
		Ok(self)
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn signature(&self, method: &str) -> Option<&MethodSignature> {
		self.methods
			.iter()
			.find(|(name, _)| name == method)
			.map(|(_, signature)| signature)
	}

	pub fn methods(&self) -> impl Iterator<Item = (&str, &MethodSignature)> {
		self.methods
			.iter()
			.map(|(name, signature)| (name.as_str(), signature))
	}

	/// Render the varlink interface description, one method line per
	/// declared method.
	pub fn describe(&self) -> String {
		let mut lines = vec![format!("interface {}", self.name), String::new()];
		for (name, signature) in &self.methods {
			lines.push(format!(
				"method {}{} -> {}",
				name,
				signature.parameters.as_varlink(),
				signature.returns.as_varlink()
			));
		}
		lines.push(String::new());
		lines.join("\n")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::conversion::VarlinkType;

	fn demo_descriptor() -> InterfaceDescriptor {
		InterfaceDescriptor::new("com.example.demo")
			.expect("interface name")
			.method(
				"Method",
				MethodSignature::new(
					ObjectType::new([("argument", VarlinkType::String)], []),
					ObjectType::new([("result", VarlinkType::String)], []),
				),
			)
			.expect("method")
			.method(
				"CreateFd",
				MethodSignature::new(
					ObjectType::empty(),
					ObjectType::new([("fd", VarlinkType::FileDescriptor)], []),
				),
			)
			.expect("method")
	}

	#[test]
	fn renders_interface_description() {
		assert_eq!(
			demo_descriptor().describe(),
			"interface com.example.demo\n\
			 \n\
			 method Method(argument: string) -> (result: string)\n\
			 method CreateFd() -> (fd: int)\n"
		);
	}

	#[test]
	fn looks_up_signatures() {
		let descriptor = demo_descriptor();
		assert!(descriptor.signature("Method").is_some());
		assert!(descriptor.signature("Absent").is_none());
	}

	#[test]
	fn rejects_invalid_names() {
		assert!(InterfaceDescriptor::new("notdotted").is_err());
		assert!(
			demo_descriptor()
				.method("lowercase", MethodSignature::new(ObjectType::empty(), ObjectType::empty()))
				.is_err()
		);
	}
}
