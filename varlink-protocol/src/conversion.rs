//! Conversion between wire JSON values and typed varlink values.
//!
//! [`VarlinkType`] is a runtime type descriptor able to convert in both
//! directions and to render itself in varlink interface-description syntax.
//! File descriptors never appear in the JSON itself: an out-of-band channel
//! threaded through the recursion carries them, with the JSON holding only
//! indices into the per-message descriptor array.

use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};

use serde_json::{Map, Number, Value};

use crate::fd_array::OwnedFdArray;

/// Position of a conversion failure within a nested value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
	Key(String),
	Index(usize),
}

impl fmt::Display for PathSegment {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PathSegment::Key(key) => write!(f, "{key}"),
			PathSegment::Index(index) => write!(f, "[{index}]"),
		}
	}
}

/// A failure to convert a value from or to its wire representation,
/// annotated with the location inside the converted value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionError {
	path: Vec<PathSegment>,
	message: String,
}

impl ConversionError {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			path: Vec::new(),
			message: message.into(),
		}
	}

	fn expected(what: &str, got: &Value) -> Self {
		Self::new(format!("expected {what}, but got {}", json_type_name(got)))
	}

	fn expected_value(what: &str, got: &VarlinkValue) -> Self {
		Self::new(format!("expected {what}, but got {}", got.type_name()))
	}

	/// Record that the error happened inside the given location, as it
	/// propagates outwards.
	pub fn located(mut self, segment: PathSegment) -> Self {
		self.path.insert(0, segment);
		self
	}

	pub fn path(&self) -> &[PathSegment] {
		&self.path
	}

	pub fn message(&self) -> &str {
		&self.message
	}

	/// The outermost offending key or index, e.g. for InvalidParameter
	/// replies.
	pub fn parameter(&self) -> Option<String> {
		self.path.first().map(|segment| match segment {
			PathSegment::Key(key) => key.clone(),
			PathSegment::Index(index) => index.to_string(),
		})
	}
}

impl fmt::Display for ConversionError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (position, segment) in self.path.iter().enumerate() {
			match segment {
				PathSegment::Key(key) if position > 0 => write!(f, ".{key}")?,
				segment => write!(f, "{segment}")?,
			}
		}
		if self.path.is_empty() {
			write!(f, "{}", self.message)
		} else {
			write!(f, ": {}", self.message)
		}
	}
}

impl std::error::Error for ConversionError {}

fn json_type_name(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "bool",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}

/// A typed varlink value as handled by user code. Owns any file descriptors
/// it carries.
#[derive(Debug)]
pub enum VarlinkValue {
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	String(String),
	List(Vec<VarlinkValue>),
	Object(BTreeMap<String, VarlinkValue>),
	Fd(OwnedFd),
	Foreign(Value),
}

impl VarlinkValue {
	pub fn record<K: Into<String>>(entries: impl IntoIterator<Item = (K, VarlinkValue)>) -> Self {
		Self::Object(
			entries
				.into_iter()
				.map(|(key, value)| (key.into(), value))
				.collect(),
		)
	}

	pub fn empty_record() -> Self {
		Self::Object(BTreeMap::new())
	}

	fn type_name(&self) -> &'static str {
		match self {
			Self::Null => "null",
			Self::Bool(_) => "bool",
			Self::Int(_) => "int",
			Self::Float(_) => "float",
			Self::String(_) => "string",
			Self::List(_) => "list",
			Self::Object(_) => "object",
			Self::Fd(_) => "file descriptor",
			Self::Foreign(_) => "foreign value",
		}
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Self::Bool(value) => Some(*value),
			_ => None,
		}
	}

	pub fn as_int(&self) -> Option<i64> {
		match self {
			Self::Int(value) => Some(*value),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::String(value) => Some(value),
			_ => None,
		}
	}

	pub fn into_object(self) -> Option<BTreeMap<String, VarlinkValue>> {
		match self {
			Self::Object(map) => Some(map),
			_ => None,
		}
	}

	pub fn take_fd(self) -> Option<OwnedFd> {
		match self {
			Self::Fd(fd) => Some(fd),
			_ => None,
		}
	}
}

impl PartialEq for VarlinkValue {
	fn eq(&self, other: &Self) -> bool {
		match (self, other) {
			(Self::Null, Self::Null) => true,
			(Self::Bool(a), Self::Bool(b)) => a == b,
			(Self::Int(a), Self::Int(b)) => a == b,
			(Self::Float(a), Self::Float(b)) => a == b,
			(Self::String(a), Self::String(b)) => a == b,
			(Self::List(a), Self::List(b)) => a == b,
			(Self::Object(a), Self::Object(b)) => a == b,
			(Self::Fd(a), Self::Fd(b)) => a.as_raw_fd() == b.as_raw_fd(),
			(Self::Foreign(a), Self::Foreign(b)) => a == b,
			_ => false,
		}
	}
}

impl From<bool> for VarlinkValue {
	fn from(value: bool) -> Self {
		Self::Bool(value)
	}
}

impl From<i64> for VarlinkValue {
	fn from(value: i64) -> Self {
		Self::Int(value)
	}
}

impl From<f64> for VarlinkValue {
	fn from(value: f64) -> Self {
		Self::Float(value)
	}
}

impl From<&str> for VarlinkValue {
	fn from(value: &str) -> Self {
		Self::String(value.to_owned())
	}
}

impl From<String> for VarlinkValue {
	fn from(value: String) -> Self {
		Self::String(value)
	}
}

impl From<OwnedFd> for VarlinkValue {
	fn from(value: OwnedFd) -> Self {
		Self::Fd(value)
	}
}

fn reborrow<'s, T>(oob: &'s mut Option<&mut T>) -> Option<&'s mut T> {
	oob.as_mut().map(|inner| &mut **inner)
}

/// String-keyed record type with disjoint required and optional field sets.
#[derive(Debug, Clone, Default)]
pub struct ObjectType {
	required: BTreeMap<String, VarlinkType>,
	optional: BTreeMap<String, VarlinkType>,
}

impl ObjectType {
	/// Panics if a key appears in both the required and the optional set.
	pub fn new<I, J, K>(required: I, optional: J) -> Self
	where
		I: IntoIterator<Item = (K, VarlinkType)>,
		J: IntoIterator<Item = (K, VarlinkType)>,
		K: Into<String>,
	{
		let required: BTreeMap<String, VarlinkType> = required
			.into_iter()
			.map(|(key, vtype)| (key.into(), vtype))
			.collect();
		let optional: BTreeMap<String, VarlinkType> = optional
			.into_iter()
			.map(|(key, vtype)| (key.into(), vtype))
			.collect();
		for key in optional.keys() {
			assert!(
				!required.contains_key(key),
				"key {key:?} is both required and optional"
			);
		}
		Self { required, optional }
	}

	pub fn empty() -> Self {
		Self::default()
	}

	pub fn required(&self) -> &BTreeMap<String, VarlinkType> {
		&self.required
	}

	pub fn optional(&self) -> &BTreeMap<String, VarlinkType> {
		&self.optional
	}

	pub fn as_varlink(&self) -> String {
		let fields: Vec<String> = self
			.required
			.iter()
			.map(|(key, vtype)| (key, vtype.as_varlink()))
			.chain(
				self.optional
					.iter()
					.map(|(key, vtype)| (key, format!("?{}", vtype.as_varlink()))),
			)
			.collect::<BTreeMap<_, _>>()
			.into_iter()
			.map(|(key, rendered)| format!("{key}: {rendered}"))
			.collect();
		format!("({})", fields.join(", "))
	}

	/// Convert a typed record to a wire parameter object.
	pub fn to_json_object(
		&self,
		value: VarlinkValue,
		mut oob: Option<&mut Vec<OwnedFd>>,
	) -> Result<Map<String, Value>, ConversionError> {
		let VarlinkValue::Object(mut entries) = value else {
			return Err(ConversionError::expected_value("object", &value));
		};
		let mut result = Map::new();
		for (key, vtype) in &self.required {
			let value = entries.remove(key).ok_or_else(|| {
				ConversionError::new("missing required key")
					.located(PathSegment::Key(key.clone()))
			})?;
			let converted = vtype
				.to_json(value, reborrow(&mut oob))
				.map_err(|err| err.located(PathSegment::Key(key.clone())))?;
			result.insert(key.clone(), converted);
		}
		for (key, value) in entries {
			let Some(vtype) = self.optional.get(&key) else {
				return Err(ConversionError::new("no type for this key")
					.located(PathSegment::Key(key.clone())));
			};
			if matches!(value, VarlinkValue::Null) {
				continue;
			}
			let converted = vtype
				.to_json(value, reborrow(&mut oob))
				.map_err(|err| err.located(PathSegment::Key(key.clone())))?;
			result.insert(key, converted);
		}
		Ok(result)
	}

	/// Convert a wire parameter object to a typed record.
	pub fn from_json_object(
		&self,
		object: &Map<String, Value>,
		mut oob: Option<&mut OwnedFdArray>,
	) -> Result<VarlinkValue, ConversionError> {
		let mut result = BTreeMap::new();
		for (key, vtype) in &self.required {
			let value = object.get(key).ok_or_else(|| {
				ConversionError::new("missing required key")
					.located(PathSegment::Key(key.clone()))
			})?;
			let converted = vtype
				.from_json(value, reborrow(&mut oob))
				.map_err(|err| err.located(PathSegment::Key(key.clone())))?;
			result.insert(key.clone(), converted);
		}
		for (key, value) in object {
			if self.required.contains_key(key) {
				continue;
			}
			let Some(vtype) = self.optional.get(key) else {
				return Err(ConversionError::new("no type for this key")
					.located(PathSegment::Key(key.clone())));
			};
			if value.is_null() {
				continue;
			}
			let converted = vtype
				.from_json(value, reborrow(&mut oob))
				.map_err(|err| err.located(PathSegment::Key(key.clone())))?;
			result.insert(key.clone(), converted);
		}
		Ok(VarlinkValue::Object(result))
	}
}

/// Runtime description of a varlink type.
#[derive(Debug, Clone)]
pub enum VarlinkType {
	Bool,
	Int,
	Float,
	String,
	/// Member names in declaration order.
	Enum(Vec<String>),
	Optional(Box<VarlinkType>),
	List(Box<VarlinkType>),
	/// Map with string keys and homogeneous values.
	Map(Box<VarlinkType>),
	Object(ObjectType),
	FileDescriptor,
	/// Passthrough without validation.
	Foreign,
}

impl VarlinkType {
	/// Panics when given an already-optional type; optionals do not nest.
	pub fn optional(inner: VarlinkType) -> Self {
		assert!(
			!matches!(inner, VarlinkType::Optional(_)),
			"optional types cannot nest"
		);
		Self::Optional(Box::new(inner))
	}

	pub fn list(element: VarlinkType) -> Self {
		Self::List(Box::new(element))
	}

	pub fn map(values: VarlinkType) -> Self {
		Self::Map(Box::new(values))
	}

	pub fn enumeration<M: Into<String>>(members: impl IntoIterator<Item = M>) -> Self {
		Self::Enum(members.into_iter().map(Into::into).collect())
	}

	/// Interface-description rendering of the type. Objects use sorted
	/// keys, enums keep declaration order.
	pub fn as_varlink(&self) -> String {
		match self {
			Self::Bool => "bool".to_owned(),
			Self::Int => "int".to_owned(),
			Self::Float => "float".to_owned(),
			Self::String => "string".to_owned(),
			Self::Enum(members) => format!("({})", members.join(", ")),
			Self::Optional(inner) => format!("?{}", inner.as_varlink()),
			Self::List(element) => format!("[]{}", element.as_varlink()),
			Self::Map(values) => format!("[string]{}", values.as_varlink()),
			Self::Object(object) => object.as_varlink(),
			// Descriptors travel out of band; on the wire they are indices.
			Self::FileDescriptor => "int".to_owned(),
			Self::Foreign => "object".to_owned(),
		}
	}

	/// Convert a typed value to its wire JSON form. File descriptors are
	/// appended to the out-of-band list and represented by their index;
	/// without a channel they cannot be represented.
	pub fn to_json(
		&self,
		value: VarlinkValue,
		mut oob: Option<&mut Vec<OwnedFd>>,
	) -> Result<Value, ConversionError> {
		match (self, value) {
			(Self::Bool, VarlinkValue::Bool(value)) => Ok(Value::Bool(value)),
			(Self::Int, VarlinkValue::Int(value)) => Ok(Value::Number(value.into())),
			(Self::Float, VarlinkValue::Float(value)) => float_value(value),
			(Self::Float, VarlinkValue::Int(value)) => float_value(value as f64),
			(Self::String, VarlinkValue::String(value)) => Ok(Value::String(value)),
			(Self::Enum(members), VarlinkValue::String(value)) => {
				if members.contains(&value) {
					Ok(Value::String(value))
				} else {
					Err(ConversionError::new(format!(
						"enum value {value:?} not known"
					)))
				}
			}
			(Self::Optional(_), VarlinkValue::Null) => Ok(Value::Null),
			(Self::Optional(inner), value) => inner.to_json(value, oob),
			(Self::List(element), VarlinkValue::List(items)) => {
				let mut result = Vec::with_capacity(items.len());
				for (index, item) in items.into_iter().enumerate() {
					let converted = element
						.to_json(item, reborrow(&mut oob))
						.map_err(|err| err.located(PathSegment::Index(index)))?;
					result.push(converted);
				}
				Ok(Value::Array(result))
			}
			(Self::Map(values), VarlinkValue::Object(entries)) => {
				let mut result = Map::new();
				for (key, item) in entries {
					let converted = values
						.to_json(item, reborrow(&mut oob))
						.map_err(|err| err.located(PathSegment::Key(key.clone())))?;
					result.insert(key, converted);
				}
				Ok(Value::Object(result))
			}
			(Self::Object(object), value) => object.to_json_object(value, oob).map(Value::Object),
			(Self::FileDescriptor, VarlinkValue::Fd(fd)) => {
				let Some(fds) = oob else {
					return Err(ConversionError::new(
						"cannot represent a file descriptor without an out-of-band channel",
					));
				};
				let index = fds.len();
				fds.push(fd);
				Ok(Value::Number(index.into()))
			}
			(Self::Foreign, VarlinkValue::Foreign(value)) => Ok(value),
			(vtype, value) => Err(ConversionError::expected_value(
				vtype.expectation(),
				&value,
			)),
		}
	}

	/// Convert a wire JSON value to its typed form. A file descriptor value
	/// must be a non-negative index into the out-of-band array; the slot is
	/// taken, so repeated indices fail and unconverted descriptors remain
	/// owned by the array.
	pub fn from_json(
		&self,
		value: &Value,
		mut oob: Option<&mut OwnedFdArray>,
	) -> Result<VarlinkValue, ConversionError> {
		match (self, value) {
			(Self::Bool, Value::Bool(value)) => Ok(VarlinkValue::Bool(*value)),
			(Self::Int, Value::Number(number)) => number
				.as_i64()
				.map(VarlinkValue::Int)
				.ok_or_else(|| ConversionError::expected("int", value)),
			(Self::Float, Value::Number(number)) => number
				.as_f64()
				.map(VarlinkValue::Float)
				.ok_or_else(|| ConversionError::expected("float", value)),
			(Self::String, Value::String(value)) => Ok(VarlinkValue::String(value.clone())),
			(Self::Enum(members), Value::String(name)) => {
				if members.contains(name) {
					Ok(VarlinkValue::String(name.clone()))
				} else {
					Err(ConversionError::new(format!("enum value {name:?} not known")))
				}
			}
			(Self::Optional(_), Value::Null) => Ok(VarlinkValue::Null),
			(Self::Optional(inner), value) => inner.from_json(value, oob),
			(Self::List(element), Value::Array(items)) => {
				let mut result = Vec::with_capacity(items.len());
				for (index, item) in items.iter().enumerate() {
					let converted = element
						.from_json(item, reborrow(&mut oob))
						.map_err(|err| err.located(PathSegment::Index(index)))?;
					result.push(converted);
				}
				Ok(VarlinkValue::List(result))
			}
			(Self::Map(values), Value::Object(entries)) => {
				let mut result = BTreeMap::new();
				for (key, item) in entries {
					let converted = values
						.from_json(item, reborrow(&mut oob))
						.map_err(|err| err.located(PathSegment::Key(key.clone())))?;
					result.insert(key.clone(), converted);
				}
				Ok(VarlinkValue::Object(result))
			}
			(Self::Object(object), Value::Object(entries)) => {
				object.from_json_object(entries, oob)
			}
			(Self::FileDescriptor, Value::Number(number)) => {
				let index = number
					.as_u64()
					.ok_or_else(|| ConversionError::expected("non-negative int", value))?;
				let Some(fds) = oob else {
					return Err(ConversionError::new(
						"cannot resolve a file descriptor without an out-of-band channel",
					));
				};
				let fd = fds
					.take(index as usize)
					.map_err(|err| ConversionError::new(err.to_string()))?;
				Ok(VarlinkValue::Fd(fd))
			}
			(Self::Foreign, value) => Ok(VarlinkValue::Foreign(value.clone())),
			(vtype, value) => Err(ConversionError::expected(vtype.expectation(), value)),
		}
	}

	fn expectation(&self) -> &'static str {
		match self {
			Self::Bool => "bool",
			Self::Int => "int",
			Self::Float => "float",
			Self::String => "string",
			Self::Enum(_) => "enum member name",
			Self::Optional(_) => "optional value",
			Self::List(_) => "list",
			Self::Map(_) => "map",
			Self::Object(_) => "object",
			Self::FileDescriptor => "file descriptor",
			Self::Foreign => "foreign value",
		}
	}
}

fn float_value(value: f64) -> Result<Value, ConversionError> {
	Number::from_f64(value)
		.map(Value::Number)
		.ok_or_else(|| ConversionError::new("cannot represent a non-finite float"))
}
