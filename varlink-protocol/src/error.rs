use crate::conversion::ConversionError;
use crate::message::MessageError;

/// Protocol level errors for framing, transport and decoding.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
	#[error("invalid message: {0}")]
	Message(#[from] MessageError),
	#[error("conversion error: {0}")]
	Conversion(#[from] ConversionError),
	#[error("connection closed")]
	ConnectionClosed,
}
