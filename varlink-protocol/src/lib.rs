//! Shared varlink protocol core for both client and server sides.
//! - NUL-delimited JSON message framing over unix domain sockets and pipe
//!   pairs (sendmsg/recvmsg + SCM_RIGHTS)
//! - Owned per-message file descriptor arrays with move-out-once semantics
//! - Call/reply records, dynamic type conversion with an out-of-band
//!   descriptor channel, and interface descriptions

pub mod connection;
pub mod conversion;
pub mod error;
pub mod fd_array;
pub mod interface;
pub mod message;
pub mod message_frame;
pub mod socket;
pub mod transport;

pub use connection::{VarlinkConnection, encode_frame};
pub use conversion::{ConversionError, ObjectType, PathSegment, VarlinkType, VarlinkValue};
pub use error::ProtocolError;
pub use fd_array::{FdTakeError, OwnedFdArray};
pub use interface::{InterfaceDescriptor, MethodSignature};
pub use message::{
	ErrorReply, MessageError, MethodCall, MethodReply, validate_interface_name,
	validate_member_name,
};
pub use message_frame::{FrameReader, InboundFrame};
pub use socket::{DEFAULT_SOCKET_PATH, activation_listen_fd, bind_unix_listener, connect_unix};
pub use transport::{
	MAX_RECV_FDS, SendCompletion, TransportReceiver, TransportSender, VarlinkTransport,
};
