//! Server dispatch behavior over a socketpair, driven by raw frames.

use std::os::unix::net::UnixStream;

use futures::FutureExt;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use varlink_protocol::{ErrorReply, ObjectType, VarlinkTransport, VarlinkType, VarlinkValue};
use varlink_server::{
	MethodHandler, ServedInterface, ServiceInfo, VarlinkInterfaceRegistry, invalid_parameter,
	serve_connection,
};

fn demo_interface() -> ServedInterface {
	ServedInterface::new("com.example.demo")
		.expect("name")
		.method_wrapping(
			"Answer",
			ObjectType::empty(),
			"result",
			VarlinkType::Int,
			MethodHandler::Sync(Box::new(|_| Ok(VarlinkValue::Int(42)))),
		)
		.expect("method")
		.method_wrapping(
			"Echo",
			ObjectType::new([("argument", VarlinkType::String)], []),
			"result",
			VarlinkType::String,
			MethodHandler::Sync(Box::new(|parameters| {
				let argument = parameters
					.into_object()
					.and_then(|mut record| record.remove("argument"))
					.and_then(|value| value.as_str().map(str::to_owned))
					.ok_or_else(|| invalid_parameter("argument"))?;
				Ok(VarlinkValue::String(argument))
			})),
		)
		.expect("method")
		.method_wrapping(
			"Count",
			ObjectType::new([("limit", VarlinkType::Int)], []),
			"value",
			VarlinkType::Int,
			MethodHandler::SyncStream(Box::new(|parameters| {
				let limit = parameters
					.into_object()
					.and_then(|mut record| record.remove("limit"))
					.and_then(|value| value.as_int())
					.ok_or_else(|| invalid_parameter("limit"))?;
				Ok(Box::new((0..limit).map(|value| Ok(VarlinkValue::Int(value)))) as _)
			})),
		)
		.expect("method")
		.method_wrapping(
			"Sleepy",
			ObjectType::empty(),
			"result",
			VarlinkType::String,
			MethodHandler::Async(Box::new(|_| {
				async {
					tokio::time::sleep(std::time::Duration::from_millis(25)).await;
					Ok(VarlinkValue::String("yawn".to_owned()))
				}
				.boxed()
			})),
		)
		.expect("method")
		.method_wrapping(
			"Ticks",
			ObjectType::empty(),
			"tick",
			VarlinkType::Int,
			MethodHandler::AsyncStream(Box::new(|_| {
				futures::stream::iter([Ok(VarlinkValue::Int(1)), Ok(VarlinkValue::Int(2))]).boxed()
			})),
		)
		.expect("method")
		.method(
			"Fail",
			ObjectType::empty(),
			ObjectType::empty(),
			MethodHandler::Sync(Box::new(|_| {
				Err(ErrorReply::new("com.example.demo.DemoFailure").expect("error name"))
			})),
		)
		.expect("method")
}

fn demo_registry() -> VarlinkInterfaceRegistry {
	let registry = VarlinkInterfaceRegistry::with_service(ServiceInfo::new(
		"Example",
		"Demo",
		"1",
		"https://example.com",
	));
	registry.register(demo_interface()).expect("register");
	registry
}

struct Peer {
	stream: tokio::net::UnixStream,
	buffer: Vec<u8>,
}

impl Peer {
	async fn send(&mut self, frame: &Value) {
		let mut bytes = serde_json::to_vec(frame).expect("serialize");
		bytes.push(0);
		self.stream.write_all(&bytes).await.expect("write");
	}

	async fn send_raw(&mut self, bytes: &[u8]) {
		self.stream.write_all(bytes).await.expect("write");
	}

	async fn next_reply(&mut self) -> Value {
		loop {
			if let Some(end) = self.buffer.iter().position(|b| *b == 0) {
				let frame: Vec<u8> = self.buffer.drain(..=end).collect();
				return serde_json::from_slice(&frame[..frame.len() - 1]).expect("reply json");
			}
			let mut chunk = [0u8; 1024];
			let n = self.stream.read(&mut chunk).await.expect("read");
			assert!(n > 0, "connection closed while waiting for a reply");
			self.buffer.extend_from_slice(&chunk[..n]);
		}
	}
}

fn serve_pair() -> Peer {
	let (ours, theirs) = UnixStream::pair().expect("socketpair");
	let transport = VarlinkTransport::from_socket(theirs.into()).expect("transport");
	tokio::spawn(serve_connection(demo_registry(), transport));
	ours.set_nonblocking(true).expect("nonblocking");
	Peer {
		stream: tokio::net::UnixStream::from_std(ours).expect("tokio stream"),
		buffer: Vec::new(),
	}
}

#[tokio::test]
async fn sync_single_reply() {
	let mut peer = serve_pair();
	peer.send(&json!({"method": "com.example.demo.Answer"})).await;
	assert_eq!(
		peer.next_reply().await,
		json!({"parameters": {"result": 42}})
	);
}

#[tokio::test]
async fn parameters_reach_the_handler() {
	let mut peer = serve_pair();
	peer.send(&json!({
		"method": "com.example.demo.Echo",
		"parameters": {"argument": "ping"},
	}))
	.await;
	assert_eq!(
		peer.next_reply().await,
		json!({"parameters": {"result": "ping"}})
	);
}

#[tokio::test]
async fn sync_streaming_flags_continues() {
	let mut peer = serve_pair();
	peer.send(&json!({
		"method": "com.example.demo.Count",
		"parameters": {"limit": 2},
		"more": true,
	}))
	.await;
	assert_eq!(
		peer.next_reply().await,
		json!({"continues": true, "parameters": {"value": 0}})
	);
	assert_eq!(
		peer.next_reply().await,
		json!({"parameters": {"value": 1}})
	);
}

#[tokio::test]
async fn empty_stream_still_terminates() {
	let mut peer = serve_pair();
	peer.send(&json!({
		"method": "com.example.demo.Count",
		"parameters": {"limit": 0},
		"more": true,
	}))
	.await;
	assert_eq!(peer.next_reply().await, json!({}));
}

#[tokio::test]
async fn async_single_reply() {
	let mut peer = serve_pair();
	peer.send(&json!({"method": "com.example.demo.Sleepy"})).await;
	assert_eq!(
		peer.next_reply().await,
		json!({"parameters": {"result": "yawn"}})
	);
}

#[tokio::test]
async fn async_streaming_replies() {
	let mut peer = serve_pair();
	peer.send(&json!({"method": "com.example.demo.Ticks", "more": true}))
		.await;
	assert_eq!(
		peer.next_reply().await,
		json!({"continues": true, "parameters": {"tick": 1}})
	);
	assert_eq!(peer.next_reply().await, json!({"parameters": {"tick": 2}}));
}

#[tokio::test]
async fn streaming_without_more_is_refused() {
	let mut peer = serve_pair();
	peer.send(&json!({"method": "com.example.demo.Count", "parameters": {"limit": 2}}))
		.await;
	assert_eq!(
		peer.next_reply().await,
		json!({"error": "org.varlink.service.ExpectedMore"})
	);
}

#[tokio::test]
async fn unknown_interface_and_method() {
	let mut peer = serve_pair();
	peer.send(&json!({"method": "com.example.other.Answer"})).await;
	assert_eq!(
		peer.next_reply().await,
		json!({
			"error": "org.varlink.service.InterfaceNotFound",
			"parameters": {"interface": "com.example.other"},
		})
	);
	peer.send(&json!({"method": "com.example.demo.Absent"})).await;
	assert_eq!(
		peer.next_reply().await,
		json!({
			"error": "org.varlink.service.MethodNotFound",
			"parameters": {"method": "com.example.demo.Absent"},
		})
	);
}

#[tokio::test]
async fn invalid_parameters_name_the_offending_key() {
	let mut peer = serve_pair();
	peer.send(&json!({
		"method": "com.example.demo.Echo",
		"parameters": {"argument": 5},
	}))
	.await;
	assert_eq!(
		peer.next_reply().await,
		json!({
			"error": "org.varlink.service.InvalidParameter",
			"parameters": {"parameter": "argument"},
		})
	);
	peer.send(&json!({"method": "com.example.demo.Echo"})).await;
	assert_eq!(
		peer.next_reply().await,
		json!({
			"error": "org.varlink.service.InvalidParameter",
			"parameters": {"parameter": "argument"},
		})
	);
}

#[tokio::test]
async fn malformed_calls_earn_a_protocol_violation() {
	let mut peer = serve_pair();
	peer.send(&json!({"parameters": {}})).await;
	assert_eq!(
		peer.next_reply().await,
		json!({"error": "org.varlink.service.ProtocolViolation"})
	);
	peer.send(&json!("not an object")).await;
	assert_eq!(
		peer.next_reply().await,
		json!({"error": "org.varlink.service.ProtocolViolation"})
	);
	// Undecodable bytes are dropped without an answer; the connection
	// stays usable.
	peer.send_raw(b"}\0").await;
	peer.send(&json!({"method": "com.example.demo.Answer"})).await;
	assert_eq!(
		peer.next_reply().await,
		json!({"parameters": {"result": 42}})
	);
}

#[tokio::test]
async fn oneway_suppresses_replies_and_errors() {
	let mut peer = serve_pair();
	peer.send(&json!({"method": "com.example.demo.Fail", "oneway": true}))
		.await;
	peer.send(&json!({"method": "com.example.demo.Answer"})).await;
	// The only reply is the one for the follow-up call.
	assert_eq!(
		peer.next_reply().await,
		json!({"parameters": {"result": 42}})
	);
}

#[tokio::test]
async fn user_errors_become_error_replies() {
	let mut peer = serve_pair();
	peer.send(&json!({"method": "com.example.demo.Fail"})).await;
	assert_eq!(
		peer.next_reply().await,
		json!({"error": "com.example.demo.DemoFailure"})
	);
}

#[tokio::test]
async fn pipelined_calls_are_answered_in_order() {
	let mut peer = serve_pair();
	// A slow asynchronous call first; its reply must still precede the
	// fast one, because the next frame is only handled once the head of
	// the line finished.
	peer.send_raw(
		b"{\"method\":\"com.example.demo.Sleepy\"}\0{\"method\":\"com.example.demo.Answer\"}\0",
	)
	.await;
	assert_eq!(
		peer.next_reply().await,
		json!({"parameters": {"result": "yawn"}})
	);
	assert_eq!(
		peer.next_reply().await,
		json!({"parameters": {"result": 42}})
	);
}

#[tokio::test]
async fn get_info_lists_interfaces_sorted() {
	let mut peer = serve_pair();
	peer.send(&json!({"method": "org.varlink.service.GetInfo"})).await;
	assert_eq!(
		peer.next_reply().await,
		json!({"parameters": {
			"interfaces": ["com.example.demo", "org.varlink.service"],
			"product": "Demo",
			"url": "https://example.com",
			"vendor": "Example",
			"version": "1",
		}})
	);
}

#[tokio::test]
async fn get_interface_description_renders_methods() {
	let mut peer = serve_pair();
	peer.send(&json!({
		"method": "org.varlink.service.GetInterfaceDescription",
		"parameters": {"interface": "org.varlink.service"},
	}))
	.await;
	let reply = peer.next_reply().await;
	let description = reply["parameters"]["description"]
		.as_str()
		.expect("description");
	assert!(description.starts_with("interface org.varlink.service\n"));
	assert!(description.contains("method GetInfo() -> "));
	assert!(
		description
			.contains("method GetInterfaceDescription(interface: string) -> (description: string)")
	);
	peer.send(&json!({
		"method": "org.varlink.service.GetInterfaceDescription",
		"parameters": {"interface": "com.example.unknown"},
	}))
	.await;
	assert_eq!(
		peer.next_reply().await,
		json!({
			"error": "org.varlink.service.InterfaceNotFound",
			"parameters": {"interface": "com.example.unknown"},
		})
	);
}
