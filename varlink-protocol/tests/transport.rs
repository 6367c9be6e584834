//! Behavioral tests for the transport and connection layers over real
//! socketpairs and pipes.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use serde_json::json;
use varlink_protocol::{VarlinkConnection, VarlinkTransport, encode_frame};

fn socket_pair() -> (OwnedFd, OwnedFd) {
	let (a, b) = UnixStream::pair().expect("socketpair");
	(a.into(), b.into())
}

#[tokio::test]
async fn socket_round_trip() {
	let (a, b) = socket_pair();
	let mut near = VarlinkTransport::from_socket(a).expect("transport");
	let mut far = VarlinkTransport::from_socket(b).expect("transport");
	near.send(b"{\"hello\":\"world\"}\0".to_vec(), Vec::new())
		.await
		.expect("send");
	let (bytes, fds) = far.recv_chunk().await.expect("recv").expect("chunk");
	assert_eq!(bytes, b"{\"hello\":\"world\"}\0");
	assert!(fds.is_empty());
}

#[tokio::test]
async fn consecutive_sends_preserve_order() {
	let (a, b) = socket_pair();
	let near = VarlinkTransport::from_socket(a).expect("transport");
	let mut far = VarlinkTransport::from_socket(b).expect("transport");
	let first = near.send(b"hello".to_vec(), Vec::new());
	let second = near.send(b"world".to_vec(), Vec::new());
	first.await.expect("first send");
	second.await.expect("second send");
	let mut received = Vec::new();
	while received.len() < 10 {
		let (bytes, _) = far.recv_chunk().await.expect("recv").expect("chunk");
		received.extend(bytes);
	}
	assert_eq!(received, b"helloworld");
}

#[tokio::test]
async fn eof_is_reported_as_none() {
	let (a, b) = socket_pair();
	let mut near = VarlinkTransport::from_socket(a).expect("transport");
	drop(b);
	assert!(near.recv_chunk().await.expect("recv").is_none());
}

#[tokio::test]
async fn send_after_peer_close_fails() {
	let (a, b) = socket_pair();
	let near = VarlinkTransport::from_socket(a).expect("transport");
	drop(b);
	// The first write may be swallowed by the socket buffer; keep writing
	// until the broken pipe surfaces.
	let mut failed = false;
	for _ in 0..64 {
		if near.send(vec![0u8; 65536], Vec::new()).await.is_err() {
			failed = true;
			break;
		}
	}
	assert!(failed, "sending into a closed peer never failed");
}

#[tokio::test]
async fn shutdown_fails_new_sends_immediately() {
	let (a, _b) = socket_pair();
	let near = VarlinkTransport::from_socket(a).expect("transport");
	let sender = near.sender();
	sender.shutdown();
	let err = sender
		.send(b"late\0".to_vec(), Vec::new())
		.await
		.expect_err("send after shutdown");
	assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
}

#[tokio::test]
async fn shutdown_flushes_queued_messages() {
	let (a, b) = socket_pair();
	let near = VarlinkTransport::from_socket(a).expect("transport");
	let mut far = VarlinkTransport::from_socket(b).expect("transport");
	let completion = near.send(b"flushed\0".to_vec(), Vec::new());
	near.sender().shutdown();
	completion.await.expect("queued send still flushed");
	let (bytes, _) = far.recv_chunk().await.expect("recv").expect("chunk");
	assert_eq!(bytes, b"flushed\0");
	// Once the receiving half is gone as well, the peer sees EOF.
	drop(near);
	assert!(far.recv_chunk().await.expect("recv").is_none());
}

#[tokio::test]
async fn descriptors_ride_with_their_message() {
	let (a, b) = socket_pair();
	let near = VarlinkTransport::from_socket(a).expect("transport");
	let mut far = VarlinkTransport::from_socket(b).expect("transport");
	let (read_end, write_end) = nix::unistd::pipe().expect("pipe");
	near.send(b"{\"fd\":0}\0".to_vec(), vec![write_end])
		.await
		.expect("send");
	let (bytes, mut fds) = far.recv_chunk().await.expect("recv").expect("chunk");
	assert_eq!(bytes, b"{\"fd\":0}\0");
	assert_eq!(fds.len(), 1);
	let received = fds.take(0).expect("take");
	nix::unistd::write(&received, b"needle").expect("write through passed fd");
	let mut buf = [0u8; 16];
	let n = nix::unistd::read(std::os::fd::AsRawFd::as_raw_fd(&read_end), &mut buf).expect("read");
	assert_eq!(&buf[..n], b"needle");
}

#[tokio::test]
async fn pipe_transport_moves_bytes_but_refuses_descriptors() {
	let (near_read, far_write) = nix::unistd::pipe().expect("pipe");
	let (far_read, near_write) = nix::unistd::pipe().expect("pipe");
	let mut near = VarlinkTransport::new(near_read, near_write).expect("near transport");
	let mut far = VarlinkTransport::new(far_read, far_write).expect("far transport");
	near.send(b"over the pipe\0".to_vec(), Vec::new())
		.await
		.expect("send");
	let (bytes, fds) = far.recv_chunk().await.expect("recv").expect("chunk");
	assert_eq!(bytes, b"over the pipe\0");
	assert!(fds.is_empty());
	let (_r, w) = nix::unistd::pipe().expect("pipe");
	let err = near
		.send(b"with fd\0".to_vec(), vec![w])
		.await
		.expect_err("fds on a pipe");
	assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
}

#[tokio::test]
async fn connection_reassembles_fragmented_frames() {
	let (a, b) = socket_pair();
	let near = VarlinkTransport::from_socket(a).expect("transport");
	let mut far = VarlinkConnection::new(VarlinkTransport::from_socket(b).expect("transport"));
	near.send(b"{\"parameters\":".to_vec(), Vec::new())
		.await
		.expect("send");
	near.send(
		b"{\"result\":\"one\"}}\0{\"parameters\":{\"result\":\"two\"}}\0".to_vec(),
		Vec::new(),
	)
	.await
	.expect("send");
	let first = far.next_frame().await.expect("recv").expect("frame");
	assert_eq!(
		first.parse().expect("json"),
		json!({"parameters": {"result": "one"}})
	);
	let second = far.next_frame().await.expect("recv").expect("frame");
	assert_eq!(
		second.parse().expect("json"),
		json!({"parameters": {"result": "two"}})
	);
}

#[tokio::test]
async fn connection_delivers_malformed_frames_for_the_consumer_to_judge() {
	let (a, b) = socket_pair();
	let near = VarlinkTransport::from_socket(a).expect("transport");
	let mut far = VarlinkConnection::new(VarlinkTransport::from_socket(b).expect("transport"));
	near.send(b"}\0\"not an object\"\0".to_vec(), Vec::new())
		.await
		.expect("send");
	let broken = far.next_frame().await.expect("recv").expect("frame");
	assert!(broken.parse().is_err());
	let non_object = far.next_frame().await.expect("recv").expect("frame");
	assert_eq!(non_object.parse().expect("json"), json!("not an object"));
}

#[tokio::test]
async fn connection_send_value_appends_the_frame_delimiter() {
	let (a, b) = socket_pair();
	let near = VarlinkConnection::new(VarlinkTransport::from_socket(a).expect("transport"));
	let mut far = VarlinkTransport::from_socket(b).expect("transport");
	near.send_value(&json!({"method": "org.example.ping.Ping"}), Vec::new())
		.await
		.expect("send");
	let (bytes, _) = far.recv_chunk().await.expect("recv").expect("chunk");
	assert_eq!(bytes, b"{\"method\":\"org.example.ping.Ping\"}\0");
	assert_eq!(encode_frame(&json!({})), b"{}\0");
}

#[tokio::test]
async fn connection_reports_eof_once() {
	let (a, b) = socket_pair();
	let mut near = VarlinkConnection::new(VarlinkTransport::from_socket(a).expect("transport"));
	{
		let far = VarlinkTransport::from_socket(b).expect("transport");
		far.send(b"{}\0trailing".to_vec(), Vec::new())
			.await
			.expect("send");
		far.sender().shutdown();
	}
	let frame = near.next_frame().await.expect("recv").expect("frame");
	assert_eq!(frame.payload, b"{}");
	// Unterminated trailing bytes are discarded at end of stream.
	assert!(near.next_frame().await.expect("recv").is_none());
	assert!(near.next_frame().await.expect("recv").is_none());
}

#[tokio::test]
async fn descriptor_and_follow_up_frame_in_one_chunk() {
	let (a, b) = socket_pair();
	let near = VarlinkTransport::from_socket(a).expect("transport");
	let mut far = VarlinkConnection::new(VarlinkTransport::from_socket(b).expect("transport"));
	let (_read_end, write_end) = nix::unistd::pipe().expect("pipe");
	// A message carrying a descriptor, then one without. The second must
	// not inherit the first message's descriptor.
	near.send(b"{\"fd\":0}\0".to_vec(), vec![write_end])
		.await
		.expect("send");
	near.send(b"{\"plain\":true}\0".to_vec(), Vec::new())
		.await
		.expect("send");
	let first = far.next_frame().await.expect("recv").expect("frame");
	assert_eq!(first.fds.len(), 1);
	let second = far.next_frame().await.expect("recv").expect("frame");
	assert!(second.fds.is_empty());
}
