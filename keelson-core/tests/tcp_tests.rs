//! Channels over real sockets on an event loop.

use keelson_core::channel::{is_live, parent_of};
use keelson_core::prelude::*;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

struct Echo;

impl ChannelHandler for Echo {
    fn channel_read(&mut self, ctx: &HandlerContext, msg: ByteBuffer) {
        ctx.write(msg);
    }

    fn channel_read_complete(&mut self, ctx: &HandlerContext) {
        ctx.flush();
    }
}

/// Sends every inbound buffer to the test thread.
struct Collect(flume::Sender<Vec<u8>>);

impl ChannelHandler for Collect {
    fn channel_read(&mut self, _ctx: &HandlerContext, msg: ByteBuffer) {
        let _ = self.0.send(msg.readable_slice().to_vec());
    }
}

fn echo_server(event_loop: &EventLoop) -> Channel {
    ServerBootstrap::new()
        .event_loop(event_loop)
        .child_handler(|child| child.pipeline().add_last("echo", Echo))
        .bind("127.0.0.1:0".parse().unwrap())
        .get()
        .unwrap()
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn echo_server_round_trip_with_std_client() {
    let event_loop = EventLoop::new("tcp-echo").unwrap();
    let server = echo_server(&event_loop);
    let addr = server.local_addr().unwrap();
    assert!(server.is_active());

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream.write_all(b"hello keelson").unwrap();
    let mut reply = [0u8; 13];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello keelson");

    let acceptor = Arc::clone(server.acceptor().unwrap());
    let child = acceptor.children().pop().unwrap();
    assert_eq!(parent_of(child.id()), Some(server.id()));
    assert_eq!(child.parent().unwrap(), server);

    drop(stream);
    assert!(child.close_future().wait_timeout(WAIT).unwrap());
    let child_id = child.id();
    assert!(wait_until(|| !is_live(child_id)));

    assert!(server.close().wait_timeout(WAIT).unwrap());
    let server_id = server.id();
    assert!(wait_until(|| !is_live(server_id)));
    event_loop.shutdown();
}

#[test]
fn client_bootstrap_talks_to_server() {
    let event_loop = EventLoop::new("tcp-client").unwrap();
    let server = echo_server(&event_loop);
    let addr = server.local_addr().unwrap();

    let (tx, rx) = flume::unbounded();
    let client: Channel = Bootstrap::new()
        .event_loop(&event_loop)
        .handler(move |ch| ch.pipeline().add_last("collect", Collect(tx.clone())))
        .connect(addr)
        .get()
        .unwrap();
    assert!(client.is_active());
    assert_eq!(client.remote_addr(), Some(addr));

    let written = client.write_and_flush(ByteBuffer::copied_from(b"ping"));
    assert!(written.wait_timeout(WAIT).unwrap());
    assert!(written.is_success());

    let mut got = Vec::new();
    while got.len() < 4 {
        got.extend(rx.recv_timeout(WAIT).unwrap());
    }
    assert_eq!(got, b"ping");

    assert!(client.close().wait_timeout(WAIT).unwrap());
    let late = client.write_and_flush(ByteBuffer::copied_from(b"late"));
    assert!(late.wait_timeout(WAIT).unwrap());
    assert!(late.is_failed());

    assert!(server.close().wait_timeout(WAIT).unwrap());
    event_loop.shutdown();
}

#[test]
fn connect_to_a_closed_port_fails() {
    let addr: SocketAddr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let event_loop = EventLoop::new("tcp-refused").unwrap();
    let connecting: CompletionFuture<Channel> = Bootstrap::new()
        .event_loop(&event_loop)
        .options(ChannelOptions::default().with_connect_timeout(Duration::from_secs(2)))
        .connect(addr);

    let err = connecting.get().unwrap_err();
    assert!(matches!(err, KeelsonError::Failed(_)));
    event_loop.shutdown();
}

#[test]
fn closing_the_server_closes_its_children() {
    let event_loop = EventLoop::new("tcp-cascade").unwrap();
    let server = echo_server(&event_loop);
    let addr = server.local_addr().unwrap();
    let acceptor = Arc::clone(server.acceptor().unwrap());

    let mut streams: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
    assert!(wait_until(|| acceptor.live_children() == 3));
    let children = acceptor.children();

    assert!(server.close().wait_timeout(WAIT).unwrap());
    for child in &children {
        assert!(child.close_future().is_success());
        assert!(!child.is_open());
    }
    assert_eq!(acceptor.live_children(), 0);
    assert_eq!(acceptor.pooled_children(), 0);

    // peers see the connection go away
    for stream in &mut streams {
        stream.set_read_timeout(Some(WAIT)).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));
    }
    event_loop.shutdown();
}

#[test]
fn bootstrap_without_executor_is_rejected() {
    let server: CompletionFuture<Channel> = ServerBootstrap::new()
        .child_handler(|_| Ok(()))
        .bind("127.0.0.1:0".parse().unwrap());
    assert!(matches!(
        server.get(),
        Err(KeelsonError::Failed(e)) if matches!(*e, KeelsonError::InvalidConfig(_))
    ));
}

#[compio::test]
async fn bind_and_close_awaited_from_async_code() {
    let event_loop = EventLoop::new("tcp-async").unwrap();
    let bound = ServerBootstrap::new()
        .event_loop(&event_loop)
        .child_handler(|child| child.pipeline().add_last("echo", Echo))
        .bind("127.0.0.1:0".parse().unwrap());
    let server: Channel = bound.listen().await.unwrap();
    assert!(server.is_active());
    assert!(server.local_addr().unwrap().port() != 0);

    server.close().listen().await.unwrap();
    assert!(!server.is_active());
    event_loop.shutdown();
}
