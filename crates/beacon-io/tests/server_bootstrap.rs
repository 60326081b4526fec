//! 服务端引导的端到端场景：接受、数据流、TLS 延迟投递、监听器销毁。

mod common;

use std::io::Write;
use std::sync::Arc;
use std::sync::mpsc;

use parking_lot::Mutex;

use beacon_io::prelude::*;
use common::*;

struct ListenerFixture {
    listener: ServerListener,
    incoming_rx: mpsc::Receiver<Result<Channel, CoreError>>,
    shutdown_rx: mpsc::Receiver<Option<CoreError>>,
    destroy_rx: mpsc::Receiver<()>,
    port: u16,
}

fn spawn_listener(
    bootstrap: &ServerBootstrap,
    tls_options: Option<&TlsConnectionOptions>,
) -> ListenerFixture {
    let (incoming_tx, incoming_rx) = mpsc::channel();
    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let (destroy_tx, destroy_rx) = mpsc::channel();
    let incoming_tx = Mutex::new(incoming_tx);
    let shutdown_tx = Mutex::new(shutdown_tx);
    let options = ServerListenerOptions {
        endpoint: SocketEndpoint {
            address: "127.0.0.1".into(),
            port: 0,
        },
        socket_options: SocketOptions::default(),
        incoming_callback: Arc::new(move |result| {
            let _ = incoming_tx.lock().send(result);
        }),
        shutdown_callback: Arc::new(move |_channel, error| {
            let _ = shutdown_tx.lock().send(error);
        }),
        destroy_callback: Some(Box::new(move || {
            let _ = destroy_tx.send(());
        })),
    };
    let listener = match tls_options {
        Some(tls) => bootstrap
            .new_tls_socket_listener(options, tls)
            .expect("tls listener starts"),
        None => bootstrap
            .new_socket_listener(options)
            .expect("listener starts"),
    };
    let port = listener
        .local_endpoint()
        .expect("bound endpoint")
        .port;
    assert_ne!(port, 0);
    ListenerFixture {
        listener,
        incoming_rx,
        shutdown_rx,
        destroy_rx,
        port,
    }
}

#[test]
fn accept_plain_connection_and_deliver_reads() {
    init_tracing();
    let group = EventLoopGroup::new(2).expect("start group");
    let bootstrap = ServerBootstrap::new(Arc::clone(&group));
    let fixture = spawn_listener(&bootstrap, None);

    let mut client =
        std::net::TcpStream::connect(("127.0.0.1", fixture.port)).expect("client connects");
    let channel = recv(&fixture.incoming_rx).expect("incoming channel");
    assert!(channel.first_slot().is_some(), "socket handler at the head");

    let (read_tx, read_rx) = mpsc::channel();
    let attach_channel = channel.clone();
    run_on_loop(channel.event_loop(), move || {
        let user = attach_channel.new_slot();
        attach_channel
            .slot_insert_end(&user)
            .expect("insert user slot");
        user.set_handler(
            RecordingHandler::new("user", 64 * 1024)
                .with_read_sender(read_tx)
                .into_ref(),
        )
        .expect("set handler");
    });

    let payload = b"hello server".to_vec();
    client.write_all(&payload).expect("client write");
    client.flush().expect("client flush");
    let mut received = Vec::new();
    while received.len() < payload.len() {
        received.extend(recv(&read_rx));
    }
    assert_eq!(received, payload);

    // 对端断开：通道干净关闭，走 shutdown 回调
    drop(client);
    assert!(recv(&fixture.shutdown_rx).is_none());

    bootstrap.destroy_socket_listener(fixture.listener);
    recv(&fixture.destroy_rx);
    bootstrap.release();
}

#[test]
fn incoming_fires_once_per_connection() {
    init_tracing();
    let group = EventLoopGroup::new(2).expect("start group");
    let bootstrap = ServerBootstrap::new(Arc::clone(&group));
    let fixture = spawn_listener(&bootstrap, None);

    let first = std::net::TcpStream::connect(("127.0.0.1", fixture.port)).expect("first client");
    let second = std::net::TcpStream::connect(("127.0.0.1", fixture.port)).expect("second client");
    for name in ["conn-a", "conn-b"] {
        let channel = recv(&fixture.incoming_rx).expect("incoming channel");
        // 挂上用户阶段，授出读窗口，让对端断开能够被观测到
        let attach_channel = channel.clone();
        run_on_loop(channel.event_loop(), move || {
            let user = attach_channel.new_slot();
            attach_channel
                .slot_insert_end(&user)
                .expect("insert user slot");
            user.set_handler(RecordingHandler::new(name, 64 * 1024).into_ref())
                .expect("set handler");
        });
    }
    assert_no_event(&fixture.incoming_rx);

    drop(first);
    drop(second);
    recv(&fixture.shutdown_rx);
    recv(&fixture.shutdown_rx);

    bootstrap.destroy_socket_listener(fixture.listener);
    recv(&fixture.destroy_rx);
    bootstrap.release();
}

#[test]
fn tls_listener_defers_incoming_until_negotiation() {
    init_tracing();
    let group = EventLoopGroup::new(2).expect("start group");
    let bootstrap = ServerBootstrap::new(Arc::clone(&group));
    let provider = FakeTlsProvider::success();
    let tls_options = TlsConnectionOptions::new(provider.clone());
    let fixture = spawn_listener(&bootstrap, Some(&tls_options));

    let client =
        std::net::TcpStream::connect(("127.0.0.1", fixture.port)).expect("client connects");
    let _channel = recv(&fixture.incoming_rx).expect("incoming after negotiation");

    drop(client);
    recv(&fixture.shutdown_rx);
    bootstrap.destroy_socket_listener(fixture.listener);
    recv(&fixture.destroy_rx);
    bootstrap.release();
    assert!(provider.cleanup_count() >= 1);
}

#[test]
fn disconnect_before_negotiation_reports_unknown_error() {
    init_tracing();
    let group = EventLoopGroup::new(2).expect("start group");
    let bootstrap = ServerBootstrap::new(Arc::clone(&group));
    let tls_options = TlsConnectionOptions::new(FakeTlsProvider::stall());
    let fixture = spawn_listener(&bootstrap, Some(&tls_options));

    let client =
        std::net::TcpStream::connect(("127.0.0.1", fixture.port)).expect("client connects");
    drop(client);

    // 协商永远不会完成；对端断开迫使通道在 incoming 前关闭
    let error = recv(&fixture.incoming_rx).expect_err("incoming must carry an error");
    assert_eq!(error.code(), codes::UNKNOWN);
    assert_no_event(&fixture.shutdown_rx);

    bootstrap.destroy_socket_listener(fixture.listener);
    recv(&fixture.destroy_rx);
    bootstrap.release();
}

#[test]
fn tls_listener_rejects_datagram_sockets() {
    init_tracing();
    let group = EventLoopGroup::new(1).expect("start group");
    let bootstrap = ServerBootstrap::new(Arc::clone(&group));
    let tls_options = TlsConnectionOptions::new(FakeTlsProvider::success());
    let error = bootstrap
        .new_tls_socket_listener(
            ServerListenerOptions {
                endpoint: SocketEndpoint {
                    address: "127.0.0.1".into(),
                    port: 0,
                },
                socket_options: SocketOptions {
                    socket_type: SocketType::Datagram,
                    ..SocketOptions::default()
                },
                incoming_callback: Arc::new(|_result| {}),
                shutdown_callback: Arc::new(|_channel, _error| {}),
                destroy_callback: None,
            },
            &tls_options,
        )
        .expect_err("datagram sockets cannot carry tls");
    assert_eq!(error.code(), codes::SOCKET_INVALID_OPTIONS);
}
