//! 客户端引导的端到端场景：单地址直连、跨地址竞速、全败、TLS 协商。

mod common;

use std::sync::Arc;
use std::sync::mpsc::channel;

use bytes::BufMut;
use parking_lot::Mutex;

use beacon_io::prelude::*;
use common::*;

fn callbacks() -> (
    ClientCallbackSenders,
    std::sync::mpsc::Receiver<Result<Channel, CoreError>>,
    std::sync::mpsc::Receiver<Option<CoreError>>,
) {
    let (setup_tx, setup_rx) = channel();
    let (shutdown_tx, shutdown_rx) = channel();
    (
        ClientCallbackSenders {
            setup_tx,
            shutdown_tx,
        },
        setup_rx,
        shutdown_rx,
    )
}

struct ClientCallbackSenders {
    setup_tx: std::sync::mpsc::Sender<Result<Channel, CoreError>>,
    shutdown_tx: std::sync::mpsc::Sender<Option<CoreError>>,
}

impl ClientCallbackSenders {
    fn into_boxed(
        self,
    ) -> (
        Box<dyn FnOnce(Result<Channel, CoreError>) + Send>,
        Box<dyn FnOnce(&Channel, Option<CoreError>) + Send>,
    ) {
        let setup_tx = self.setup_tx;
        let shutdown_tx = self.shutdown_tx;
        (
            Box::new(move |result| {
                let _ = setup_tx.send(result);
            }),
            Box::new(move |_channel, error| {
                let _ = shutdown_tx.send(error);
            }),
        )
    }
}

#[test]
fn plain_connect_single_address_succeeds() {
    init_tracing();
    let group = EventLoopGroup::new(2).expect("start group");
    let (port, data_rx) = spawn_sink_listener();
    let resolver = StaticResolver::ok(vec![host_address(
        "svc.test",
        "127.0.0.1",
        AddressRecordType::A,
    )]);
    let bootstrap = ClientBootstrap::new(Arc::clone(&group), resolver.clone(), None);

    let (senders, setup_rx, shutdown_rx) = callbacks();
    let (setup_cb, shutdown_cb) = senders.into_boxed();
    bootstrap
        .new_socket_channel(
            "svc.test",
            port,
            &SocketOptions::default(),
            setup_cb,
            shutdown_cb,
        )
        .expect("kick off connection");

    let channel = recv(&setup_rx).expect("setup succeeds");
    assert_no_event(&setup_rx);

    // 在通道上装一个用户阶段并发出一条写消息
    let payload = b"ping across the pipeline".to_vec();
    let send_channel = channel.clone();
    let send_payload = payload.clone();
    run_on_loop(channel.event_loop(), move || {
        let user = send_channel.new_slot();
        send_channel
            .slot_insert_end(&user)
            .expect("insert user slot");
        user.set_handler(RecordingHandler::new("user", 64 * 1024).into_ref())
            .expect("set handler");
        let mut message = send_channel
            .acquire_message_from_pool(MessageType::WriteData, send_payload.len());
        message.data_mut().put_slice(&send_payload);
        user.send_message(message, ChannelDirection::Write)
            .expect("write accepted");
    });

    channel.shutdown(None);
    assert!(recv(&shutdown_rx).is_none(), "clean shutdown");
    assert_eq!(recv(&data_rx), payload, "payload flushed before close");
    bootstrap.release();
}

#[test]
fn race_second_address_wins_and_first_failure_is_recorded() {
    init_tracing();
    let group = EventLoopGroup::new(2).expect("start group");
    let (port, _data_rx) = spawn_sink_listener();
    // 127.0.0.2 上无人监听：该次尝试会被拒绝并回报解析器
    let resolver = StaticResolver::ok(vec![
        host_address("svc.test", "127.0.0.2", AddressRecordType::A),
        host_address("svc.test", "127.0.0.1", AddressRecordType::A),
    ]);
    let bootstrap = ClientBootstrap::new(Arc::clone(&group), resolver.clone(), None);

    let (senders, setup_rx, _shutdown_rx) = callbacks();
    let (setup_cb, shutdown_cb) = senders.into_boxed();
    bootstrap
        .new_socket_channel(
            "svc.test",
            port,
            &SocketOptions::default(),
            setup_cb,
            shutdown_cb,
        )
        .expect("kick off race");

    let channel = recv(&setup_rx).expect("a winner emerges");
    assert_no_event(&setup_rx);

    // 失败反馈最终应包含 127.0.0.2
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let failures = resolver.failures();
        if failures.iter().any(|address| address.address == "127.0.0.2") {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "losing address never recorded: {failures:?}"
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    channel.shutdown(None);
    bootstrap.release();
}

#[test]
fn race_with_all_addresses_failing_reports_once() {
    init_tracing();
    let group = EventLoopGroup::new(1).expect("start group");
    let port = unused_port();
    let resolver = StaticResolver::ok(vec![
        host_address("svc.test", "127.0.0.2", AddressRecordType::A),
        host_address("svc.test", "127.0.0.3", AddressRecordType::A),
    ]);
    let bootstrap = ClientBootstrap::new(Arc::clone(&group), resolver.clone(), None);

    let (senders, setup_rx, shutdown_rx) = callbacks();
    let (setup_cb, shutdown_cb) = senders.into_boxed();
    bootstrap
        .new_socket_channel(
            "svc.test",
            port,
            &SocketOptions::default(),
            setup_cb,
            shutdown_cb,
        )
        .expect("kick off race");

    let error = recv(&setup_rx).expect_err("all attempts fail");
    assert_eq!(error.code(), codes::SOCKET_CONNECT_FAILED);
    assert_no_event(&setup_rx);
    assert_no_event(&shutdown_rx);

    let failures = resolver.failures();
    assert!(failures.iter().any(|address| address.address == "127.0.0.2"));
    assert!(failures.iter().any(|address| address.address == "127.0.0.3"));
    bootstrap.release();
}

#[test]
fn resolution_failure_reaches_setup_callback() {
    init_tracing();
    let group = EventLoopGroup::new(1).expect("start group");
    let resolver = StaticResolver::fail(CoreError::new(
        codes::RESOLUTION_FAILED,
        "no such host",
    ));
    let bootstrap = ClientBootstrap::new(Arc::clone(&group), resolver, None);

    let (senders, setup_rx, shutdown_rx) = callbacks();
    let (setup_cb, shutdown_cb) = senders.into_boxed();
    bootstrap
        .new_socket_channel(
            "missing.test",
            443,
            &SocketOptions::default(),
            setup_cb,
            shutdown_cb,
        )
        .expect("request accepted");

    let error = recv(&setup_rx).expect_err("resolution fails");
    assert_eq!(error.code(), codes::RESOLUTION_FAILED);
    assert_no_event(&shutdown_rx);
    bootstrap.release();
}

#[test]
fn tls_negotiation_failure_is_reported_through_setup() {
    init_tracing();
    let group = EventLoopGroup::new(2).expect("start group");
    let (port, _data_rx) = spawn_sink_listener();
    let resolver = StaticResolver::ok(vec![host_address(
        "svc.test",
        "127.0.0.1",
        AddressRecordType::A,
    )]);
    let bootstrap = ClientBootstrap::new(Arc::clone(&group), resolver, None);
    let provider = FakeTlsProvider::fail(CoreError::new(
        codes::TLS_NEGOTIATION_FAILED,
        "bad certificate",
    ));
    let tls_options =
        TlsConnectionOptions::new(provider.clone()).with_server_name("svc.test");

    let (senders, setup_rx, shutdown_rx) = callbacks();
    let (setup_cb, shutdown_cb) = senders.into_boxed();
    bootstrap
        .new_tls_socket_channel(
            "svc.test",
            port,
            &SocketOptions::default(),
            &tls_options,
            setup_cb,
            shutdown_cb,
        )
        .expect("kick off tls connection");

    let error = recv(&setup_rx).expect_err("negotiation fails before setup");
    assert_eq!(error.code(), codes::TLS_NEGOTIATION_FAILED);
    assert_no_event(&setup_rx);
    assert_no_event(&shutdown_rx);

    bootstrap.release();
    assert!(provider.cleanup_count() >= 1, "release cleans loop state");
}

#[test]
fn tls_with_alpn_installs_the_negotiated_handler() {
    init_tracing();
    let group = EventLoopGroup::new(2).expect("start group");
    let (port, _data_rx) = spawn_sink_listener();
    let resolver = StaticResolver::ok(vec![host_address(
        "svc.test",
        "127.0.0.1",
        AddressRecordType::A,
    )]);
    let bootstrap = ClientBootstrap::new(Arc::clone(&group), resolver, None);
    let provider = FakeTlsProvider::success_with_protocol(b"h2");
    let tls_options = TlsConnectionOptions::new(provider)
        .with_server_name("svc.test")
        .with_alpn_list(["h2", "http/1.1"]);

    let (protocol_tx, protocol_rx) = channel();
    let protocol_tx = Mutex::new(protocol_tx);
    bootstrap.set_alpn_callback(Arc::new(move |_slot, protocol| {
        let _ = protocol_tx.lock().send(protocol.to_vec());
        Ok(RecordingHandler::new("app", 64 * 1024).into_ref())
    }));

    let (senders, setup_rx, shutdown_rx) = callbacks();
    let (setup_cb, shutdown_cb) = senders.into_boxed();
    bootstrap
        .new_tls_socket_channel(
            "svc.test",
            port,
            &SocketOptions::default(),
            &tls_options,
            setup_cb,
            shutdown_cb,
        )
        .expect("kick off tls connection");

    let channel = recv(&setup_rx).expect("setup succeeds after negotiation");
    assert_eq!(recv(&protocol_rx), b"h2".to_vec());

    channel.shutdown(None);
    assert!(recv(&shutdown_rx).is_none());
    bootstrap.release();
}
