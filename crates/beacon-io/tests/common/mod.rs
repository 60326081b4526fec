//! 集成测试共享设施：录制型 Handler、静态解析器、假 TLS 提供方。

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::Duration;

use bytes::BufMut;
use parking_lot::Mutex;

use beacon_io::prelude::*;

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn recv<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(Duration::from_secs(10))
        .expect("timed out waiting for event")
}

pub fn assert_no_event<T>(rx: &Receiver<T>) {
    assert!(
        rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "received an event that must not happen"
    );
}

/// 在指定事件循环线程上执行闭包并取回结果。
pub fn run_on_loop<T, F>(event_loop: &Arc<EventLoop>, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = channel();
    event_loop.schedule_task_now(ChannelTask::new("test-on-loop", move |status| {
        assert_eq!(status, TaskStatus::RunReady);
        let _ = tx.send(f());
    }));
    recv(&rx)
}

pub struct ChannelFixture {
    pub channel: Channel,
    pub setup_rx: Receiver<Result<(), CoreError>>,
    pub shutdown_rx: Receiver<Option<CoreError>>,
}

pub fn make_channel(group: &Arc<EventLoopGroup>) -> ChannelFixture {
    make_channel_with(group, ChannelOptions::default())
}

pub fn make_channel_with(group: &Arc<EventLoopGroup>, options: ChannelOptions) -> ChannelFixture {
    let (setup_tx, setup_rx) = channel();
    let (shutdown_tx, shutdown_rx) = channel();
    let event_loop = group.next_loop();
    let channel = Channel::new(
        &event_loop,
        options,
        ChannelCallbacks {
            on_setup_completed: Some(Box::new(move |_channel, result| {
                let _ = setup_tx.send(result);
            })),
            on_shutdown_completed: Some(Box::new(move |_channel, error| {
                let _ = shutdown_tx.send(error);
            })),
        },
    );
    ChannelFixture {
        channel,
        setup_rx,
        shutdown_rx,
    }
}

#[derive(Default)]
pub struct HandlerEvents {
    pub reads: Mutex<Vec<Vec<u8>>>,
    pub shutdowns: Mutex<Vec<(ChannelDirection, bool)>>,
    pub dropped: AtomicBool,
}

pub type ShutdownJournal = Arc<Mutex<Vec<(&'static str, ChannelDirection)>>>;

/// 录制一切事件的用户 Handler。
pub struct RecordingHandler {
    name: &'static str,
    initial_window: usize,
    forward_reads: bool,
    journal: Option<ShutdownJournal>,
    read_tx: Mutex<Option<Sender<Vec<u8>>>>,
    events: Arc<HandlerEvents>,
}

impl RecordingHandler {
    pub fn new(name: &'static str, initial_window: usize) -> Self {
        Self {
            name,
            initial_window,
            forward_reads: false,
            journal: None,
            read_tx: Mutex::new(None),
            events: Arc::new(HandlerEvents::default()),
        }
    }

    pub fn with_journal(mut self, journal: ShutdownJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_read_sender(self, tx: Sender<Vec<u8>>) -> Self {
        *self.read_tx.lock() = Some(tx);
        self
    }

    pub fn forwarding_reads(mut self) -> Self {
        self.forward_reads = true;
        self
    }

    pub fn events(&self) -> Arc<HandlerEvents> {
        Arc::clone(&self.events)
    }

    pub fn into_ref(self) -> HandlerRef {
        Arc::new(self)
    }
}

impl ChannelHandler for RecordingHandler {
    fn process_read_message(
        &self,
        slot: &SlotHandle,
        message: IoMessage,
    ) -> Result<(), CoreError> {
        self.events.reads.lock().push(message.data().to_vec());
        if let Some(tx) = &*self.read_tx.lock() {
            let _ = tx.send(message.data().to_vec());
        }
        if self.forward_reads {
            return slot
                .send_message(message, ChannelDirection::Read)
                .map_err(|send_error| send_error.error);
        }
        Ok(())
    }

    fn process_write_message(
        &self,
        slot: &SlotHandle,
        message: IoMessage,
    ) -> Result<(), CoreError> {
        slot.send_message(message, ChannelDirection::Write)
            .map_err(|send_error| send_error.error)
    }

    fn increment_read_window(&self, slot: &SlotHandle, size: usize) -> Result<(), CoreError> {
        slot.increment_read_window(size)
    }

    fn shutdown(
        &self,
        slot: &SlotHandle,
        direction: ChannelDirection,
        error: Option<CoreError>,
        urgent: bool,
    ) -> Result<(), CoreError> {
        if let Some(journal) = &self.journal {
            journal.lock().push((self.name, direction));
        }
        self.events.shutdowns.lock().push((direction, urgent));
        slot.on_handler_shutdown_complete(direction, error, urgent);
        Ok(())
    }

    fn initial_window_size(&self) -> usize {
        self.initial_window
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for RecordingHandler {
    fn drop(&mut self) {
        self.events.dropped.store(true, Ordering::SeqCst);
    }
}

/// 返回固定结果的解析器，并记录失败反馈。
pub struct StaticResolver {
    outcome: Mutex<Result<Vec<HostAddress>, CoreError>>,
    failures: Mutex<Vec<HostAddress>>,
}

impl StaticResolver {
    pub fn ok(addresses: Vec<HostAddress>) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(Ok(addresses)),
            failures: Mutex::new(Vec::new()),
        })
    }

    pub fn fail(error: CoreError) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(Err(error)),
            failures: Mutex::new(Vec::new()),
        })
    }

    pub fn failures(&self) -> Vec<HostAddress> {
        self.failures.lock().clone()
    }
}

impl HostResolver for StaticResolver {
    fn resolve_host(
        &self,
        _host_name: &str,
        _config: &ResolutionConfig,
        on_resolved: Box<dyn FnOnce(Result<Vec<HostAddress>, CoreError>) + Send + 'static>,
    ) {
        on_resolved(self.outcome.lock().clone());
    }

    fn record_connection_failure(&self, address: &HostAddress) {
        self.failures.lock().push(address.clone());
    }
}

pub fn host_address(host: &str, address: &str, record_type: AddressRecordType) -> HostAddress {
    HostAddress {
        host: host.to_owned(),
        address: address.to_owned(),
        record_type,
    }
}

/// 假 TLS 提供方：按既定剧本完成（或卡住）协商。
#[derive(Clone)]
pub enum FakeTlsMode {
    Success { protocol: Option<Vec<u8>> },
    Fail(CoreError),
    /// 永远不给协商结果，用于驱动“协商前关闭”的路径。
    Stall,
}

pub struct FakeTlsProvider {
    mode: FakeTlsMode,
    cleanups: AtomicUsize,
}

impl FakeTlsProvider {
    pub fn success() -> Arc<Self> {
        Arc::new(Self {
            mode: FakeTlsMode::Success { protocol: None },
            cleanups: AtomicUsize::new(0),
        })
    }

    pub fn success_with_protocol(protocol: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            mode: FakeTlsMode::Success {
                protocol: Some(protocol.to_vec()),
            },
            cleanups: AtomicUsize::new(0),
        })
    }

    pub fn fail(error: CoreError) -> Arc<Self> {
        Arc::new(Self {
            mode: FakeTlsMode::Fail(error),
            cleanups: AtomicUsize::new(0),
        })
    }

    pub fn stall() -> Arc<Self> {
        Arc::new(Self {
            mode: FakeTlsMode::Stall,
            cleanups: AtomicUsize::new(0),
        })
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

impl TlsProvider for FakeTlsProvider {
    fn new_client_handler(
        &self,
        options: &TlsConnectionOptions,
        _slot: &SlotHandle,
    ) -> Result<Arc<dyn TlsChannelHandler>, CoreError> {
        Ok(Arc::new(FakeTlsHandler {
            options: options.clone(),
            mode: self.mode.clone(),
        }))
    }

    fn new_server_handler(
        &self,
        options: &TlsConnectionOptions,
        slot: &SlotHandle,
    ) -> Result<Arc<dyn TlsChannelHandler>, CoreError> {
        let handler = Arc::new(FakeTlsHandler {
            options: options.clone(),
            mode: self.mode.clone(),
        });
        // 服务端握手由入站数据驱动；测试剧本直接调度协商结果
        handler.schedule_negotiation(slot);
        Ok(handler)
    }

    fn clean_up_thread_local_state(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeTlsHandler {
    options: TlsConnectionOptions,
    mode: FakeTlsMode,
}

impl FakeTlsHandler {
    fn schedule_negotiation(&self, slot: &SlotHandle) {
        if matches!(self.mode, FakeTlsMode::Stall) {
            return;
        }
        let options = self.options.clone();
        let mode = self.mode.clone();
        let channel = slot.channel().clone();
        let slot = slot.clone();
        channel.schedule_task_now(ChannelTask::new("fake-tls-negotiate", move |_status| {
                match mode {
                    FakeTlsMode::Fail(error) => {
                        if let Some(on_result) = &options.on_negotiation_result {
                            on_result(&slot, Err(error));
                        }
                    }
                    FakeTlsMode::Success { protocol } => {
                        if options.advertise_alpn_message
                            && let Some(protocol) = protocol
                        {
                            let mut message = slot.channel().acquire_message_from_pool(
                                MessageType::ProtocolNegotiated,
                                protocol.len(),
                            );
                            message.data_mut().put_slice(&protocol);
                            if let Err(send_error) =
                                slot.send_message(message, ChannelDirection::Read)
                            {
                                tracing::warn!(error = %send_error.error, "alpn announce failed");
                            }
                        }
                        if let Some(on_result) = &options.on_negotiation_result {
                            on_result(&slot, Ok(()));
                        }
                    }
                    FakeTlsMode::Stall => {}
                }
            }));
    }
}

impl ChannelHandler for FakeTlsHandler {
    fn process_read_message(
        &self,
        slot: &SlotHandle,
        message: IoMessage,
    ) -> Result<(), CoreError> {
        // 假实现不解密，明文向右透传；没有右邻时丢弃
        let _ = slot.send_message(message, ChannelDirection::Read);
        Ok(())
    }

    fn process_write_message(
        &self,
        slot: &SlotHandle,
        message: IoMessage,
    ) -> Result<(), CoreError> {
        slot.send_message(message, ChannelDirection::Write)
            .map_err(|send_error| send_error.error)
    }

    fn increment_read_window(&self, slot: &SlotHandle, size: usize) -> Result<(), CoreError> {
        slot.increment_read_window(size)
    }

    fn initial_window_size(&self) -> usize {
        usize::MAX
    }

    fn name(&self) -> &'static str {
        "fake-tls"
    }
}

impl TlsChannelHandler for FakeTlsHandler {
    fn start_negotiation(&self, slot: &SlotHandle) -> Result<(), CoreError> {
        self.schedule_negotiation(slot);
        Ok(())
    }
}

/// 接受一条连接、读到 EOF 后回传全部字节的监听线程。
pub fn spawn_sink_listener() -> (u16, Receiver<Vec<u8>>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind sink listener");
    let port = listener.local_addr().expect("local addr").port();
    let (tx, rx) = channel();
    std::thread::spawn(move || {
        if let Ok((mut stream, _peer)) = listener.accept() {
            use std::io::Read;
            let mut data = Vec::new();
            let _ = stream.read_to_end(&mut data);
            let _ = tx.send(data);
        }
    });
    (port, rx)
}

/// 取一个当前无人监听的端口。
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("probe port");
    listener.local_addr().expect("local addr").port()
}
