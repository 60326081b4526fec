//! 客户端引导：解析主机名、跨地址竞速建连、在胜者套接字上装配通道。

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bootstrap::ensure_thread_local_state_cleaned;
use crate::channel::{Channel, ChannelCallbacks, ChannelOptions};
use crate::error::{CoreError, codes, unknown_error};
use crate::event_loop::{EventLoop, EventLoopGroup};
use crate::handlers::alpn::{AlpnChannelHandler, OnProtocolNegotiated};
use crate::handlers::socket::SocketChannelHandler;
use crate::resolver::{AddressRecordType, HostAddress, HostResolver, ResolutionConfig};
use crate::socket::{Socket, SocketDomain, SocketEndpoint, SocketOptions, SocketType};
use crate::task::{ChannelTask, TaskStatus};
use crate::tls::{TlsConnectionOptions, TlsProvider};

/// 通道装配结果回调：每次 `new_*_socket_channel` 调用恰好触发一次。
pub type ClientSetupFn = Box<dyn FnOnce(Result<Channel, CoreError>) + Send + 'static>;
/// 通道关闭回调：仅当 setup 以成功告终时触发。
pub type ClientShutdownFn = Box<dyn FnOnce(&Channel, Option<CoreError>) + Send + 'static>;

struct ClientBootstrapInner {
    event_loop_group: Arc<EventLoopGroup>,
    host_resolver: Arc<dyn HostResolver>,
    resolution_config: ResolutionConfig,
    on_protocol_negotiated: Mutex<Option<OnProtocolNegotiated>>,
    tls_providers: Mutex<Vec<Arc<dyn TlsProvider>>>,
}

/// 客户端引导句柄；克隆共享同一实例，跨线程安全。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“解析 → 竞速建连 → 装配通道（含可选 TLS/ALPN）→ 投递回调”的完整
///   状态机收拢到一处，调用方只面对一对 setup/shutdown 回调。
/// - 竞速的部分失败反馈给解析器（`record_connection_failure`），让坏地址
///   尽快退出后续解析结果。
///
/// ## 契约说明（What）
/// - setup 回调恰好触发一次：要么首个胜者带来成功，要么全部尝试失败后
///   携带最后一个错误；shutdown 回调当且仅当 setup 成功时触发。
/// - `set_alpn_callback` 安装的协商回调对此后创建的所有 TLS 通道生效。
/// - `release` 会在组内每条事件循环上清理 TLS 线程局部状态后再放弃引用。
#[derive(Clone)]
pub struct ClientBootstrap {
    inner: Arc<ClientBootstrapInner>,
}

impl ClientBootstrap {
    pub fn new(
        event_loop_group: Arc<EventLoopGroup>,
        host_resolver: Arc<dyn HostResolver>,
        resolution_config: Option<ResolutionConfig>,
    ) -> ClientBootstrap {
        tracing::info!(
            target: "beacon_io::bootstrap",
            loops = event_loop_group.loop_count(),
            "initializing client bootstrap"
        );
        ClientBootstrap {
            inner: Arc::new(ClientBootstrapInner {
                event_loop_group,
                host_resolver,
                resolution_config: resolution_config.unwrap_or_default(),
                on_protocol_negotiated: Mutex::new(None),
                tls_providers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 安装共享的协议协商回调；所有带 TLS 的通道会据此追加 ALPN 槽位。
    pub fn set_alpn_callback(&self, on_protocol_negotiated: OnProtocolNegotiated) {
        tracing::debug!(target: "beacon_io::bootstrap", "setting ALPN callback");
        *self.inner.on_protocol_negotiated.lock() = Some(on_protocol_negotiated);
    }

    pub fn event_loop_group(&self) -> &Arc<EventLoopGroup> {
        &self.inner.event_loop_group
    }

    /// 建立一条明文通道。
    pub fn new_socket_channel(
        &self,
        host_name: &str,
        port: u16,
        options: &SocketOptions,
        setup_callback: ClientSetupFn,
        shutdown_callback: ClientShutdownFn,
    ) -> Result<(), CoreError> {
        self.new_client_channel(host_name, port, options, None, setup_callback, shutdown_callback)
    }

    /// 建立一条带 TLS 协商的通道；要求流式套接字。
    pub fn new_tls_socket_channel(
        &self,
        host_name: &str,
        port: u16,
        options: &SocketOptions,
        tls_options: &TlsConnectionOptions,
        setup_callback: ClientSetupFn,
        shutdown_callback: ClientShutdownFn,
    ) -> Result<(), CoreError> {
        if options.socket_type != SocketType::Stream {
            return Err(CoreError::new(
                codes::SOCKET_INVALID_OPTIONS,
                "tls requires a stream socket",
            ));
        }
        self.new_client_channel(
            host_name,
            port,
            options,
            Some(tls_options),
            setup_callback,
            shutdown_callback,
        )
    }

    /// 释放引导引用；释放前在组内每条事件循环上清理 TLS 线程局部状态。
    pub fn release(self) {
        let providers: Vec<Arc<dyn TlsProvider>> = self.inner.tls_providers.lock().clone();
        ensure_thread_local_state_cleaned(&self.inner.event_loop_group, &providers);
    }

    fn new_client_channel(
        &self,
        host_name: &str,
        port: u16,
        options: &SocketOptions,
        tls_options: Option<&TlsConnectionOptions>,
        setup_callback: ClientSetupFn,
        shutdown_callback: ClientShutdownFn,
    ) -> Result<(), CoreError> {
        tracing::trace!(
            target: "beacon_io::bootstrap",
            host = host_name,
            port,
            "attempting to initialize a new client channel"
        );
        let tls = tls_options.map(|user_options| {
            let mut options = user_options.clone();
            let on_protocol_negotiated = self.inner.on_protocol_negotiated.lock().clone();
            if on_protocol_negotiated.is_some() {
                options.advertise_alpn_message = true;
            }
            self.remember_tls_provider(&options.provider);
            ClientTlsData {
                options,
                on_protocol_negotiated,
            }
        });

        let state = Arc::new(ClientConnectionState {
            bootstrap: self.clone(),
            socket_options: *options,
            port,
            host_name: (options.domain != SocketDomain::Local).then(|| host_name.to_owned()),
            tls,
            callbacks: Mutex::new(ClientCallbacks {
                setup: Some(setup_callback),
                shutdown: Some(shutdown_callback),
            }),
            race: Mutex::new(RaceState::default()),
        });

        if options.domain == SocketDomain::Local {
            state.race.lock().addresses_count = 1;
            let socket = Socket::new(options)?;
            let connect_loop = self.inner.event_loop_group.next_loop();
            let endpoint = SocketEndpoint {
                address: host_name.to_owned(),
                port: 0,
            };
            let callback_state = Arc::clone(&state);
            socket.connect(
                &endpoint,
                &connect_loop,
                Box::new(move |socket, result| {
                    ClientConnectionState::on_connection_established(
                        &callback_state,
                        socket,
                        result,
                    );
                }),
            )?;
        } else {
            let resolver_state = Arc::clone(&state);
            self.inner.host_resolver.resolve_host(
                host_name,
                &self.inner.resolution_config,
                Box::new(move |result| {
                    ClientConnectionState::on_host_resolved(&resolver_state, result);
                }),
            );
        }
        Ok(())
    }

    fn remember_tls_provider(&self, provider: &Arc<dyn TlsProvider>) {
        let mut providers = self.inner.tls_providers.lock();
        if !providers
            .iter()
            .any(|known| Arc::ptr_eq(known, provider))
        {
            providers.push(Arc::clone(provider));
        }
    }
}

struct ClientCallbacks {
    setup: Option<ClientSetupFn>,
    shutdown: Option<ClientShutdownFn>,
}

struct ClientTlsData {
    options: TlsConnectionOptions,
    on_protocol_negotiated: Option<OnProtocolNegotiated>,
}

#[derive(Default)]
struct RaceState {
    addresses_count: usize,
    failed_count: usize,
    connection_chosen: bool,
    setup_called: bool,
    socket: Option<Socket>,
}

/// 一次 `new_*_socket_channel` 调用的竞速状态。
///
/// 每个在途尝试、每个回调闭包都持有一个 `Arc` 引用；
/// 最后一个引用释放时状态随之消亡。
struct ClientConnectionState {
    bootstrap: ClientBootstrap,
    socket_options: SocketOptions,
    port: u16,
    host_name: Option<String>,
    tls: Option<ClientTlsData>,
    callbacks: Mutex<ClientCallbacks>,
    race: Mutex<RaceState>,
}

/// 单个地址的建连尝试：作为任务投递到公共的 connect loop。
struct ConnectionAttempt {
    state: Arc<ClientConnectionState>,
    endpoint: SocketEndpoint,
    options: SocketOptions,
    host_address: HostAddress,
    connect_loop: Arc<EventLoop>,
}

impl ConnectionAttempt {
    fn run(self, status: TaskStatus) {
        if status == TaskStatus::Cancelled {
            ClientConnectionState::register_failure(
                &self.state,
                crate::error::runtime_terminated(),
            );
            return;
        }
        let resolver = &self.state.bootstrap.inner.host_resolver;
        let socket = match Socket::new(&self.options) {
            Ok(socket) => socket,
            Err(error) => {
                resolver.record_connection_failure(&self.host_address);
                ClientConnectionState::register_failure(&self.state, error);
                return;
            }
        };
        let callback_state = Arc::clone(&self.state);
        let connect_result = socket.connect(
            &self.endpoint,
            &self.connect_loop,
            Box::new(move |socket, result| {
                ClientConnectionState::on_connection_established(&callback_state, socket, result);
            }),
        );
        if let Err(error) = connect_result {
            tracing::error!(
                target: "beacon_io::bootstrap",
                address = %self.host_address.address,
                %error,
                "failed to start connection attempt"
            );
            resolver.record_connection_failure(&self.host_address);
            ClientConnectionState::register_failure(&self.state, error);
        }
    }
}

impl ClientConnectionState {
    /// 投递 setup 回调；整个竞速生命周期内恰好一次。
    fn deliver_setup(state: &Arc<Self>, result: Result<Channel, CoreError>) {
        {
            let mut race = state.race.lock();
            if race.setup_called {
                return;
            }
            race.setup_called = true;
        }
        let failed = result.is_err();
        let callback = state.callbacks.lock().setup.take();
        if let Some(callback) = callback {
            callback(result);
        }
        if failed {
            // setup 已携带错误，shutdown 回调不再投递
            state.callbacks.lock().shutdown = None;
        }
    }

    /// 关闭路径的回调出口：setup 未投递时兜底投递错误，否则走 shutdown。
    fn deliver_shutdown(state: &Arc<Self>, channel: &Channel, error: Option<CoreError>) {
        let setup_called = state.race.lock().setup_called;
        if !setup_called {
            let error = error.unwrap_or_else(unknown_error);
            Self::deliver_setup(state, Err(error));
            return;
        }
        let callback = state.callbacks.lock().shutdown.take();
        if let Some(callback) = callback {
            callback(channel, error);
        }
    }

    fn on_host_resolved(state: &Arc<Self>, result: Result<Vec<HostAddress>, CoreError>) {
        let addresses = match result {
            Err(error) => {
                tracing::error!(
                    target: "beacon_io::bootstrap",
                    %error,
                    "dns resolution failed"
                );
                Self::deliver_setup(state, Err(error));
                return;
            }
            Ok(addresses) => addresses,
        };
        assert!(!addresses.is_empty(), "resolver reported success with no addresses");
        tracing::trace!(
            target: "beacon_io::bootstrap",
            count = addresses.len(),
            "dns resolution completed; racing connections, first one back wins"
        );
        // 所有尝试共用同一条事件循环；最终只有一个胜者
        let connect_loop = state.bootstrap.inner.event_loop_group.next_loop();
        state.race.lock().addresses_count = addresses.len();

        // 先构造全部尝试，再统一调度，保持“要么全部入队、要么一个不跑”
        let attempts: Vec<ConnectionAttempt> = addresses
            .into_iter()
            .map(|host_address| {
                let mut options = state.socket_options;
                options.domain = match host_address.record_type {
                    AddressRecordType::Aaaa => SocketDomain::Ipv6,
                    AddressRecordType::A => SocketDomain::Ipv4,
                };
                ConnectionAttempt {
                    state: Arc::clone(state),
                    endpoint: SocketEndpoint {
                        address: host_address.address.clone(),
                        port: state.port,
                    },
                    options,
                    host_address,
                    connect_loop: Arc::clone(&connect_loop),
                }
            })
            .collect();
        for attempt in attempts {
            let loop_handle = Arc::clone(&attempt.connect_loop);
            loop_handle.schedule_task_now(ChannelTask::new("attempt_connection", move |status| {
                attempt.run(status);
            }));
        }
    }

    /// 记录一次失败尝试；最后一个失败者负责投递 setup 错误。
    fn register_failure(state: &Arc<Self>, error: CoreError) {
        let deliver = {
            let mut race = state.race.lock();
            race.failed_count += 1;
            race.failed_count == race.addresses_count
        };
        if deliver {
            tracing::error!(
                target: "beacon_io::bootstrap",
                %error,
                "all connection attempts failed"
            );
            Self::deliver_setup(state, Err(error));
        }
    }

    fn on_connection_established(
        state: &Arc<Self>,
        socket: &Socket,
        result: Result<(), CoreError>,
    ) {
        let already_chosen = state.race.lock().connection_chosen;
        tracing::debug!(
            target: "beacon_io::bootstrap",
            error = result.as_ref().err().map(|e| e.code()),
            already_chosen,
            "client connection attempt completed"
        );
        if result.is_err() || already_chosen {
            if let Err(error) = result {
                // 真实失败（非迟到的胜者）才回报解析器并计数
                if state.socket_options.domain != SocketDomain::Local {
                    Self::record_bad_address(state, socket);
                }
                socket.close();
                Self::register_failure(state, error);
            } else {
                // 已有胜者：迟到的成功连接直接关闭
                socket.close();
            }
            return;
        }

        {
            let mut race = state.race.lock();
            race.connection_chosen = true;
            race.socket = Some(socket.clone());
        }
        let Some(event_loop) = socket.event_loop() else {
            socket.close();
            Self::register_failure(
                state,
                CoreError::new(codes::SOCKET_NOT_CONNECTED, "winner lost its event loop"),
            );
            return;
        };
        tracing::trace!(
            target: "beacon_io::bootstrap",
            "successful connection, creating a channel on the winning socket"
        );
        let setup_state = Arc::clone(state);
        let shutdown_state = Arc::clone(state);
        // 返回的句柄无须暂存：装配任务与管线内的槽位各自持有通道引用
        let _channel = Channel::new(
            &event_loop,
            ChannelOptions::default(),
            ChannelCallbacks {
                on_setup_completed: Some(Box::new(move |channel, result| {
                    ClientConnectionState::on_channel_setup(&setup_state, channel, result);
                })),
                on_shutdown_completed: Some(Box::new(move |channel, error| {
                    ClientConnectionState::on_channel_shutdown(&shutdown_state, channel, error);
                })),
            },
        );
    }

    fn record_bad_address(state: &Arc<Self>, socket: &Socket) {
        let Some(remote) = socket.remote_endpoint() else {
            return;
        };
        let host_address = HostAddress {
            host: state.host_name.clone().unwrap_or_default(),
            address: remote.address,
            record_type: if socket.options().domain == SocketDomain::Ipv6 {
                AddressRecordType::Aaaa
            } else {
                AddressRecordType::A
            },
        };
        tracing::debug!(
            target: "beacon_io::bootstrap",
            address = %host_address.address,
            "recording bad address"
        );
        state
            .bootstrap
            .inner
            .host_resolver
            .record_connection_failure(&host_address);
    }

    fn on_channel_setup(state: &Arc<Self>, channel: &Channel, result: Result<(), CoreError>) {
        let error = match result {
            Ok(()) => match Self::assemble_channel(state, channel) {
                Ok(deliver_now) => {
                    if deliver_now {
                        Self::deliver_setup(state, Ok(channel.clone()));
                    }
                    return;
                }
                Err(error) => error,
            },
            Err(error) => error,
        };
        tracing::error!(
            target: "beacon_io::bootstrap",
            %error,
            "client channel setup failed"
        );
        channel.shutdown(Some(error));
        // 关闭回调负责善后与回调投递
    }

    /// 在装配完成的通道上搭建 socket（以及可选的 TLS/ALPN）阶段。
    ///
    /// 返回 `Ok(true)` 表示可以立即投递 setup；TLS 场景下投递推迟到协商
    /// 结果回调。
    fn assemble_channel(state: &Arc<Self>, channel: &Channel) -> Result<bool, CoreError> {
        let socket = state
            .race
            .lock()
            .socket
            .clone()
            .ok_or_else(|| CoreError::new(codes::SOCKET_NOT_CONNECTED, "winner socket missing"))?;
        let socket_slot = channel.new_slot();
        let socket_handler =
            SocketChannelHandler::new(&socket, &socket_slot, channel.max_fragment_size())?;
        socket_slot.set_handler(socket_handler)?;

        let Some(tls) = &state.tls else {
            return Ok(true);
        };
        Self::setup_client_tls(state, channel, tls)?;
        // TLS 仍在协商；等协商回调再通知用户
        Ok(false)
    }

    fn setup_client_tls(
        state: &Arc<Self>,
        channel: &Channel,
        tls: &ClientTlsData,
    ) -> Result<(), CoreError> {
        let tls_slot = channel.new_slot();
        channel.slot_insert_end(&tls_slot)?;

        // 蹦床回调：先转发给用户，再执行引导自身的装配逻辑
        let mut negotiated_options = tls.options.clone();
        let user_on_negotiation_result = tls.options.on_negotiation_result.clone();
        let negotiation_state = Arc::clone(state);
        negotiated_options.on_negotiation_result = Some(Arc::new(move |slot, result| {
            if let Some(user) = &user_on_negotiation_result {
                user(slot, result.clone());
            }
            tracing::debug!(
                target: "beacon_io::bootstrap",
                error = result.as_ref().err().map(|e| e.code()),
                "tls negotiation result"
            );
            match result {
                Err(error) => {
                    // 错误经由关闭路径转交用户
                    slot.channel().shutdown(Some(error));
                }
                Ok(()) => {
                    let channel = slot.channel().clone();
                    ClientConnectionState::deliver_setup(&negotiation_state, Ok(channel));
                }
            }
        }));
        if let Some(user_on_data_read) = tls.options.on_data_read.clone() {
            negotiated_options.on_data_read = Some(Arc::new(move |slot, buffer| {
                user_on_data_read(slot, buffer);
            }));
        }
        if let Some(user_on_error) = tls.options.on_error.clone() {
            negotiated_options.on_error = Some(Arc::new(move |slot, error| {
                user_on_error(slot, error);
            }));
        }

        let tls_handler = tls
            .options
            .provider
            .new_client_handler(&negotiated_options, &tls_slot)?;
        tls_slot.set_handler(tls_handler.clone())?;
        tracing::trace!(target: "beacon_io::bootstrap", "client tls slot installed");

        if let Some(on_protocol_negotiated) = &tls.on_protocol_negotiated {
            let alpn_slot = channel.new_slot();
            let alpn_handler = AlpnChannelHandler::new(Arc::clone(on_protocol_negotiated));
            tls_slot.insert_right(&alpn_slot)?;
            alpn_slot.set_handler(alpn_handler)?;
            tracing::trace!(target: "beacon_io::bootstrap", "alpn slot installed");
        }

        tls_handler.start_negotiation(&tls_slot)
    }

    fn on_channel_shutdown(state: &Arc<Self>, channel: &Channel, error: Option<CoreError>) {
        tracing::debug!(
            target: "beacon_io::bootstrap",
            error = error.as_ref().map(|e| e.code()),
            "client channel shut down"
        );
        Self::deliver_shutdown(state, channel, error);
        channel.destroy();
        let socket = state.race.lock().socket.clone();
        if let Some(socket) = socket {
            socket.close();
        }
    }
}
