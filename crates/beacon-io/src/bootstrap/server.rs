//! 服务端引导：监听器生命周期与“每接受一条连接装配一条通道”。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::bootstrap::ensure_thread_local_state_cleaned;
use crate::channel::{Channel, ChannelCallbacks, ChannelOptions};
use crate::error::{CoreError, codes, unknown_error};
use crate::event_loop::EventLoopGroup;
use crate::handlers::alpn::{AlpnChannelHandler, OnProtocolNegotiated};
use crate::handlers::socket::SocketChannelHandler;
use crate::socket::{Socket, SocketEndpoint, SocketOptions, SocketType};
use crate::task::ChannelTask;
use crate::tls::{TlsConnectionOptions, TlsProvider};

/// 入站通道回调：每条被接受的连接恰好触发一次（成功或失败）。
pub type ServerIncomingFn = Arc<dyn Fn(Result<Channel, CoreError>) + Send + Sync + 'static>;
/// 入站通道关闭回调：仅当 incoming 已成功投递时触发。
pub type ServerChannelShutdownFn =
    Arc<dyn Fn(&Channel, Option<CoreError>) + Send + Sync + 'static>;
/// 监听器销毁回调：监听器停止且所有接受的通道退场后触发一次。
pub type ServerListenerDestroyFn = Box<dyn FnOnce() + Send + 'static>;

/// 新监听器的参数集合。
pub struct ServerListenerOptions {
    pub endpoint: SocketEndpoint,
    pub socket_options: SocketOptions,
    pub incoming_callback: ServerIncomingFn,
    pub shutdown_callback: ServerChannelShutdownFn,
    pub destroy_callback: Option<ServerListenerDestroyFn>,
}

const LISTEN_BACKLOG: i32 = 1024;

struct ServerBootstrapInner {
    event_loop_group: Arc<EventLoopGroup>,
    on_protocol_negotiated: Mutex<Option<OnProtocolNegotiated>>,
    tls_providers: Mutex<Vec<Arc<dyn TlsProvider>>>,
}

/// 服务端引导句柄；克隆共享同一实例。
#[derive(Clone)]
pub struct ServerBootstrap {
    inner: Arc<ServerBootstrapInner>,
}

impl ServerBootstrap {
    pub fn new(event_loop_group: Arc<EventLoopGroup>) -> ServerBootstrap {
        tracing::info!(
            target: "beacon_io::bootstrap",
            loops = event_loop_group.loop_count(),
            "initializing server bootstrap"
        );
        ServerBootstrap {
            inner: Arc::new(ServerBootstrapInner {
                event_loop_group,
                on_protocol_negotiated: Mutex::new(None),
                tls_providers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 安装共享的协议协商回调；对所有带 TLS 的被接受通道生效。
    pub fn set_alpn_callback(&self, on_protocol_negotiated: OnProtocolNegotiated) {
        tracing::debug!(target: "beacon_io::bootstrap", "setting ALPN callback");
        *self.inner.on_protocol_negotiated.lock() = Some(on_protocol_negotiated);
    }

    pub fn event_loop_group(&self) -> &Arc<EventLoopGroup> {
        &self.inner.event_loop_group
    }

    /// 绑定并开始接受明文连接。
    pub fn new_socket_listener(
        &self,
        options: ServerListenerOptions,
    ) -> Result<ServerListener, CoreError> {
        self.new_listener(options, None)
    }

    /// 绑定并开始接受 TLS 连接；要求流式套接字。
    pub fn new_tls_socket_listener(
        &self,
        options: ServerListenerOptions,
        tls_options: &TlsConnectionOptions,
    ) -> Result<ServerListener, CoreError> {
        if options.socket_options.socket_type != SocketType::Stream {
            return Err(CoreError::new(
                codes::SOCKET_INVALID_OPTIONS,
                "tls requires a stream socket",
            ));
        }
        self.new_listener(options, Some(tls_options))
    }

    /// 停止监听并释放监听器引用。
    ///
    /// 停止与关闭在监听器所属的事件循环线程上执行；销毁回调在全部引用
    /// （包括每条已接受通道持有的引用）归零后触发。
    pub fn destroy_socket_listener(&self, listener: ServerListener) {
        let state = listener.state;
        let Some(event_loop) = state.listener.event_loop() else {
            state.listener.close();
            return;
        };
        tracing::debug!(target: "beacon_io::bootstrap", "destroying socket listener");
        let task_state = Arc::clone(&state);
        event_loop.schedule_task_now(ChannelTask::new("listener-destroy", move |_status| {
            task_state.listener.stop_accept();
            task_state.listener.close();
        }));
    }

    /// 释放引导引用；释放前在组内每条事件循环上清理 TLS 线程局部状态。
    pub fn release(self) {
        let providers: Vec<Arc<dyn TlsProvider>> = self.inner.tls_providers.lock().clone();
        ensure_thread_local_state_cleaned(&self.inner.event_loop_group, &providers);
    }

    fn new_listener(
        &self,
        options: ServerListenerOptions,
        tls_options: Option<&TlsConnectionOptions>,
    ) -> Result<ServerListener, CoreError> {
        tracing::info!(
            target: "beacon_io::bootstrap",
            address = %options.endpoint.address,
            port = options.endpoint.port,
            tls = tls_options.is_some(),
            "initializing a server socket listener"
        );
        let tls = tls_options.map(|user_options| {
            let mut copied = user_options.clone();
            let on_protocol_negotiated = self.inner.on_protocol_negotiated.lock().clone();
            if on_protocol_negotiated.is_some() {
                copied.advertise_alpn_message = true;
            }
            self.remember_tls_provider(&copied.provider);
            ServerTlsData {
                options: copied,
                on_protocol_negotiated,
            }
        });

        let listener_socket = Socket::new(&options.socket_options)?;
        let state = Arc::new(ServerConnectionState {
            bootstrap: self.clone(),
            listener: listener_socket.clone(),
            incoming_callback: options.incoming_callback,
            shutdown_callback: options.shutdown_callback,
            destroy_callback: Mutex::new(options.destroy_callback),
            tls,
        });

        listener_socket.bind(&options.endpoint)?;
        listener_socket.listen(LISTEN_BACKLOG)?;

        let connection_loop = self.inner.event_loop_group.next_loop();
        let accept_state = Arc::clone(&state);
        listener_socket.start_accept(
            &connection_loop,
            Box::new(move |result| match result {
                Ok(new_socket) => {
                    ServerConnectionState::handle_incoming(&accept_state, new_socket);
                }
                Err(error) => {
                    tracing::error!(
                        target: "beacon_io::bootstrap",
                        %error,
                        "listener accept failed"
                    );
                    (accept_state.incoming_callback)(Err(error));
                }
            }),
        )?;

        Ok(ServerListener { state })
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

/// 监听器句柄：持有服务端连接状态的一个引用。
pub struct ServerListener {
    state: Arc<ServerConnectionState>,
}

impl ServerListener {
    /// 监听器实际绑定的端点（`:0` 绑定后可据此取得真实端口）。
    pub fn local_endpoint(&self) -> Option<SocketEndpoint> {
        self.state.listener.local_endpoint()
    }
}

impl std::fmt::Debug for ServerListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerListener").finish()
    }
}

struct ServerTlsData {
    options: TlsConnectionOptions,
    on_protocol_negotiated: Option<OnProtocolNegotiated>,
}

/// 监听器与其派生通道共享的状态。
///
/// 监听器句柄、接受协程、每条已接受的通道各持有一个 `Arc` 引用；
/// 最后一个引用释放时触发销毁回调。
struct ServerConnectionState {
    bootstrap: ServerBootstrap,
    listener: Socket,
    incoming_callback: ServerIncomingFn,
    shutdown_callback: ServerChannelShutdownFn,
    destroy_callback: Mutex<Option<ServerListenerDestroyFn>>,
    tls: Option<ServerTlsData>,
}

impl Drop for ServerConnectionState {
    fn drop(&mut self) {
        if let Some(destroy_callback) = self.destroy_callback.lock().take() {
            destroy_callback();
        }
    }
}

/// 每条被接受连接的通道状态。
struct ServerChannelData {
    socket: Socket,
    state: Arc<ServerConnectionState>,
    incoming_called: AtomicBool,
}

impl ServerConnectionState {
    fn handle_incoming(state: &Arc<Self>, socket: Socket) {
        tracing::debug!(target: "beacon_io::bootstrap", "accepted incoming connection");
        let channel_data = Arc::new(ServerChannelData {
            socket: socket.clone(),
            state: Arc::clone(state),
            incoming_called: AtomicBool::new(false),
        });
        let event_loop = state.bootstrap.inner.event_loop_group.next_loop();
        socket.assign_to_event_loop(&event_loop);

        let setup_data = Arc::clone(&channel_data);
        let shutdown_data = Arc::clone(&channel_data);
        // 返回的句柄无须暂存：装配任务与管线内的槽位各自持有通道引用
        let _channel = Channel::new(
            &event_loop,
            ChannelOptions::default(),
            ChannelCallbacks {
                on_setup_completed: Some(Box::new(move |channel, result| {
                    ServerChannelData::on_channel_setup(&setup_data, channel, result);
                })),
                on_shutdown_completed: Some(Box::new(move |channel, error| {
                    ServerChannelData::on_channel_shutdown(&shutdown_data, channel, error);
                })),
            },
        );
    }
}

impl ServerChannelData {
    /// 投递 incoming 回调；每条被接受的连接恰好一次。
    fn deliver_incoming(data: &Arc<Self>, result: Result<Channel, CoreError>) {
        if data.incoming_called.swap(true, Ordering::SeqCst) {
            return;
        }
        (data.state.incoming_callback)(result);
    }

    fn on_channel_setup(data: &Arc<Self>, channel: &Channel, result: Result<(), CoreError>) {
        if let Err(error) = result {
            tracing::error!(
                target: "beacon_io::bootstrap",
                %error,
                "server channel setup failed"
            );
            channel.destroy();
            data.socket.close();
            Self::deliver_incoming(data, Err(error));
            return;
        }
        let error = match Self::assemble_channel(data, channel) {
            Ok(deliver_now) => {
                if deliver_now {
                    Self::deliver_incoming(data, Ok(channel.clone()));
                }
                return;
            }
            Err(error) => error,
        };
        tracing::error!(
            target: "beacon_io::bootstrap",
            %error,
            "server channel assembly failed"
        );
        channel.shutdown(Some(error));
    }

    fn assemble_channel(data: &Arc<Self>, channel: &Channel) -> Result<bool, CoreError> {
        let socket_slot = channel.new_slot();
        let socket_handler =
            SocketChannelHandler::new(&data.socket, &socket_slot, channel.max_fragment_size())?;
        socket_slot.set_handler(socket_handler)?;

        let Some(tls) = &data.state.tls else {
            return Ok(true);
        };
        Self::setup_server_tls(data, channel, tls)?;
        // incoming 回调等协商结束再投递
        Ok(false)
    }

    fn setup_server_tls(
        data: &Arc<Self>,
        channel: &Channel,
        tls: &ServerTlsData,
    ) -> Result<(), CoreError> {
        let tls_slot = channel.new_slot();
        channel.slot_insert_end(&tls_slot)?;

        // 每条通道一份选项拷贝，蹦床回调捕获的是本通道的状态
        let mut negotiated_options = tls.options.clone();
        let user_on_negotiation_result = tls.options.on_negotiation_result.clone();
        let negotiation_data = Arc::clone(data);
        negotiated_options.on_negotiation_result = Some(Arc::new(move |slot, result| {
            if let Some(user) = &user_on_negotiation_result {
                user(slot, result.clone());
            }
            tracing::debug!(
                target: "beacon_io::bootstrap",
                error = result.as_ref().err().map(|e| e.code()),
                "server tls negotiation result"
            );
            match result {
                Err(error) => slot.channel().shutdown(Some(error)),
                Ok(()) => {
                    let channel = slot.channel().clone();
                    ServerChannelData::deliver_incoming(&negotiation_data, Ok(channel));
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
            .new_server_handler(&negotiated_options, &tls_slot)?;
        tls_slot.set_handler(tls_handler)?;
        tracing::trace!(target: "beacon_io::bootstrap", "server tls slot installed");

        if let Some(on_protocol_negotiated) = &tls.on_protocol_negotiated {
            let alpn_slot = channel.new_slot();
            let alpn_handler = AlpnChannelHandler::new(Arc::clone(on_protocol_negotiated));
            tls_slot.insert_right(&alpn_slot)?;
            alpn_slot.set_handler(alpn_handler)?;
            tracing::trace!(target: "beacon_io::bootstrap", "alpn slot installed");
        }
        // 服务端握手由入站的 ClientHello 驱动，无须主动发起
        Ok(())
    }

    fn on_channel_shutdown(data: &Arc<Self>, channel: &Channel, error: Option<CoreError>) {
        tracing::debug!(
            target: "beacon_io::bootstrap",
            error = error.as_ref().map(|e| e.code()),
            "server channel shut down"
        );
        if !data.incoming_called.load(Ordering::SeqCst) {
            let error = error.unwrap_or_else(unknown_error);
            Self::deliver_incoming(data, Err(error));
        } else {
            (data.state.shutdown_callback)(channel, error);
        }
        channel.destroy();
        data.socket.close();
    }
}
