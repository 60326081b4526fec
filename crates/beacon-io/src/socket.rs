//! 流式套接字封装：以回调接口暴露建连、监听与接受，供引导层组合。
//!
//! 连接完成后的流以非阻塞 std 形态停泊在 [`Socket`] 内，直到套接字
//! Handler 在目标事件循环线程上装配时才注册进该循环的反应器；这使得
//! “在监听循环上接受、在另一条循环上驱动”成为安全操作。

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Type};

use crate::error::{CoreError, codes, map_io_error, runtime_terminated};
use crate::event_loop::EventLoop;
use crate::task::{ChannelTask, TaskStatus};

/// 套接字地址族。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketDomain {
    Ipv4,
    Ipv6,
    /// 本机域套接字（Unix domain socket），跳过主机名解析。
    Local,
}

/// 套接字类型。TLS 与两类引导都要求 `Stream`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Datagram,
}

/// 套接字选项。
#[derive(Clone, Copy, Debug)]
pub struct SocketOptions {
    pub domain: SocketDomain,
    pub socket_type: SocketType,
    pub connect_timeout_ms: u32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            domain: SocketDomain::Ipv4,
            socket_type: SocketType::Stream,
            connect_timeout_ms: 3_000,
        }
    }
}

/// 端点：IP 字面量加端口，或 `Local` 域下的套接字路径。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SocketEndpoint {
    pub address: String,
    pub port: u16,
}

/// 建连完成回调。
pub type SocketConnectFn = Box<dyn FnOnce(&Socket, Result<(), CoreError>) + Send + 'static>;
/// 接受回调：每个入站连接触发一次，监听错误也经由此上报。
pub type SocketAcceptFn = Box<dyn FnMut(Result<Socket, CoreError>) + Send + 'static>;

pub(crate) enum StreamKind {
    Tcp(std::net::TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

enum ListenerKind {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

enum SocketState {
    Init,
    Connecting,
    Connected(Option<StreamKind>),
    Bound(socket2::Socket),
    Listening {
        listener: Option<ListenerKind>,
        accept_abort: Option<tokio::task::AbortHandle>,
    },
    Closed,
}

enum ConnectTarget {
    Inet(SocketAddr),
    #[cfg_attr(not(unix), allow(dead_code))]
    Unix(PathBuf),
}

struct SocketInner {
    options: SocketOptions,
    state: Mutex<SocketState>,
    local: Mutex<Option<SocketEndpoint>>,
    remote: Mutex<Option<SocketEndpoint>>,
    event_loop: Mutex<Option<Arc<EventLoop>>>,
}

/// 流式套接字句柄；克隆共享同一底层状态。
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    /// 按选项创建套接字。数据报类型与非 Unix 平台上的 `Local` 域会被拒绝。
    pub fn new(options: &SocketOptions) -> Result<Socket, CoreError> {
        if options.socket_type != SocketType::Stream {
            return Err(CoreError::new(
                codes::SOCKET_INVALID_OPTIONS,
                "only stream sockets are supported",
            ));
        }
        #[cfg(not(unix))]
        if options.domain == SocketDomain::Local {
            return Err(CoreError::new(
                codes::SOCKET_INVALID_OPTIONS,
                "local sockets require a unix platform",
            ));
        }
        Ok(Socket {
            inner: Arc::new(SocketInner {
                options: *options,
                state: Mutex::new(SocketState::Init),
                local: Mutex::new(None),
                remote: Mutex::new(None),
                event_loop: Mutex::new(None),
            }),
        })
    }

    pub(crate) fn from_accepted(
        stream: StreamKind,
        options: &SocketOptions,
        local: Option<SocketEndpoint>,
        remote: Option<SocketEndpoint>,
    ) -> Socket {
        Socket {
            inner: Arc::new(SocketInner {
                options: *options,
                state: Mutex::new(SocketState::Connected(Some(stream))),
                local: Mutex::new(local),
                remote: Mutex::new(remote),
                event_loop: Mutex::new(None),
            }),
        }
    }

    pub fn options(&self) -> &SocketOptions {
        &self.inner.options
    }

    pub fn local_endpoint(&self) -> Option<SocketEndpoint> {
        self.inner.local.lock().clone()
    }

    pub fn remote_endpoint(&self) -> Option<SocketEndpoint> {
        self.inner.remote.lock().clone()
    }

    /// 套接字当前归属的事件循环。
    pub fn event_loop(&self) -> Option<Arc<EventLoop>> {
        self.inner.event_loop.lock().clone()
    }

    /// 把（已接受的）套接字指派给某条事件循环；实际的反应器注册推迟到
    /// 套接字 Handler 在该循环线程上装配时发生。
    pub fn assign_to_event_loop(&self, event_loop: &Arc<EventLoop>) {
        *self.inner.event_loop.lock() = Some(Arc::clone(event_loop));
    }

    /// 在 `event_loop` 上异步建连，完成（或失败）后回调 `on_connected`。
    pub fn connect(
        &self,
        endpoint: &SocketEndpoint,
        event_loop: &Arc<EventLoop>,
        on_connected: SocketConnectFn,
    ) -> Result<(), CoreError> {
        let target = self.parse_target(endpoint)?;
        {
            let mut state = self.inner.state.lock();
            match *state {
                SocketState::Init => *state = SocketState::Connecting,
                _ => {
                    return Err(CoreError::new(
                        codes::SOCKET_INVALID_OPTIONS,
                        "socket is not in a connectable state",
                    ));
                }
            }
        }
        *self.inner.remote.lock() = Some(endpoint.clone());
        *self.inner.event_loop.lock() = Some(Arc::clone(event_loop));

        let socket = self.clone();
        let timeout = Duration::from_millis(u64::from(self.inner.options.connect_timeout_ms));
        event_loop.schedule_task_now(ChannelTask::new("socket-connect", move |status| {
            if status == TaskStatus::Cancelled {
                socket.close();
                on_connected(&socket, Err(runtime_terminated()));
                return;
            }
            tokio::task::spawn_local(async move {
                match Self::do_connect(target, timeout).await {
                    Ok((stream, local)) => {
                        *socket.inner.local.lock() = local;
                        *socket.inner.state.lock() = SocketState::Connected(Some(stream));
                        tracing::debug!(target: "beacon_io::socket", "connect completed");
                        on_connected(&socket, Ok(()));
                    }
                    Err(error) => {
                        tracing::debug!(target: "beacon_io::socket", %error, "connect failed");
                        socket.close();
                        on_connected(&socket, Err(error));
                    }
                }
            });
        }));
        Ok(())
    }

    async fn do_connect(
        target: ConnectTarget,
        timeout: Duration,
    ) -> Result<(StreamKind, Option<SocketEndpoint>), CoreError> {
        match target {
            ConnectTarget::Inet(addr) => {
                let stream =
                    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await
                    {
                        Err(_elapsed) => {
                            return Err(CoreError::new(
                                codes::SOCKET_TIMEOUT,
                                "tcp connect timed out",
                            ));
                        }
                        Ok(Err(error)) => {
                            return Err(map_io_error(
                                codes::SOCKET_CONNECT_FAILED,
                                "tcp connect",
                                error,
                            ));
                        }
                        Ok(Ok(stream)) => stream,
                    };
                let local = stream.local_addr().ok().map(endpoint_from_addr);
                let std_stream = stream
                    .into_std()
                    .map_err(|error| map_io_error(codes::SOCKET_CONNECT_FAILED, "detach", error))?;
                Ok((StreamKind::Tcp(std_stream), local))
            }
            #[cfg(unix)]
            ConnectTarget::Unix(path) => {
                let stream = match tokio::time::timeout(
                    timeout,
                    tokio::net::UnixStream::connect(&path),
                )
                .await
                {
                    Err(_elapsed) => {
                        return Err(CoreError::new(
                            codes::SOCKET_TIMEOUT,
                            "local connect timed out",
                        ));
                    }
                    Ok(Err(error)) => {
                        return Err(map_io_error(
                            codes::SOCKET_CONNECT_FAILED,
                            "local connect",
                            error,
                        ));
                    }
                    Ok(Ok(stream)) => stream,
                };
                let std_stream = stream
                    .into_std()
                    .map_err(|error| map_io_error(codes::SOCKET_CONNECT_FAILED, "detach", error))?;
                Ok((StreamKind::Unix(std_stream), None))
            }
            #[cfg(not(unix))]
            ConnectTarget::Unix(_) => Err(CoreError::new(
                codes::SOCKET_INVALID_OPTIONS,
                "local sockets require a unix platform",
            )),
        }
    }

    /// 绑定监听端点。
    pub fn bind(&self, endpoint: &SocketEndpoint) -> Result<(), CoreError> {
        let sock = match self.inner.options.domain {
            SocketDomain::Ipv4 | SocketDomain::Ipv6 => {
                let addr = self.parse_inet(endpoint)?;
                let domain = if addr.is_ipv6() {
                    Domain::IPV6
                } else {
                    Domain::IPV4
                };
                let sock = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
                    .map_err(|error| map_io_error(codes::SOCKET_BIND_FAILED, "socket", error))?;
                sock.set_reuse_address(true)
                    .map_err(|error| map_io_error(codes::SOCKET_BIND_FAILED, "reuseaddr", error))?;
                sock.bind(&SockAddr::from(addr))
                    .map_err(|error| map_io_error(codes::SOCKET_BIND_FAILED, "bind", error))?;
                if let Some(local) = sock.local_addr().ok().and_then(|addr| addr.as_socket()) {
                    *self.inner.local.lock() = Some(endpoint_from_addr(local));
                }
                sock
            }
            #[cfg(unix)]
            SocketDomain::Local => {
                let path = PathBuf::from(&endpoint.address);
                // 残留的套接字文件会让 bind 失败
                let _ = std::fs::remove_file(&path);
                let sock = socket2::Socket::new(Domain::UNIX, Type::STREAM, None)
                    .map_err(|error| map_io_error(codes::SOCKET_BIND_FAILED, "socket", error))?;
                let addr = SockAddr::unix(&path)
                    .map_err(|error| map_io_error(codes::SOCKET_BIND_FAILED, "path", error))?;
                sock.bind(&addr)
                    .map_err(|error| map_io_error(codes::SOCKET_BIND_FAILED, "bind", error))?;
                *self.inner.local.lock() = Some(endpoint.clone());
                sock
            }
            #[cfg(not(unix))]
            SocketDomain::Local => unreachable!("rejected at Socket::new"),
        };
        let mut state = self.inner.state.lock();
        match *state {
            SocketState::Init => {
                *state = SocketState::Bound(sock);
                Ok(())
            }
            _ => Err(CoreError::new(
                codes::SOCKET_INVALID_OPTIONS,
                "socket is not in a bindable state",
            )),
        }
    }

    /// 开始监听。
    pub fn listen(&self, backlog: i32) -> Result<(), CoreError> {
        let mut state = self.inner.state.lock();
        let sock = match std::mem::replace(&mut *state, SocketState::Closed) {
            SocketState::Bound(sock) => sock,
            other => {
                *state = other;
                return Err(CoreError::new(
                    codes::SOCKET_INVALID_OPTIONS,
                    "socket must be bound before listen",
                ));
            }
        };
        sock.listen(backlog)
            .map_err(|error| map_io_error(codes::SOCKET_BIND_FAILED, "listen", error))?;
        let listener = match self.inner.options.domain {
            SocketDomain::Ipv4 | SocketDomain::Ipv6 => {
                let listener: std::net::TcpListener = sock.into();
                listener
                    .set_nonblocking(true)
                    .map_err(|error| map_io_error(codes::SOCKET_BIND_FAILED, "nonblock", error))?;
                ListenerKind::Tcp(listener)
            }
            #[cfg(unix)]
            SocketDomain::Local => {
                let listener: std::os::unix::net::UnixListener = sock.into();
                listener
                    .set_nonblocking(true)
                    .map_err(|error| map_io_error(codes::SOCKET_BIND_FAILED, "nonblock", error))?;
                ListenerKind::Unix(listener)
            }
            #[cfg(not(unix))]
            SocketDomain::Local => unreachable!("rejected at Socket::new"),
        };
        *state = SocketState::Listening {
            listener: Some(listener),
            accept_abort: None,
        };
        Ok(())
    }

    /// 在 `event_loop` 上开始接受入站连接，每个结果回调一次 `on_accept`。
    pub fn start_accept(
        &self,
        event_loop: &Arc<EventLoop>,
        mut on_accept: SocketAcceptFn,
    ) -> Result<(), CoreError> {
        let listener = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                SocketState::Listening { listener, .. } => listener.take().ok_or_else(|| {
                    CoreError::new(codes::SOCKET_INVALID_OPTIONS, "accept already started")
                })?,
                _ => {
                    return Err(CoreError::new(
                        codes::SOCKET_INVALID_OPTIONS,
                        "socket is not listening",
                    ));
                }
            }
        };
        *self.inner.event_loop.lock() = Some(Arc::clone(event_loop));

        let socket = self.clone();
        let base_options = self.inner.options;
        event_loop.schedule_task_now(ChannelTask::new("socket-accept", move |status| {
            if status == TaskStatus::Cancelled {
                return;
            }
            let handle = tokio::task::spawn_local(async move {
                Self::drive_accept(listener, base_options, &mut on_accept).await;
            });
            socket.store_accept_abort(handle.abort_handle());
        }));
        Ok(())
    }

    async fn drive_accept(
        listener: ListenerKind,
        base_options: SocketOptions,
        on_accept: &mut SocketAcceptFn,
    ) {
        match listener {
            ListenerKind::Tcp(std_listener) => {
                let listener = match tokio::net::TcpListener::from_std(std_listener) {
                    Ok(listener) => listener,
                    Err(error) => {
                        on_accept(Err(map_io_error(
                            codes::SOCKET_ACCEPT_FAILED,
                            "register listener",
                            error,
                        )));
                        return;
                    }
                };
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            let local = stream.local_addr().ok().map(endpoint_from_addr);
                            match stream.into_std() {
                                Ok(std_stream) => {
                                    let mut options = base_options;
                                    options.domain = if peer.is_ipv6() {
                                        SocketDomain::Ipv6
                                    } else {
                                        SocketDomain::Ipv4
                                    };
                                    let accepted = Socket::from_accepted(
                                        StreamKind::Tcp(std_stream),
                                        &options,
                                        local,
                                        Some(endpoint_from_addr(peer)),
                                    );
                                    on_accept(Ok(accepted));
                                }
                                Err(error) => on_accept(Err(map_io_error(
                                    codes::SOCKET_ACCEPT_FAILED,
                                    "detach",
                                    error,
                                ))),
                            }
                        }
                        Err(error) => on_accept(Err(map_io_error(
                            codes::SOCKET_ACCEPT_FAILED,
                            "tcp accept",
                            error,
                        ))),
                    }
                }
            }
            #[cfg(unix)]
            ListenerKind::Unix(std_listener) => {
                let listener = match tokio::net::UnixListener::from_std(std_listener) {
                    Ok(listener) => listener,
                    Err(error) => {
                        on_accept(Err(map_io_error(
                            codes::SOCKET_ACCEPT_FAILED,
                            "register listener",
                            error,
                        )));
                        return;
                    }
                };
                loop {
                    match listener.accept().await {
                        Ok((stream, _peer)) => match stream.into_std() {
                            Ok(std_stream) => {
                                let accepted = Socket::from_accepted(
                                    StreamKind::Unix(std_stream),
                                    &base_options,
                                    None,
                                    None,
                                );
                                on_accept(Ok(accepted));
                            }
                            Err(error) => on_accept(Err(map_io_error(
                                codes::SOCKET_ACCEPT_FAILED,
                                "detach",
                                error,
                            ))),
                        },
                        Err(error) => on_accept(Err(map_io_error(
                            codes::SOCKET_ACCEPT_FAILED,
                            "local accept",
                            error,
                        ))),
                    }
                }
            }
        }
    }

    fn store_accept_abort(&self, handle: tokio::task::AbortHandle) {
        let mut state = self.inner.state.lock();
        if let SocketState::Listening { accept_abort, .. } = &mut *state {
            *accept_abort = Some(handle);
        } else {
            // 监听早已关闭，立刻掐掉接受协程
            handle.abort();
        }
    }

    /// 停止接受新的入站连接。
    pub fn stop_accept(&self) {
        let mut state = self.inner.state.lock();
        if let SocketState::Listening { accept_abort, .. } = &mut *state
            && let Some(handle) = accept_abort.take()
        {
            handle.abort();
        }
    }

    /// 关闭套接字并丢弃底层资源。
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if let SocketState::Listening { accept_abort, .. } = &mut *state
            && let Some(handle) = accept_abort.take()
        {
            handle.abort();
        }
        *state = SocketState::Closed;
    }

    /// 取走停泊的流，交由套接字 Handler 注册到目标事件循环。
    pub(crate) fn take_stream(&self) -> Result<StreamKind, CoreError> {
        let mut state = self.inner.state.lock();
        match &mut *state {
            SocketState::Connected(stream) => stream.take().ok_or_else(|| {
                CoreError::new(codes::SOCKET_NOT_CONNECTED, "stream already taken")
            }),
            _ => Err(CoreError::new(
                codes::SOCKET_NOT_CONNECTED,
                "socket is not connected",
            )),
        }
    }

    fn parse_target(&self, endpoint: &SocketEndpoint) -> Result<ConnectTarget, CoreError> {
        match self.inner.options.domain {
            SocketDomain::Ipv4 | SocketDomain::Ipv6 => {
                Ok(ConnectTarget::Inet(self.parse_inet(endpoint)?))
            }
            SocketDomain::Local => Ok(ConnectTarget::Unix(PathBuf::from(&endpoint.address))),
        }
    }

    fn parse_inet(&self, endpoint: &SocketEndpoint) -> Result<SocketAddr, CoreError> {
        let ip: IpAddr = endpoint.address.parse().map_err(|_| {
            CoreError::new(
                codes::SOCKET_INVALID_OPTIONS,
                "endpoint address must be a literal IP",
            )
        })?;
        Ok(SocketAddr::new(ip, endpoint.port))
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("options", &self.inner.options)
            .field("local", &*self.inner.local.lock())
            .field("remote", &*self.inner.remote.lock())
            .finish()
    }
}

fn endpoint_from_addr(addr: SocketAddr) -> SocketEndpoint {
    SocketEndpoint {
        address: addr.ip().to_string(),
        port: addr.port(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_options_are_rejected() {
        let options = SocketOptions {
            socket_type: SocketType::Datagram,
            ..SocketOptions::default()
        };
        let error = Socket::new(&options).expect_err("datagram must be rejected");
        assert_eq!(error.code(), codes::SOCKET_INVALID_OPTIONS);
    }

    #[test]
    fn connect_requires_literal_ip() {
        let socket = Socket::new(&SocketOptions::default()).expect("socket");
        let error = socket
            .parse_inet(&SocketEndpoint {
                address: "not-an-ip".into(),
                port: 80,
            })
            .expect_err("host names are resolved upstream");
        assert_eq!(error.code(), codes::SOCKET_INVALID_OPTIONS);
    }

    #[test]
    fn bind_and_listen_report_local_port() {
        let socket = Socket::new(&SocketOptions::default()).expect("socket");
        socket
            .bind(&SocketEndpoint {
                address: "127.0.0.1".into(),
                port: 0,
            })
            .expect("bind");
        socket.listen(1024).expect("listen");
        let local = socket.local_endpoint().expect("local endpoint");
        assert_ne!(local.port, 0);
        socket.close();
    }
}
