use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Arc;

/// `CoreError` 表示 `beacon-io` 统一的错误域。
///
/// # 设计背景（Why）
/// - 通道会在关闭发起时闩存一个错误，并把同一份错误依次交给每个 Handler 的
///   `shutdown` 以及最终的 `on_shutdown_completed` 回调；因此错误必须可克隆，
///   底层原因放入 `Arc` 以保持克隆零拷贝。
/// - 跨层传递稳定的字符串错误码，便于日志与断言进行机器可读的根因识别。
///
/// # 契约说明（What）
/// - **前置条件**：`code` 应在 [`codes`] 模块中声明，或遵守 `domain.reason` 命名。
/// - **后置条件**：所有构造方法都产生拥有所有权的实例，可跨线程移动与闩存。
#[derive(Clone, Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<Arc<dyn Error + Send + Sync + 'static>>,
}

impl CoreError {
    /// 使用稳定错误码与消息创建 `CoreError`。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取人类可读的错误描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 附带一个底层原因，形成错误链。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 获取可选的底层原因。
    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|arc| arc.as_ref() as &(dyn Error + 'static))
    }
}

/// 将底层 IO 错误映射为带稳定错误码的 [`CoreError`]。
pub(crate) fn map_io_error(code: &'static str, context: &'static str, error: io::Error) -> CoreError {
    CoreError::new(code, format!("{context}: {error}")).with_cause(error)
}

/// 框架内置的错误码常量集合，保证可观测性系统具有稳定识别符。
pub mod codes {
    /// 读方向发送的消息超过下游槽位的接收窗口。
    pub const CHANNEL_EXCEEDS_WINDOW: &str = "channel.exceeds_window";
    /// 通道管线装配失败。
    pub const CHANNEL_SETUP_FAILED: &str = "channel.setup_failed";
    /// 槽位已被移除或通道已析构。
    pub const CHANNEL_STALE: &str = "channel.stale";
    /// 目标方向上没有相邻槽位。
    pub const CHANNEL_NO_NEIGHBOR: &str = "channel.no_adjacent_slot";
    /// 槽位的 Handler 只允许设置一次。
    pub const CHANNEL_HANDLER_EXISTS: &str = "channel.handler_already_set";
    /// Handler 收到了自身不支持的方向或消息。
    pub const CHANNEL_UNEXPECTED_MESSAGE: &str = "channel.unexpected_message";
    /// 套接字选项组合非法（如对 TLS 使用数据报套接字）。
    pub const SOCKET_INVALID_OPTIONS: &str = "socket.invalid_options";
    /// 套接字建连失败。
    pub const SOCKET_CONNECT_FAILED: &str = "socket.connect_failed";
    /// 套接字建连超时。
    pub const SOCKET_TIMEOUT: &str = "socket.timeout";
    /// 监听套接字绑定失败。
    pub const SOCKET_BIND_FAILED: &str = "socket.bind_failed";
    /// 接受入站连接失败。
    pub const SOCKET_ACCEPT_FAILED: &str = "socket.accept_failed";
    /// 套接字已关闭。
    pub const SOCKET_CLOSED: &str = "socket.closed";
    /// 套接字读取失败。
    pub const SOCKET_READ_FAILED: &str = "socket.read_failed";
    /// 套接字写入失败。
    pub const SOCKET_WRITE_FAILED: &str = "socket.write_failed";
    /// 套接字尚未建连。
    pub const SOCKET_NOT_CONNECTED: &str = "socket.not_connected";
    /// 主机名解析失败。
    pub const RESOLUTION_FAILED: &str = "resolver.resolution_failed";
    /// TLS 协商失败。
    pub const TLS_NEGOTIATION_FAILED: &str = "tls.negotiation_failed";
    /// 事件循环已经停止。
    pub const RUNTIME_TERMINATED: &str = "runtime.terminated";
    /// 在关闭早于装配完成时用于兜底上报的未知错误。
    pub const UNKNOWN: &str = "error.unknown";
}

/// 构造兜底的未知错误，仅在真实原因缺失时使用。
pub(crate) fn unknown_error() -> CoreError {
    CoreError::new(codes::UNKNOWN, "channel closed before a cause was recorded")
}

/// 构造事件循环已停止错误。
pub(crate) fn runtime_terminated() -> CoreError {
    CoreError::new(codes::RUNTIME_TERMINATED, "event loop is no longer running")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let err = CoreError::new(codes::SOCKET_CLOSED, "peer went away");
        assert_eq!(err.to_string(), "[socket.closed] peer went away");
    }

    #[test]
    fn io_mapping_keeps_cause_chain() {
        let io = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = map_io_error(codes::SOCKET_CONNECT_FAILED, "tcp connect", io);
        assert_eq!(err.code(), codes::SOCKET_CONNECT_FAILED);
        assert!(err.cause().is_some());
        assert!(err.message().contains("tcp connect"));
    }
}
