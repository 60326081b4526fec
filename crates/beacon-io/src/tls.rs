//! TLS 协商阶段的外部协作契约。
//!
//! 具体的 TLS 实现（证书、握手、记录层）由外部提供方承担；本模块只定义
//! 引导层需要的构造与回调形状。引导会把用户在 [`TlsConnectionOptions`]
//! 上安装的回调包一层蹦床，以便在转发给用户之余插入自己的装配逻辑
//! （协商成功才投递 setup/incoming 回调）。

use std::fmt;
use std::sync::Arc;

use crate::channel::{ChannelHandler, SlotHandle};
use crate::error::CoreError;

/// 协商结果回调。
pub type TlsNegotiationResultFn =
    Arc<dyn Fn(&SlotHandle, Result<(), CoreError>) + Send + Sync + 'static>;
/// 明文数据观察回调。
pub type TlsDataReadFn = Arc<dyn Fn(&SlotHandle, &[u8]) + Send + Sync + 'static>;
/// 错误观察回调。
pub type TlsErrorFn = Arc<dyn Fn(&SlotHandle, &CoreError) + Send + Sync + 'static>;

/// 一次 TLS 连接的参数与回调集合。引导层按值复制后持有。
#[derive(Clone)]
pub struct TlsConnectionOptions {
    pub provider: Arc<dyn TlsProvider>,
    /// SNI 主机名。
    pub server_name: Option<String>,
    /// 按优先级排列的 ALPN 候选协议。
    pub alpn_list: Vec<String>,
    /// 协商完成后是否向右广播 `ProtocolNegotiated` 消息（装配 ALPN 槽位时
    /// 由引导强制打开）。
    pub advertise_alpn_message: bool,
    pub on_negotiation_result: Option<TlsNegotiationResultFn>,
    pub on_data_read: Option<TlsDataReadFn>,
    pub on_error: Option<TlsErrorFn>,
}

impl TlsConnectionOptions {
    pub fn new(provider: Arc<dyn TlsProvider>) -> Self {
        Self {
            provider,
            server_name: None,
            alpn_list: Vec::new(),
            advertise_alpn_message: false,
            on_negotiation_result: None,
            on_data_read: None,
            on_error: None,
        }
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn with_alpn_list<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alpn_list = protocols.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Debug for TlsConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnectionOptions")
            .field("server_name", &self.server_name)
            .field("alpn_list", &self.alpn_list)
            .field("advertise_alpn_message", &self.advertise_alpn_message)
            .finish()
    }
}

/// TLS 管线阶段：除常规 Handler 能力外，还能主动发起协商。
pub trait TlsChannelHandler: ChannelHandler {
    /// 客户端侧发起握手。结果经 `TlsConnectionOptions::on_negotiation_result`
    /// 回报；服务端握手由入站数据驱动，不调用本方法。
    fn start_negotiation(&self, slot: &SlotHandle) -> Result<(), CoreError>;
}

/// TLS 实现提供方：为通道构造客户端/服务端协商阶段。
pub trait TlsProvider: Send + Sync + 'static {
    fn new_client_handler(
        &self,
        options: &TlsConnectionOptions,
        slot: &SlotHandle,
    ) -> Result<Arc<dyn TlsChannelHandler>, CoreError>;

    fn new_server_handler(
        &self,
        options: &TlsConnectionOptions,
        slot: &SlotHandle,
    ) -> Result<Arc<dyn TlsChannelHandler>, CoreError>;

    /// 清理事件循环线程上的线程局部状态。引导释放时会在组内每条循环上
    /// 调度一次本方法并同步等待。
    fn clean_up_thread_local_state(&self) {}
}
