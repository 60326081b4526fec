use std::sync::Arc;

use crate::channel::slot::SlotHandle;
use crate::error::CoreError;
use crate::message::IoMessage;

/// 管线内的数据流方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelDirection {
    /// 入站：自左向右。
    Read,
    /// 出站：自右向左。
    Write,
}

/// 槽位上的消息处理阶段：套接字 I/O、TLS、ALPN 或用户自定义逻辑。
///
/// # 设计背景（Why）
/// - Handler 以 `&self` 接收全部事件并自行管理内部可变性：所有回调都只会在
///   通道所属的事件循环线程上发生，锁因此不存在竞争，却让 Handler 可以被
///   `Arc<dyn ChannelHandler>` 持有并在回调期间安全地重入通道 API。
///
/// # 契约说明（What）
/// - `process_read_message` / `process_write_message`：消息所有权随调用移交；
///   Handler 要么继续经 [`SlotHandle::send_message`] 向邻居转发，要么让消息
///   析构回池。
/// - `increment_read_window`：下游授予了新的读预算，通常应向自己的槽位继续
///   上抛一个窗口增量。
/// - `shutdown`：通道在读方向自左向右、写方向自右向左各调用一次。流程允许
///   依赖调度任务延后完成，但完成时必须调用
///   [`SlotHandle::on_handler_shutdown_complete`]；`urgent` 为真时，套接字、
///   文件描述符等稀缺资源必须在返回前关闭。
/// - 析构（`Drop`）即资源回收钩子：通道保证它只发生在双向关闭完成之后
///   （或显式的槽位移除/替换时）。
///
/// # 前置/后置条件（Contract）
/// - **前置**：实现必须 `Send + Sync + 'static`；所有方法仅在循环线程被调用。
/// - **后置**：无法恢复的错误应通过 `Channel::shutdown` 升级，而不是吞掉。
pub trait ChannelHandler: Send + Sync + 'static {
    /// 处理读方向消息。
    fn process_read_message(&self, slot: &SlotHandle, message: IoMessage)
    -> Result<(), CoreError>;

    /// 处理写方向消息。
    fn process_write_message(
        &self,
        slot: &SlotHandle,
        message: IoMessage,
    ) -> Result<(), CoreError>;

    /// 下游发出了窗口增量。
    fn increment_read_window(&self, slot: &SlotHandle, size: usize) -> Result<(), CoreError>;

    /// 按方向执行关闭。默认实现立即完成并把流程交还给通道。
    fn shutdown(
        &self,
        slot: &SlotHandle,
        direction: ChannelDirection,
        error: Option<CoreError>,
        urgent: bool,
    ) -> Result<(), CoreError> {
        slot.on_handler_shutdown_complete(direction, error, urgent);
        Ok(())
    }

    /// Handler 被装入槽位时的初始读窗口。
    fn initial_window_size(&self) -> usize;

    /// 本阶段引入的消息开销（字节），供下游估算分片尺寸。
    fn message_overhead(&self) -> usize {
        0
    }

    /// 用于日志的阶段名。
    fn name(&self) -> &'static str {
        "handler"
    }
}

/// 统一的 Handler 引用形态；槽位独占持有，回调期间按需克隆。
pub type HandlerRef = Arc<dyn ChannelHandler>;
