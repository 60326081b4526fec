use crate::channel::Channel;
use crate::channel::handler::{ChannelDirection, HandlerRef};
use crate::error::CoreError;
use crate::message::IoMessage;

/// 槽位标识：通道内部槽位表的索引，随通道一起失效。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotId(usize);

impl SlotId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// 发送失败的结果：错误码加上可能退还的消息。
///
/// 当失败发生在移交之前（窗口不足、没有邻居、槽位已失效），消息退还给
/// 调用方（`message` 为 `Some`）；若下游 Handler 在接管后报告错误，所有权
/// 已经转移，`message` 为 `None`。
#[derive(Debug)]
pub struct SendMessageError {
    pub error: CoreError,
    pub message: Option<IoMessage>,
}

/// 指向通道内某个槽位的轻量句柄。
///
/// 克隆句柄不会克隆槽位；所有修改类操作仅在通道的事件循环线程上合法。
#[derive(Clone)]
pub struct SlotHandle {
    channel: Channel,
    id: SlotId,
}

impl SlotHandle {
    pub(crate) fn new(channel: Channel, id: SlotId) -> Self {
        Self { channel, id }
    }

    /// 所属通道。
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub(crate) fn id(&self) -> SlotId {
        self.id
    }

    /// 把游离槽位 `to_add` 插到本槽位右侧。
    pub fn insert_right(&self, to_add: &SlotHandle) -> Result<(), CoreError> {
        self.channel.slot_insert_right(self.id, to_add.id)
    }

    /// 把游离槽位 `to_add` 插到本槽位左侧；若本槽位是链头，`to_add` 接任链头。
    pub fn insert_left(&self, to_add: &SlotHandle) -> Result<(), CoreError> {
        self.channel.slot_insert_left(self.id, to_add.id)
    }

    /// 设置槽位的 Handler；只允许一次，并把其初始窗口向上游传播。
    pub fn set_handler(&self, handler: HandlerRef) -> Result<(), CoreError> {
        self.channel.slot_set_handler(self.id, handler)
    }

    /// 把槽位从链路摘除并析构其 Handler。要求槽位静默（没有在途消息）。
    pub fn remove(self) -> Result<(), CoreError> {
        self.channel.slot_remove(self.id)
    }

    /// 用游离槽位 `new_slot` 顶替本槽位，并析构被替换槽位与其 Handler。
    pub fn replace(self, new_slot: &SlotHandle) -> Result<(), CoreError> {
        self.channel.slot_replace(self.id, new_slot.id)
    }

    /// 沿 `direction` 把消息交给相邻槽位；读方向会做窗口检查并扣减。
    pub fn send_message(
        &self,
        message: IoMessage,
        direction: ChannelDirection,
    ) -> Result<(), SendMessageError> {
        self.channel.slot_send_message(self.id, message, direction)
    }

    /// 为本槽位增加读窗口，并向上游（左侧）Handler 发出增量通知。
    pub fn increment_read_window(&self, delta: usize) -> Result<(), CoreError> {
        self.channel.slot_increment_read_window(self.id, delta)
    }

    /// 在本槽位上重新进入 Handler 的关闭流程。
    pub fn shutdown(
        &self,
        direction: ChannelDirection,
        error: Option<CoreError>,
        urgent: bool,
    ) -> Result<(), CoreError> {
        self.channel.slot_shutdown(self.id, direction, error, urgent)
    }

    /// Handler 完成某方向的关闭后调用，驱动通道状态机继续推进。
    pub fn on_handler_shutdown_complete(
        &self,
        direction: ChannelDirection,
        error: Option<CoreError>,
        urgent: bool,
    ) {
        self.channel
            .on_handler_shutdown_complete(self.id, direction, error, urgent);
    }

    /// 下游（右邻）当前的读窗口。发送超过该值的读消息会被拒绝。
    pub fn downstream_read_window(&self) -> usize {
        self.channel.slot_downstream_read_window(self.id)
    }

    /// 上游 Handler 的累计消息开销，供避免分片时参考。
    pub fn upstream_message_overhead(&self) -> usize {
        self.channel.slot_upstream_message_overhead(self.id)
    }

    /// 本槽位当前的读窗口。
    pub fn window_size(&self) -> usize {
        self.channel.slot_window_size(self.id)
    }
}

impl std::fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotHandle").field("id", &self.id).finish()
    }
}
