//! ALPN Handler：消费 TLS 阶段广播的协商结果，并把用户回调返回的应用层
//! Handler 装入右侧新槽位。

use std::sync::Arc;

use crate::channel::{ChannelDirection, ChannelHandler, HandlerRef, SlotHandle};
use crate::error::{CoreError, codes};
use crate::message::{IoMessage, MessageType};

/// 协议协商回调：收到协商出的协议名，返回要装入新槽位的应用层 Handler。
pub type OnProtocolNegotiated =
    Arc<dyn Fn(&SlotHandle, &[u8]) -> Result<HandlerRef, CoreError> + Send + Sync + 'static>;

pub struct AlpnChannelHandler {
    on_protocol_negotiated: OnProtocolNegotiated,
}

impl AlpnChannelHandler {
    pub fn new(on_protocol_negotiated: OnProtocolNegotiated) -> Arc<Self> {
        Arc::new(Self {
            on_protocol_negotiated,
        })
    }
}

impl ChannelHandler for AlpnChannelHandler {
    fn process_read_message(
        &self,
        slot: &SlotHandle,
        message: IoMessage,
    ) -> Result<(), CoreError> {
        if message.message_type() != MessageType::ProtocolNegotiated {
            return Err(CoreError::new(
                codes::CHANNEL_UNEXPECTED_MESSAGE,
                "alpn handler only accepts protocol announcements",
            ));
        }
        let protocol = message.data().to_vec();
        tracing::debug!(
            target: "beacon_io::alpn",
            protocol = %String::from_utf8_lossy(&protocol),
            "installing negotiated protocol handler"
        );
        let new_slot = slot.channel().new_slot();
        slot.insert_right(&new_slot)?;
        let handler = (self.on_protocol_negotiated)(&new_slot, &protocol)?;
        new_slot.set_handler(handler)?;
        // 本阶段是一次性的：应用层 Handler 就位后把自己摘出链路
        slot.clone().remove()?;
        Ok(())
    }

    fn process_write_message(
        &self,
        slot: &SlotHandle,
        message: IoMessage,
    ) -> Result<(), CoreError> {
        // 应用层消息向左透传
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
        "alpn"
    }
}
