use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

/// 消息类型标签，标注消息在管线中的语义。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// 从传输层向右流动的入站数据。
    ReadData,
    /// 从业务层向左流动的出站数据。
    WriteData,
    /// 应用层自定义数据。
    ApplicationData,
    /// 窗口更新通知。
    WindowUpdate,
    /// TLS 协商完成后向右广播的协议名。
    ProtocolNegotiated,
}

/// `IoMessage` 是管线内所有权单持有者的字节消息。
///
/// # 设计背景（Why）
/// - 消息沿管线按方向移交所有权：持有者要么成功交给邻居，要么让消息落盘回池。
///   Rust 的移动语义让“双重释放/移交后使用”在类型层面不可表达，释放动作由
///   `Drop` 统一归还缓冲池。
///
/// # 契约说明（What）
/// - `data` 的容量即消息的尺寸上限；发送超过下游窗口的消息会被通道拒绝并退还。
/// - 池化消息析构时缓冲回到所属 [`MessagePool`]，游离消息直接释放。
pub struct IoMessage {
    message_type: MessageType,
    data: BytesMut,
    capacity: usize,
    pool: Option<Arc<PoolInner>>,
}

impl IoMessage {
    /// 创建不属于任何池的游离消息，主要供测试与一次性场景使用。
    pub fn standalone(message_type: MessageType, capacity: usize) -> Self {
        Self {
            message_type,
            data: BytesMut::with_capacity(capacity),
            capacity,
            pool: None,
        }
    }

    /// 消息类型标签。
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// 消息的尺寸上限。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 只读载荷。
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 可写载荷缓冲。
    pub fn data_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    /// 当前载荷长度。
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 载荷是否为空。
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for IoMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoMessage")
            .field("type", &self.message_type)
            .field("len", &self.data.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Drop for IoMessage {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let mut buffer = std::mem::take(&mut self.data);
            buffer.clear();
            pool.recycle(buffer);
        }
    }
}

struct PoolInner {
    max_fragment_size: usize,
    free: Mutex<Vec<BytesMut>>,
    outstanding: AtomicUsize,
}

impl PoolInner {
    fn recycle(&self, buffer: BytesMut) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED_BUFFERS {
            free.push(buffer);
        }
    }
}

const MAX_POOLED_BUFFERS: usize = 16;

/// 通道级消息池：租借按分片上限裁剪的缓冲，析构时自动回收。
///
/// `size_hint` 仅是提示，实际容量不超过 `max_fragment_size`；调用方需要自行
/// 检查边界，必要时拆分为多条消息发送。
#[derive(Clone)]
pub struct MessagePool {
    inner: Arc<PoolInner>,
}

impl MessagePool {
    pub fn new(max_fragment_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                max_fragment_size,
                free: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// 租借一条消息，容量为 `min(size_hint, max_fragment_size)`。
    pub fn acquire(&self, message_type: MessageType, size_hint: usize) -> IoMessage {
        let capacity = size_hint.min(self.inner.max_fragment_size);
        let mut free = self.inner.free.lock();
        let data = match free.iter().position(|buf| buf.capacity() >= capacity) {
            Some(index) => free.swap_remove(index),
            None => BytesMut::with_capacity(capacity),
        };
        drop(free);
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        IoMessage {
            message_type,
            data,
            capacity,
            pool: Some(Arc::clone(&self.inner)),
        }
    }

    /// 当前尚未归还的租借数量，供泄漏检查使用。
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// 分片尺寸上限。
    pub fn max_fragment_size(&self) -> usize {
        self.inner.max_fragment_size
    }
}
