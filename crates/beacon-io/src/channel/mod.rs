//! Channel：绑定单条事件循环的双向 Slot/Handler 管线。
//!
//! 入站字节从最左端（套接字 Handler）进入并向右传播；出站消息起于用户
//! Handler 并向左传播；窗口更新自右向左流动。所有槽位级操作只允许在通道
//! 所属的事件循环线程上执行，跨线程调用方通过任务投递切换线程。

pub mod handler;
pub mod slot;

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{CoreError, codes, runtime_terminated};
use crate::event_loop::EventLoop;
use crate::message::{IoMessage, MessagePool, MessageType};
use crate::task::{ChannelTask, TaskStatus};

pub use handler::{ChannelDirection, ChannelHandler, HandlerRef};
pub use slot::{SendMessageError, SlotHandle, SlotId};

/// 默认的单条消息分片上限（字节）。
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 16 * 1024;

/// 通道构造参数。
#[derive(Clone, Copy, Debug)]
pub struct ChannelOptions {
    /// 单槽位读窗口的饱和上限。
    pub max_window: usize,
    /// 消息池分片尺寸上限，同时是套接字 Handler 单次读取的上界。
    pub max_fragment_size: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_window: usize::MAX,
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
        }
    }
}

/// 通道装配完成回调：在事件循环线程上恰好触发一次。
pub type SetupCallback = Box<dyn FnOnce(&Channel, Result<(), CoreError>) + Send + 'static>;
/// 通道关闭完成回调：双向关闭完成后在事件循环线程上至多触发一次。
pub type ShutdownCallback = Box<dyn FnOnce(&Channel, Option<CoreError>) + Send + 'static>;

/// 通道生命周期回调对。
#[derive(Default)]
pub struct ChannelCallbacks {
    pub on_setup_completed: Option<SetupCallback>,
    pub on_shutdown_completed: Option<ShutdownCallback>,
}

/// 关闭状态机。
///
/// `NotStarted → ReadShuttingDown → WriteShuttingDown → Completed`：
/// 读方向自最左槽位向右逐一完成，随后写方向自最右槽位向左逐一完成，
/// 最终投递 `on_shutdown_completed`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShutdownPhase {
    NotStarted,
    ReadShuttingDown,
    WriteShuttingDown,
    Completed,
}

#[derive(Default)]
pub(crate) struct SlotNode {
    pub(crate) left: Option<SlotId>,
    pub(crate) right: Option<SlotId>,
    pub(crate) handler: Option<HandlerRef>,
    pub(crate) window_size: usize,
    pub(crate) upstream_message_overhead: usize,
}

struct Pipeline {
    slots: Vec<Option<SlotNode>>,
    head: Option<SlotId>,
    phase: ShutdownPhase,
    latched_error: Option<CoreError>,
    urgent: bool,
    torn_down: bool,
}

impl Pipeline {
    fn node(&self, id: SlotId) -> Result<&SlotNode, CoreError> {
        self.slots
            .get(id.index())
            .and_then(|slot| slot.as_ref())
            .ok_or_else(stale_slot)
    }

    fn node_mut(&mut self, id: SlotId) -> Result<&mut SlotNode, CoreError> {
        self.slots
            .get_mut(id.index())
            .and_then(|slot| slot.as_mut())
            .ok_or_else(stale_slot)
    }

    /// 自 `from` 起（含）向右找到第一个装有 Handler 的槽位。
    fn first_handler_from(&self, from: Option<SlotId>) -> Option<(SlotId, HandlerRef)> {
        let mut cursor = from;
        while let Some(id) = cursor {
            let node = self.slots.get(id.index())?.as_ref()?;
            if let Some(handler) = &node.handler {
                return Some((id, Arc::clone(handler)));
            }
            cursor = node.right;
        }
        None
    }

    /// 自 `from` 起（含）向左找到第一个装有 Handler 的槽位。
    fn last_handler_from(&self, from: Option<SlotId>) -> Option<(SlotId, HandlerRef)> {
        let mut cursor = from;
        while let Some(id) = cursor {
            let node = self.slots.get(id.index())?.as_ref()?;
            if let Some(handler) = &node.handler {
                return Some((id, Arc::clone(handler)));
            }
            cursor = node.left;
        }
        None
    }

    /// Handler 增删后重算每个槽位的上游消息开销。
    fn recompute_overheads(&mut self) {
        let mut accumulated = 0usize;
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let Some(node) = self.slots.get_mut(id.index()).and_then(|slot| slot.as_mut()) else {
                break;
            };
            node.upstream_message_overhead = accumulated;
            if let Some(handler) = &node.handler {
                accumulated = accumulated.saturating_add(handler.message_overhead());
            }
            cursor = node.right;
        }
    }
}

fn stale_slot() -> CoreError {
    CoreError::new(codes::CHANNEL_STALE, "slot was removed or channel torn down")
}

struct CallbackCell {
    setup: Option<SetupCallback>,
    shutdown: Option<ShutdownCallback>,
}

struct ChannelShared {
    event_loop: Arc<EventLoop>,
    options: ChannelOptions,
    pool: MessagePool,
    pipeline: Mutex<Pipeline>,
    callbacks: Mutex<CallbackCell>,
    holds: AtomicUsize,
    destroy_requested: AtomicBool,
}

/// 管线容器与生命周期锚点。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把一条连接的全部处理阶段组织为双向槽位链，由唯一一条事件循环线程
///   驱动，省去内部锁竞争并给 Handler 一个单线程的世界观。
/// - 关闭是带背压的两阶段协议：读方向排空后才允许写方向冲刷，保证中途
///   不会丢失已接收或待发送的数据。
///
/// ## 契约说明（What）
/// - `new` 调度装配任务并在循环线程上触发一次 `on_setup_completed`；
/// - `shutdown` 可在任意线程调用，重复调用除把 `urgent` 从假升级为真外
///   没有其他可观测效果；
/// - `destroy` 仅在关闭完成后合法，真正的内存回收要等到持有数归零；
/// - 克隆 `Channel` 只是克隆句柄；槽位与 Handler 的所有权始终在通道内部。
///
/// ## 注意事项（Trade-offs）
/// - 内部 `Mutex` 按线程亲和约定不会出现竞争，仅用来让句柄满足
///   `Send + Sync`；Handler 回调前锁都会先释放，以允许回调重入通道 API。
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    /// 创建绑定到 `event_loop` 的通道并调度装配任务。
    ///
    /// 装配任务在循环线程上运行并触发 `on_setup_completed(channel, Ok(()))`；
    /// 若事件循环已经停止，回调以 `runtime.terminated` 错误触发，此后对该
    /// 通道调用 `shutdown`/`destroy` 仍然合法且等价于空操作。
    pub fn new(
        event_loop: &Arc<EventLoop>,
        options: ChannelOptions,
        callbacks: ChannelCallbacks,
    ) -> Channel {
        let shared = Arc::new(ChannelShared {
            event_loop: Arc::clone(event_loop),
            options,
            pool: MessagePool::new(options.max_fragment_size),
            pipeline: Mutex::new(Pipeline {
                slots: Vec::new(),
                head: None,
                phase: ShutdownPhase::NotStarted,
                latched_error: None,
                urgent: false,
                torn_down: false,
            }),
            callbacks: Mutex::new(CallbackCell {
                setup: callbacks.on_setup_completed,
                shutdown: callbacks.on_shutdown_completed,
            }),
            holds: AtomicUsize::new(0),
            destroy_requested: AtomicBool::new(false),
        });
        let channel = Channel { shared };
        let setup_target = channel.clone();
        event_loop.schedule_task_now(ChannelTask::new("channel-setup", move |status| {
            let callback = setup_target.shared.callbacks.lock().setup.take();
            let Some(callback) = callback else {
                return;
            };
            match status {
                TaskStatus::RunReady => {
                    tracing::debug!(target: "beacon_io::channel", "channel setup completed");
                    callback(&setup_target, Ok(()));
                }
                TaskStatus::Cancelled => callback(&setup_target, Err(runtime_terminated())),
            }
        }));
        channel
    }

    /// 通道绑定的事件循环。
    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.shared.event_loop
    }

    /// 当前线程是否为通道的事件循环线程。
    pub fn thread_is_callers_thread(&self) -> bool {
        self.shared.event_loop.thread_is_callers_thread()
    }

    /// 尽快在通道的事件循环上执行任务。任意线程可调用。
    pub fn schedule_task_now(&self, task: ChannelTask) {
        self.shared.event_loop.schedule_task_now(task);
    }

    /// 在指定时刻执行任务。任意线程可调用。
    pub fn schedule_task_future(&self, task: ChannelTask, run_at_nanos: u64) {
        self.shared.event_loop.schedule_task_future(task, run_at_nanos);
    }

    /// 读取事件循环时钟（纳秒）。
    pub fn current_clock_time_nanos(&self) -> u64 {
        self.shared.event_loop.current_clock_time_nanos()
    }

    /// 从通道消息池租借一条消息；`size_hint` 会被分片上限裁剪。
    pub fn acquire_message_from_pool(
        &self,
        message_type: MessageType,
        size_hint: usize,
    ) -> IoMessage {
        self.shared.pool.acquire(message_type, size_hint)
    }

    /// 通道消息池，供泄漏检查等观测使用。
    pub fn message_pool(&self) -> &MessagePool {
        &self.shared.pool
    }

    /// 分片尺寸上限。
    pub fn max_fragment_size(&self) -> usize {
        self.shared.options.max_fragment_size
    }

    /// 写入事件循环本地对象。
    pub fn put_local_object<T: Any + Send + Sync>(
        &self,
        value: Arc<T>,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        self.shared.event_loop.put_local_object(value)
    }

    /// 读取事件循环本地对象。
    pub fn fetch_local_object<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.shared.event_loop.fetch_local_object::<T>()
    }

    /// 移除事件循环本地对象。
    pub fn remove_local_object<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.shared.event_loop.remove_local_object::<T>()
    }

    /// 分配一个新槽位。第一条槽位隐式成为链头，后续槽位保持游离状态，
    /// 需经 `insert_left` / `insert_right` / `slot_insert_end` 接入链路。
    pub fn new_slot(&self) -> SlotHandle {
        debug_assert!(
            self.thread_is_callers_thread(),
            "slot creation must happen on the channel's event loop thread"
        );
        let id = {
            let mut pipeline = self.shared.pipeline.lock();
            let id = SlotId::new(pipeline.slots.len());
            pipeline.slots.push(Some(SlotNode::default()));
            if pipeline.head.is_none() {
                pipeline.head = Some(id);
            }
            id
        };
        SlotHandle::new(self.clone(), id)
    }

    /// 链头槽位（最左端）。
    pub fn first_slot(&self) -> Option<SlotHandle> {
        let head = self.shared.pipeline.lock().head?;
        Some(SlotHandle::new(self.clone(), head))
    }

    /// 把游离槽位接到链路最右端。
    pub fn slot_insert_end(&self, to_add: &SlotHandle) -> Result<(), CoreError> {
        debug_assert!(self.thread_is_callers_thread());
        let mut pipeline = self.shared.pipeline.lock();
        Self::ensure_detached(&pipeline, to_add.id())?;
        let Some(head) = pipeline.head else {
            pipeline.head = Some(to_add.id());
            return Ok(());
        };
        let mut rightmost = head;
        while let Some(next) = pipeline.node(rightmost)?.right {
            rightmost = next;
        }
        Self::link_after(&mut pipeline, rightmost, to_add.id())
    }

    /// 发起通道关闭。任意线程可调用；错误码在首次调用时闩存。
    pub fn shutdown(&self, error: Option<CoreError>) {
        self.shutdown_with_urgency(error, false);
    }

    /// 发起关闭并指定是否需要立即释放稀缺资源。
    ///
    /// 后续调用被忽略，唯一的例外是允许把 `urgent` 从假升级为真。
    pub fn shutdown_with_urgency(&self, error: Option<CoreError>, urgent: bool) {
        if self.thread_is_callers_thread() {
            self.begin_shutdown(error, urgent);
            return;
        }
        let target = self.clone();
        self.schedule_task_now(ChannelTask::new("channel-shutdown", move |_status| {
            // 即使任务被取消也要推进状态机，否则关闭回调永远不会投递
            target.begin_shutdown(error, urgent);
        }));
    }

    /// 关闭是否已经双向完成。
    pub fn shutdown_completed(&self) -> bool {
        self.shared.pipeline.lock().phase == ShutdownPhase::Completed
    }

    /// 阻止通道内存被回收。任意线程可调用，必须与 `release_hold` 配对。
    pub fn acquire_hold(&self) {
        self.shared.holds.fetch_add(1, Ordering::SeqCst);
    }

    /// 释放一次持有；若 `destroy` 已被请求且这是最后一次持有，
    /// 槽位与 Handler 将在当前线程上被回收。
    pub fn release_hold(&self) {
        let previous = self.shared.holds.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "release_hold without a matching acquire_hold");
        if previous == 1 {
            self.try_tear_down();
        }
    }

    /// 标记通道待销毁。仅在 `on_shutdown_completed` 触发后合法，
    /// 任意线程可调用；实际回收发生在持有数归零时。
    pub fn destroy(&self) {
        self.shared.destroy_requested.store(true, Ordering::SeqCst);
        self.try_tear_down();
    }

    fn try_tear_down(&self) {
        if !self.shared.destroy_requested.load(Ordering::SeqCst) {
            return;
        }
        if self.shared.holds.load(Ordering::SeqCst) != 0 {
            return;
        }
        let dropped: Vec<HandlerRef> = {
            let mut pipeline = self.shared.pipeline.lock();
            if pipeline.torn_down {
                return;
            }
            debug_assert!(
                pipeline.phase == ShutdownPhase::Completed || pipeline.head.is_none(),
                "channel destroyed before shutdown completed"
            );
            pipeline.torn_down = true;
            pipeline.head = None;
            pipeline
                .slots
                .drain(..)
                .flatten()
                .filter_map(|node| node.handler)
                .collect()
        };
        tracing::debug!(target: "beacon_io::channel", handlers = dropped.len(), "tearing down channel");
        // Handler 的析构在锁外发生
        drop(dropped);
    }

    fn begin_shutdown(&self, error: Option<CoreError>, urgent: bool) {
        let start = {
            let mut pipeline = self.shared.pipeline.lock();
            if pipeline.phase != ShutdownPhase::NotStarted {
                if urgent && !pipeline.urgent {
                    pipeline.urgent = true;
                }
                return;
            }
            pipeline.phase = ShutdownPhase::ReadShuttingDown;
            pipeline.latched_error = error;
            pipeline.urgent = urgent;
            let head = pipeline.head;
            (
                pipeline.first_handler_from(head),
                pipeline.latched_error.clone(),
                pipeline.urgent,
            )
        };
        let (target, latched, urgent_now) = start;
        tracing::debug!(
            target: "beacon_io::channel",
            error = latched.as_ref().map(|e| e.code()),
            urgent = urgent_now,
            "channel shutdown initiated"
        );
        match target {
            Some((id, handler)) => {
                let slot = SlotHandle::new(self.clone(), id);
                if let Err(shutdown_error) =
                    handler.shutdown(&slot, ChannelDirection::Read, latched, urgent_now)
                {
                    tracing::warn!(
                        target: "beacon_io::channel",
                        handler = handler.name(),
                        error = %shutdown_error,
                        "read shutdown failed; forcing completion for this slot"
                    );
                    self.on_handler_shutdown_complete(
                        id,
                        ChannelDirection::Read,
                        Some(shutdown_error),
                        urgent_now,
                    );
                }
            }
            None => {
                // 链上没有任何 Handler：读写两阶段都无事可做，直接完成
                self.shared.pipeline.lock().phase = ShutdownPhase::Completed;
                self.deliver_shutdown_completed();
            }
        }
    }

    /// Handler 完成某方向的关闭后推进状态机。
    ///
    /// 读方向向右推进；最右槽位完成后状态切换为写关闭并从同一槽位向左
    /// 回推；最左槽位完成写关闭时投递 `on_shutdown_completed`。
    pub(crate) fn on_handler_shutdown_complete(
        &self,
        from: SlotId,
        direction: ChannelDirection,
        error: Option<CoreError>,
        urgent: bool,
    ) {
        let mut pending = Some((from, direction, error, urgent));
        while let Some((slot_id, direction, error, urgent)) = pending.take() {
            enum Next {
                Invoke(SlotId, HandlerRef, ChannelDirection),
                Complete,
                Ignore,
            }
            let (next, latched, urgent_now) = {
                let mut pipeline = self.shared.pipeline.lock();
                if error.is_some() && pipeline.latched_error.is_none() {
                    pipeline.latched_error = error;
                }
                if urgent && !pipeline.urgent {
                    pipeline.urgent = true;
                }
                let next = match direction {
                    ChannelDirection::Read => {
                        if pipeline.phase != ShutdownPhase::ReadShuttingDown {
                            Next::Ignore
                        } else {
                            let right = pipeline.node(slot_id).ok().and_then(|node| node.right);
                            match pipeline.first_handler_from(right) {
                                Some((id, handler)) => {
                                    Next::Invoke(id, handler, ChannelDirection::Read)
                                }
                                None => {
                                    // 读方向排空，从最右完成者开始写方向回推
                                    pipeline.phase = ShutdownPhase::WriteShuttingDown;
                                    match pipeline.last_handler_from(Some(slot_id)) {
                                        Some((id, handler)) => {
                                            Next::Invoke(id, handler, ChannelDirection::Write)
                                        }
                                        None => {
                                            pipeline.phase = ShutdownPhase::Completed;
                                            Next::Complete
                                        }
                                    }
                                }
                            }
                        }
                    }
                    ChannelDirection::Write => {
                        if pipeline.phase != ShutdownPhase::WriteShuttingDown {
                            Next::Ignore
                        } else {
                            let left = pipeline.node(slot_id).ok().and_then(|node| node.left);
                            match pipeline.last_handler_from(left) {
                                Some((id, handler)) => {
                                    Next::Invoke(id, handler, ChannelDirection::Write)
                                }
                                None => {
                                    pipeline.phase = ShutdownPhase::Completed;
                                    Next::Complete
                                }
                            }
                        }
                    }
                };
                (next, pipeline.latched_error.clone(), pipeline.urgent)
            };
            match next {
                Next::Invoke(id, handler, direction) => {
                    let slot = SlotHandle::new(self.clone(), id);
                    if let Err(shutdown_error) =
                        handler.shutdown(&slot, direction, latched, urgent_now)
                    {
                        tracing::warn!(
                            target: "beacon_io::channel",
                            handler = handler.name(),
                            ?direction,
                            error = %shutdown_error,
                            "handler shutdown failed; forcing completion for this slot"
                        );
                        pending = Some((id, direction, Some(shutdown_error), urgent_now));
                    }
                }
                Next::Complete => self.deliver_shutdown_completed(),
                Next::Ignore => {
                    tracing::warn!(
                        target: "beacon_io::channel",
                        ?direction,
                        "ignoring out-of-phase shutdown completion"
                    );
                }
            }
        }
    }

    fn deliver_shutdown_completed(&self) {
        let error = self.shared.pipeline.lock().latched_error.clone();
        let callback = self.shared.callbacks.lock().shutdown.take();
        tracing::debug!(
            target: "beacon_io::channel",
            error = error.as_ref().map(|e| e.code()),
            "channel shutdown completed"
        );
        if let Some(callback) = callback {
            callback(self, error);
        }
    }

    fn ensure_detached(pipeline: &Pipeline, id: SlotId) -> Result<(), CoreError> {
        let node = pipeline.node(id)?;
        if node.left.is_some() || node.right.is_some() || pipeline.head == Some(id) {
            return Err(CoreError::new(
                codes::CHANNEL_STALE,
                "slot is already linked into the pipeline",
            ));
        }
        Ok(())
    }

    fn link_after(pipeline: &mut Pipeline, anchor: SlotId, to_add: SlotId) -> Result<(), CoreError> {
        let anchor_right = pipeline.node(anchor)?.right;
        {
            let node = pipeline.node_mut(to_add)?;
            node.left = Some(anchor);
            node.right = anchor_right;
        }
        if let Some(right) = anchor_right {
            pipeline.node_mut(right)?.left = Some(to_add);
        }
        pipeline.node_mut(anchor)?.right = Some(to_add);
        pipeline.recompute_overheads();
        Ok(())
    }

    pub(crate) fn slot_insert_right(&self, anchor: SlotId, to_add: SlotId) -> Result<(), CoreError> {
        debug_assert!(self.thread_is_callers_thread());
        let mut pipeline = self.shared.pipeline.lock();
        Self::ensure_detached(&pipeline, to_add)?;
        Self::link_after(&mut pipeline, anchor, to_add)
    }

    pub(crate) fn slot_insert_left(&self, anchor: SlotId, to_add: SlotId) -> Result<(), CoreError> {
        debug_assert!(self.thread_is_callers_thread());
        let mut pipeline = self.shared.pipeline.lock();
        Self::ensure_detached(&pipeline, to_add)?;
        let anchor_left = pipeline.node(anchor)?.left;
        {
            let node = pipeline.node_mut(to_add)?;
            node.left = anchor_left;
            node.right = Some(anchor);
        }
        if let Some(left) = anchor_left {
            pipeline.node_mut(left)?.right = Some(to_add);
        }
        pipeline.node_mut(anchor)?.left = Some(to_add);
        if pipeline.head == Some(anchor) {
            pipeline.head = Some(to_add);
        }
        pipeline.recompute_overheads();
        Ok(())
    }

    pub(crate) fn slot_set_handler(&self, id: SlotId, handler: HandlerRef) -> Result<(), CoreError> {
        debug_assert!(self.thread_is_callers_thread());
        {
            let mut pipeline = self.shared.pipeline.lock();
            let node = pipeline.node_mut(id)?;
            if node.handler.is_some() {
                return Err(CoreError::new(
                    codes::CHANNEL_HANDLER_EXISTS,
                    "slot handler may only be set once",
                ));
            }
            node.handler = Some(Arc::clone(&handler));
            pipeline.recompute_overheads();
        }
        // Handler 的初始窗口作为一次窗口增量向上游传播
        self.slot_increment_read_window(id, handler.initial_window_size())
    }

    pub(crate) fn slot_remove(&self, id: SlotId) -> Result<(), CoreError> {
        debug_assert!(self.thread_is_callers_thread());
        let dropped = {
            let mut pipeline = self.shared.pipeline.lock();
            let node = pipeline
                .slots
                .get_mut(id.index())
                .and_then(|slot| slot.take())
                .ok_or_else(stale_slot)?;
            if let Some(left) = node.left {
                pipeline.node_mut(left)?.right = node.right;
            }
            if let Some(right) = node.right {
                pipeline.node_mut(right)?.left = node.left;
            }
            if pipeline.head == Some(id) {
                pipeline.head = node.right;
            }
            pipeline.recompute_overheads();
            node.handler
        };
        drop(dropped);
        Ok(())
    }

    pub(crate) fn slot_replace(&self, old: SlotId, new: SlotId) -> Result<(), CoreError> {
        debug_assert!(self.thread_is_callers_thread());
        let dropped = {
            let mut pipeline = self.shared.pipeline.lock();
            Self::ensure_detached(&pipeline, new)?;
            let old_node = pipeline
                .slots
                .get_mut(old.index())
                .and_then(|slot| slot.take())
                .ok_or_else(stale_slot)?;
            {
                let node = pipeline.node_mut(new)?;
                node.left = old_node.left;
                node.right = old_node.right;
            }
            if let Some(left) = old_node.left {
                pipeline.node_mut(left)?.right = Some(new);
            }
            if let Some(right) = old_node.right {
                pipeline.node_mut(right)?.left = Some(new);
            }
            if pipeline.head == Some(old) {
                pipeline.head = Some(new);
            }
            pipeline.recompute_overheads();
            old_node.handler
        };
        drop(dropped);
        Ok(())
    }

    pub(crate) fn slot_send_message(
        &self,
        id: SlotId,
        message: IoMessage,
        direction: ChannelDirection,
    ) -> Result<(), SendMessageError> {
        debug_assert!(self.thread_is_callers_thread());
        let (target_id, handler) = {
            let mut pipeline = self.shared.pipeline.lock();
            let neighbor = match pipeline.node(id) {
                Ok(node) => match direction {
                    ChannelDirection::Read => node.right,
                    ChannelDirection::Write => node.left,
                },
                Err(error) => {
                    return Err(SendMessageError {
                        error,
                        message: Some(message),
                    });
                }
            };
            let Some(target_id) = neighbor else {
                return Err(SendMessageError {
                    error: CoreError::new(
                        codes::CHANNEL_NO_NEIGHBOR,
                        "no adjacent slot in the requested direction",
                    ),
                    message: Some(message),
                });
            };
            let target = match pipeline.node_mut(target_id) {
                Ok(node) => node,
                Err(error) => {
                    return Err(SendMessageError {
                        error,
                        message: Some(message),
                    });
                }
            };
            let Some(handler) = target.handler.clone() else {
                return Err(SendMessageError {
                    error: CoreError::new(
                        codes::CHANNEL_NO_NEIGHBOR,
                        "adjacent slot has no handler",
                    ),
                    message: Some(message),
                });
            };
            if direction == ChannelDirection::Read {
                let len = message.len();
                if target.window_size < len {
                    return Err(SendMessageError {
                        error: CoreError::new(
                            codes::CHANNEL_EXCEEDS_WINDOW,
                            "read message exceeds the downstream window",
                        ),
                        message: Some(message),
                    });
                }
                target.window_size -= len;
            }
            (target_id, handler)
        };
        tracing::trace!(
            target: "beacon_io::channel",
            ?direction,
            len = message.len(),
            handler = handler.name(),
            "forwarding message"
        );
        let slot = SlotHandle::new(self.clone(), target_id);
        let result = match direction {
            ChannelDirection::Read => handler.process_read_message(&slot, message),
            ChannelDirection::Write => handler.process_write_message(&slot, message),
        };
        result.map_err(|error| SendMessageError {
            error,
            message: None,
        })
    }

    pub(crate) fn slot_increment_read_window(
        &self,
        id: SlotId,
        delta: usize,
    ) -> Result<(), CoreError> {
        debug_assert!(self.thread_is_callers_thread());
        let upstream = {
            let mut pipeline = self.shared.pipeline.lock();
            let max_window = self.shared.options.max_window;
            let node = pipeline.node_mut(id)?;
            node.window_size = node.window_size.saturating_add(delta).min(max_window);
            let left = node.left;
            left.and_then(|left_id| {
                pipeline
                    .node(left_id)
                    .ok()
                    .and_then(|node| node.handler.clone())
                    .map(|handler| (left_id, handler))
            })
        };
        match upstream {
            Some((left_id, handler)) => {
                let slot = SlotHandle::new(self.clone(), left_id);
                handler.increment_read_window(&slot, delta)
            }
            None => Ok(()),
        }
    }

    pub(crate) fn slot_shutdown(
        &self,
        id: SlotId,
        direction: ChannelDirection,
        error: Option<CoreError>,
        urgent: bool,
    ) -> Result<(), CoreError> {
        debug_assert!(self.thread_is_callers_thread());
        let handler = {
            let pipeline = self.shared.pipeline.lock();
            pipeline.node(id)?.handler.clone()
        }
        .ok_or_else(stale_slot)?;
        let slot = SlotHandle::new(self.clone(), id);
        handler.shutdown(&slot, direction, error, urgent)
    }

    pub(crate) fn slot_downstream_read_window(&self, id: SlotId) -> usize {
        let pipeline = self.shared.pipeline.lock();
        pipeline
            .node(id)
            .ok()
            .and_then(|node| node.right)
            .and_then(|right| pipeline.node(right).ok())
            .map(|node| node.window_size)
            .unwrap_or(0)
    }

    pub(crate) fn slot_upstream_message_overhead(&self, id: SlotId) -> usize {
        self.shared
            .pipeline
            .lock()
            .node(id)
            .map(|node| node.upstream_message_overhead)
            .unwrap_or(0)
    }

    pub(crate) fn slot_window_size(&self, id: SlotId) -> usize {
        self.shared
            .pipeline
            .lock()
            .node(id)
            .map(|node| node.window_size)
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pipeline = self.shared.pipeline.lock();
        f.debug_struct("Channel")
            .field("slots", &pipeline.slots.iter().flatten().count())
            .field("phase", &pipeline.phase)
            .field("holds", &self.shared.holds.load(Ordering::Relaxed))
            .finish()
    }
}
