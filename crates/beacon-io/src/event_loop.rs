use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::LocalSet;

use crate::error::{CoreError, codes};
use crate::task::{ChannelTask, TaskGuard, TaskStatus};

/// 事件循环：一条工作线程加一个按投递顺序派发的任务队列。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 管线的全部内部状态都以“线程亲和”方式归属唯一一条事件循环线程，
///   外部线程只能通过任务投递与之交互；本类型即该契约的宿主。
/// - 线程内部运行一个 tokio current-thread 运行时与 `LocalSet`，使套接字
///   Handler 可以在循环线程上 `spawn_local` 读写协程，而不引入多线程竞争。
///
/// ## 核心逻辑（How）
/// - 构造时启动线程：线程先建立运行时并回传自身 `ThreadId`，随后在
///   `LocalSet::run_until` 中消费命令队列；
/// - `schedule_task_now` 将任务包进取消守卫后入队；队列关闭（循环停机）时
///   任务在调用线程上以 `Cancelled` 状态就地执行；
/// - `schedule_task_future` 在循环线程上挂一个定时协程，循环停机时挂起的
///   定时任务随 `LocalSet` 析构并以 `Cancelled` 收尾。
///
/// ## 契约说明（What）
/// - 同一线程投递的任务按投递顺序执行；跨线程之间不保证相对顺序；
/// - `thread_is_callers_thread` 判定当前线程是否为循环线程；
/// - 本地对象存储以 `TypeId` 为键，值为 `Arc<dyn Any>`，供跨任务共享每循环
///   单例（如 TLS 线程局部状态的宿主）。
pub struct EventLoop {
    tx: mpsc::UnboundedSender<LoopCommand>,
    thread_id: ThreadId,
    locals: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
    stopped: AtomicBool,
}

enum LoopCommand {
    Run(TaskGuard),
    RunAt(TaskGuard, u64),
    Stop,
}

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// 进程级单调时钟，纳秒。所有事件循环共享同一时间原点。
pub fn current_clock_time_nanos() -> u64 {
    CLOCK_EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

impl EventLoop {
    fn start(index: usize) -> Result<Arc<Self>, CoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let join = thread::Builder::new()
            .name(format!("beacon-loop-{index}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(error) => {
                        let _ = ready_tx.send(Err(error));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(thread::current().id()));
                let local = LocalSet::new();
                runtime.block_on(local.run_until(Self::drive(rx)));
                // LocalSet 析构时，尚未触发的定时任务经由守卫补投 Cancelled
            })
            .map_err(|error| {
                crate::error::map_io_error(codes::RUNTIME_TERMINATED, "spawn event loop", error)
            })?;

        let thread_id = match ready_rx.recv() {
            Ok(Ok(id)) => id,
            Ok(Err(error)) => {
                let _ = join.join();
                return Err(crate::error::map_io_error(
                    codes::RUNTIME_TERMINATED,
                    "build loop runtime",
                    error,
                ));
            }
            Err(_) => {
                let _ = join.join();
                return Err(CoreError::new(
                    codes::RUNTIME_TERMINATED,
                    "event loop thread exited during startup",
                ));
            }
        };

        Ok(Arc::new(Self {
            tx,
            thread_id,
            locals: Mutex::new(HashMap::new()),
            join: Mutex::new(Some(join)),
            stopped: AtomicBool::new(false),
        }))
    }

    async fn drive(mut rx: mpsc::UnboundedReceiver<LoopCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                LoopCommand::Run(guard) => guard.run(TaskStatus::RunReady),
                LoopCommand::RunAt(guard, run_at_nanos) => {
                    tokio::task::spawn_local(async move {
                        let now = current_clock_time_nanos();
                        if run_at_nanos > now {
                            tokio::time::sleep(Duration::from_nanos(run_at_nanos - now)).await;
                        }
                        guard.run(TaskStatus::RunReady);
                    });
                }
                LoopCommand::Stop => break,
            }
        }
        // 停机后清空剩余队列，守卫会把任务以 Cancelled 状态收尾
        while rx.try_recv().is_ok() {}
    }

    /// 尽快在循环线程上执行任务。任意线程可调用。
    pub fn schedule_task_now(&self, task: ChannelTask) {
        let tag = task.type_tag();
        if self
            .tx
            .send(LoopCommand::Run(TaskGuard::new(task)))
            .is_err()
        {
            tracing::warn!(
                target: "beacon_io::event_loop",
                tag,
                "scheduling on a stopped event loop; task cancelled inline"
            );
        }
    }

    /// 在指定的单调时间（纳秒，见 [`current_clock_time_nanos`]）执行任务。
    pub fn schedule_task_future(&self, task: ChannelTask, run_at_nanos: u64) {
        let tag = task.type_tag();
        if self
            .tx
            .send(LoopCommand::RunAt(TaskGuard::new(task), run_at_nanos))
            .is_err()
        {
            tracing::warn!(
                target: "beacon_io::event_loop",
                tag,
                "scheduling on a stopped event loop; task cancelled inline"
            );
        }
    }

    /// 判断当前线程是否为该循环的工作线程。
    pub fn thread_is_callers_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// 读取循环时钟。
    pub fn current_clock_time_nanos(&self) -> u64 {
        current_clock_time_nanos()
    }

    /// 写入每循环本地对象，返回同键位上被替换的旧值。
    pub fn put_local_object<T: Any + Send + Sync>(
        &self,
        value: Arc<T>,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        self.locals.lock().insert(TypeId::of::<T>(), value)
    }

    /// 读取每循环本地对象。
    pub fn fetch_local_object<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let stored = self.locals.lock().get(&TypeId::of::<T>()).cloned()?;
        stored.downcast::<T>().ok()
    }

    /// 移除每循环本地对象。
    pub fn remove_local_object<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let stored = self.locals.lock().remove(&TypeId::of::<T>())?;
        stored.downcast::<T>().ok()
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(LoopCommand::Stop);
        }
    }

    fn join_thread(&self) {
        if self.thread_is_callers_thread() {
            return;
        }
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread_id", &self.thread_id)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

/// 固定规模的事件循环组，按轮转方式分派新通道与新连接。
pub struct EventLoopGroup {
    loops: Vec<Arc<EventLoop>>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    /// 启动 `loop_count` 条事件循环线程（至少 1 条）。
    pub fn new(loop_count: usize) -> Result<Arc<Self>, CoreError> {
        let loop_count = loop_count.max(1);
        let mut loops = Vec::with_capacity(loop_count);
        for index in 0..loop_count {
            loops.push(EventLoop::start(index)?);
        }
        Ok(Arc::new(Self {
            loops,
            next: AtomicUsize::new(0),
        }))
    }

    pub fn loop_count(&self) -> usize {
        self.loops.len()
    }

    pub fn loop_at(&self, index: usize) -> Option<Arc<EventLoop>> {
        self.loops.get(index).cloned()
    }

    /// 轮转取下一条事件循环。
    pub fn next_loop(&self) -> Arc<EventLoop> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        Arc::clone(&self.loops[index])
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        for event_loop in &self.loops {
            event_loop.stop();
        }
        for event_loop in &self.loops {
            event_loop.join_thread();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn tasks_run_in_submission_order_on_the_loop_thread() {
        let group = EventLoopGroup::new(1).expect("start group");
        let event_loop = group.next_loop();
        let (tx, rx) = mpsc::channel();
        for index in 0..8usize {
            let tx = tx.clone();
            let el = Arc::clone(&event_loop);
            event_loop.schedule_task_now(ChannelTask::new("ordered", move |status| {
                assert_eq!(status, TaskStatus::RunReady);
                assert!(el.thread_is_callers_thread());
                tx.send(index).expect("report order");
            }));
        }
        let order: Vec<usize> = (0..8).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn future_task_does_not_run_early() {
        let group = EventLoopGroup::new(1).expect("start group");
        let event_loop = group.next_loop();
        let (tx, rx) = mpsc::channel();
        let scheduled_at = current_clock_time_nanos();
        let delay = Duration::from_millis(50);
        event_loop.schedule_task_future(
            ChannelTask::new("timed", move |status| {
                assert_eq!(status, TaskStatus::RunReady);
                tx.send(current_clock_time_nanos()).unwrap();
            }),
            scheduled_at + delay.as_nanos() as u64,
        );
        let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired_at >= scheduled_at + delay.as_nanos() as u64);
    }

    #[test]
    fn stopping_the_group_cancels_pending_timed_tasks() {
        let group = EventLoopGroup::new(1).expect("start group");
        let event_loop = group.next_loop();
        let (tx, rx) = mpsc::channel();
        event_loop.schedule_task_future(
            ChannelTask::new("never", move |status| {
                tx.send(status).unwrap();
            }),
            current_clock_time_nanos() + Duration::from_secs(3600).as_nanos() as u64,
        );
        // 等待任务进入循环线程再停机
        std::thread::sleep(Duration::from_millis(50));
        drop(group);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            TaskStatus::Cancelled
        );
    }

    #[test]
    fn local_objects_round_trip_by_type() {
        let group = EventLoopGroup::new(1).expect("start group");
        let event_loop = group.next_loop();
        struct Marker(u32);
        assert!(event_loop.fetch_local_object::<Marker>().is_none());
        event_loop.put_local_object(Arc::new(Marker(7)));
        assert_eq!(event_loop.fetch_local_object::<Marker>().unwrap().0, 7);
        assert!(event_loop.remove_local_object::<Marker>().is_some());
        assert!(event_loop.fetch_local_object::<Marker>().is_none());
    }

    #[test]
    fn round_robin_cycles_through_loops() {
        let group = EventLoopGroup::new(2).expect("start group");
        let first = group.next_loop();
        let second = group.next_loop();
        let third = group.next_loop();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
    }
}
