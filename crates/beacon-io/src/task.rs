use std::fmt;

/// 任务派发状态：正常执行或因事件循环停止而取消。
///
/// 任务函数必须能够处理 `Cancelled` 并在该分支中完成必要的清理。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    RunReady,
    Cancelled,
}

/// 投递到事件循环的工作单元：一个一次性函数加一个用于日志的类型标签。
pub struct ChannelTask {
    task_fn: Box<dyn FnOnce(TaskStatus) + Send + 'static>,
    type_tag: &'static str,
}

impl ChannelTask {
    pub fn new(type_tag: &'static str, task_fn: impl FnOnce(TaskStatus) + Send + 'static) -> Self {
        Self {
            task_fn: Box::new(task_fn),
            type_tag,
        }
    }

    /// 任务标签，用于追踪日志。
    pub fn type_tag(&self) -> &'static str {
        self.type_tag
    }

    pub(crate) fn run(self, status: TaskStatus) {
        tracing::trace!(
            target: "beacon_io::task",
            tag = self.type_tag,
            ?status,
            "dispatching channel task"
        );
        (self.task_fn)(status);
    }
}

impl fmt::Debug for ChannelTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTask")
            .field("type_tag", &self.type_tag)
            .finish()
    }
}

/// 包装 [`ChannelTask`]，保证任务恰好被派发一次。
///
/// 若包装器在未执行的情况下被丢弃（事件循环停机、延时任务被抛弃），
/// 任务函数会以 [`TaskStatus::Cancelled`] 的形式收到最后一次回调。
pub(crate) struct TaskGuard(Option<ChannelTask>);

impl TaskGuard {
    pub(crate) fn new(task: ChannelTask) -> Self {
        Self(Some(task))
    }

    pub(crate) fn run(mut self, status: TaskStatus) {
        if let Some(task) = self.0.take() {
            task.run(status);
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.run(TaskStatus::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn guard_cancels_exactly_once_on_drop() {
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        let guard = TaskGuard::new(ChannelTask::new("test", move |status| {
            assert_eq!(status, TaskStatus::Cancelled);
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        drop(guard);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_run_suppresses_cancel() {
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        let guard = TaskGuard::new(ChannelTask::new("test", move |status| {
            assert_eq!(status, TaskStatus::RunReady);
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        guard.run(TaskStatus::RunReady);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
