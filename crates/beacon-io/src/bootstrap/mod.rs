//! 连接引导层：在套接字之上装配通道的客户端/服务端工厂。

pub mod client;
pub mod server;

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::event_loop::EventLoopGroup;
use crate::task::ChannelTask;
use crate::tls::TlsProvider;

pub use client::{ClientBootstrap, ClientSetupFn, ClientShutdownFn};
pub use server::{
    ServerBootstrap, ServerChannelShutdownFn, ServerIncomingFn, ServerListener,
    ServerListenerDestroyFn, ServerListenerOptions,
};

/// 在组内每条事件循环上同步清理 TLS 线程局部状态。
///
/// 引导释放意味着调用方不再使用它，需要趁事件循环线程还活着时完成清理：
/// 向每条循环投递一个清理任务，并用互斥量加条件变量逐条等待其执行完毕。
/// 若调用发生在某条循环自身的线程上，则就地执行以避免自等待。
pub(crate) fn ensure_thread_local_state_cleaned(
    group: &Arc<EventLoopGroup>,
    providers: &[Arc<dyn TlsProvider>],
) {
    if providers.is_empty() {
        return;
    }
    for index in 0..group.loop_count() {
        let Some(event_loop) = group.loop_at(index) else {
            continue;
        };
        if event_loop.thread_is_callers_thread() {
            for provider in providers {
                provider.clean_up_thread_local_state();
            }
            continue;
        }
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let task_gate = Arc::clone(&gate);
        let task_providers: Vec<Arc<dyn TlsProvider>> = providers.to_vec();
        event_loop.schedule_task_now(ChannelTask::new("tls-thread-local-cleanup", move |_status| {
            for provider in &task_providers {
                provider.clean_up_thread_local_state();
            }
            tracing::trace!(target: "beacon_io::bootstrap", "cleaned up thread local state");
            let (invoked, condvar) = &*task_gate;
            *invoked.lock() = true;
            condvar.notify_one();
        }));
        let (invoked, condvar) = &*gate;
        let mut done = invoked.lock();
        while !*done {
            condvar.wait(&mut done);
        }
    }
}
