//! beacon-io：事件循环亲和的异步 I/O 管道与连接引导核心。
//!
//! ## 模块说明（What）
//! - [`channel`]：绑定单条事件循环的 Slot/Handler 双向管线，含读窗口流控、
//!   两阶段关闭状态机与基于持有计数的生命周期。
//! - [`bootstrap`]：客户端（解析 + 跨地址建连竞速）与服务端（监听 + 每
//!   连接装配）引导，可选 TLS/ALPN 阶段的组合。
//! - [`event_loop`]：每线程一条的事件循环与轮转分派的循环组。
//! - [`socket`] / [`handlers`]：流式套接字封装与内置的管线阶段。
//! - [`resolver`] / [`tls`]：主机名解析与 TLS 协商的外部协作契约。
//!
//! ## 并发模型（Why）
//! - 通道终生绑定一条事件循环线程，所有槽位级操作都在该线程上发生；
//!   跨线程入口（`shutdown`、任务调度、`destroy`、持有计数）内部负责
//!   把工作转投到归属线程。
//! - 引导对象跨线程共享，字段在任何操作前写定、此后只读。

pub mod bootstrap;
pub mod channel;
pub mod error;
pub mod event_loop;
pub mod handlers;
pub mod message;
pub mod resolver;
pub mod socket;
pub mod task;
pub mod tls;

pub use error::CoreError;

/// 常用类型一站式导入。
pub mod prelude {
    pub use crate::bootstrap::{
        ClientBootstrap, ServerBootstrap, ServerListener, ServerListenerOptions,
    };
    pub use crate::channel::{
        Channel, ChannelCallbacks, ChannelDirection, ChannelHandler, ChannelOptions, HandlerRef,
        SendMessageError, SlotHandle,
    };
    pub use crate::error::{CoreError, codes};
    pub use crate::event_loop::{EventLoop, EventLoopGroup};
    pub use crate::handlers::{AlpnChannelHandler, SocketChannelHandler};
    pub use crate::message::{IoMessage, MessagePool, MessageType};
    pub use crate::resolver::{
        AddressRecordType, HostAddress, HostResolver, ResolutionConfig, SystemHostResolver,
    };
    pub use crate::socket::{Socket, SocketDomain, SocketEndpoint, SocketOptions, SocketType};
    pub use crate::task::{ChannelTask, TaskStatus};
    pub use crate::tls::{TlsChannelHandler, TlsConnectionOptions, TlsProvider};
}
