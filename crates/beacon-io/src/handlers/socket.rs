//! 套接字 Handler：管线最左端的传输阶段。
//!
//! 读取完全由下游读窗口驱动：窗口增量唤醒读协程，单次读取不超过
//! `min(窗口, 分片上限)`；写入按到达顺序排队冲刷。紧急关闭时两个流半部
//! 立即被丢弃，这是稀缺资源（fd）必须在 `shutdown` 返回前释放的契约。

use std::collections::VecDeque;
use std::io;
use std::slice;
use std::sync::{Arc, Weak};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::channel::{ChannelDirection, ChannelHandler, SlotHandle};
use crate::error::{CoreError, codes, map_io_error};
use crate::message::MessageType;
use crate::socket::{Socket, StreamKind};

enum ReadHalf {
    Tcp(tokio::net::tcp::OwnedReadHalf),
    #[cfg(unix)]
    Unix(tokio::net::unix::OwnedReadHalf),
}

enum WriteHalf {
    Tcp(tokio::net::tcp::OwnedWriteHalf),
    #[cfg(unix)]
    Unix(tokio::net::unix::OwnedWriteHalf),
}

struct ReadState {
    half: Option<ReadHalf>,
    task: Option<AbortHandle>,
    started: bool,
    stopped: bool,
}

struct WriteState {
    half: Option<WriteHalf>,
    queue: VecDeque<crate::message::IoMessage>,
    task: Option<AbortHandle>,
    writing: bool,
    pending_shutdown: Option<(Option<CoreError>, bool)>,
    stopped: bool,
}

/// 管线最左端的套接字 I/O 阶段。
pub struct SocketChannelHandler {
    weak_self: Weak<SocketChannelHandler>,
    slot: SlotHandle,
    max_fragment_size: usize,
    read: Mutex<ReadState>,
    write: Mutex<WriteState>,
    read_wake: Notify,
}

impl SocketChannelHandler {
    /// 接管 `socket` 的流并注册到当前事件循环。
    ///
    /// 必须在 `slot` 所属通道的事件循环线程上调用。
    pub fn new(
        socket: &Socket,
        slot: &SlotHandle,
        max_fragment_size: usize,
    ) -> Result<Arc<Self>, CoreError> {
        debug_assert!(slot.channel().thread_is_callers_thread());
        let stream = socket.take_stream()?;
        let (read_half, write_half) = match stream {
            StreamKind::Tcp(std_stream) => {
                let stream = tokio::net::TcpStream::from_std(std_stream).map_err(|error| {
                    map_io_error(codes::SOCKET_NOT_CONNECTED, "register stream", error)
                })?;
                let (read, write) = stream.into_split();
                (ReadHalf::Tcp(read), WriteHalf::Tcp(write))
            }
            #[cfg(unix)]
            StreamKind::Unix(std_stream) => {
                let stream = tokio::net::UnixStream::from_std(std_stream).map_err(|error| {
                    map_io_error(codes::SOCKET_NOT_CONNECTED, "register stream", error)
                })?;
                let (read, write) = stream.into_split();
                (ReadHalf::Unix(read), WriteHalf::Unix(write))
            }
        };
        Ok(Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            slot: slot.clone(),
            max_fragment_size,
            read: Mutex::new(ReadState {
                half: Some(read_half),
                task: None,
                started: false,
                stopped: false,
            }),
            write: Mutex::new(WriteState {
                half: Some(write_half),
                queue: VecDeque::new(),
                task: None,
                writing: false,
                pending_shutdown: None,
                stopped: false,
            }),
            read_wake: Notify::new(),
        }))
    }

    fn ensure_read_task(&self) {
        let mut read = self.read.lock();
        if read.stopped {
            return;
        }
        if read.started {
            drop(read);
            self.read_wake.notify_one();
            return;
        }
        read.started = true;
        drop(read);
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let handle = tokio::task::spawn_local(Self::drive_reads(this));
        self.read.lock().task = Some(handle.abort_handle());
    }

    async fn drive_reads(this: Arc<Self>) {
        loop {
            if this.read.lock().stopped {
                return;
            }
            let window = this.slot.downstream_read_window();
            if window == 0 {
                this.read_wake.notified().await;
                continue;
            }
            let capacity = window.min(this.max_fragment_size);
            let mut message = this
                .slot
                .channel()
                .acquire_message_from_pool(MessageType::ReadData, capacity);
            let Some(mut half) = this.read.lock().half.take() else {
                return;
            };
            let result = read_some(&mut half, message.data_mut(), capacity).await;
            {
                let mut read = this.read.lock();
                if read.stopped {
                    // 关闭期间被唤醒：半部随本协程丢弃
                    return;
                }
                read.half = Some(half);
            }
            match result {
                Ok(0) => {
                    // 对端有序关闭
                    tracing::debug!(target: "beacon_io::socket", "peer closed the read side");
                    this.slot.channel().shutdown(None);
                    return;
                }
                Ok(_bytes) => {
                    if let Err(send_error) =
                        this.slot.send_message(message, ChannelDirection::Read)
                    {
                        tracing::warn!(
                            target: "beacon_io::socket",
                            error = %send_error.error,
                            "failed to forward read message"
                        );
                        this.slot.channel().shutdown(Some(send_error.error));
                        return;
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    this.slot.channel().shutdown(Some(map_io_error(
                        codes::SOCKET_READ_FAILED,
                        "socket read",
                        error,
                    )));
                    return;
                }
            }
        }
    }

    async fn drive_writes(this: Arc<Self>) {
        loop {
            let message = {
                let mut write = this.write.lock();
                match write.queue.pop_front() {
                    Some(message) => message,
                    None => {
                        write.writing = false;
                        write.task = None;
                        let pending = write.pending_shutdown.take();
                        drop(write);
                        if let Some((error, urgent)) = pending {
                            this.finish_write_shutdown(error, urgent);
                        }
                        return;
                    }
                }
            };
            let Some(mut half) = this.write.lock().half.take() else {
                // 紧急关闭已丢弃写半部，队列余量就地释放
                drop(message);
                continue;
            };
            let result = write_all(&mut half, message.data()).await;
            drop(message);
            {
                let mut write = this.write.lock();
                if !write.stopped {
                    write.half = Some(half);
                }
            }
            if let Err(error) = result {
                let pending = {
                    let mut write = this.write.lock();
                    write.writing = false;
                    write.task = None;
                    write.queue.clear();
                    write.pending_shutdown.take()
                };
                let mapped = map_io_error(codes::SOCKET_WRITE_FAILED, "socket write", error);
                this.slot.channel().shutdown(Some(mapped.clone()));
                if let Some((_, urgent)) = pending {
                    this.finish_write_shutdown(Some(mapped), urgent);
                }
                return;
            }
        }
    }

    fn finish_write_shutdown(&self, error: Option<CoreError>, urgent: bool) {
        {
            let mut write = self.write.lock();
            write.stopped = true;
            // 丢弃写半部即发送 FIN
            write.half = None;
        }
        self.slot
            .on_handler_shutdown_complete(ChannelDirection::Write, error, urgent);
    }
}

impl ChannelHandler for SocketChannelHandler {
    fn process_read_message(
        &self,
        _slot: &SlotHandle,
        _message: crate::message::IoMessage,
    ) -> Result<(), CoreError> {
        Err(CoreError::new(
            codes::CHANNEL_UNEXPECTED_MESSAGE,
            "socket handler is the leftmost stage and takes no read messages",
        ))
    }

    fn process_write_message(
        &self,
        _slot: &SlotHandle,
        message: crate::message::IoMessage,
    ) -> Result<(), CoreError> {
        let spawn = {
            let mut write = self.write.lock();
            if write.stopped {
                return Err(CoreError::new(
                    codes::SOCKET_CLOSED,
                    "socket write side is shut down",
                ));
            }
            write.queue.push_back(message);
            if write.writing {
                false
            } else {
                write.writing = true;
                true
            }
        };
        if spawn {
            let Some(this) = self.weak_self.upgrade() else {
                return Ok(());
            };
            let handle = tokio::task::spawn_local(Self::drive_writes(this));
            self.write.lock().task = Some(handle.abort_handle());
        }
        Ok(())
    }

    fn increment_read_window(&self, _slot: &SlotHandle, _size: usize) -> Result<(), CoreError> {
        self.ensure_read_task();
        Ok(())
    }

    fn shutdown(
        &self,
        slot: &SlotHandle,
        direction: ChannelDirection,
        error: Option<CoreError>,
        urgent: bool,
    ) -> Result<(), CoreError> {
        match direction {
            ChannelDirection::Read => {
                {
                    let mut read = self.read.lock();
                    read.stopped = true;
                    if let Some(handle) = read.task.take() {
                        handle.abort();
                    }
                    if urgent {
                        read.half = None;
                        let mut write = self.write.lock();
                        write.stopped = true;
                        write.queue.clear();
                        write.half = None;
                        write.writing = false;
                        if let Some(handle) = write.task.take() {
                            handle.abort();
                        }
                    }
                }
                self.read_wake.notify_one();
                slot.on_handler_shutdown_complete(ChannelDirection::Read, error, urgent);
                Ok(())
            }
            ChannelDirection::Write => {
                let deferred = {
                    let mut write = self.write.lock();
                    if urgent {
                        write.stopped = true;
                        write.queue.clear();
                        write.half = None;
                        write.writing = false;
                        if let Some(handle) = write.task.take() {
                            handle.abort();
                        }
                        let mut read = self.read.lock();
                        read.stopped = true;
                        read.half = None;
                        if let Some(handle) = read.task.take() {
                            handle.abort();
                        }
                        false
                    } else if write.writing {
                        // 先冲刷队列，完成回调由写协程补投
                        write.pending_shutdown = Some((error.clone(), urgent));
                        true
                    } else {
                        false
                    }
                };
                if !deferred {
                    self.finish_write_shutdown(error, urgent);
                }
                Ok(())
            }
        }
    }

    fn initial_window_size(&self) -> usize {
        0
    }

    fn name(&self) -> &'static str {
        "socket"
    }
}

async fn read_some(half: &mut ReadHalf, buf: &mut BytesMut, limit: usize) -> io::Result<usize> {
    buf.reserve(limit);
    let chunk = buf.chunk_mut();
    let len = chunk.len().min(limit);
    let raw = unsafe { slice::from_raw_parts_mut(chunk.as_mut_ptr().cast::<u8>(), len) };
    let read = match half {
        ReadHalf::Tcp(half) => half.read(raw).await?,
        #[cfg(unix)]
        ReadHalf::Unix(half) => half.read(raw).await?,
    };
    if read > 0 {
        unsafe {
            buf.advance_mut(read);
        }
    }
    Ok(read)
}

async fn write_all(half: &mut WriteHalf, data: &[u8]) -> io::Result<()> {
    match half {
        WriteHalf::Tcp(half) => half.write_all(data).await,
        #[cfg(unix)]
        WriteHalf::Unix(half) => half.write_all(data).await,
    }
}
