//! 主机名解析契约与默认实现。
//!
//! 引导层只依赖 [`HostResolver`] 契约：异步解析一个主机名、回报连接失败
//! 以驱逐坏地址。[`SystemHostResolver`] 用系统解析器补上默认实现，带一层
//! 按 TTL 过期的结果缓存。

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{CoreError, codes};

/// 默认的解析结果存活时间（秒）。
const DEFAULT_DNS_TTL_SECS: u64 = 30;

/// 解析配置。
#[derive(Clone, Copy, Debug)]
pub struct ResolutionConfig {
    pub max_ttl: Duration,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            max_ttl: Duration::from_secs(DEFAULT_DNS_TTL_SECS),
        }
    }
}

/// 地址记录类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressRecordType {
    A,
    Aaaa,
}

/// 一条解析出的地址。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostAddress {
    pub host: String,
    pub address: String,
    pub record_type: AddressRecordType,
}

/// 解析完成回调。成功时地址列表非空。
pub type ResolutionCallback = Box<dyn FnOnce(Result<Vec<HostAddress>, CoreError>) + Send + 'static>;

/// 主机名解析器契约。
pub trait HostResolver: Send + Sync + 'static {
    /// 异步解析 `host_name`，结果经 `on_resolved` 回报；回调线程不作保证。
    fn resolve_host(
        &self,
        host_name: &str,
        config: &ResolutionConfig,
        on_resolved: ResolutionCallback,
    );

    /// 回报某个地址上的连接失败，供解析器的健康状态参考。
    fn record_connection_failure(&self, address: &HostAddress);
}

struct CacheEntry {
    addresses: Vec<HostAddress>,
    expires_at: Instant,
}

type Cache = Arc<Mutex<HashMap<String, CacheEntry>>>;

/// 基于系统解析器（`ToSocketAddrs`）的默认实现。
///
/// 解析在一条短命工作线程上执行；结果按 `max_ttl` 缓存，
/// `record_connection_failure` 把失败地址从缓存中驱逐。
#[derive(Default)]
pub struct SystemHostResolver {
    cache: Cache,
}

impl SystemHostResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(host_name: &str) -> Result<Vec<HostAddress>, CoreError> {
        let addresses: Vec<HostAddress> = (host_name, 0u16)
            .to_socket_addrs()
            .map_err(|error| {
                CoreError::new(
                    codes::RESOLUTION_FAILED,
                    format!("failed to resolve {host_name}"),
                )
                .with_cause(error)
            })?
            .map(|addr| HostAddress {
                host: host_name.to_owned(),
                address: addr.ip().to_string(),
                record_type: if addr.is_ipv6() {
                    AddressRecordType::Aaaa
                } else {
                    AddressRecordType::A
                },
            })
            .collect();
        if addresses.is_empty() {
            return Err(CoreError::new(
                codes::RESOLUTION_FAILED,
                format!("no addresses for {host_name}"),
            ));
        }
        Ok(addresses)
    }
}

impl HostResolver for SystemHostResolver {
    fn resolve_host(
        &self,
        host_name: &str,
        config: &ResolutionConfig,
        on_resolved: ResolutionCallback,
    ) {
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(host_name)
                && entry.expires_at > Instant::now()
                && !entry.addresses.is_empty()
            {
                let addresses = entry.addresses.clone();
                drop(cache);
                tracing::trace!(target: "beacon_io::resolver", host = host_name, "cache hit");
                on_resolved(Ok(addresses));
                return;
            }
        }

        let host_name = host_name.to_owned();
        let max_ttl = config.max_ttl;
        let cache = Arc::clone(&self.cache);
        let spawn_result = std::thread::Builder::new()
            .name("beacon-resolver".into())
            .spawn(move || {
                let result = Self::lookup(&host_name);
                if let Ok(addresses) = &result {
                    cache.lock().insert(
                        host_name.clone(),
                        CacheEntry {
                            addresses: addresses.clone(),
                            expires_at: Instant::now() + max_ttl,
                        },
                    );
                }
                on_resolved(result);
            });
        if let Err(error) = spawn_result {
            tracing::error!(
                target: "beacon_io::resolver",
                %error,
                "failed to spawn resolver thread"
            );
        }
    }

    fn record_connection_failure(&self, address: &HostAddress) {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get_mut(&address.host) {
            entry.addresses.retain(|candidate| candidate != address);
            if entry.addresses.is_empty() {
                cache.remove(&address.host);
            }
        }
        tracing::debug!(
            target: "beacon_io::resolver",
            host = %address.host,
            address = %address.address,
            "recorded connection failure"
        );
    }
}
