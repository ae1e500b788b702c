//! Core library for runtime-agnostic async Memcached text-protocol clients
//! and servers. Concrete runtimes (tokio, async-std) implement the
//! [`Connection`] trait and re-export [`MemcachedClient`] and
//! [`MemcachedServerConn`] against their own socket types.

pub mod attachment;
pub mod buffers;
pub mod client;
pub mod config;
pub mod error;
pub mod expire;
pub mod server;

pub use attachment::LoopHandle;
pub use buffers::{AsyncBuffers, BulkWrite, Connection};
pub use client::{MemcachedClient, StoreResult};
pub use config::{ClientConfig, ServerConfig};
pub use error::Error;
pub use expire::calc_expire_time;
pub use server::{
    DeferredContext, DeferredReply, MemcachedHandler, MemcachedServerConn, ResponseResult,
};
