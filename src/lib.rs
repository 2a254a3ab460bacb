//! Client resource layer of a storage-less database compute node.
//!
//! Pages are fetched on demand from a remote page service and every mutation
//! is streamed as a WAL record to a remote log service. The crate provides the
//! pieces in between: a dual-kind [`pool::ConnectionPool`], a bounded
//! [`cache::PageCache`], a FIFO [`pipeline::AppendPipeline`] and the
//! [`runtime::ComputeContext`] that ties them together per table.

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod pipeline;
pub mod pool;
pub mod remote;
pub mod runtime;
pub mod types;

pub use config::{Config, PoolConfig};
pub use runtime::{ComputeContext, PerfStats, TimelineSession};
pub use types::{Lsn, NimbusError, PageId, Result, TimelineId, WalRecord, PAGE_SIZE};
