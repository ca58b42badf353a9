//! Tessera: a sharded, in-memory graph-feature server for minibatch training.
//!
//! A training job's graph is split into contiguous-range shards, one per
//! server process. Each server loads its shard into a [`store::PartitionStore`],
//! runs background [`sampler`] threads that turn shard state into ready-to-ship
//! [`batch::GraphBatch`] minibatches, and absorbs cross-shard reads through a
//! [`cache::NodeCache`]. Workers attach through the [`cluster::ClusterBus`] and
//! drive the non-blocking pull/resolve protocol on a [`client::DistClient`];
//! single-process jobs use [`client::LocalClient`] instead.

#![warn(missing_docs)]

pub mod batch;
pub mod cache;
pub mod client;
pub mod cluster;
pub mod datagen;
pub mod error;
pub mod meta;
pub mod model;
pub mod net;
pub mod router;
pub mod sampler;
pub mod server;
pub mod store;

pub use error::{Result, TesseraError};
pub use model::{NodeId, QueryId, Role, SamplerConfig, SamplerKind};
pub use router::Reply;
