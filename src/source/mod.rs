//! Stage inputs: the HTTP data source and raw batches in object storage.

pub mod http;
pub mod shards;

pub use http::HttpSource;
pub use shards::{ShardReader, ShardsRead};
