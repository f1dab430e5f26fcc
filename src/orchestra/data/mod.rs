pub mod dataloader;
pub mod dataset;
pub mod shard;

pub use dataloader::{display_batch, Batches, DataLoader};
pub use dataset::Dataset;
pub use shard::{shard_range, ShardSpec};
