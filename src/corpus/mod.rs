pub(crate) mod collate;
pub(crate) mod prefetch;
pub mod sampler;
pub mod store;

pub use sampler::BatchSampler;
pub use store::ClipStore;

pub(crate) use prefetch::Prefetcher;
