#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod core;
pub mod index;
pub mod lifecycle;
pub mod overlay;
pub mod query;
pub mod stats;
pub mod storage;
pub mod testing;
