pub mod generation;
pub mod store;
pub mod text;

pub use generation::{Snapshot, SnapshotStats};
pub use store::{RecordStore, SnapshotHandle};
