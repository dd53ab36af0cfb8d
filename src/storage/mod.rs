pub mod download;
pub mod http;
pub mod snapshot;

pub use download::{sha256_file, sweep_orphans, RemoteBlob, SnapshotDownloader, SnapshotSource, TempFile};
pub use http::HttpSnapshotSource;
pub use snapshot::{DecodedSnapshot, SnapshotHeader, SnapshotWriter, SCHEMA_BINCODE, SCHEMA_CURRENT, SCHEMA_JSONL};
