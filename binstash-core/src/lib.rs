#![forbid(unsafe_code)]

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cancel;
pub mod error;

pub mod util {
    pub mod bitio;
    pub mod transpose;
    pub mod varint;
}

pub mod hash;

pub mod chunking {
    pub mod fastcdc;
    pub mod recommend;
}

pub mod pack {
    pub mod entry;
    pub mod shard;
}

pub mod store;

pub mod bpkg {
    pub mod filedef;
    pub mod format;
    pub mod model;
    pub mod refs;
    pub mod section;
    pub mod strtab;
    pub mod v1;
    pub mod v2;
}

pub mod patch {
    pub mod apply;
    pub mod diff;
    pub mod model;
    pub mod script;
}

pub mod release;

pub use crate::cancel::CancelToken;
pub use crate::error::{Error, Result};
pub use crate::hash::Hash32;

pub use bpkg::format::{SerializeOptions, deserialize, serialize};
pub use bpkg::model::{Component, ReleaseFile, ReleasePackage};
pub use chunking::fastcdc::{ChunkMapEntry, Chunker, ChunkerParams};
pub use store::ObjectStore;

pub mod prelude {
    pub use crate::cancel::CancelToken;
    pub use crate::chunking::fastcdc::{ChunkMapEntry, Chunker, ChunkerParams};
    pub use crate::error::{Error, Result};
    pub use crate::hash::Hash32;
    pub use crate::patch::model::ReleasePackagePatch;
    pub use crate::release::{
        IngestOptions, ReleaseMeta, emit_release, ingest_release, missing_chunks,
    };
    pub use crate::store::ObjectStore;
    pub use crate::{SerializeOptions, deserialize, serialize};
    pub use crate::{Component, ReleaseFile, ReleasePackage};
}
