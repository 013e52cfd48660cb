//! watch-keeper kubehub – Kubernetes API access: discovery, paged lists,
//! watch connections and cluster identity.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod directory;
pub mod mock;
pub mod registry;
pub mod stream;
pub mod transport;

pub use cluster::{cluster_id, cluster_metadata};
pub use directory::{discover, get_single, ResourceTypeDescriptor};
pub use registry::{BackoffPolicy, WatchHandle, WatchHandler, WatchRegistry, WatchState};
pub use stream::{decode_frames, WatchEvent, WatchFrame};
pub use transport::{ByteStream, KubeApi, KubeClient, KubeError, ListQuery};
