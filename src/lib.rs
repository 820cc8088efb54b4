// Core synchronization engine: reconciliation, three-way merge, background
// transfers and the client-side encryption codec. Hosts embed this library,
// feed it file events, and render the events it emits.

pub mod adapter;
pub mod comm;
pub mod config;
pub mod dirty;
pub mod encrypted_adapter;
pub mod encryption;
pub mod hashing;
pub mod index;
pub mod merge;
pub mod migration;
pub mod path_filter;
pub mod reconcile;
pub mod secrets;
pub mod sync;
pub mod transfer_history;
pub mod transfer_queue;
pub mod vault;

pub use adapter::{Adapter, AdapterError, RemoteKind, RemoteRecord};
pub use config::SyncConfig;
pub use encrypted_adapter::ContentStore;
pub use encryption::EncryptionEngine;
pub use sync::{EngineEvents, SyncEvent, SyncOrchestrator, SyncRequest, SyncState};
