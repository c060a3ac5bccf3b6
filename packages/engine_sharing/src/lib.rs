//! Engine sharing - let many isolated contexts ride on one engine
//!
//! Several execution contexts (tabs, windows, workers) each run their own
//! client instance. This crate makes them cooperate so only one of them, the
//! holder, owns the real session, while the others attach to it through a
//! bridge and talk to it over a small RPC layer.
//!
//! The moving parts:
//! - [`store`]: text-only shared key/value media and the presence codec
//! - [`presence`]: heartbeat leases and conflict resolution by withdrawal
//! - [`gc`]: background sweep of stale records and id-list entries
//! - [`search`]: discovery of an existing holder, with slow-link confirmation
//! - [`bridge`]: direct and relay message transports between contexts
//! - [`rpc`]: request/response correlation on top of a bridge
//! - [`host`] and [`remote`]: the holder and attached sides of a bridge
//! - [`sharing`]: the entry point wiring everything together
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use engine_sharing::{
//!     Directory, EngineSharing, LocalEnvironment, MemoryStore, OnFound, OnNotFound,
//!     Origin, SessionEngine, SharingDeps, SharingPolicy,
//! };
//!
//! # async fn run(engine: Arc<dyn SessionEngine>) -> Result<(), engine_sharing::SharingError> {
//! let env = Arc::new(LocalEnvironment::new());
//! let policy = SharingPolicy::new("app1", OnFound::Attach, OnNotFound::Create, false, env.as_ref())?;
//! let deps = SharingDeps::new(
//!     Arc::new(MemoryStore::new()),
//!     env,
//!     Arc::new(Directory::new()),
//!     Origin::new("example.com", "build-1", "https"),
//! );
//!
//! let sharing = EngineSharing::new(policy, deps, engine);
//! let handle = sharing.start().await?;
//! handle.connect();
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod clock;
pub mod config;
pub mod directory;
pub mod engine;
pub mod environment;
pub mod error;
pub mod gc;
pub mod host;
pub mod policy;
pub mod presence;
pub mod remote;
pub mod rpc;
pub mod search;
pub mod sharing;
pub mod store;
pub mod types;
pub mod wire;

pub use clock::{Clock, SharedClock, SystemClock, TokioClock};
pub use config::{SharingFileConfig, Timings};
pub use directory::Directory;
pub use engine::{EngineEvent, EngineHandle, SessionEngine};
pub use environment::{Environment, LocalEnvironment};
pub use error::{AttachError, CallError, ConfigError, SharingError, StoreError};
pub use gc::{Collector, CollectorLease, SweepReport};
pub use policy::{OnFound, OnNotFound, SharingPolicy};
pub use presence::{PresenceEngine, PresenceMode, Withdrawal};
pub use search::{Search, SearchOutcome};
pub use sharing::{EngineSharing, SharingDeps, SharingEvent};
pub use store::status::{Origin, PresenceRecord, StatusStore};
pub use store::{CookieStore, FileStore, MemoryStore, NullStore, SharedStore, StoreKind};
pub use types::{InstanceId, Namespace, PeerId};
