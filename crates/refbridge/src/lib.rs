//! # RefBridge
//!
//! Session-aware calls from a host program into a pool of workers running a
//! foreign language runtime.
//!
//! ## Architecture
//!
//! - [`session`]: which sessions exist and which remote objects each one owns.
//! - [`monitor`]: releases a session when the host task that owns it terminates.
//! - [`router`]: keeps a session on the worker holding its objects.
//! - [`dispatch`]: declared signatures and local arity validation.
//! - [`translate`]: remote exceptions to host error values.
//! - [`pool`]: the byte-level seam to the workers.
//! - [`bridge`]: the facade tying the above together.
//!
//! The value codec and the envelope format live in the `refwire` crate.

pub mod bridge;
pub mod builder;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod mock_pool;
pub mod monitor;
pub mod pool;
pub mod refs;
pub mod router;
pub mod session;
pub mod translate;


pub use bridge::AttrTarget;
pub use bridge::Bridge;
pub use bridge::CallOptions;
pub use bridge::Kwargs;
pub use bridge::SessionOptions;
pub use bridge::SessionScope;
pub use builder::BridgeBuilder;
pub use config::BridgeConfig;
pub use dispatch::ArityInfo;
pub use dispatch::Catalog;
pub use dispatch::ClassDecl;
pub use dispatch::MaxArity;
pub use dispatch::Signature;
pub use error::Error;
pub use error::Result;
pub use monitor::OwnerGuard;
pub use monitor::OwnerHandle;
pub use pool::PoolError;
pub use pool::WorkerId;
pub use pool::WorkerPool;
pub use router::AffinityPolicy;
pub use translate::ErrorKind;
pub use translate::RemoteFailure;
