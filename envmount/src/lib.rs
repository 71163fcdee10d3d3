//! envmount - package environments layered onto a virtual filesystem
//!
//! This library installs resolved package sets into an in-process virtual
//! filesystem. Plain archives are unpacked; filesystem images are streamed
//! block by block over HTTP range requests and layered into the prefix as
//! symlinks. Shared libraries found along the way are planned for loading
//! in dependency-safe order.
//!
//! # Architecture
//!
//! ```text
//!                   ┌──────────────┐
//!                   │ Bootstrapper │
//!                   └──────┬───────┘
//!            ┌─────────────┼──────────────┐
//!            ▼             ▼              ▼
//!     LayeredInstaller  Resolver    LibraryLoadPlanner
//!       │        │                        │
//!       │   MountGate ─▶ ImageMounter     └─▶ parse_dylink
//!       │                   │
//!       ▼                   ▼
//!   VirtualFs ◀──── BridgeClient ══ SharedRegion ══ BlockBridge
//!                                                      │
//!                                              BlockStreamCache
//!                                                      │
//!                                               RangeSource (HTTP)
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod dynload;
pub mod installer;
pub mod mount;
pub mod package;
pub mod rendezvous;
pub mod resolver;
pub mod stream;
pub mod vfs;

/// Boxed, sendable future returned by the crate's dyn-compatible traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use bootstrap::{BootstrapConfig, BootstrapError, BootstrapResult, Bootstrapper, Environment};
pub use config::ConfigFile;
pub use installer::{InstallError, InstalledPathManifest, LayeredInstaller, SharedLibraryInventory};
pub use package::{EnvironmentDiff, EnvironmentLock, PackageMap, ResolvedPackage};
