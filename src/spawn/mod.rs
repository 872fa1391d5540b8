//! The spawner hierarchy.
//!
//! ```text
//!   SpawnManager ─┬─ "version:<runtime>" ─▶ FrameworkSpawner (child)
//!                 │                            └─ app root ─▶ ApplicationSpawner (grandchild)
//!                 └─ "app:<root>" ─────────▶ ApplicationSpawner (child)
//!                                                 └─ fork ─▶ worker
//! ```
//!
//! Every spawner is a [`ServerProcess`](crate::server::ServerProcess) and
//! every cache an [`IdleRegistry`](crate::registry::IdleRegistry), so idle
//! spawners disappear on their own. Workers are bootstrapped through a
//! line-based handshake and handed back up the chain as
//! [`Application`] descriptors together with their owner pipe.

mod app_spawner;
mod application;
mod framework_spawner;
mod handshake;
mod loader;
mod manager;
mod options;
mod privilege;
mod protocol;
mod worker;

pub use app_spawner::ApplicationSpawner;
pub use application::{Application, ListenEndpoint};
pub use framework_spawner::FrameworkSpawner;
pub use loader::{AppWorker, BootstrapError, BootstrapKind, Loader, OwnerPipe};
pub use manager::{
    SpawnError, SpawnErrorKind, SpawnManager, SpawnManagerClient, SpawnManagerServer,
};
pub use options::{SpawnMethod, SpawnOptions};
pub use protocol::{ManagerRequest, SpawnerRequest};
