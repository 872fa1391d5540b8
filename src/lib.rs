//! warmspawn: process supervision and IPC for pools of pre-warmed
//! application workers.
//!
//! The crate is layered leaf-first:
//!
//! - [`channel`]: framed array messages, scalars and descriptor passing over
//!   a Unix stream socket.
//! - [`server`]: a forked child running a message-dispatch loop, with staged
//!   shutdown.
//! - [`registry`]: a keyed cache of such children that stops idle entries
//!   in the background.
//! - [`spawn`]: application spawners, framework spawners and the
//!   [`SpawnManager`](spawn::SpawnManager) on top, which hands out
//!   [`Application`](spawn::Application) workers.
//!
//! Hosts plug their language runtime in by implementing
//! [`spawn::Loader`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use warmspawn::config::SpawnerConfig;
//! use warmspawn::spawn::{SpawnManager, SpawnOptions};
//! # fn loader() -> Arc<dyn warmspawn::spawn::Loader> { unimplemented!() }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = SpawnManager::new(loader(), SpawnerConfig::default().with_env_overrides())?;
//! let app = manager.spawn(SpawnOptions::new("/srv/blog"))?;
//! println!("worker {} listens on {}", app.pid(), app.listen_endpoint().address);
//! # Ok(())
//! # }
//! ```

#![cfg(unix)]

pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod registry;
pub mod server;
pub mod spawn;

pub use error::{Error, Result};
