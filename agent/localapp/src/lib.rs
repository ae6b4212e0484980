//! Keeps exactly one helper process ("local app") installed and running per
//! remote host, shared by every editor window on the machine.
//!
//! Windows coordinate only through a [`StateStore`]: a [`LeaseLock`] per host
//! serialises installation ([`Installer`]) and launch
//! ([`ProcessSupervisor`]), and the [`ConnectionBroker`] talks to the
//! resulting helper while its RPC server comes up. [`AppCoordinator`] wires
//! them together.
//!
//! ```rust,no_run
//! use localapp::{AppCoordinator, RemoteHost};
//! use localapp_config::Config;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::from_env()?;
//! localapp::init_logging(&config.logging, "localapp")?;
//!
//! let coordinator = AppCoordinator::from_config(&config).await?;
//! let host = RemoteHost::parse("https://gitpod.example.com")?;
//! let instance = coordinator.ensure(&host, &CancellationToken::new()).await?;
//! println!("helper {} listening on {}", instance.pid, instance.endpoint());
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod host;
pub mod installer;
pub mod lease;
pub mod platform;
pub mod records;
pub mod rpc;
pub mod schedule;
pub mod store;
pub mod supervisor;

pub use broker::ConnectionBroker;
pub use clock::{Clock, SystemClock, TokioClock};
pub use coordinator::AppCoordinator;
pub use error::{LocalAppError, Result};
pub use host::RemoteHost;
pub use installer::Installer;
pub use lease::{LeaseGuard, LeaseLock, LeaseOwner};
pub use localapp_logging::{init_console_logging, init_logging};
pub use records::{InstallationRecord, LockRecord, RunningInstance};
pub use rpc::{
    AutoTunnelRequest, ResolveSshConnectionRequest, ResolveSshConnectionResponse, RpcChannel,
    RpcError,
};
pub use schedule::PeriodicTask;
pub use store::{FsStateStore, MemoryStateStore, StateStore, StoreError};
pub use supervisor::{Launch, LaunchOutcome, ProcessSupervisor};
