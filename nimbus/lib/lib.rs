//! `nimbus` runs untrusted code in disposable micro-VM sandboxes.
//!
//! # Overview
//!
//! A sandbox is booted from an immutable template snapshot, lives until it is killed or its
//! timeout expires, and can have one persistent volume attached at creation. While it runs,
//! commands, file operations and terminals are routed into it through its guest agent.
//!
//! # Architecture
//!
//! - **Ledger**: per-team quota admission for vCPUs, memory, disk and sandbox count
//! - **Templates**: builder steps or Dockerfiles turned into snapshot generations
//! - **Volumes**: named persistent storage usable with or without a sandbox
//! - **Orchestration**: the sandbox state machine and the expiry sweeper
//! - **Gateway**: commands with streaming output, files, directory watches and PTYs
//! - **Network**: egress rules and public host names for guest ports
//! - **Server**: the REST API
//!
//! Micro-VMs are reached through the [`vm::VmBackend`] and [`guest::GuestAgent`] traits. The
//! bundled local backend runs guests as host processes over per-sandbox directories, which is
//! enough for development and tests but provides no isolation.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use nimbus::{
//!     config::NimbusConfig,
//!     gateway::CommandOptions,
//!     orchestration::{CreateOptions, VolumeMount},
//!     Nimbus,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let nimbus = Nimbus::new(NimbusConfig::default()).await?;
//!     nimbus.volumes().create("my-team", "scratch").await?;
//!
//!     let sandbox = nimbus
//!         .orchestrator()
//!         .create(
//!             "my-team",
//!             CreateOptions::builder()
//!                 .volume(VolumeMount {
//!                     volume: "scratch".into(),
//!                     mount_path: "/workspace".into(),
//!                 })
//!                 .build(),
//!         )
//!         .await?;
//!
//!     let result = sandbox
//!         .gateway()?
//!         .run(
//!             "echo hello > hello.txt",
//!             CommandOptions::builder().cwd("/workspace").build(),
//!         )
//!         .await?;
//!     assert_eq!(result.exit_code, 0);
//!
//!     sandbox.kill().await?;
//!     let saved = nimbus.volumes().download("my-team", "scratch", "/hello.txt").await?;
//!     assert_eq!(&saved[..], b"hello\n");
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`cli`] - Command-line interface and argument parsing
//! - [`config`] - Configuration types and defaults
//! - [`gateway`] - Command, file and terminal access to a running sandbox
//! - [`guest`] - The guest agent interface and its local implementation
//! - [`ledger`] - Quota admission
//! - [`management`] - The SQLite catalog
//! - [`network`] - Egress policies and host names
//! - [`orchestration`] - Sandbox lifecycle
//! - [`server`] - REST API server
//! - [`template`] - Template specs, builds and the template catalog
//! - [`vm`] - Micro-VM backends
//! - [`volume`] - Persistent volumes

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

mod context;
mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod config;
pub mod gateway;
pub mod guest;
pub mod ledger;
pub mod management;
pub mod network;
pub mod orchestration;
pub mod server;
pub mod template;
pub mod utils;
pub mod vm;
pub mod volume;

pub use context::*;
pub use error::*;
