//! `vboxcore` is a compute provider that turns a declarative image catalogue into SSH-ready
//! VirtualBox machines.
//!
//! # Overview
//!
//! vboxcore exposes a small "cloud-like" compute API on top of a local VirtualBox host. It handles:
//! - Downloading and verifying install media
//! - Serving unattended-install documents to first-boot guests
//! - Building one golden master machine per image, exactly once
//! - Cloning masters into linked or full clones and waiting for them to answer on ssh
//! - Mapping native machine states onto a small set of abstract node states
//!
//! # Architecture
//!
//! - **Catalogue**: the YAML image catalogue and hardware profiles
//! - **Hypervisor**: the capability trait over VirtualBox, with a `VBoxManage` binding and an
//!   in-memory simulation
//! - **Master**: the master builder and the at-most-one-build master cache
//! - **Node**: the node creator and the state mapper
//! - **Compute**: the façade tying everything together
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use vboxcore::{compute::ComputeAdapter, config::ProviderConfig, node::NodeSpec};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ProviderConfig::load(None).await?;
//!     let compute = ComputeAdapter::from_config(&config, false).await?;
//!
//!     let spec = NodeSpec::builder()
//!         .name("n1")
//!         .image_id("ubuntu-22-amd64")
//!         .build();
//!
//!     let created = compute.create_node(spec).await?;
//!     println!("{} is {}", created.node.name, created.node.state);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`catalogue`] - Image catalogue and hardware profiles
//! - [`cli`] - Command-line interface and argument parsing
//! - [`compute`] - The compute façade
//! - [`config`] - Provider configuration and defaults
//! - [`fetch`] - Install media downloads
//! - [`hypervisor`] - Hypervisor capability and bindings
//! - [`master`] - Master builds and the master cache
//! - [`node`] - Node creation and state mapping
//! - [`preseed`] - The preseed HTTP server
//! - [`ssh`] - SSH readiness probing
//! - [`utils`] - Common utilities and helpers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod catalogue;
pub mod cli;
pub mod compute;
pub mod config;
pub mod fetch;
pub mod hypervisor;
pub mod master;
pub mod node;
pub mod preseed;
pub mod ssh;
pub mod utils;

pub use error::*;
