use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::hypervisor::CloneMode;

use super::styles;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// vboxcore - SSH-ready VirtualBox machines from an image catalogue
#[derive(Debug, Parser)]
#[command(name = "vboxcore", author, about, version, styles=styles::styles())]
pub struct VboxcoreArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<VboxcoreSubcommand>,

    /// Path to the configuration file
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Use the in-memory hypervisor instead of VirtualBox
    #[arg(long, global = true)]
    pub simulate: bool,
}

/// Available subcommands
#[derive(Debug, Subcommand)]
pub enum VboxcoreSubcommand {
    /// Manage nodes
    #[command(name = "node")]
    Node {
        /// The node subcommand to run
        #[command(subcommand)]
        subcommand: NodeSubcommand,
    },

    /// Inspect the image catalogue
    #[command(name = "image")]
    Image {
        /// The image subcommand to run
        #[command(subcommand)]
        subcommand: ImageSubcommand,
    },

    /// Inspect the hardware profiles
    #[command(name = "hardware")]
    Hardware {
        /// The hardware subcommand to run
        #[command(subcommand)]
        subcommand: HardwareSubcommand,
    },

    /// Manage master machines
    #[command(name = "master")]
    Master {
        /// The master subcommand to run
        #[command(subcommand)]
        subcommand: MasterSubcommand,
    },
}

/// Node subcommands
#[derive(Debug, Subcommand)]
pub enum NodeSubcommand {
    /// List nodes
    #[command(name = "list")]
    List,

    /// Create a node and wait until it answers on ssh
    #[command(name = "create")]
    Create {
        /// Image to clone. Defaults to the first ubuntu image of the catalogue
        #[arg(short, long)]
        image: Option<String>,

        /// Hardware profile
        #[arg(long)]
        hardware: Option<String>,

        /// Name of the node
        #[arg(short, long)]
        name: String,

        /// Clone mode: linked or full
        #[arg(long)]
        clone: Option<CloneMode>,
    },

    /// Shut a node down and delete it
    #[command(name = "destroy")]
    Destroy {
        /// Name of the node
        name: String,
    },

    /// Shut a node down and start it again
    #[command(name = "reboot")]
    Reboot {
        /// Name of the node
        name: String,
    },

    /// Show a node
    #[command(name = "show")]
    Show {
        /// Name of the node
        name: String,
    },

    /// Shut a node down, keeping it
    #[command(name = "suspend")]
    Suspend {
        /// Name of the node
        name: String,
    },

    /// Start a suspended node
    #[command(name = "resume")]
    Resume {
        /// Name of the node
        name: String,
    },
}

/// Image subcommands
#[derive(Debug, Subcommand)]
pub enum ImageSubcommand {
    /// List images
    #[command(name = "list")]
    List,
}

/// Hardware subcommands
#[derive(Debug, Subcommand)]
pub enum HardwareSubcommand {
    /// List hardware profiles
    #[command(name = "list")]
    List,
}

/// Master subcommands
#[derive(Debug, Subcommand)]
pub enum MasterSubcommand {
    /// List master machines
    #[command(name = "list")]
    List,

    /// Delete the master of an image
    #[command(name = "destroy")]
    Destroy {
        /// The image whose master is deleted
        image: String,
    },
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
