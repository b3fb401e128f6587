use clap::CommandFactory;
use vboxcore::{
    catalogue::{HardwareProfile, ImageCatalogue},
    cli::{
        AnsiStyles, HardwareSubcommand, ImageSubcommand, MasterSubcommand, NodeSubcommand,
        VboxcoreArgs, VboxcoreSubcommand,
    },
    compute::{ComputeAdapter, MasterSummary},
    config::ProviderConfig,
    hypervisor::CloneMode,
    node::{NodeHardware, NodeMetadata, NodeSpec, NodeState},
    VboxcoreError, VboxcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

pub async fn run(args: VboxcoreArgs) -> VboxcoreResult<()> {
    let Some(subcommand) = args.subcommand else {
        VboxcoreArgs::command().print_help()?;
        return Ok(());
    };

    let config = ProviderConfig::load(args.config.as_deref()).await?;

    match subcommand {
        VboxcoreSubcommand::Image {
            subcommand: ImageSubcommand::List,
        } => image_list_subcommand(&config).await,
        VboxcoreSubcommand::Hardware {
            subcommand: HardwareSubcommand::List,
        } => hardware_list_subcommand(&config).await,
        VboxcoreSubcommand::Node { subcommand } => {
            let compute = ComputeAdapter::from_config(&config, args.simulate).await?;
            node_subcommand(&compute, subcommand).await
        }
        VboxcoreSubcommand::Master { subcommand } => {
            let compute = ComputeAdapter::from_config(&config, args.simulate).await?;
            master_subcommand(&compute, subcommand).await
        }
    }
}

async fn image_list_subcommand(config: &ProviderConfig) -> VboxcoreResult<()> {
    let catalogue = ImageCatalogue::load(&config.catalogue_path()).await?;
    let default = catalogue.default_image().map(|image| image.get_id().clone());

    println!(
        "{}",
        format!(
            "{:<24} {:<10} {:<10} {:<8} {}",
            "ID", "FAMILY", "VERSION", "ARCH", "OS TYPE"
        )
        .header()
    );
    for image in catalogue.images() {
        let marker = if default.as_ref() == Some(image.get_id()) {
            " (default)"
        } else {
            ""
        };

        println!(
            "{} {:<10} {:<10} {:<8} {}{}",
            format!("{:<24}", image.get_id()).literal(),
            image.get_os_family(),
            image.get_os_version(),
            image.get_os_arch(),
            image.os_type(),
            marker.placeholder(),
        );
    }

    Ok(())
}

async fn hardware_list_subcommand(config: &ProviderConfig) -> VboxcoreResult<()> {
    let catalogue = ImageCatalogue::load(&config.catalogue_path()).await?;

    println!(
        "{}",
        format!("{:<12} {:>5} {:>12} {:>12}", "ID", "CPUS", "MEMORY MIB", "DISK MIB").header()
    );
    for profile in catalogue.hardware_profiles() {
        println!(
            "{} {:>5} {:>12} {:>12}",
            format!("{:<12}", profile.get_id()).literal(),
            profile.get_cpus(),
            profile.get_memory_mib(),
            profile.get_disk_mib(),
        );
    }

    Ok(())
}

async fn node_subcommand(
    compute: &ComputeAdapter,
    subcommand: NodeSubcommand,
) -> VboxcoreResult<()> {
    match subcommand {
        NodeSubcommand::List => {
            print_node_table(&compute.list_nodes().await?);
        }
        NodeSubcommand::Create {
            image,
            hardware,
            name,
            clone,
        } => {
            let spec = node_spec(compute, image, hardware, name, clone)?;
            let created = compute.create_node(spec).await?;
            print_node(&created.node);

            let username = created.credentials.get_username();
            if let Some(port) = created.node.ssh_port {
                println!("\nssh -p {port} {username}@127.0.0.1");
            }
            if let Some(password) = created.credentials.get_password() {
                println!("password: {}", password.placeholder());
            }
        }
        NodeSubcommand::Destroy { name } => {
            compute.destroy_node(&name).await?;
            println!("{} destroyed", name.literal());
        }
        NodeSubcommand::Reboot { name } => {
            print_node(&compute.reboot_node(&name).await?);
        }
        NodeSubcommand::Show { name } => match compute.get_node(&name).await? {
            Some(node) => print_node(&node),
            None => return Err(VboxcoreError::NotFound(format!("node {name}"))),
        },
        NodeSubcommand::Suspend { name } => {
            print_node(&compute.suspend_node(&name).await?);
        }
        NodeSubcommand::Resume { name } => {
            print_node(&compute.resume_node(&name).await?);
        }
    }

    Ok(())
}

async fn master_subcommand(
    compute: &ComputeAdapter,
    subcommand: MasterSubcommand,
) -> VboxcoreResult<()> {
    match subcommand {
        MasterSubcommand::List => {
            print_master_table(&compute.list_masters().await?);
        }
        MasterSubcommand::Destroy { image } => {
            compute.destroy_master(&image).await?;
            println!("master of {} destroyed", image.literal());
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Resolves the image and hardware profile of a create request against the catalogue.
fn node_spec(
    compute: &ComputeAdapter,
    image: Option<String>,
    hardware: Option<String>,
    name: String,
    clone: Option<CloneMode>,
) -> VboxcoreResult<NodeSpec> {
    let catalogue = compute.catalogue();

    let image_id = match image {
        Some(image) => image,
        None => catalogue
            .default_image()
            .map(|image| image.get_id().clone())
            .ok_or_else(|| VboxcoreError::Catalogue("the catalogue has no images".to_string()))?,
    };

    let hardware = match hardware {
        Some(id) => catalogue
            .hardware_profile(&id)
            .map(|profile: HardwareProfile| NodeHardware::from_profile(&profile))
            .ok_or_else(|| VboxcoreError::NotFound(format!("hardware profile {id}")))?,
        None => NodeHardware::default(),
    };

    let spec = NodeSpec::builder()
        .name(name)
        .image_id(image_id)
        .hardware(hardware)
        .build();

    Ok(match clone {
        Some(mode) => NodeSpec {
            clone_mode: Some(mode),
            ..spec
        },
        None => spec,
    })
}

fn styled_state(state: NodeState, width: usize) -> String {
    let padded = format!("{:<width$}", state.as_str());
    match state {
        NodeState::Running => padded.valid(),
        NodeState::Error | NodeState::Unrecognized => padded.invalid(),
        _ => padded,
    }
}

fn print_node_table(nodes: &[NodeMetadata]) {
    println!(
        "{}",
        format!(
            "{:<20} {:<12} {:<8} {:<20} {}",
            "NAME", "STATE", "SSH", "IMAGE", "ADDRESSES"
        )
        .header()
    );

    for node in nodes {
        let ssh = node.ssh_port.map(|port| port.to_string()).unwrap_or_default();
        let addresses = node
            .private_addresses
            .iter()
            .chain(&node.public_addresses)
            .cloned()
            .collect::<Vec<_>>()
            .join(",");

        println!(
            "{} {} {:<8} {:<20} {}",
            format!("{:<20}", node.name).literal(),
            styled_state(node.state, 12),
            ssh,
            node.image_id.as_deref().unwrap_or("-"),
            addresses.placeholder(),
        );
    }
}

fn print_node(node: &NodeMetadata) {
    let field = |label: &str| format!("{label:<18}").header();

    println!("{}{}", field("name"), node.name.literal());
    println!("{}{}", field("id"), node.id);
    println!("{}{}", field("state"), styled_state(node.state, 0));
    println!("{}{}", field("image"), node.image_id.as_deref().unwrap_or("-"));
    println!(
        "{}{} cpus, {} MiB",
        field("hardware"),
        node.hardware.get_cpus(),
        node.hardware.get_memory_mib()
    );
    if let Some(port) = node.ssh_port {
        println!("{}127.0.0.1:{port}", field("ssh"));
    }
    if !node.private_addresses.is_empty() {
        println!("{}{}", field("private addresses"), node.private_addresses.join(", "));
    }
    if !node.public_addresses.is_empty() {
        println!("{}{}", field("public addresses"), node.public_addresses.join(", "));
    }
    if let Some(credentials) = &node.login_credentials {
        println!("{}{}", field("username"), credentials.get_username());
    }
}

fn print_master_table(masters: &[MasterSummary]) {
    println!(
        "{}",
        format!(
            "{:<24} {:<28} {:<12} {:<9} {}",
            "IMAGE", "NAME", "STATE", "COMPLETE", "ID"
        )
        .header()
    );

    for master in masters {
        let complete = if master.complete {
            format!("{:<9}", "yes").valid()
        } else {
            format!("{:<9}", "no").invalid()
        };

        println!(
            "{} {:<28} {} {} {}",
            format!("{:<24}", master.image_id).literal(),
            master.name,
            styled_state(master.state, 12),
            complete,
            master.id.placeholder(),
        );
    }
}
