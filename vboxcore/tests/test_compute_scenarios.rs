use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{extract::State, routing::get, Router};
use tempfile::TempDir;
use tokio::{net::TcpListener, time::Instant};
use vboxcore::{
    catalogue::ImageCatalogue,
    compute::ComputeAdapter,
    config::ProviderConfig,
    hypervisor::{Hypervisor, MachineHandle, MachineState, SimulatedHypervisor, SimulationOptions},
    node::{NodeHardware, NodeSpec, NodeState},
    ErrorKind,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const IMAGE_ID: &str = "ubuntu-22-amd64";

const ISO_CONTENTS: &[u8] = b"ubuntu 22.04 live server installer";

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_create_node_happy_path() -> anyhow::Result<()> {
    let harness = Harness::builder().start().await?;

    let hardware = NodeHardware::builder().cpus(2).memory_mib(2048).build();
    let created = harness
        .compute
        .create_node(
            NodeSpec::builder()
                .name("n1")
                .image_id(IMAGE_ID)
                .hardware(hardware)
                .build(),
        )
        .await?;

    assert_eq!(created.node.name, "n1");
    assert_eq!(created.node.state, NodeState::Running);
    assert_eq!(created.node.image_id.as_deref(), Some(IMAGE_ID));
    assert_eq!(*created.node.hardware.get_cpus(), 2);
    assert_eq!(*created.node.hardware.get_memory_mib(), 2048);
    assert_eq!(created.credentials.get_username(), "ops");

    let masters = harness.compute.list_masters().await?;
    assert_eq!(masters.len(), 1);
    assert_eq!(masters[0].name, "master-ubuntu-22-amd64");
    assert!(masters[0].complete);
    assert_eq!(harness.iso_hits(), 1);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_concurrent_creates_share_one_master() -> anyhow::Result<()> {
    let harness = Harness::builder().start().await?;

    let (a, b) = tokio::join!(
        harness.compute.create_node(spec("n1")),
        harness.compute.create_node(spec("n2"))
    );
    let (a, b) = (a?, b?);

    assert_ne!(a.node.name, b.node.name);
    assert_ne!(a.node_id, b.node_id);
    assert_eq!(harness.hypervisor.machines_created(), 1);
    assert_eq!(harness.hypervisor.machines_cloned(), 2);
    assert_eq!(harness.iso_hits(), 1);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_integrity_failure_creates_nothing() -> anyhow::Result<()> {
    let harness = Harness::builder()
        .sha256(&"0".repeat(64))
        .start()
        .await?;

    let error = harness.compute.create_node(spec("n1")).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Integrity);
    assert_eq!(error.image_id(), Some(IMAGE_ID));
    assert_eq!(harness.hypervisor.machines_created(), 0);
    assert!(harness.hypervisor.list_machines().await?.is_empty());

    // Nothing was cached: the next attempt downloads again.
    let error = harness.compute.create_node(spec("n1")).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Integrity);
    assert_eq!(harness.iso_hits(), 2);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_unreachable_node_is_kept_for_diagnosis() -> anyhow::Result<()> {
    let harness = Harness::builder()
        .options(SimulationOptions::builder().guest_ssh(false).build())
        .node_running("1s")
        .start()
        .await?;

    let started = Instant::now();
    let error = harness.compute.create_node(spec("n1")).await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(error.kind(), ErrorKind::NodeUnreachable);
    assert_eq!(error.exit_code(), 4);

    // The master install happens first, the ssh wait is bounded by its own ceiling.
    assert!(elapsed >= Duration::from_secs(1), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");

    let node = harness.compute.get_node("n1").await?;
    assert_eq!(node.map(|node| node.state), Some(NodeState::Running));

    harness.compute.destroy_node("n1").await?;
    assert!(harness.compute.get_node("n1").await?.is_none());

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_node_states_are_mapped() -> anyhow::Result<()> {
    let harness = Harness::builder().start().await?;
    let created = harness.compute.create_node(spec("n1")).await?;
    let handle = MachineHandle::new(created.node_id);

    for (native, expected) in [
        (MachineState::Aborted, NodeState::Error),
        (MachineState::DeletingSnapshotOnline, NodeState::Pending),
        (MachineState::from_vboxmanage("hibernating"), NodeState::Unrecognized),
        (MachineState::PoweredOff, NodeState::Suspended),
    ] {
        harness.hypervisor.set_state(&handle, native)?;
        let node = harness.compute.get_node("n1").await?;
        assert_eq!(node.map(|node| node.state), Some(expected), "{native}");
    }

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_destroy_running_node() -> anyhow::Result<()> {
    let harness = Harness::builder().start().await?;
    harness.compute.create_node(spec("n1")).await?;
    assert_eq!(harness.hypervisor.list_machines().await?.len(), 2);

    harness.compute.destroy_node("n1").await?;

    assert!(harness.compute.get_node("n1").await?.is_none());
    assert!(harness.hypervisor.find_by_name("n1").await?.is_none());
    assert_eq!(harness.hypervisor.list_machines().await?.len(), 1);

    let error = harness.compute.destroy_node("n1").await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
    assert_eq!(error.report(), "NOT_FOUND: not found: node n1");

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_name_collision_creates_nothing() -> anyhow::Result<()> {
    let harness = Harness::builder().start().await?;
    harness.compute.create_node(spec("n1")).await?;

    let error = harness.compute.create_node(spec("n1")).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::NameCollision);
    assert_eq!(error.exit_code(), 2);
    assert_eq!(harness.hypervisor.machines_cloned(), 1);
    assert_eq!(harness.hypervisor.list_machines().await?.len(), 2);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_start_failure_leaves_no_clone() -> anyhow::Result<()> {
    let harness = Harness::builder().start().await?;
    harness.hypervisor.fail_start("n1");

    let error = harness.compute.create_node(spec("n1")).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Hypervisor);
    assert!(harness.hypervisor.find_by_name("n1").await?.is_none());
    assert_eq!(harness.compute.list_masters().await?.len(), 1);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_install_timeout_is_bounded() -> anyhow::Result<()> {
    let harness = Harness::builder()
        .options(
            SimulationOptions::builder()
                .install_duration(Duration::from_secs(60))
                .build(),
        )
        .install("1s")
        .start()
        .await?;

    let started = Instant::now();
    let error = harness.compute.create_node(spec("n1")).await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(error.kind(), ErrorKind::InstallTimeout);
    assert_eq!(error.image_id(), Some(IMAGE_ID));
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    assert!(harness.hypervisor.list_machines().await?.is_empty());

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_rebuilt_master_reuses_download() -> anyhow::Result<()> {
    let harness = Harness::builder().start().await?;
    harness.compute.create_node(spec("n1")).await?;
    harness.compute.destroy_node("n1").await?;
    harness.compute.destroy_master(IMAGE_ID).await?;

    harness.compute.create_node(spec("n2")).await?;

    assert_eq!(harness.hypervisor.machines_created(), 2);
    assert_eq!(harness.iso_hits(), 1);

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn spec(name: &str) -> NodeSpec {
    NodeSpec::builder().name(name).image_id(IMAGE_ID).build()
}

/// A compute adapter over the simulated hypervisor, with the install medium served over http.
struct Harness {
    hypervisor: Arc<SimulatedHypervisor>,
    compute: ComputeAdapter,
    hits: Arc<AtomicUsize>,
    _dir: TempDir,
}

#[derive(Default)]
struct HarnessBuilder {
    options: Option<SimulationOptions>,
    sha256: Option<String>,
    install: Option<String>,
    node_running: Option<String>,
}

impl Harness {
    fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    fn iso_hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl HarnessBuilder {
    fn options(mut self, options: SimulationOptions) -> Self {
        self.options = Some(options);
        self
    }

    fn sha256(mut self, digest: &str) -> Self {
        self.sha256 = Some(digest.to_string());
        self
    }

    fn install(mut self, timeout: &str) -> Self {
        self.install = Some(timeout.to_string());
        self
    }

    fn node_running(mut self, timeout: &str) -> Self {
        self.node_running = Some(timeout.to_string());
        self
    }

    async fn start(self) -> anyhow::Result<Harness> {
        let dir = tempfile::tempdir()?;
        let hits = Arc::new(AtomicUsize::new(0));
        let iso_uri = serve_iso(Arc::clone(&hits)).await?;

        let sha256 = self
            .sha256
            .map(|digest| format!("    sha256: {digest}\n"))
            .unwrap_or_default();
        let catalogue = ImageCatalogue::parse(&format!(
            "images:\n  - id: {IMAGE_ID}\n    iso: {iso_uri}\n{sha256}    login_credentials:\n      username: ops\n      password: ops\n"
        ))?;

        let config = ProviderConfig::parse(&format!(
            r#"
            [download]
            dir = "{}"

            [preseed]
            bind_host = "127.0.0.1"

            [timeouts]
            install = "{}"
            min_install = "0s"
            node_running = "{}"
            shutdown = "2s"
            "#,
            dir.path().join("isos").display(),
            self.install.as_deref().unwrap_or("30s"),
            self.node_running.as_deref().unwrap_or("10s"),
        ))?;

        let options = self.options.unwrap_or_else(|| {
            SimulationOptions::builder()
                .install_duration(Duration::from_millis(100))
                .shutdown_delay(Duration::from_millis(20))
                .build()
        });
        let hypervisor = Arc::new(SimulatedHypervisor::new(options));
        let compute = ComputeAdapter::new(&config, catalogue, hypervisor.clone());

        Ok(Harness {
            hypervisor,
            compute,
            hits,
            _dir: dir,
        })
    }
}

/// Serves [`ISO_CONTENTS`] on a loopback port and returns its URL.
async fn serve_iso(hits: Arc<AtomicUsize>) -> anyhow::Result<String> {
    async fn iso(State(hits): State<Arc<AtomicUsize>>) -> &'static [u8] {
        hits.fetch_add(1, Ordering::SeqCst);
        ISO_CONTENTS
    }

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new().route("/ubuntu.iso", get(iso)).with_state(hits);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok(format!("http://{addr}/ubuntu.iso"))
}
