use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::{self, Instant};
use typed_builder::TypedBuilder;

use crate::{
    catalogue::ImageSpec,
    config::{
        master_name, ProviderConfig, DEFAULT_INSTALL_TIMEOUT, DEFAULT_MASTER_CPUS,
        DEFAULT_MASTER_MEMORY_MIB, DEFAULT_MIN_INSTALL_TIME, DEFAULT_POLL_INTERVAL,
        DEFAULT_SHUTDOWN_TIMEOUT,
    },
    fetch::FileFetcher,
    hypervisor::{
        self, ExecutionType, HardwareSettings, Hypervisor, MachineHandle, MachineState,
        NetworkAttachment, IMAGE_ID_KEY, INSTALL_STATE_COMPLETE, INSTALL_STATE_KEY, SSH_PORT_KEY,
    },
    preseed::{PreseedLease, PreseedServer},
    ssh::{SshClient, SshEndpoint},
    utils, VboxcoreError, VboxcoreResult,
};

use super::{BuildMaster, Master};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Installs masters.
///
/// A build downloads the install medium, starts serving the preseed document, creates the master
/// machine, boots it from the medium and types the boot command that points the installer at
/// the preseed server. The install is
/// finished once the guest has powered itself off, or once it answers on ssh and has been shut
/// down.
#[derive(TypedBuilder)]
pub struct MasterBuilder {
    /// The hypervisor masters are created on.
    hypervisor: Arc<dyn Hypervisor>,

    /// Downloads install media.
    #[builder(default = Arc::new(FileFetcher::new()))]
    fetcher: Arc<FileFetcher>,

    /// Serves unattended-install documents.
    preseed: PreseedServer,

    /// Detects installs that finished without powering off.
    ssh: Arc<dyn SshClient>,

    /// Where install media are cached.
    #[builder(setter(into))]
    download_dir: PathBuf,

    /// How masters are started.
    #[builder(default)]
    execution_type: ExecutionType,

    /// The ceiling on a whole install.
    #[builder(default = DEFAULT_INSTALL_TIMEOUT)]
    install_timeout: Duration,

    /// A guest that is powered off before this much time has passed is not done installing.
    #[builder(default = DEFAULT_MIN_INSTALL_TIME)]
    min_install: Duration,

    /// How long a finished guest gets to honour an ACPI shutdown.
    #[builder(default = DEFAULT_SHUTDOWN_TIMEOUT)]
    shutdown_timeout: Duration,

    /// The install polling cadence.
    #[builder(default = DEFAULT_POLL_INTERVAL)]
    poll_interval: Duration,

    /// Keep the machines of failed installs for diagnosis.
    #[builder(default)]
    keep_partials: bool,
}

/// The machine an install runs on.
struct InstallRun<'a> {
    name: &'a str,
    handle: &'a MachineHandle,
    iso: &'a Path,
    ssh_port: u16,
    deadline: Instant,
}

/// How an install ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstallOutcome {
    PoweredOff,
    SshResponded,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MasterBuilder {
    /// Creates a builder with the timeouts and policies of `config`.
    pub fn from_config(
        config: &ProviderConfig,
        hypervisor: Arc<dyn Hypervisor>,
        fetcher: Arc<FileFetcher>,
        preseed: PreseedServer,
        ssh: Arc<dyn SshClient>,
    ) -> Self {
        MasterBuilder::builder()
            .hypervisor(hypervisor)
            .fetcher(fetcher)
            .preseed(preseed)
            .ssh(ssh)
            .download_dir(config.download_dir())
            .execution_type(config.execution.execution_type)
            .install_timeout(config.install_timeout())
            .min_install(config.timeouts.min_install.get())
            .shutdown_timeout(config.timeouts.shutdown.get())
            .keep_partials(config.master.keep_partials)
            .build()
    }

    /// Returns the finished master registered for `spec`, removing a stale partial one.
    async fn existing(&self, spec: &ImageSpec, name: &str) -> VboxcoreResult<Option<Master>> {
        let Some(handle) = self.hypervisor.find_by_name(name).await? else {
            return Ok(None);
        };

        let install_state = self
            .hypervisor
            .get_extra_data(&handle, INSTALL_STATE_KEY)
            .await?;

        if install_state.as_deref() == Some(INSTALL_STATE_COMPLETE) {
            let info = self.hypervisor.machine_info(&handle).await?;
            if let Some(disk) = info.hard_disk {
                tracing::info!(%handle, name, "adopting finished master");
                return Ok(Some(
                    Master::builder()
                        .image_id(spec.get_id())
                        .machine_handle(handle)
                        .source_hard_disk_path(disk)
                        .login_credentials(spec.get_login_credentials().clone())
                        .build(),
                ));
            }

            tracing::warn!(%handle, name, "finished master has no disk, treating it as partial");
        }

        if self.keep_partials {
            return Err(VboxcoreError::Hypervisor(format!(
                "a partial master {name} ({handle}) is registered; remove it or disable \
                 master.keep_partials"
            )));
        }

        tracing::warn!(%handle, name, "removing partial master");
        hypervisor::force_remove(self.hypervisor.as_ref(), &handle).await;
        Ok(None)
    }

    async fn install(&self, spec: &ImageSpec, name: &str) -> VboxcoreResult<Master> {
        let iso = self
            .fetcher
            .fetch(
                spec.get_install_medium_uri(),
                &self.download_dir,
                spec.get_install_medium_sha256().as_deref(),
            )
            .await?;

        let deadline = Instant::now() + self.install_timeout;
        let document = spec
            .get_preseed_template()
            .render(&spec.template_context(name, None))?;
        let lease = self.lease(&document, deadline, spec).await?;

        let ssh_port = utils::free_local_port()?;
        let handle = match self.hypervisor.create_machine(name, &spec.os_type()).await {
            Ok(handle) => handle,
            Err(e) => {
                utils::release_local_port(ssh_port);
                return Err(e);
            }
        };
        tracing::info!(%handle, name, preseed_url = lease.url(), "created master machine");

        let provisioned = self
            .provision(
                spec,
                InstallRun {
                    name,
                    handle: &handle,
                    iso: &iso,
                    ssh_port,
                    deadline,
                },
                lease,
            )
            .await;

        // The master never boots again, so its install forward is free for nodes.
        utils::release_local_port(ssh_port);

        match provisioned {
            Ok(disk) => Ok(Master::builder()
                .image_id(spec.get_id())
                .machine_handle(handle)
                .source_hard_disk_path(disk)
                .login_credentials(spec.get_login_credentials().clone())
                .build()),
            Err(e) => {
                if self.keep_partials {
                    tracing::warn!(%handle, name, "keeping partial master for diagnosis");
                } else {
                    hypervisor::force_remove(self.hypervisor.as_ref(), &handle).await;
                }
                Err(e)
            }
        }
    }

    /// Sets the machine up, runs the install and marks the master finished.
    async fn provision(
        &self,
        spec: &ImageSpec,
        run: InstallRun<'_>,
        lease: PreseedLease,
    ) -> VboxcoreResult<PathBuf> {
        let InstallRun {
            name,
            handle,
            iso,
            ssh_port,
            deadline,
        } = run;

        let disk = self
            .hypervisor
            .create_hard_disk(handle, *spec.get_disk_mib())
            .await?;
        self.hypervisor.attach_hard_disk(handle, &disk).await?;

        let hardware = HardwareSettings::builder()
            .cpus(DEFAULT_MASTER_CPUS)
            .memory_mib(DEFAULT_MASTER_MEMORY_MIB)
            .nics(vec![NetworkAttachment::nat_with_ssh(ssh_port)])
            .build();
        self.hypervisor.set_hardware(handle, &hardware).await?;
        self.hypervisor.attach_iso(handle, iso).await?;

        self.hypervisor
            .set_extra_data(handle, IMAGE_ID_KEY, spec.get_id())
            .await?;
        self.hypervisor
            .set_extra_data(handle, SSH_PORT_KEY, &ssh_port.to_string())
            .await?;

        let boot_command = spec
            .get_boot_command()
            .render(&spec.template_context(name, Some(lease.url())))?;

        self.hypervisor
            .start_machine(handle, self.execution_type)
            .await?;
        let started = Instant::now();
        tracing::info!(%handle, preseed_url = lease.url(), "master booted from install medium");

        self.hypervisor.type_keys(handle, &boot_command).await?;

        let outcome = self
            .wait_for_install(spec, handle, ssh_port, started, deadline, lease)
            .await?;
        tracing::info!(%handle, ?outcome, elapsed = ?started.elapsed(), "install finished");

        if outcome == InstallOutcome::SshResponded {
            self.shut_down(handle).await?;
        }

        self.hypervisor.detach_iso(handle).await?;
        self.hypervisor
            .set_extra_data(handle, INSTALL_STATE_KEY, INSTALL_STATE_COMPLETE)
            .await?;

        Ok(disk)
    }

    /// Leases the preseed server, waiting while it serves another image's document.
    async fn lease(
        &self,
        document: &str,
        deadline: Instant,
        spec: &ImageSpec,
    ) -> VboxcoreResult<PreseedLease> {
        loop {
            match self.preseed.acquire(document) {
                Ok(lease) => return Ok(lease),
                Err(VboxcoreError::Conflict(reason)) => {
                    if Instant::now() + self.poll_interval >= deadline {
                        return Err(self.install_timeout(spec));
                    }

                    tracing::debug!(image_id = spec.get_id(), reason, "waiting for preseed server");
                    time::sleep(self.poll_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn wait_for_install(
        &self,
        spec: &ImageSpec,
        handle: &MachineHandle,
        ssh_port: u16,
        started: Instant,
        deadline: Instant,
        lease: PreseedLease,
    ) -> VboxcoreResult<InstallOutcome> {
        let endpoint = SshEndpoint::loopback(ssh_port);
        let mut lease = Some(lease);
        let mut ticker = utils::poll_ticker(self.poll_interval);

        loop {
            if time::timeout_at(deadline, ticker.tick()).await.is_err() {
                return Err(self.install_timeout(spec));
            }

            if lease.as_ref().is_some_and(|lease| lease.served() > 0) {
                tracing::debug!(%handle, "preseed document fetched, releasing the server");
                lease = None;
            }

            match self.hypervisor.get_state(handle).await? {
                MachineState::PoweredOff if started.elapsed() >= self.min_install => {
                    return Ok(InstallOutcome::PoweredOff);
                }
                state @ (MachineState::Aborted | MachineState::Stuck) => {
                    return Err(VboxcoreError::Hypervisor(format!(
                        "master {handle} entered state {state} during install"
                    )));
                }
                MachineState::Running => {
                    if let Ok(true) = time::timeout_at(deadline, self.ssh.responds(&endpoint)).await
                    {
                        return Ok(InstallOutcome::SshResponded);
                    }
                }
                _ => {}
            }
        }
    }

    /// Shuts a finished guest down, forcing it off if it ignores the ACPI request.
    async fn shut_down(&self, handle: &MachineHandle) -> VboxcoreResult<()> {
        self.hypervisor.acpi_shutdown(handle).await?;

        let stopped = hypervisor::wait_for_state(
            self.hypervisor.as_ref(),
            handle,
            MachineState::PoweredOff,
            self.poll_interval,
            self.shutdown_timeout,
        )
        .await?;

        if !stopped {
            tracing::warn!(%handle, "master ignored ACPI shutdown, powering off");
            self.hypervisor.stop_machine(handle).await?;
        }

        Ok(())
    }

    fn install_timeout(&self, spec: &ImageSpec) -> VboxcoreError {
        VboxcoreError::InstallTimeout {
            image_id: spec.get_id().clone(),
            timeout: self.install_timeout,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl BuildMaster for MasterBuilder {
    async fn build(&self, spec: &ImageSpec) -> VboxcoreResult<Master> {
        let image_id = spec.get_id();
        let name = master_name(image_id);

        let result = match self.existing(spec, &name).await {
            Ok(Some(master)) => Ok(master),
            Ok(None) => {
                tracing::info!(image_id, name, "building master");
                self.install(spec, &name).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(master) => {
                tracing::info!(image_id, handle = %master.get_machine_handle(), "master ready");
                Ok(master)
            }
            Err(e) => {
                if matches!(e, VboxcoreError::Invariant(_)) {
                    tracing::error!(image_id, error = %e, "master build failed");
                } else {
                    tracing::warn!(image_id, error = %e, "master build failed");
                }
                Err(e.with_image(image_id.as_str()))
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use reqwest::Url;

    use super::*;
    use crate::{
        catalogue::{ImageSpec, LoginCredentials},
        config::PreseedSection,
        hypervisor::{SimulatedHypervisor, SimulationOptions},
        ssh::BannerProbe,
        ErrorKind,
    };

    struct Fixture {
        hypervisor: Arc<SimulatedHypervisor>,
        preseed: PreseedServer,
        builder: MasterBuilder,
        iso_uri: String,
        _dir: tempfile::TempDir,
    }

    async fn fixture(install: Duration, install_timeout: Duration) -> anyhow::Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let iso = dir.path().join("ubuntu.iso");
        tokio::fs::write(&iso, b"iso").await?;
        let iso_uri = Url::from_file_path(&iso)
            .map_err(|_| anyhow::anyhow!("bad path"))?
            .to_string();

        let hypervisor = Arc::new(SimulatedHypervisor::new(
            SimulationOptions::builder()
                .install_duration(install)
                .shutdown_delay(Duration::from_millis(10))
                .build(),
        ));

        let preseed = PreseedServer::new(PreseedSection {
            bind_host: "127.0.0.1".to_string(),
            ..Default::default()
        });

        let builder = MasterBuilder::builder()
            .hypervisor(hypervisor.clone())
            .preseed(preseed.clone())
            .ssh(Arc::new(BannerProbe))
            .download_dir(dir.path().join("isos"))
            .install_timeout(install_timeout)
            .min_install(Duration::ZERO)
            .poll_interval(Duration::from_millis(10))
            .build();

        Ok(Fixture {
            hypervisor,
            preseed,
            builder,
            iso_uri,
            _dir: dir,
        })
    }

    fn image(uri: &str) -> ImageSpec {
        ImageSpec::builder()
            .id("ubuntu-22-amd64")
            .install_medium_uri(uri)
            .login_credentials(
                LoginCredentials::builder()
                    .username("ops")
                    .password("ops")
                    .build(),
            )
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn test_build_installs_and_tags_master() -> anyhow::Result<()> {
        let fx = fixture(Duration::from_millis(30), Duration::from_secs(5)).await?;
        let spec = image(&fx.iso_uri);

        let master = fx.builder.build(&spec).await?;
        let handle = master.get_machine_handle();

        assert_eq!(master.get_image_id(), "ubuntu-22-amd64");
        assert_eq!(
            fx.hypervisor.get_state(handle).await?,
            MachineState::PoweredOff
        );
        assert_eq!(
            fx.hypervisor
                .get_extra_data(handle, INSTALL_STATE_KEY)
                .await?
                .as_deref(),
            Some(INSTALL_STATE_COMPLETE)
        );
        assert_eq!(
            fx.hypervisor.find_by_name("master-ubuntu-22-amd64").await?,
            Some(handle.clone())
        );

        let typed = fx.hypervisor.typed_keys(handle)?;
        assert_eq!(typed.len(), 1);
        assert!(typed[0].contains("preseed/url=http://10.0.2.2:"));
        assert!(typed[0].contains("hostname=master-ubuntu-22-amd64"));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_build_adopts_finished_master() -> anyhow::Result<()> {
        let fx = fixture(Duration::from_millis(10), Duration::from_secs(5)).await?;
        let spec = image(&fx.iso_uri);

        let first = fx.builder.build(&spec).await?;
        let second = fx.builder.build(&spec).await?;

        assert_eq!(first, second);
        assert_eq!(fx.hypervisor.machines_created(), 1);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_build_replaces_partial_master() -> anyhow::Result<()> {
        let fx = fixture(Duration::from_millis(10), Duration::from_secs(5)).await?;
        let stale = fx
            .hypervisor
            .create_machine("master-ubuntu-22-amd64", "Ubuntu_64")
            .await?;

        let master = fx.builder.build(&image(&fx.iso_uri)).await?;

        assert_ne!(master.get_machine_handle(), &stale);
        assert_eq!(fx.hypervisor.list_machines().await?.len(), 1);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_build_times_out_and_cleans_up() -> anyhow::Result<()> {
        let fx = fixture(Duration::from_secs(3600), Duration::from_millis(200)).await?;
        let started = Instant::now();

        let error = fx.builder.build(&image(&fx.iso_uri)).await.unwrap_err();

        assert_eq!(error.kind(), ErrorKind::InstallTimeout);
        assert_eq!(error.image_id(), Some("ubuntu-22-amd64"));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(fx.hypervisor.list_machines().await?.is_empty());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_integrity_failure_creates_no_machine() -> anyhow::Result<()> {
        let fx = fixture(Duration::from_millis(10), Duration::from_secs(5)).await?;
        let spec = ImageSpec::builder()
            .id("ubuntu-22-amd64")
            .install_medium_uri(fx.iso_uri.as_str())
            .install_medium_sha256("0".repeat(64))
            .build();

        let error = fx.builder.build(&spec).await.unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Integrity);
        assert_eq!(fx.hypervisor.machines_created(), 0);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_busy_preseed_server_delays_machine_creation() -> anyhow::Result<()> {
        let fx = fixture(Duration::from_millis(10), Duration::from_millis(300)).await?;
        let other = fx.preseed.acquire("d-i debian-installer/locale string en_GB\n")?;

        let error = fx.builder.build(&image(&fx.iso_uri)).await.unwrap_err();

        assert_eq!(error.kind(), ErrorKind::InstallTimeout);
        assert_eq!(fx.hypervisor.machines_created(), 0);

        drop(other);
        fx.builder.build(&image(&fx.iso_uri)).await?;
        assert_eq!(fx.hypervisor.machines_created(), 1);

        Ok(())
    }
}
