use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use getset::Getters;
use tokio::{io::AsyncWriteExt, net::TcpListener, task::JoinHandle};
use typed_builder::TypedBuilder;

use crate::{VboxcoreError, VboxcoreResult};

use super::{
    encode, CloneMode, ExecutionType, HardwareSettings, Hypervisor, MachineHandle, MachineInfo,
    MachineState, NetworkAttachment,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The banner simulated guests greet ssh clients with.
pub const SIMULATED_SSH_BANNER: &str = "SSH-2.0-OpenSSH_8.9p1 vboxcore-simulated\r\n";

/// The address simulated guests report on their NAT adapter.
const SIMULATED_GUEST_ADDRESS: &str = "10.0.2.15";

const SIMULATED_DISK_ROOT: &str = "/simulated";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How the simulated guests behave.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SimulationOptions {
    /// How long an install boot runs before the guest powers itself off.
    #[builder(default = Duration::from_millis(200))]
    install_duration: Duration,

    /// How long a guest takes to honour an ACPI shutdown.
    #[builder(default = Duration::from_millis(50))]
    shutdown_delay: Duration,

    /// Whether running guests answer on their ssh forwards.
    #[builder(default = true)]
    guest_ssh: bool,

    /// Whether guests ignore ACPI power button presses.
    #[builder(default)]
    ignore_acpi: bool,
}

/// An in-memory hypervisor.
///
/// Machines live in a table instead of on disk. A machine booted with an ISO attached installs
/// for [`install_duration`](SimulationOptions::get_install_duration) and then powers off. A
/// machine booted from its disk opens real loopback listeners on its NAT ssh forwards that greet
/// clients with [`SIMULATED_SSH_BANNER`].
#[derive(Debug, Clone)]
pub struct SimulatedHypervisor {
    options: SimulationOptions,
    inner: Arc<Mutex<Simulation>>,
}

#[derive(Debug, Default)]
struct Simulation {
    machines: BTreeMap<MachineHandle, SimulatedMachine>,
    failing_starts: HashSet<String>,
    ssh_ports: Vec<u16>,
    created: usize,
    stopped: usize,
    cloned: usize,
    next_id: u64,
}

#[derive(Debug)]
struct SimulatedMachine {
    name: String,
    os_type: String,
    state: MachineState,
    cpus: u32,
    memory_mib: u32,
    nics: Vec<NetworkAttachment>,
    hard_disk: Option<PathBuf>,
    dvd: Option<PathBuf>,
    extra_data: HashMap<String, String>,
    typed: Vec<String>,

    /// Bumped on every power transition so stale timers do nothing.
    boot: u64,
    guest: Vec<JoinHandle<()>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SimulatedHypervisor {
    /// Creates an empty simulation.
    pub fn new(options: SimulationOptions) -> Self {
        Self {
            options,
            inner: Arc::new(Mutex::new(Simulation::default())),
        }
    }

    /// Makes every later `start_machine` of the machine named `name` fail.
    pub fn fail_start(&self, name: impl Into<String>) {
        self.simulation().failing_starts.insert(name.into());
    }

    /// Forces a machine into `state` without running any guest behaviour.
    pub fn set_state(&self, handle: &MachineHandle, state: MachineState) -> VboxcoreResult<()> {
        let mut simulation = self.simulation();
        let machine = simulation.machine_mut(handle)?;
        machine.power_transition();
        machine.state = state;
        Ok(())
    }

    /// The number of machines registered with `create_machine`.
    pub fn machines_created(&self) -> usize {
        self.simulation().created
    }

    /// The number of machines registered with `clone_machine`.
    pub fn machines_cloned(&self) -> usize {
        self.simulation().cloned
    }

    /// The number of forced power-offs.
    pub fn machines_stopped(&self) -> usize {
        self.simulation().stopped
    }

    /// Every host port given an ssh forward by `set_hardware`, in order.
    pub fn ssh_ports_assigned(&self) -> Vec<u16> {
        self.simulation().ssh_ports.clone()
    }

    /// Everything typed on the machine's keyboard, one entry per `type_keys` call.
    pub fn typed_keys(&self, handle: &MachineHandle) -> VboxcoreResult<Vec<String>> {
        let mut simulation = self.simulation();
        Ok(simulation.machine_mut(handle)?.typed.clone())
    }

    fn simulation(&self) -> MutexGuard<'_, Simulation> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Powers the guest off after `delay` unless it changed power state in the meantime.
    fn power_off_after(&self, handle: MachineHandle, boot: u64, delay: Duration) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let mut simulation = inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(machine) = simulation.machines.get_mut(&handle) {
                if machine.boot == boot {
                    machine.power_transition();
                    machine.state = MachineState::PoweredOff;
                    tracing::debug!(%handle, "simulated guest powered off");
                }
            }
        });
    }
}

impl Simulation {
    fn machine_mut(&mut self, handle: &MachineHandle) -> VboxcoreResult<&mut SimulatedMachine> {
        self.machines
            .get_mut(handle)
            .ok_or_else(|| VboxcoreError::Hypervisor(format!("no machine with handle {handle}")))
    }

    fn name_taken(&self, name: &str) -> bool {
        self.machines.values().any(|machine| machine.name == name)
    }

    fn register(&mut self, machine: SimulatedMachine) -> VboxcoreResult<MachineHandle> {
        if self.name_taken(&machine.name) {
            return Err(VboxcoreError::Hypervisor(format!(
                "a machine named {} is already registered",
                machine.name
            )));
        }

        self.next_id += 1;
        let handle = MachineHandle::new(format!("sim-{:08}", self.next_id));
        self.machines.insert(handle.clone(), machine);
        Ok(handle)
    }
}

impl SimulatedMachine {
    fn new(name: &str, os_type: &str) -> Self {
        Self {
            name: name.to_string(),
            os_type: os_type.to_string(),
            state: MachineState::PoweredOff,
            cpus: 1,
            memory_mib: 128,
            nics: Vec::new(),
            hard_disk: None,
            dvd: None,
            extra_data: HashMap::new(),
            typed: Vec::new(),
            boot: 0,
            guest: Vec::new(),
        }
    }

    fn is_on(&self) -> bool {
        !matches!(
            self.state,
            MachineState::PoweredOff | MachineState::Aborted | MachineState::Null
        )
    }

    fn power_transition(&mut self) {
        self.boot += 1;
        for task in self.guest.drain(..) {
            task.abort();
        }
    }

    fn ensure_off(&self, handle: &MachineHandle, operation: &str) -> VboxcoreResult<()> {
        if self.is_on() {
            return Err(VboxcoreError::Hypervisor(format!(
                "cannot {operation} machine {handle} while it is {}",
                self.state
            )));
        }

        Ok(())
    }

    fn info(&self, handle: &MachineHandle) -> MachineInfo {
        let guest_addresses = if self.state == MachineState::Running && self.dvd.is_none() {
            self.nics
                .iter()
                .filter(|nic| matches!(nic, NetworkAttachment::Nat { .. }))
                .map(|_| SIMULATED_GUEST_ADDRESS.to_string())
                .take(1)
                .collect()
        } else {
            Vec::new()
        };

        MachineInfo::builder()
            .handle(handle.clone())
            .name(self.name.clone())
            .state(self.state)
            .os_type(self.os_type.clone())
            .cpus(self.cpus)
            .memory_mib(self.memory_mib)
            .nics(self.nics.clone())
            .hard_disk(self.hard_disk.clone())
            .guest_addresses(guest_addresses)
            .build()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Accepts connections on `address` and greets each with the ssh banner.
fn spawn_ssh_listener(handle: MachineHandle, address: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&address).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(%handle, %address, error = %e, "simulated guest could not listen");
                return;
            }
        };

        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                continue;
            };

            tokio::spawn(async move {
                let _ = stream.write_all(SIMULATED_SSH_BANNER.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for SimulationOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[async_trait]
impl Hypervisor for SimulatedHypervisor {
    async fn create_machine(&self, name: &str, os_type: &str) -> VboxcoreResult<MachineHandle> {
        let mut simulation = self.simulation();
        let handle = simulation.register(SimulatedMachine::new(name, os_type))?;
        simulation.created += 1;

        tracing::debug!(%handle, name, "simulated machine created");
        Ok(handle)
    }

    async fn create_hard_disk(
        &self,
        handle: &MachineHandle,
        _size_mib: u64,
    ) -> VboxcoreResult<PathBuf> {
        let mut simulation = self.simulation();
        let machine = simulation.machine_mut(handle)?;
        Ok(Path::new(SIMULATED_DISK_ROOT)
            .join(&machine.name)
            .join(format!("{}.vdi", machine.name)))
    }

    async fn attach_hard_disk(&self, handle: &MachineHandle, path: &Path) -> VboxcoreResult<()> {
        let mut simulation = self.simulation();
        let machine = simulation.machine_mut(handle)?;
        machine.ensure_off(handle, "attach a disk to")?;
        machine.hard_disk = Some(path.to_path_buf());
        Ok(())
    }

    async fn attach_iso(&self, handle: &MachineHandle, path: &Path) -> VboxcoreResult<()> {
        let mut simulation = self.simulation();
        simulation.machine_mut(handle)?.dvd = Some(path.to_path_buf());
        Ok(())
    }

    async fn detach_iso(&self, handle: &MachineHandle) -> VboxcoreResult<()> {
        let mut simulation = self.simulation();
        simulation.machine_mut(handle)?.dvd = None;
        Ok(())
    }

    async fn set_hardware(
        &self,
        handle: &MachineHandle,
        hardware: &HardwareSettings,
    ) -> VboxcoreResult<()> {
        let mut simulation = self.simulation();
        let machine = simulation.machine_mut(handle)?;
        machine.ensure_off(handle, "change the hardware of")?;
        machine.cpus = *hardware.get_cpus();
        machine.memory_mib = *hardware.get_memory_mib();
        machine.nics = hardware.get_nics().clone();

        let ports = hardware
            .get_nics()
            .iter()
            .filter_map(|nic| match nic {
                NetworkAttachment::Nat { forwards } => Some(forwards),
                _ => None,
            })
            .flatten()
            .filter(|forward| forward.guest_port == crate::config::SSH_GUEST_PORT)
            .map(|forward| forward.host_port)
            .collect::<Vec<_>>();
        simulation.ssh_ports.extend(ports);

        Ok(())
    }

    async fn start_machine(
        &self,
        handle: &MachineHandle,
        execution_type: ExecutionType,
    ) -> VboxcoreResult<()> {
        let (boot, installing) = {
            let mut simulation = self.simulation();
            let failing = simulation.failing_starts.clone();
            let guest_ssh = self.options.guest_ssh;
            let machine = simulation.machine_mut(handle)?;

            if failing.contains(&machine.name) {
                return Err(VboxcoreError::Hypervisor(format!(
                    "simulated start failure for {}",
                    machine.name
                )));
            }
            machine.ensure_off(handle, "start")?;

            machine.power_transition();
            machine.state = MachineState::Running;

            let installing = machine.dvd.is_some();
            if !installing && guest_ssh {
                let listeners = machine
                    .nics
                    .iter()
                    .filter_map(|nic| match nic {
                        NetworkAttachment::Nat { forwards } => Some(forwards),
                        _ => None,
                    })
                    .flatten()
                    .filter(|forward| forward.guest_port == crate::config::SSH_GUEST_PORT)
                    .map(|forward| {
                        spawn_ssh_listener(
                            handle.clone(),
                            format!("{}:{}", forward.host_ip, forward.host_port),
                        )
                    })
                    .collect::<Vec<_>>();
                machine.guest = listeners;
            }

            (machine.boot, installing)
        };

        if installing {
            self.power_off_after(handle.clone(), boot, self.options.install_duration);
        }

        tracing::debug!(%handle, %execution_type, installing, "simulated machine started");
        Ok(())
    }

    async fn stop_machine(&self, handle: &MachineHandle) -> VboxcoreResult<()> {
        let mut simulation = self.simulation();
        let machine = simulation.machine_mut(handle)?;
        if !machine.is_on() {
            return Err(VboxcoreError::Hypervisor(format!(
                "machine {handle} is not running"
            )));
        }

        machine.power_transition();
        machine.state = MachineState::PoweredOff;
        simulation.stopped += 1;
        Ok(())
    }

    async fn acpi_shutdown(&self, handle: &MachineHandle) -> VboxcoreResult<()> {
        let boot = {
            let mut simulation = self.simulation();
            let machine = simulation.machine_mut(handle)?;
            if machine.state != MachineState::Running {
                return Err(VboxcoreError::Hypervisor(format!(
                    "machine {handle} is not running"
                )));
            }

            if self.options.ignore_acpi {
                tracing::debug!(%handle, "simulated guest ignored ACPI shutdown");
                return Ok(());
            }

            machine.state = MachineState::Stopping;
            machine.boot
        };

        self.power_off_after(handle.clone(), boot, self.options.shutdown_delay);
        Ok(())
    }

    async fn get_state(&self, handle: &MachineHandle) -> VboxcoreResult<MachineState> {
        let mut simulation = self.simulation();
        Ok(simulation.machine_mut(handle)?.state)
    }

    async fn machine_info(&self, handle: &MachineHandle) -> VboxcoreResult<MachineInfo> {
        let mut simulation = self.simulation();
        Ok(simulation.machine_mut(handle)?.info(handle))
    }

    async fn clone_machine(
        &self,
        source: &MachineHandle,
        name: &str,
        mode: CloneMode,
    ) -> VboxcoreResult<MachineHandle> {
        let mut simulation = self.simulation();
        let original = simulation.machine_mut(source)?;
        original.ensure_off(source, "clone")?;

        let hard_disk = match mode {
            CloneMode::Linked => original.hard_disk.clone(),
            CloneMode::Full => Some(
                Path::new(SIMULATED_DISK_ROOT)
                    .join(name)
                    .join(format!("{name}.vdi")),
            ),
        };

        let copy = SimulatedMachine {
            name: name.to_string(),
            os_type: original.os_type.clone(),
            cpus: original.cpus,
            memory_mib: original.memory_mib,
            nics: original.nics.clone(),
            hard_disk,
            extra_data: original.extra_data.clone(),
            ..SimulatedMachine::new(name, &original.os_type)
        };

        let handle = simulation.register(copy)?;
        simulation.cloned += 1;

        tracing::debug!(%source, %handle, name, %mode, "simulated machine cloned");
        Ok(handle)
    }

    async fn delete_machine(&self, handle: &MachineHandle) -> VboxcoreResult<()> {
        let mut simulation = self.simulation();
        simulation.machine_mut(handle)?.ensure_off(handle, "delete")?;

        if let Some(mut machine) = simulation.machines.remove(handle) {
            machine.power_transition();
        }

        Ok(())
    }

    async fn list_machines(&self) -> VboxcoreResult<Vec<MachineHandle>> {
        Ok(self.simulation().machines.keys().cloned().collect())
    }

    async fn find_by_name(&self, name: &str) -> VboxcoreResult<Option<MachineHandle>> {
        Ok(self
            .simulation()
            .machines
            .iter()
            .find(|(_, machine)| machine.name == name)
            .map(|(handle, _)| handle.clone()))
    }

    async fn set_extra_data(
        &self,
        handle: &MachineHandle,
        key: &str,
        value: &str,
    ) -> VboxcoreResult<()> {
        let mut simulation = self.simulation();
        let extra_data = &mut simulation.machine_mut(handle)?.extra_data;
        if value.is_empty() {
            extra_data.remove(key);
        } else {
            extra_data.insert(key.to_string(), value.to_string());
        }

        Ok(())
    }

    async fn get_extra_data(
        &self,
        handle: &MachineHandle,
        key: &str,
    ) -> VboxcoreResult<Option<String>> {
        let mut simulation = self.simulation();
        Ok(simulation.machine_mut(handle)?.extra_data.get(key).cloned())
    }

    async fn type_keys(&self, handle: &MachineHandle, text: &str) -> VboxcoreResult<()> {
        encode(text)?;

        let mut simulation = self.simulation();
        let machine = simulation.machine_mut(handle)?;
        if machine.state != MachineState::Running {
            return Err(VboxcoreError::Hypervisor(format!(
                "cannot type on machine {handle} while it is {}",
                machine.state
            )));
        }

        machine.typed.push(text.to_string());
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::{
        hypervisor::{wait_for_state, PortForward},
        utils::free_local_port,
    };

    fn fast() -> SimulatedHypervisor {
        SimulatedHypervisor::new(
            SimulationOptions::builder()
                .install_duration(Duration::from_millis(50))
                .shutdown_delay(Duration::from_millis(10))
                .build(),
        )
    }

    #[tokio::test]
    async fn test_install_boot_powers_off() -> anyhow::Result<()> {
        let hypervisor = fast();
        let handle = hypervisor.create_machine("master-ubuntu", "Ubuntu_64").await?;
        hypervisor
            .attach_iso(&handle, Path::new("/tmp/ubuntu.iso"))
            .await?;
        hypervisor
            .start_machine(&handle, ExecutionType::Headless)
            .await?;

        assert_eq!(hypervisor.get_state(&handle).await?, MachineState::Running);
        assert!(
            wait_for_state(
                &hypervisor,
                &handle,
                MachineState::PoweredOff,
                Duration::from_millis(10),
                Duration::from_secs(2),
            )
            .await?
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_running_guest_answers_on_ssh_forward() -> anyhow::Result<()> {
        let hypervisor = fast();
        let port = free_local_port()?;
        let handle = hypervisor.create_machine("n1", "Ubuntu_64").await?;
        hypervisor
            .set_hardware(
                &handle,
                &HardwareSettings::builder()
                    .cpus(1)
                    .memory_mib(512)
                    .nics(vec![NetworkAttachment::Nat {
                        forwards: vec![PortForward::ssh(port)],
                    }])
                    .build(),
            )
            .await?;
        hypervisor
            .start_machine(&handle, ExecutionType::Headless)
            .await?;

        let mut banner = String::new();
        for _ in 0..50 {
            if let Ok(mut stream) = tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
                stream.read_to_string(&mut banner).await?;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(banner.starts_with("SSH-2.0-"));

        let info = hypervisor.machine_info(&handle).await?;
        assert_eq!(info.ssh_port(), Some(port));
        assert_eq!(info.guest_addresses, vec!["10.0.2.15".to_string()]);

        Ok(())
    }

    #[tokio::test]
    async fn test_rules_mirror_virtualbox() -> anyhow::Result<()> {
        let hypervisor = fast();
        let handle = hypervisor.create_machine("n1", "Ubuntu_64").await?;

        assert!(hypervisor.create_machine("n1", "Ubuntu_64").await.is_err());

        hypervisor.set_state(&handle, MachineState::Running)?;
        let hardware = HardwareSettings::builder().cpus(2).memory_mib(2048).build();
        assert!(hypervisor.set_hardware(&handle, &hardware).await.is_err());
        assert!(hypervisor.delete_machine(&handle).await.is_err());
        assert!(hypervisor
            .clone_machine(&handle, "n2", CloneMode::Linked)
            .await
            .is_err());

        hypervisor.acpi_shutdown(&handle).await?;
        assert_eq!(hypervisor.get_state(&handle).await?, MachineState::Stopping);
        assert!(
            wait_for_state(
                &hypervisor,
                &handle,
                MachineState::PoweredOff,
                Duration::from_millis(5),
                Duration::from_secs(1),
            )
            .await?
        );

        hypervisor.delete_machine(&handle).await?;
        assert!(hypervisor.list_machines().await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_clone_copies_settings_and_tags() -> anyhow::Result<()> {
        let hypervisor = fast();
        let master = hypervisor.create_machine("master-ubuntu", "Ubuntu_64").await?;
        let disk = hypervisor.create_hard_disk(&master, 8192).await?;
        hypervisor.attach_hard_disk(&master, &disk).await?;
        hypervisor
            .set_extra_data(&master, "vboxcore/install-state", "complete")
            .await?;

        let linked = hypervisor
            .clone_machine(&master, "n1", CloneMode::Linked)
            .await?;
        let full = hypervisor
            .clone_machine(&master, "n2", CloneMode::Full)
            .await?;

        assert_eq!(hypervisor.machines_cloned(), 2);
        assert_eq!(
            hypervisor.machine_info(&linked).await?.hard_disk,
            Some(disk.clone())
        );
        assert_ne!(hypervisor.machine_info(&full).await?.hard_disk, Some(disk));
        assert_eq!(
            hypervisor
                .get_extra_data(&full, "vboxcore/install-state")
                .await?,
            Some("complete".to_string())
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_fail_start() -> anyhow::Result<()> {
        let hypervisor = fast();
        hypervisor.fail_start("n1");
        let handle = hypervisor.create_machine("n1", "Ubuntu_64").await?;

        assert!(hypervisor
            .start_machine(&handle, ExecutionType::Headless)
            .await
            .is_err());
        assert_eq!(
            hypervisor.get_state(&handle).await?,
            MachineState::PoweredOff
        );

        Ok(())
    }
}
