use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::{catalogue::ImageSpec, VboxcoreError, VboxcoreResult};

use super::{BuildMaster, Master};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

type BuildOutcome = Result<Master, Arc<VboxcoreError>>;

/// The masters of a process, keyed by image id.
///
/// At most one build per image runs at any time. Callers asking for an image whose build is in
/// flight wait for that build and observe its outcome. Successes are kept until
/// [`invalidate`](Self::invalidate)d. Failures are not kept, so the next call starts over.
///
/// Builds run on their own task: a caller that stops waiting does not stop the build.
pub struct MasterCache {
    builder: Arc<dyn BuildMaster>,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    generations: AtomicU64,
}

#[derive(Clone)]
enum Entry {
    Building {
        generation: u64,
        outcome: Shared<BoxFuture<'static, BuildOutcome>>,
    },
    Present(Master),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MasterCache {
    /// Creates an empty cache building masters with `builder`.
    pub fn new(builder: Arc<dyn BuildMaster>) -> Self {
        Self {
            builder,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    /// Returns the master of `spec`, building it first if needed.
    pub async fn get(&self, spec: &ImageSpec) -> VboxcoreResult<Master> {
        let outcome = {
            let mut entries = lock(&self.entries);
            match entries.get(spec.get_id()) {
                Some(Entry::Present(master)) => return Ok(master.clone()),
                Some(Entry::Building { outcome, .. }) => {
                    tracing::debug!(image_id = spec.get_id(), "joining master build in flight");
                    outcome.clone()
                }
                None => {
                    let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
                    let outcome = self.spawn_build(spec.clone(), generation);
                    entries.insert(
                        spec.get_id().clone(),
                        Entry::Building {
                            generation,
                            outcome: outcome.clone(),
                        },
                    );
                    outcome
                }
            }
        };

        outcome.await.map_err(VboxcoreError::Shared)
    }

    /// Forgets the master of `image_id` and returns it. The machine itself is left alone.
    ///
    /// A build in flight is detached: its waiters still get its outcome, but the outcome is not
    /// cached.
    pub fn invalidate(&self, image_id: &str) -> Option<Master> {
        match lock(&self.entries).remove(image_id) {
            Some(Entry::Present(master)) => {
                tracing::info!(image_id, "master invalidated");
                Some(master)
            }
            Some(Entry::Building { .. }) => {
                tracing::info!(image_id, "master build detached");
                None
            }
            None => None,
        }
    }

    /// The cached master of `image_id`, without building.
    pub fn peek(&self, image_id: &str) -> Option<Master> {
        match lock(&self.entries).get(image_id) {
            Some(Entry::Present(master)) => Some(master.clone()),
            _ => None,
        }
    }

    /// The cached masters, ordered by image id.
    pub fn masters(&self) -> Vec<Master> {
        let mut masters = lock(&self.entries)
            .values()
            .filter_map(|entry| match entry {
                Entry::Present(master) => Some(master.clone()),
                Entry::Building { .. } => None,
            })
            .collect::<Vec<_>>();

        masters.sort_by(|a, b| a.get_image_id().cmp(b.get_image_id()));
        masters
    }

    /// Whether a build for `image_id` is in flight.
    pub fn is_building(&self, image_id: &str) -> bool {
        matches!(
            lock(&self.entries).get(image_id),
            Some(Entry::Building { .. })
        )
    }

    fn spawn_build(
        &self,
        spec: ImageSpec,
        generation: u64,
    ) -> Shared<BoxFuture<'static, BuildOutcome>> {
        let builder = Arc::clone(&self.builder);
        let entries = Arc::clone(&self.entries);
        let image_id = spec.get_id().clone();

        let task = tokio::spawn({
            let entries = Arc::clone(&entries);
            let image_id = image_id.clone();
            async move {
                let outcome = builder.build(&spec).await.map_err(Arc::new);
                settle(&entries, &image_id, generation, &outcome);
                outcome
            }
        });

        task.map(move |joined| match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                let outcome = Err(Arc::new(VboxcoreError::Cancelled(format!(
                    "master build for {image_id} ended abnormally: {e}"
                ))));
                settle(&entries, &image_id, generation, &outcome);
                outcome
            }
        })
        .boxed()
        .shared()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn lock(entries: &Mutex<HashMap<String, Entry>>) -> MutexGuard<'_, HashMap<String, Entry>> {
    entries.lock().unwrap_or_else(|e| e.into_inner())
}

/// Moves the entry of a finished build to present or absent, unless it was invalidated meanwhile.
fn settle(
    entries: &Mutex<HashMap<String, Entry>>,
    image_id: &str,
    generation: u64,
    outcome: &BuildOutcome,
) {
    let mut entries = lock(entries);
    let current = matches!(
        entries.get(image_id),
        Some(Entry::Building { generation: g, .. }) if *g == generation
    );
    if !current {
        return;
    }

    match outcome {
        Ok(master) => {
            entries.insert(image_id.to_string(), Entry::Present(master.clone()));
        }
        Err(e) => {
            entries.remove(image_id);
            tracing::debug!(image_id, error = %e, "failed master build not cached");
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Debug for MasterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterCache")
            .field("masters", &self.masters().len())
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        time::Duration,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{catalogue::LoginCredentials, hypervisor::MachineHandle, ErrorKind};

    #[derive(Default)]
    struct CountingBuilder {
        builds: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl BuildMaster for CountingBuilder {
        async fn build(&self, spec: &ImageSpec) -> VboxcoreResult<Master> {
            let n = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;

            if self.fail.load(Ordering::SeqCst) {
                return Err(VboxcoreError::hypervisor("createvm failed").with_image(spec.get_id()));
            }

            Ok(Master::builder()
                .image_id(spec.get_id())
                .machine_handle(MachineHandle::new(format!("m{n}")))
                .source_hard_disk_path("/vms/master.vdi")
                .login_credentials(LoginCredentials::builder().username("ops").build())
                .build())
        }
    }

    fn image(id: &str) -> ImageSpec {
        ImageSpec::builder()
            .id(id)
            .install_medium_uri("http://mirror.local/ubuntu.iso")
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_gets_share_one_build() -> anyhow::Result<()> {
        let builder = Arc::new(CountingBuilder::default());
        let cache = Arc::new(MasterCache::new(builder.clone()));
        let spec = image("ubuntu-22-amd64");

        let handles = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let spec = spec.clone();
                tokio::spawn(async move { cache.get(&spec).await })
            })
            .collect::<Vec<_>>();

        let mut masters = Vec::new();
        for handle in handles {
            masters.push(handle.await??);
        }

        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
        assert!(masters.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(cache.masters(), vec![masters[0].clone()]);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_failures_are_not_cached() -> anyhow::Result<()> {
        let builder = Arc::new(CountingBuilder::default());
        builder.fail.store(true, Ordering::SeqCst);
        let cache = MasterCache::new(builder.clone());
        let spec = image("ubuntu-22-amd64");

        let (a, b) = tokio::join!(cache.get(&spec), cache.get(&spec));
        let (a, b) = (a.unwrap_err(), b.unwrap_err());
        assert_eq!(a.kind(), ErrorKind::Hypervisor);
        assert_eq!(b.kind(), ErrorKind::Hypervisor);
        assert_eq!(a.image_id(), Some("ubuntu-22-amd64"));
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
        assert!(cache.masters().is_empty());

        builder.fail.store(false, Ordering::SeqCst);
        cache.get(&spec).await?;
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_masters_are_stable_until_invalidated() -> anyhow::Result<()> {
        let builder = Arc::new(CountingBuilder::default());
        let cache = MasterCache::new(builder.clone());
        let spec = image("ubuntu-22-amd64");

        let first = cache.get(&spec).await?;
        assert_eq!(cache.get(&spec).await?, first);
        assert_eq!(cache.peek("ubuntu-22-amd64"), Some(first.clone()));

        assert_eq!(cache.invalidate("ubuntu-22-amd64"), Some(first.clone()));
        let rebuilt = cache.get(&spec).await?;
        assert_ne!(rebuilt, first);
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_abandoned_waiter_does_not_cancel_build() -> anyhow::Result<()> {
        let builder = Arc::new(CountingBuilder::default());
        let cache = MasterCache::new(builder.clone());
        let spec = image("ubuntu-22-amd64");

        let abandoned = tokio::time::timeout(Duration::from_millis(5), cache.get(&spec)).await;
        assert!(abandoned.is_err());
        assert!(cache.is_building("ubuntu-22-amd64"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.peek("ubuntu-22-amd64").is_some());
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_distinct_images_build_independently() -> anyhow::Result<()> {
        let builder = Arc::new(CountingBuilder::default());
        let cache = MasterCache::new(builder.clone());

        let ubuntu = image("ubuntu-22-amd64");
        let debian = image("debian-12-amd64");

        let (a, b) = tokio::join!(cache.get(&ubuntu), cache.get(&debian));

        assert_ne!(a?.get_machine_handle(), b?.get_machine_handle());
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);
        assert_eq!(cache.masters().len(), 2);

        Ok(())
    }
}
