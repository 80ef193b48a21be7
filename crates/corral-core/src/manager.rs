//! Domain registry and the services shared by operations and event handlers.

use crate::config::ManagerConfig;
use crate::domain::{Domain, DomainDef, DomainGuard, DomainRef, DomainSnapshot};
use crate::error::{CoreError, Result};
use crate::handlers::LifecycleHandlers;
use crate::job::JobKind;
use crate::lifecycle::{LifecycleEvent, LifecycleKind, Notifier};
use crate::process::ProcessManager;
use crate::queue::{DomainResolver, EventHandler, EventQueue, EventSubmitter};
use crate::store::DomainStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct Index {
    by_uuid: HashMap<Uuid, Arc<Domain>>,
    by_name: HashMap<String, Uuid>,
}

/// Live domains by UUID, with a name index.
///
/// The registry lock is never held while taking a domain's object lock.
#[derive(Default)]
pub struct Registry {
    index: RwLock<Index>,
}

impl Registry {
    /// Domain by UUID.
    pub async fn get(&self, uuid: Uuid) -> Option<Arc<Domain>> {
        self.index.read().await.by_uuid.get(&uuid).cloned()
    }

    /// Domain by name.
    pub async fn get_by_name(&self, name: &str) -> Option<Arc<Domain>> {
        let index = self.index.read().await;
        let uuid = index.by_name.get(name)?;
        index.by_uuid.get(uuid).cloned()
    }

    /// All domains, sorted by name.
    pub async fn all(&self) -> Vec<Arc<Domain>> {
        let mut domains: Vec<Arc<Domain>> = self.index.read().await.by_uuid.values().cloned().collect();
        domains.sort_by(|a, b| a.name().cmp(b.name()));
        domains
    }

    /// Number of registered domains.
    pub async fn len(&self) -> usize {
        self.index.read().await.by_uuid.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn insert(&self, domain: Arc<Domain>) -> Result<()> {
        let mut index = self.index.write().await;
        Self::check_free(&index, domain.name(), domain.uuid())?;
        index.by_name.insert(domain.name().to_string(), domain.uuid());
        index.by_uuid.insert(domain.uuid(), domain);
        Ok(())
    }

    fn check_free(index: &Index, name: &str, uuid: Uuid) -> Result<()> {
        if index.by_name.contains_key(name) {
            return Err(CoreError::Config(format!("domain {name} already exists")));
        }
        if index.by_uuid.contains_key(&uuid) {
            return Err(CoreError::Config(format!("domain with uuid {uuid} already exists")));
        }
        Ok(())
    }

    /// Drop the entry for `uuid`.
    pub(crate) async fn remove(&self, uuid: Uuid) -> Option<Arc<Domain>> {
        let mut index = self.index.write().await;
        let domain = index.by_uuid.remove(&uuid)?;
        index.by_name.remove(domain.name());
        Some(domain)
    }
}

#[async_trait]
impl DomainResolver for Registry {
    async fn resolve(&self, domain: &DomainRef) -> Option<Arc<Domain>> {
        self.get(domain.uuid).await
    }
}

// ============================================================================
// Services
// ============================================================================

/// Collaborators shared by operations and event handlers.
pub struct Services {
    pub config: ManagerConfig,
    pub registry: Arc<Registry>,
    pub store: Arc<dyn DomainStore>,
    pub process: Arc<dyn ProcessManager>,
    pub notifier: Notifier,
}

impl Services {
    /// Drop a stopped transient domain from the registry.
    ///
    /// Waiters for its jobs fail with `DomainGone`.
    pub async fn forget_if_transient(&self, guard: &mut DomainGuard) {
        if guard.is_persistent() || guard.is_active() || guard.is_removed() {
            return;
        }
        guard.mark_removed();
        let reference = guard.domain().reference().clone();
        self.registry.remove(reference.uuid).await;
        self.notifier.emit(&reference, LifecycleKind::Undefined, "transient domain stopped");
    }

    /// Where `save` writes the image for `name`.
    pub fn managed_save_path(&self, name: &str) -> PathBuf {
        self.config.save_dir.join(format!("{name}.save"))
    }

    /// Where a watchdog-triggered dump for `name` goes.
    pub fn dump_path(&self, name: &str) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        self.config.save_dir.join(format!("{name}-{stamp}.core"))
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Owns the registry, the event worker and the shared services.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(JsonFileStore::new(&config.state_dir));
/// let process = Arc::new(EmulatorProcessManager::new(&config));
/// let manager = DomainManager::new(config, store, process)?;
/// manager.load_all().await?;
/// let web = manager.define(DomainDef::new("web01")).await?;
/// ops::start(manager.services(), &web).await?;
/// manager.shutdown().await;
/// ```
pub struct DomainManager {
    services: Arc<Services>,
    queue: EventQueue,
}

impl DomainManager {
    /// Create a manager running the standard lifecycle handlers.
    ///
    /// Must be called from within a tokio runtime: the event worker is
    /// spawned here.
    pub fn new(
        config: ManagerConfig,
        store: Arc<dyn DomainStore>,
        process: Arc<dyn ProcessManager>,
    ) -> Result<Self> {
        Self::with_handler(config, store, process, |services| {
            Arc::new(LifecycleHandlers::new(services))
        })
    }

    /// Create a manager whose event worker runs the handler built by `handler`.
    pub fn with_handler<F>(
        config: ManagerConfig,
        store: Arc<dyn DomainStore>,
        process: Arc<dyn ProcessManager>,
        handler: F,
    ) -> Result<Self>
    where
        F: FnOnce(Arc<Services>) -> Arc<dyn EventHandler>,
    {
        config.validate()?;
        tracing::info!(
            state_dir = %config.state_dir.display(),
            run_dir = %config.run_dir.display(),
            job_wait_timeout = ?config.job_wait_timeout,
            "Creating domain manager"
        );

        let registry = Arc::new(Registry::default());
        let capacity = config.event_queue_capacity;
        let services = Arc::new(Services {
            notifier: Notifier::new(config.lifecycle_capacity),
            config,
            registry: Arc::clone(&registry),
            store,
            process,
        });
        let queue = EventQueue::start(capacity, registry, handler(Arc::clone(&services)));
        Ok(Self { services, queue })
    }

    /// Shared services, for operations.
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.services.config
    }

    /// Handle for producing events.
    pub fn submitter(&self) -> EventSubmitter {
        self.queue.submitter()
    }

    /// The event queue.
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Receive lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.services.notifier.subscribe()
    }

    fn instantiate(&self, def: DomainDef, persistent: bool) -> Arc<Domain> {
        Domain::new(
            def,
            persistent,
            self.services.config.tuning(),
            Some(self.queue.submitter()),
        )
    }

    /// Register and persist a new definition.
    pub async fn define(&self, def: DomainDef) -> Result<Arc<Domain>> {
        def.validate()?;
        {
            let index = self.services.registry.index.read().await;
            Registry::check_free(&index, &def.name, def.uuid)?;
        }
        self.services.store.save(&def).await?;

        let domain = self.instantiate(def, true);
        if let Err(e) = self.services.registry.insert(Arc::clone(&domain)).await {
            // Lost a race with a concurrent define of the same name.
            let _ = self.services.store.delete(domain.uuid()).await;
            return Err(e);
        }
        tracing::info!(domain = %domain.name(), uuid = %domain.uuid(), "Domain defined");
        self.services
            .notifier
            .emit(domain.reference(), LifecycleKind::Defined, "");
        Ok(domain)
    }

    /// Register a domain that is not persisted and disappears when it stops.
    pub async fn create_transient(&self, def: DomainDef) -> Result<Arc<Domain>> {
        def.validate()?;
        let domain = self.instantiate(def, false);
        self.services.registry.insert(Arc::clone(&domain)).await?;
        tracing::info!(domain = %domain.name(), "Transient domain registered");
        Ok(domain)
    }

    /// Domain by UUID.
    pub async fn get(&self, uuid: Uuid) -> Result<Arc<Domain>> {
        self.services
            .registry
            .get(uuid)
            .await
            .ok_or_else(|| CoreError::NotFound(uuid.to_string()))
    }

    /// Domain by name.
    pub async fn get_by_name(&self, name: &str) -> Result<Arc<Domain>> {
        self.services
            .registry
            .get_by_name(name)
            .await
            .ok_or_else(|| CoreError::NotFound(name.to_string()))
    }

    /// Re-locate a domain from an event back-reference.
    pub async fn resolve(&self, reference: &DomainRef) -> Option<Arc<Domain>> {
        self.services.registry.resolve(reference).await
    }

    /// Snapshots of every domain, sorted by name.
    pub async fn list(&self) -> Vec<Arc<DomainSnapshot>> {
        self.services
            .registry
            .all()
            .await
            .iter()
            .map(|d| d.snapshot())
            .collect()
    }

    /// Remove a definition.
    ///
    /// An inactive domain is removed at once and every task waiting for one
    /// of its jobs fails with `DomainGone`. An active one becomes transient
    /// and is removed when it stops.
    pub async fn undefine(&self, name: &str) -> Result<()> {
        let domain = self.get_by_name(name).await?;
        let (mut vm, job) = domain.begin_job(JobKind::Modify).await?;

        if !vm.is_persistent() {
            vm.end_job(job);
            return Err(CoreError::InvalidState {
                expected: "persistent domain".into(),
                actual: "transient".into(),
            });
        }
        vm.set_persistent(false);
        let active = vm.is_active();
        if !active {
            vm.mark_removed();
            self.services.registry.remove(domain.uuid()).await;
        }
        vm.end_job(job);
        drop(vm);

        self.services.store.delete(domain.uuid()).await?;
        if active {
            tracing::info!(domain = %name, "Active domain made transient");
        } else {
            tracing::info!(domain = %name, "Domain undefined");
            self.services
                .notifier
                .emit(domain.reference(), LifecycleKind::Undefined, "");
        }
        Ok(())
    }

    /// Register every stored definition that is not registered yet.
    /// Returns how many were added.
    pub async fn load_all(&self) -> Result<usize> {
        let defs = self.services.store.load_all().await?;
        let mut added = 0;
        for def in defs {
            if self.services.registry.get(def.uuid).await.is_some() {
                continue;
            }
            let save = self.services.managed_save_path(&def.name);
            let domain = self.instantiate(def, true);
            if let Err(e) = self.services.registry.insert(Arc::clone(&domain)).await {
                tracing::warn!(domain = %domain.name(), error = %e, "Skipping conflicting definition");
                continue;
            }
            if tokio::fs::try_exists(&save).await.unwrap_or(false) {
                tracing::info!(domain = %domain.name(), path = %save.display(), "Found managed-save image");
                domain.lock().await.set_managed_save(Some(save));
            }
            added += 1;
        }
        tracing::info!(added, total = self.services.registry.len().await, "Definitions loaded");
        Ok(added)
    }

    /// Stop the event worker after it drains what is queued.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down domain manager");
        self.queue.shutdown().await;
    }
}
