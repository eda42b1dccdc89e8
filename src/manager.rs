//! The supervisor: creates, deduplicates, tracks and stops instances

use crate::config::{LifecycleTimings, PathMode};
use crate::error::SupervisorError;
use crate::instance::{Instance, InstanceParams};
use crate::paths::PathManager;
use crate::port::{LocalPortAllocator, PortAllocator};
use crate::registry::{CommandContext, LaunchCommand, LaunchContext, ProxyOptions, Registry};
use crate::sync::StatusHub;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct InstanceManager {
    registry: Registry,
    paths: PathManager,
    ports: Arc<dyn PortAllocator>,
    timings: LifecycleTimings,
    hub: Arc<StatusHub>,
    /// Proxy options per kind, resolved once at startup
    options: HashMap<String, ProxyOptions>,
    /// Live instances by id
    instances: DashMap<String, Arc<Instance>>,
    /// Dedup key to instance id. Both tables are only mutated under this lock.
    dedup: Mutex<HashMap<String, String>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl InstanceManager {
    pub fn new(
        registry: Registry,
        paths: PathManager,
        timings: LifecycleTimings,
        hub: Arc<StatusHub>,
    ) -> Arc<Self> {
        Self::with_port_allocator(registry, paths, timings, hub, Arc::new(LocalPortAllocator))
    }

    pub fn with_port_allocator(
        registry: Registry,
        paths: PathManager,
        timings: LifecycleTimings,
        hub: Arc<StatusHub>,
        ports: Arc<dyn PortAllocator>,
    ) -> Arc<Self> {
        let options = registry
            .iter()
            .map(|kind| {
                let mount = paths.kind_mount_path(kind.id());
                let options = kind.build_middleware(&mount, ProxyOptions::default());
                (kind.id().to_string(), options)
            })
            .collect();

        info!(kinds = ?registry, home = paths.home_path(), "Instance manager ready");

        Arc::new(Self {
            registry,
            paths,
            ports,
            timings,
            hub,
            options,
            instances: DashMap::new(),
            dedup: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn paths(&self) -> &PathManager {
        &self.paths
    }

    pub fn hub(&self) -> &Arc<StatusHub> {
        &self.hub
    }

    /// Longest stop timeout any instance may run with
    pub fn max_stop_timeout(&self) -> Duration {
        self.registry
            .iter()
            .map(|kind| kind.timings(&self.timings).stop_timeout)
            .fold(self.timings.stop_timeout, Duration::max)
    }

    pub fn proxy_options(&self, kind: &str) -> Option<&ProxyOptions> {
        self.options.get(kind)
    }

    /// Return the live instance for `(kind, context)`, starting one if there
    /// is none. Concurrent callers for the same key get the same instance.
    pub fn get_or_create(
        self: &Arc<Self>,
        kind: &str,
        context: LaunchContext,
    ) -> Result<Arc<Instance>, SupervisorError> {
        let key = dedup_key(kind, &context);
        let mut dedup = self.dedup.lock();

        if let Some(existing) = dedup
            .get(&key)
            .and_then(|id| self.instances.get(id))
            .map(|entry| entry.value().clone())
        {
            if !existing.status().is_completed() {
                debug!(instance_id = existing.id(), kind, "Reusing live instance");
                return Ok(existing);
            }
        }

        let instance = self.create(&mut dedup, kind, context, key)?;
        drop(dedup);
        self.activate(&instance);
        Ok(instance)
    }

    /// Start a new instance unconditionally. Returns as soon as it is
    /// registered; the instance reaches `started` in the background.
    pub fn start(
        self: &Arc<Self>,
        kind: &str,
        context: LaunchContext,
    ) -> Result<Arc<Instance>, SupervisorError> {
        let key = dedup_key(kind, &context);
        let mut dedup = self.dedup.lock();
        let instance = self.create(&mut dedup, kind, context, key)?;
        drop(dedup);
        self.activate(&instance);
        Ok(instance)
    }

    /// Build and register an instance while holding the dedup lock
    fn create(
        &self,
        dedup: &mut HashMap<String, String>,
        kind_id: &str,
        context: LaunchContext,
        key: String,
    ) -> Result<Arc<Instance>, SupervisorError> {
        let kind = self
            .registry
            .get(kind_id)
            .ok_or_else(|| SupervisorError::UnknownKind(kind_id.to_string()))?;

        let port = self.ports.allocate()?;
        let id = (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let base_path = self.paths.internal_path(kind_id, &id, "");
        let public_path = self.paths.public_path(kind_id, &id, "");

        let ctx = CommandContext {
            instance_id: &id,
            kind: kind_id,
            port,
            base_path: &base_path,
            public_path: &public_path,
            context: &context,
        };
        let launch = kind
            .build_command(&ctx)
            .map_err(|e| SupervisorError::CommandBuild {
                kind: kind_id.to_string(),
                message: format!("{:#}", e),
            })?;
        if launch.command.is_empty() {
            return Err(SupervisorError::EmptyCommand(kind_id.to_string()));
        }

        let path_mode = self
            .options
            .get(kind_id)
            .map(|o| o.path_mode)
            .unwrap_or_default();
        let health_path = health_path(&launch, path_mode, &base_path);

        let instance = Instance::new(InstanceParams {
            id: id.clone(),
            kind: kind_id.to_string(),
            context,
            public_path,
            launch,
            health_path,
            timings: kind.timings(&self.timings),
            cancel: self.shutdown.child_token(),
        });

        self.instances.insert(id.clone(), instance.clone());
        dedup.insert(key, id.clone());

        info!(
            instance_id = %id,
            kind = kind_id,
            port = instance.port(),
            path = instance.public_path(),
            "Instance created"
        );
        Ok(instance)
    }

    /// Forward the instance's statuses to the hub, clean up once it is
    /// terminal, then spawn it
    fn activate(self: &Arc<Self>, instance: &Arc<Instance>) {
        let mut events = instance.subscribe();
        let manager = self.clone();
        let id = instance.id().to_string();

        tokio::spawn(async move {
            while let Some(status) = events.recv().await {
                manager.hub.publish(&status);
                if status.is_terminal() {
                    manager.remove(&id);
                }
            }
        });

        instance.launch();
    }

    /// Drop a terminal instance from both tables
    fn remove(&self, id: &str) {
        let mut dedup = self.dedup.lock();
        let removed = self
            .instances
            .remove_if(id, |_, instance| instance.status().is_terminal())
            .is_some();
        if removed {
            dedup.retain(|_, live_id| live_id != id);
            debug!(instance_id = id, "Instance removed");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances.get(id).map(|entry| entry.value().clone())
    }

    /// Port of a live instance that has not reached a terminal status
    pub fn port_of(&self, id: &str) -> Option<u16> {
        self.instances
            .get(id)
            .filter(|entry| !entry.status().is_terminal())
            .map(|entry| entry.port())
    }

    pub fn get_by_kind(&self, kind: &str) -> Vec<Arc<Instance>> {
        let mut found: Vec<_> = self
            .instances
            .iter()
            .filter(|entry| entry.kind() == kind)
            .map(|entry| entry.value().clone())
            .collect();
        sort_by_id(&mut found);
        found
    }

    /// All live instances, oldest first
    pub fn list(&self) -> Vec<Arc<Instance>> {
        let mut all: Vec<_> = self
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sort_by_id(&mut all);
        all
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Stop an instance. Unknown ids return `false`.
    pub async fn stop(&self, id: &str) -> bool {
        let Some(instance) = self.get(id) else {
            debug!(instance_id = id, "Stop requested for unknown instance");
            return false;
        };

        let stopped = instance.stop().await;
        if stopped {
            self.remove(id);
        }
        stopped
    }

    /// Stop every live instance concurrently
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.list().iter().map(|i| i.id().to_string()).collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "Stopping all instances");
        futures::future::join_all(ids.iter().map(|id| self.stop(id))).await;
    }

    /// Abort health polling everywhere and stop all instances
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.stop_all().await;
    }
}

fn dedup_key(kind: &str, context: &LaunchContext) -> String {
    format!("{}\0{}", kind, context.dedup_key())
}

fn health_path(launch: &LaunchCommand, mode: PathMode, base_path: &str) -> String {
    match &launch.validation_path {
        Some(path) if path.starts_with('/') => path.clone(),
        Some(path) => format!("/{}", path),
        None => match mode {
            PathMode::Strip => "/".to_string(),
            PathMode::Preserve => base_path.to_string(),
        },
    }
}

fn sort_by_id(instances: &mut [Arc<Instance>]) {
    instances.sort_by_key(|i| i.id().parse::<u64>().unwrap_or(u64::MAX));
}
