//! Simulated provider for development and testing

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::{ContainerGroupDescriptor, ContainerProvider, ProviderError, ProviderResult};

/// Simulated container group state
#[derive(Debug, Clone, Default)]
pub struct SimulatedGroup {
    pub active_sessions: u32,
}

/// In-process stand-in for a cloud provider
#[derive(Default)]
pub struct SimulatedProvider {
    groups: Mutex<HashMap<String, SimulatedGroup>>,
    latency: Option<Duration>,

    fail_deploy: AtomicBool,
    fail_destroy: AtomicBool,
    fail_probe: AtomicBool,

    deploy_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    probe_calls: AtomicUsize,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every call, to imitate network round trips
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn set_fail_deploy(&self, fail: bool) {
        self.fail_deploy.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_probe(&self, fail: bool) {
        self.fail_probe.store(fail, Ordering::SeqCst);
    }

    /// Pretend users are connected to a running group
    pub fn set_active_sessions(&self, descriptor: &ContainerGroupDescriptor, sessions: u32) {
        if let Ok(mut groups) = self.groups.lock()
            && let Some(group) = groups.get_mut(&descriptor.container_group)
        {
            group.active_sessions = sessions;
        }
    }

    /// Whether a container group currently exists
    pub fn is_running(&self, descriptor: &ContainerGroupDescriptor) -> bool {
        self.groups
            .lock()
            .map(|groups| groups.contains_key(&descriptor.container_group))
            .unwrap_or(false)
    }

    pub fn running_groups(&self) -> usize {
        self.groups.lock().map(|groups| groups.len()).unwrap_or(0)
    }

    pub fn deploy_calls(&self) -> usize {
        self.deploy_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn groups(&self) -> ProviderResult<std::sync::MutexGuard<'_, HashMap<String, SimulatedGroup>>> {
        self.groups
            .lock()
            .map_err(|_| ProviderError::Unavailable("simulated group table poisoned".into()))
    }
}

#[async_trait]
impl ContainerProvider for SimulatedProvider {
    async fn deploy(&self, descriptor: &ContainerGroupDescriptor) -> ProviderResult<()> {
        self.deploy_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if self.fail_deploy.load(Ordering::SeqCst) {
            return Err(ProviderError::DeployFailed("simulated deploy failure".into()));
        }

        self.groups()?
            .entry(descriptor.container_group.clone())
            .or_default();

        info!(container_group = %descriptor, "Simulated container group running");
        Ok(())
    }

    async fn destroy(&self, descriptor: &ContainerGroupDescriptor) -> ProviderResult<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(ProviderError::DestroyFailed("simulated destroy failure".into()));
        }

        if self.groups()?.remove(&descriptor.container_group).is_none() {
            debug!(container_group = %descriptor, "Container group already gone");
        } else {
            info!(container_group = %descriptor, "Simulated container group deleted");
        }
        Ok(())
    }

    async fn is_idle(&self, descriptor: &ContainerGroupDescriptor) -> ProviderResult<bool> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if self.fail_probe.load(Ordering::SeqCst) {
            return Err(ProviderError::ProbeFailed("simulated probe failure".into()));
        }

        let idle = self
            .groups()?
            .get(&descriptor.container_group)
            .map(|group| group.active_sessions == 0)
            .unwrap_or(true);
        Ok(idle)
    }
}
