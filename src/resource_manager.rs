// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::{mpsc, oneshot};
use tracing::{event, Level};

// Process one batch of this many grants, then re-queue the work.
const PERMIT_GRANT_BATCH_SIZE: usize = 64;

/// Holds `units` of a resource until dropped.
#[derive(Debug)]
pub struct PermitGuard {
    pub resource_type: ResourceType,
    pub units: usize,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        let _ = self.control_tx.send(ControlCommand::Release {
            resource: self.resource_type,
            units: self.units,
        });
    }
}

/// `PieceMemory` is measured in bytes of in-flight piece buffers; the disk
/// resources are measured in concurrent operations.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, strum_macros::Display)]
pub enum ResourceType {
    PieceMemory,
    DiskRead,
    DiskWrite,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceManagerError {
    #[error("The resource manager has been shut down.")]
    ManagerShutdown,
    #[error("The request queue for the resource is full.")]
    QueueFull,
    #[error("No limit is configured for resource {0}.")]
    UnknownResource(ResourceType),
}

#[derive(Clone, Debug)]
pub struct ResourceManagerClient {
    acquire_tx: mpsc::Sender<AcquireCommand>,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
}

impl ResourceManagerClient {
    /// Reserves `bytes` of the piece buffer budget. Requests larger than the whole
    /// budget are clamped to it so they can still be admitted once everything else drains.
    pub async fn acquire_piece_memory(
        &self,
        bytes: usize,
    ) -> Result<PermitGuard, ResourceManagerError> {
        self.acquire(ResourceType::PieceMemory, bytes).await
    }

    pub async fn acquire_disk_read(&self) -> Result<PermitGuard, ResourceManagerError> {
        self.acquire(ResourceType::DiskRead, 1).await
    }

    pub async fn acquire_disk_write(&self) -> Result<PermitGuard, ResourceManagerError> {
        self.acquire(ResourceType::DiskWrite, 1).await
    }

    pub fn update_limits(
        &self,
        new_limits: HashMap<ResourceType, usize>,
    ) -> Result<(), ResourceManagerError> {
        self.control_tx
            .send(ControlCommand::UpdateLimits { limits: new_limits })
            .map_err(|_| ResourceManagerError::ManagerShutdown)
    }

    async fn acquire(
        &self,
        resource: ResourceType,
        units: usize,
    ) -> Result<PermitGuard, ResourceManagerError> {
        let (respond_to, rx) = oneshot::channel();
        self.acquire_tx
            .send(AcquireCommand {
                resource,
                units,
                respond_to,
            })
            .await
            .map_err(|_| ResourceManagerError::ManagerShutdown)?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ResourceManagerError::ManagerShutdown),
        }
    }
}

type Responder = oneshot::Sender<Result<PermitGuard, ResourceManagerError>>;

#[derive(Debug)]
struct AcquireCommand {
    resource: ResourceType,
    units: usize,
    respond_to: Responder,
}

#[derive(Debug)]
enum ControlCommand {
    Release {
        resource: ResourceType,
        units: usize,
    },
    UpdateLimits {
        limits: HashMap<ResourceType, usize>,
    },
    ProcessQueue {
        resource: ResourceType,
    },
}

struct Waiter {
    units: usize,
    respond_to: Responder,
}

struct ResourceState {
    limit: usize,
    in_use: usize,
    max_queue_size: usize,
    wait_queue: VecDeque<Waiter>,
}

impl ResourceState {
    fn fits(&self, units: usize) -> bool {
        self.in_use + units <= self.limit
    }
}

/// Limits for one session: `piece_memory` bytes of in-flight piece buffers and the
/// number of concurrent disk reads and writes. Waiter queues are generous since
/// every queued waiter is a parked task, not a buffer.
pub fn session_limits(
    piece_memory: usize,
    disk_reads: usize,
    disk_writes: usize,
) -> HashMap<ResourceType, (usize, usize)> {
    HashMap::from([
        (ResourceType::PieceMemory, (piece_memory.max(1), 65536)),
        (ResourceType::DiskRead, (disk_reads.max(1), 65536)),
        (ResourceType::DiskWrite, (disk_writes.max(1), 65536)),
    ])
}

/// Session-wide admission control. Runs as an actor; clients talk to it over channels
/// and get RAII permits back.
pub struct ResourceManager {
    acquire_rx: mpsc::Receiver<AcquireCommand>,
    control_rx: mpsc::UnboundedReceiver<ControlCommand>,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
    resources: HashMap<ResourceType, ResourceState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ResourceManager {
    /// `limits` maps each resource to `(limit, max_queue_size)`.
    pub fn new(
        limits: HashMap<ResourceType, (usize, usize)>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> (Self, ResourceManagerClient) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (acquire_tx, acquire_rx) = mpsc::channel(256);

        let resources = limits
            .into_iter()
            .map(|(res_type, (limit, max_queue_size))| {
                (
                    res_type,
                    ResourceState {
                        limit,
                        in_use: 0,
                        max_queue_size,
                        wait_queue: VecDeque::new(),
                    },
                )
            })
            .collect();

        let client = ResourceManagerClient {
            acquire_tx,
            control_tx: control_tx.clone(),
        };
        let actor = Self {
            acquire_rx,
            control_rx,
            control_tx,
            resources,
            shutdown_tx,
        };
        (actor, client)
    }

    pub async fn run(mut self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                Some(cmd) = self.acquire_rx.recv() => self.handle_acquire(cmd),
                Some(cmd) = self.control_rx.recv() => {
                    match cmd {
                        ControlCommand::Release { resource, units } => self.handle_release(resource, units),
                        ControlCommand::UpdateLimits { limits } => self.handle_update_limits(limits),
                        ControlCommand::ProcessQueue { resource } => self.handle_process_queue(resource),
                    }
                },
                else => { break; }
            }
        }
        event!(Level::DEBUG, "Resource manager stopped");
    }

    fn handle_acquire(&mut self, cmd: AcquireCommand) {
        let AcquireCommand {
            resource,
            units,
            respond_to,
        } = cmd;
        let control_tx = self.control_tx.clone();
        let Some(state) = self.resources.get_mut(&resource) else {
            let _ = respond_to.send(Err(ResourceManagerError::UnknownResource(resource)));
            return;
        };
        let units = units.min(state.limit);

        if state.wait_queue.is_empty() && state.fits(units) {
            state.in_use += units;
            let guard = PermitGuard {
                resource_type: resource,
                units,
                control_tx,
            };
            // If the waiter is gone the guard comes back and is dropped, releasing the units.
            let _ = respond_to.send(Ok(guard));
        } else if state.wait_queue.len() < state.max_queue_size {
            state.wait_queue.push_back(Waiter { units, respond_to });
        } else {
            let _ = respond_to.send(Err(ResourceManagerError::QueueFull));
        }
    }

    fn handle_release(&mut self, resource: ResourceType, units: usize) {
        if let Some(state) = self.resources.get_mut(&resource) {
            state.in_use = state.in_use.saturating_sub(units);
            let _ = self
                .control_tx
                .send(ControlCommand::ProcessQueue { resource });
        }
    }

    fn handle_update_limits(&mut self, limits: HashMap<ResourceType, usize>) {
        for (resource, new_limit) in limits {
            if let Some(state) = self.resources.get_mut(&resource) {
                state.limit = new_limit;
                let _ = self
                    .control_tx
                    .send(ControlCommand::ProcessQueue { resource });
            }
        }
    }

    fn handle_process_queue(&mut self, resource: ResourceType) {
        let control_tx = self.control_tx.clone();
        let Some(state) = self.resources.get_mut(&resource) else {
            return;
        };
        for _ in 0..PERMIT_GRANT_BATCH_SIZE {
            let Some(front) = state.wait_queue.front() else {
                return;
            };
            if front.respond_to.is_closed() {
                state.wait_queue.pop_front();
                continue;
            }
            let units = front.units.min(state.limit);
            if !state.fits(units) {
                return;
            }
            if let Some(waiter) = state.wait_queue.pop_front() {
                state.in_use += units;
                let guard = PermitGuard {
                    resource_type: resource,
                    units,
                    control_tx: control_tx.clone(),
                };
                let _ = waiter.respond_to.send(Ok(guard));
            }
        }
        if !state.wait_queue.is_empty() {
            let _ = control_tx.send(ControlCommand::ProcessQueue { resource });
        }
    }
}
