//! Per-node reservation accounting.
//!
//! Every node has its own [`NodeLedger`] behind its own mutex. A placement
//! is committed by checking fit and recording the reservation under that
//! one lock, so two placements racing for the last slot on a node are
//! linearized and exactly one of them wins.
//!
//! A node can also carry holds: capacity set aside for a workload whose
//! preemption is in flight. Other workloads see a hold as allocated until
//! the holder reserves on the node or the hold expires.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use kiln_events::{InfeasibleConstraint, QosClass};
use kiln_id::{InstanceId, NodeId, WorkloadId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use super::error::{ResourceError, ResourceResult};
use crate::types::{Allocation, NodeCapacity, ResourceRequest};

/// Memory reserved on one GPU device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GpuSlice {
    pub index: u32,
    pub memory_bytes: u64,
}

/// Resources granted to one instance on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub node: NodeId,
    pub instance_id: InstanceId,
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub gpus: Vec<GpuSlice>,
}

impl Reservation {
    pub fn gpu_devices(&self) -> Vec<u32> {
        self.gpus.iter().map(|g| g.index).collect()
    }
}

/// What a reservation is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
    pub qos: QosClass,
    pub request: ResourceRequest,
}

/// Capacity set aside on a node for one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hold {
    pub workload_id: WorkloadId,
    pub request: ResourceRequest,
    pub expires_at: Instant,
}

#[derive(Debug, Clone)]
pub struct ReservationEntry {
    pub claim: Claim,
    pub reservation: Reservation,
    pub created_at: Instant,
}

/// Reservations held on a single node.
#[derive(Debug, Clone)]
pub struct NodeLedger {
    node: NodeId,
    capacity: NodeCapacity,
    reservations: BTreeMap<InstanceId, ReservationEntry>,
    reserved_cpu: u64,
    reserved_memory: u64,
    gpu_used: Vec<u64>,
    holds: BTreeMap<WorkloadId, Hold>,
    /// CPU and memory the cluster accounts to the node outside our own
    /// reservations. Set by resync.
    external: Allocation,
}

fn scaled(value: u64, ratio: f64) -> u64 {
    (value as f64 * ratio).floor() as u64
}

impl NodeLedger {
    pub fn new(node: NodeId, capacity: NodeCapacity) -> Self {
        Self {
            node,
            capacity,
            reservations: BTreeMap::new(),
            reserved_cpu: 0,
            reserved_memory: 0,
            gpu_used: vec![0; capacity.gpu_count as usize],
            holds: BTreeMap::new(),
            external: Allocation::default(),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn capacity(&self) -> NodeCapacity {
        self.capacity
    }

    pub(crate) fn set_capacity(&mut self, capacity: NodeCapacity) {
        if self.gpu_used.len() < capacity.gpu_count as usize {
            self.gpu_used.resize(capacity.gpu_count as usize, 0);
        }
        self.capacity = capacity;
    }

    pub fn allocation(&self) -> Allocation {
        Allocation {
            cpu_millis: self.reserved_cpu.saturating_add(self.external.cpu_millis),
            memory_bytes: self.reserved_memory.saturating_add(self.external.memory_bytes),
            gpus_in_use: self.gpu_used.iter().filter(|used| **used > 0).count() as u32,
        }
    }

    pub fn reservations(&self) -> impl Iterator<Item = &ReservationEntry> {
        self.reservations.values()
    }

    pub fn reservation(&self, instance: &InstanceId) -> Option<&ReservationEntry> {
        self.reservations.get(instance)
    }

    pub fn hosts_qos(&self, qos: QosClass) -> bool {
        self.reservations.values().any(|e| e.claim.qos == qos)
    }

    fn allowed_cpu(&self, overcommit: f64) -> u64 {
        scaled(self.capacity.cpu_millis, overcommit)
    }

    fn allowed_memory(&self, overcommit: f64) -> u64 {
        scaled(self.capacity.memory_bytes, overcommit)
    }

    fn gpu_free(&self, index: usize) -> u64 {
        self.capacity
            .gpu_memory_bytes
            .saturating_sub(self.gpu_used.get(index).copied().unwrap_or(0))
    }

    /// Checks whether `request` fits and, if so, which GPU devices it would
    /// get. Returns every failing constraint otherwise.
    pub fn fit(
        &self,
        request: &ResourceRequest,
        overcommit: f64,
    ) -> Result<Vec<GpuSlice>, Vec<InfeasibleConstraint>> {
        let allocation = self.allocation();
        let mut failed = Vec::new();

        if allocation.cpu_millis.saturating_add(request.cpu_millis) > self.allowed_cpu(overcommit) {
            failed.push(InfeasibleConstraint::InsufficientCpu);
        }
        if allocation.memory_bytes.saturating_add(request.memory_bytes)
            > self.allowed_memory(overcommit)
        {
            failed.push(InfeasibleConstraint::InsufficientMemory);
        }

        match self.pick_gpus(request) {
            Ok(gpus) if failed.is_empty() => Ok(gpus),
            Ok(_) => Err(failed),
            Err(constraint) => {
                failed.push(constraint);
                Err(failed)
            }
        }
    }

    /// Best-fit device selection: the devices with the least free memory
    /// that still hold the per-device need, lowest index first on ties.
    fn pick_gpus(&self, request: &ResourceRequest) -> Result<Vec<GpuSlice>, InfeasibleConstraint> {
        if request.gpu_count == 0 {
            return Ok(Vec::new());
        }
        let wanted = request.gpu_count as usize;
        let devices = self.capacity.gpu_count as usize;
        let need = request.per_gpu_need(self.capacity.gpu_memory_bytes);
        if devices < wanted || need == 0 || need > self.capacity.gpu_memory_bytes {
            return Err(InfeasibleConstraint::InsufficientGpu);
        }

        let mut fitting: Vec<(u64, usize)> = (0..devices)
            .map(|i| (self.gpu_free(i), i))
            .filter(|(free, _)| *free >= need)
            .collect();

        if fitting.len() < wanted {
            let aggregate: u64 = (0..devices).map(|i| self.gpu_free(i)).sum();
            return Err(if aggregate >= need.saturating_mul(wanted as u64) {
                InfeasibleConstraint::GpuFragmented
            } else {
                InfeasibleConstraint::InsufficientGpu
            });
        }

        fitting.sort();
        Ok(fitting
            .into_iter()
            .take(wanted)
            .map(|(_, i)| GpuSlice {
                index: i as u32,
                memory_bytes: need,
            })
            .collect())
    }

    /// [`fit`](Self::fit) for a request owned by `workload`, counting
    /// unexpired holds of every other workload as allocated.
    pub fn fit_for(
        &self,
        workload: &WorkloadId,
        request: &ResourceRequest,
        overcommit: f64,
        now: Instant,
    ) -> Result<Vec<GpuSlice>, Vec<InfeasibleConstraint>> {
        let mut foreign = self
            .holds
            .values()
            .filter(|h| &h.workload_id != workload && h.expires_at > now)
            .peekable();
        if foreign.peek().is_none() {
            return self.fit(request, overcommit);
        }

        let mut trial = self.clone();
        for hold in foreign {
            // CPU and memory count in full even before the victims are gone
            let gpus = trial.pick_gpus(&hold.request).unwrap_or_default();
            trial.charge(&hold.request, &gpus);
        }
        trial.fit(request, overcommit)
    }

    fn charge(&mut self, request: &ResourceRequest, gpus: &[GpuSlice]) {
        for slice in gpus {
            if let Some(used) = self.gpu_used.get_mut(slice.index as usize) {
                *used += slice.memory_bytes;
            }
        }
        self.reserved_cpu += request.cpu_millis;
        self.reserved_memory += request.memory_bytes;
    }

    pub fn holds(&self) -> impl Iterator<Item = &Hold> {
        self.holds.values()
    }

    pub(crate) fn hold(&mut self, hold: Hold) {
        self.holds.insert(hold.workload_id, hold);
    }

    pub(crate) fn release_hold(&mut self, workload: &WorkloadId) -> Option<Hold> {
        self.holds.remove(workload)
    }

    /// Checks fit and records the reservation. Reserving an instance that
    /// already holds a reservation here returns the existing one.
    ///
    /// A successful reservation consumes the claimant's own hold.
    pub fn reserve(
        &mut self,
        claim: &Claim,
        overcommit: f64,
        now: Instant,
    ) -> Result<Reservation, Vec<InfeasibleConstraint>> {
        if let Some(existing) = self.reservations.get(&claim.instance_id) {
            return Ok(existing.reservation.clone());
        }

        self.holds.retain(|_, h| h.expires_at > now);
        let gpus = self.fit_for(&claim.workload_id, &claim.request, overcommit, now)?;
        self.charge(&claim.request, &gpus);
        self.holds.remove(&claim.workload_id);

        let reservation = Reservation {
            node: self.node.clone(),
            instance_id: claim.instance_id,
            cpu_millis: claim.request.cpu_millis,
            memory_bytes: claim.request.memory_bytes,
            gpus,
        };
        self.reservations.insert(
            claim.instance_id,
            ReservationEntry {
                claim: claim.clone(),
                reservation: reservation.clone(),
                created_at: now,
            },
        );
        Ok(reservation)
    }

    pub fn release(&mut self, instance: &InstanceId) -> Option<ReservationEntry> {
        let entry = self.reservations.remove(instance)?;
        let r = &entry.reservation;
        self.reserved_cpu = self.reserved_cpu.saturating_sub(r.cpu_millis);
        self.reserved_memory = self.reserved_memory.saturating_sub(r.memory_bytes);
        for slice in &r.gpus {
            if let Some(used) = self.gpu_used.get_mut(slice.index as usize) {
                *used = used.saturating_sub(slice.memory_bytes);
            }
        }
        Some(entry)
    }

    /// Share of GPU devices that are partially occupied.
    pub fn fragmentation(&self) -> f64 {
        self.fragmentation_with(&[])
    }

    /// Fragmentation after additionally placing `extra`.
    pub fn fragmentation_with(&self, extra: &[GpuSlice]) -> f64 {
        let devices = self.capacity.gpu_count as usize;
        if devices == 0 {
            return 0.0;
        }
        let partial = (0..devices)
            .filter(|&i| {
                let added: u64 = extra
                    .iter()
                    .filter(|s| s.index as usize == i)
                    .map(|s| s.memory_bytes)
                    .sum();
                let used = self.gpu_used.get(i).copied().unwrap_or(0) + added;
                used > 0 && used < self.capacity.gpu_memory_bytes
            })
            .count();
        partial as f64 / devices as f64
    }

    /// Mean fraction of capacity in use across the dimensions the node has.
    pub fn allocation_fraction(&self) -> f64 {
        let a = self.allocation();
        let mut fractions = Vec::with_capacity(3);
        if self.capacity.cpu_millis > 0 {
            fractions.push(a.cpu_millis as f64 / self.capacity.cpu_millis as f64);
        }
        if self.capacity.memory_bytes > 0 {
            fractions.push(a.memory_bytes as f64 / self.capacity.memory_bytes as f64);
        }
        let gpu_total = self.capacity.gpu_memory_bytes * u64::from(self.capacity.gpu_count);
        if gpu_total > 0 {
            let used: u64 = self.gpu_used.iter().sum();
            fractions.push(used as f64 / gpu_total as f64);
        }
        if fractions.is_empty() {
            return 0.0;
        }
        fractions.iter().sum::<f64>() / fractions.len() as f64
    }

    /// Mean requested-to-free ratio over the requested dimensions. Closer to
    /// 1.0 is a tighter fit.
    pub fn fit_ratio(&self, request: &ResourceRequest, overcommit: f64) -> f64 {
        let a = self.allocation();
        let mut ratios = Vec::with_capacity(3);

        let mut push = |requested: u64, free: u64| {
            if requested > 0 && free > 0 {
                ratios.push((requested as f64 / free as f64).min(1.0));
            }
        };
        push(
            request.cpu_millis,
            self.allowed_cpu(overcommit).saturating_sub(a.cpu_millis),
        );
        push(
            request.memory_bytes,
            self.allowed_memory(overcommit).saturating_sub(a.memory_bytes),
        );
        if request.gpu_count > 0 {
            let need = request.per_gpu_need(self.capacity.gpu_memory_bytes);
            let free: u64 = (0..self.capacity.gpu_count as usize)
                .map(|i| self.gpu_free(i))
                .sum();
            push(need.saturating_mul(u64::from(request.gpu_count)), free);
        }

        if ratios.is_empty() {
            return 0.0;
        }
        ratios.iter().sum::<f64>() / ratios.len() as f64
    }

    /// Largest relative difference between the ledger and `reported`, as a
    /// fraction of capacity.
    pub fn divergence(&self, reported: &Allocation) -> f64 {
        let a = self.allocation();
        let rel = |ours: u64, theirs: u64, capacity: u64| {
            if capacity == 0 {
                0.0
            } else {
                ours.abs_diff(theirs) as f64 / capacity as f64
            }
        };
        rel(a.cpu_millis, reported.cpu_millis, self.capacity.cpu_millis).max(rel(
            a.memory_bytes,
            reported.memory_bytes,
            self.capacity.memory_bytes,
        ))
    }

    /// Adopts the cluster's totals. Our own reservations are never dropped,
    /// so the ledger can only grow toward the report.
    pub(crate) fn resync(&mut self, reported: &Allocation) {
        self.external = Allocation {
            cpu_millis: reported.cpu_millis.saturating_sub(self.reserved_cpu),
            memory_bytes: reported.memory_bytes.saturating_sub(self.reserved_memory),
            gpus_in_use: 0,
        };
    }
}

/// All node ledgers.
#[derive(Debug)]
pub struct ReservationLedger {
    nodes: DashMap<NodeId, Arc<Mutex<NodeLedger>>>,
    overcommit: f64,
}

impl ReservationLedger {
    pub fn new(overcommit: f64) -> Self {
        Self {
            nodes: DashMap::new(),
            overcommit,
        }
    }

    pub fn overcommit(&self) -> f64 {
        self.overcommit
    }

    fn handle(&self, node: &NodeId) -> Option<Arc<Mutex<NodeLedger>>> {
        self.nodes.get(node).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn sync_capacity(&self, node: &NodeId, capacity: NodeCapacity) {
        let handle = Arc::clone(
            self.nodes
                .entry(node.clone())
                .or_insert_with(|| Arc::new(Mutex::new(NodeLedger::new(node.clone(), capacity))))
                .value(),
        );
        handle.lock().set_capacity(capacity);
    }

    /// Atomically checks fit and records the reservation on `node`.
    pub fn reserve(&self, node: &NodeId, claim: &Claim) -> ResourceResult<Reservation> {
        let handle = self
            .handle(node)
            .ok_or_else(|| ResourceError::UnknownNode(node.clone()))?;
        let mut ledger = handle.lock();
        ledger
            .reserve(claim, self.overcommit, Instant::now())
            .map_err(|constraints| ResourceError::Insufficient {
                node: node.clone(),
                constraints,
            })
    }

    pub fn release(&self, node: &NodeId, instance: &InstanceId) -> Option<ReservationEntry> {
        self.handle(node)?.lock().release(instance)
    }

    /// Sets capacity aside on `node` for `hold.workload_id`, replacing any
    /// earlier hold of that workload there.
    pub fn hold(&self, node: &NodeId, hold: Hold) -> ResourceResult<()> {
        let handle = self
            .handle(node)
            .ok_or_else(|| ResourceError::UnknownNode(node.clone()))?;
        handle.lock().hold(hold);
        Ok(())
    }

    pub fn release_hold(&self, node: &NodeId, workload: &WorkloadId) -> Option<Hold> {
        self.handle(node)?.lock().release_hold(workload)
    }

    /// Runs `f` against a node's ledger while holding its lock.
    pub fn view<R>(&self, node: &NodeId, f: impl FnOnce(&NodeLedger) -> R) -> Option<R> {
        let handle = self.handle(node)?;
        let ledger = handle.lock();
        Some(f(&ledger))
    }

    pub(crate) fn update<R>(&self, node: &NodeId, f: impl FnOnce(&mut NodeLedger) -> R) -> Option<R> {
        let handle = self.handle(node)?;
        let mut ledger = handle.lock();
        Some(f(&mut ledger))
    }

    /// A point-in-time copy of a node's ledger, for simulation.
    pub fn copy_of(&self, node: &NodeId) -> Option<NodeLedger> {
        self.view(node, Clone::clone)
    }

    pub fn allocation(&self, node: &NodeId) -> Option<Allocation> {
        self.view(node, NodeLedger::allocation)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
