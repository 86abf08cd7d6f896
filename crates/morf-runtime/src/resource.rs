//! Resource admission: concurrency slots and memory budget.
//!
//! Every invocation reserves one slot plus a memory figure before running
//! and returns both when it finishes. The caller picks what happens at the
//! ceiling: wait with a deadline, or take an immediate backpressure
//! rejection. Overallocation (observed usage above the reservation) is
//! flagged and counted, never punished.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use morf_kernel::error::ResourceError;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Global capacity ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Invocations allowed in flight at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Total reservable memory.
    #[serde(default = "default_memory_budget_mb")]
    pub memory_budget_mb: u64,
}

fn default_max_concurrent() -> u32 {
    10
}

fn default_memory_budget_mb() -> u64 {
    4_096
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            memory_budget_mb: default_memory_budget_mb(),
        }
    }
}

/// What to do when capacity is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Block until capacity frees, up to the deadline.
    Wait { max_wait_ms: u64 },
    /// Fail immediately with a backpressure error.
    Reject,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        AdmissionPolicy::Wait { max_wait_ms: 10_000 }
    }
}

/// One reservation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub memory_mb: u64,
    #[serde(default)]
    pub policy: AdmissionPolicy,
}

impl ResourceRequest {
    pub fn new(memory_mb: u64) -> Self {
        Self {
            memory_mb,
            policy: AdmissionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = policy;
        self
    }
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryBook {
    in_use_mb: u64,
    peak_mb: u64,
}

#[derive(Debug)]
struct Inner {
    limits: ResourceLimits,
    slots: Arc<Semaphore>,
    book: Mutex<MemoryBook>,
    freed: Notify,
    overallocations: AtomicU64,
}

/// Arbiter for the shared capacity pool. Cheap to clone; all clones share
/// the same pool.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(limits.max_concurrent as usize)),
                book: Mutex::new(MemoryBook::default()),
                freed: Notify::new(),
                overallocations: AtomicU64::new(0),
                limits,
            }),
        }
    }

    /// Reserve one slot plus `request.memory_mb`. Per the request's policy
    /// this waits (bounded) or rejects when the pool is exhausted.
    pub async fn reserve(
        &self,
        request: ResourceRequest,
    ) -> Result<ResourceAllocation, ResourceError> {
        let limits = &self.inner.limits;
        if request.memory_mb > limits.memory_budget_mb {
            return Err(ResourceError::ExceedsCapacity {
                requested_mb: request.memory_mb,
                capacity_mb: limits.memory_budget_mb,
            });
        }

        match request.policy {
            AdmissionPolicy::Reject => {
                let permit = self
                    .inner
                    .slots
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| ResourceError::SlotsBusy {
                        max_concurrent: limits.max_concurrent,
                    })?;
                match self.try_book(request.memory_mb) {
                    Ok(()) => Ok(self.allocation(permit, request.memory_mb)),
                    Err(err) => {
                        drop(permit);
                        Err(err)
                    }
                }
            }
            AdmissionPolicy::Wait { max_wait_ms } => {
                let deadline = Instant::now() + Duration::from_millis(max_wait_ms);
                let permit = tokio::time::timeout_at(
                    deadline,
                    self.inner.slots.clone().acquire_owned(),
                )
                .await
                .map_err(|_| ResourceError::WaitTimeout { waited_ms: max_wait_ms })?
                .map_err(|_| ResourceError::SlotsBusy {
                    max_concurrent: limits.max_concurrent,
                })?;

                loop {
                    let waiter = self.inner.freed.notified();
                    tokio::pin!(waiter);
                    // Arm the waiter before checking, so a release landing
                    // between the failed check and the await is not lost.
                    waiter.as_mut().enable();
                    if self.try_book(request.memory_mb).is_ok() {
                        return Ok(self.allocation(permit, request.memory_mb));
                    }
                    if tokio::time::timeout_at(deadline, waiter).await.is_err() {
                        drop(permit);
                        return Err(ResourceError::WaitTimeout { waited_ms: max_wait_ms });
                    }
                }
            }
        }
    }

    fn try_book(&self, memory_mb: u64) -> Result<(), ResourceError> {
        let mut book = self.inner.book.lock();
        let available = self.inner.limits.memory_budget_mb - book.in_use_mb;
        if memory_mb > available {
            return Err(ResourceError::Exhausted {
                requested_mb: memory_mb,
                available_mb: available,
            });
        }
        book.in_use_mb += memory_mb;
        book.peak_mb = book.peak_mb.max(book.in_use_mb);
        Ok(())
    }

    fn allocation(&self, permit: OwnedSemaphorePermit, memory_mb: u64) -> ResourceAllocation {
        debug!(memory_mb, "resource allocation reserved");
        ResourceAllocation {
            id: uuid::Uuid::new_v4().to_string(),
            inner: Arc::clone(&self.inner),
            permit: Some(permit),
            reserved_mb: memory_mb,
            peak_used_mb: 0,
            usage_sum_mb: 0,
            usage_samples: 0,
            overallocated: false,
            released: false,
        }
    }

    /// Point-in-time view of the pool.
    pub fn utilization(&self) -> UtilizationSnapshot {
        let book = self.inner.book.lock();
        let limits = &self.inner.limits;
        UtilizationSnapshot {
            slots_in_use: limits.max_concurrent
                - self.inner.slots.available_permits() as u32,
            max_concurrent: limits.max_concurrent,
            memory_in_use_mb: book.in_use_mb,
            peak_memory_mb: book.peak_mb,
            memory_budget_mb: limits.memory_budget_mb,
            overallocation_count: self.inner.overallocations.load(Ordering::Relaxed),
        }
    }
}

/// Pool usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtilizationSnapshot {
    pub slots_in_use: u32,
    pub max_concurrent: u32,
    pub memory_in_use_mb: u64,
    pub peak_memory_mb: u64,
    pub memory_budget_mb: u64,
    pub overallocation_count: u64,
}

// ----------------------------------------------------------------------------
// Allocation
// ----------------------------------------------------------------------------

/// A live reservation. Dropping it returns the capacity; call
/// [`release`](ResourceAllocation::release) to do so explicitly.
#[derive(Debug)]
pub struct ResourceAllocation {
    id: String,
    inner: Arc<Inner>,
    permit: Option<OwnedSemaphorePermit>,
    reserved_mb: u64,
    peak_used_mb: u64,
    usage_sum_mb: u64,
    usage_samples: u64,
    overallocated: bool,
    released: bool,
}

impl ResourceAllocation {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn reserved_mb(&self) -> u64 {
        self.reserved_mb
    }

    /// Record an observed usage sample. Usage above the reservation flags
    /// the allocation and bumps the pool-wide counter; the workload keeps
    /// running.
    pub fn record_usage(&mut self, used_mb: u64) {
        self.peak_used_mb = self.peak_used_mb.max(used_mb);
        self.usage_sum_mb += used_mb;
        self.usage_samples += 1;
        if used_mb > self.reserved_mb && !self.overallocated {
            self.overallocated = true;
            self.inner.overallocations.fetch_add(1, Ordering::Relaxed);
            warn!(
                allocation_id = %self.id,
                reserved_mb = self.reserved_mb,
                used_mb,
                "allocation exceeded its reservation"
            );
        }
    }

    pub fn peak_used_mb(&self) -> u64 {
        self.peak_used_mb
    }

    /// Mean of recorded usage samples, if any were taken.
    pub fn average_used_mb(&self) -> Option<u64> {
        (self.usage_samples > 0).then(|| self.usage_sum_mb / self.usage_samples)
    }

    pub fn overallocated(&self) -> bool {
        self.overallocated
    }

    /// Return the slot and memory to the pool.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        {
            let mut book = self.inner.book.lock();
            book.in_use_mb = book.in_use_mb.saturating_sub(self.reserved_mb);
        }
        self.permit.take();
        self.inner.freed.notify_waiters();
    }
}

impl Drop for ResourceAllocation {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_concurrent: u32, memory_budget_mb: u64) -> ResourceManager {
        ResourceManager::new(ResourceLimits {
            max_concurrent,
            memory_budget_mb,
        })
    }

    #[tokio::test]
    async fn reject_policy_fails_fast_on_busy_slots() {
        let rm = manager(1, 1_000);
        let _held = rm
            .reserve(ResourceRequest::new(10).with_policy(AdmissionPolicy::Reject))
            .await
            .unwrap();

        let err = rm
            .reserve(ResourceRequest::new(10).with_policy(AdmissionPolicy::Reject))
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::SlotsBusy { max_concurrent: 1 }));
    }

    #[tokio::test]
    async fn reject_policy_reports_memory_exhaustion() {
        let rm = manager(4, 100);
        let _held = rm
            .reserve(ResourceRequest::new(80).with_policy(AdmissionPolicy::Reject))
            .await
            .unwrap();

        let err = rm
            .reserve(ResourceRequest::new(40).with_policy(AdmissionPolicy::Reject))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResourceError::Exhausted {
                requested_mb: 40,
                available_mb: 20
            }
        ));
        // A rejected reservation holds nothing.
        assert_eq!(rm.utilization().slots_in_use, 1);
    }

    #[tokio::test]
    async fn oversized_request_is_never_satisfiable() {
        let rm = manager(4, 100);
        let err = rm.reserve(ResourceRequest::new(200)).await.unwrap_err();
        assert!(matches!(err, ResourceError::ExceedsCapacity { .. }));
    }

    #[tokio::test]
    async fn bounded_wait_succeeds_when_capacity_frees() {
        let rm = manager(1, 100);
        let held = rm.reserve(ResourceRequest::new(50)).await.unwrap();

        let rm2 = rm.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            held.release();
        });

        let start = Instant::now();
        let alloc = rm2
            .reserve(
                ResourceRequest::new(50)
                    .with_policy(AdmissionPolicy::Wait { max_wait_ms: 1_000 }),
            )
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(alloc.reserved_mb(), 50);
    }

    #[tokio::test]
    async fn bounded_wait_times_out() {
        let rm = manager(1, 100);
        let _held = rm.reserve(ResourceRequest::new(10)).await.unwrap();

        let err = rm
            .reserve(
                ResourceRequest::new(10)
                    .with_policy(AdmissionPolicy::Wait { max_wait_ms: 50 }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::WaitTimeout { waited_ms: 50 }));
    }

    #[tokio::test]
    async fn memory_wait_wakes_on_release() {
        let rm = manager(4, 100);
        let held = rm.reserve(ResourceRequest::new(90)).await.unwrap();

        let rm2 = rm.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            held.release();
        });

        let alloc = rm2
            .reserve(
                ResourceRequest::new(90)
                    .with_policy(AdmissionPolicy::Wait { max_wait_ms: 1_000 }),
            )
            .await
            .unwrap();
        assert_eq!(alloc.reserved_mb(), 90);
    }

    #[tokio::test]
    async fn memory_waiters_funnel_through_without_missed_wakeups() {
        let rm = manager(8, 100);
        let first = rm.reserve(ResourceRequest::new(100)).await.unwrap();

        // Five waiters contend for the whole budget; every release wakes
        // all of them, one books, the rest re-arm and wait again.
        let mut tasks = Vec::new();
        for _ in 0..5 {
            let rm = rm.clone();
            tasks.push(tokio::spawn(async move {
                let alloc = rm
                    .reserve(
                        ResourceRequest::new(100)
                            .with_policy(AdmissionPolicy::Wait { max_wait_ms: 2_000 }),
                    )
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                alloc.release();
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.release();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(rm.utilization().memory_in_use_mb, 0);
    }

    #[tokio::test]
    async fn drop_returns_capacity() {
        let rm = manager(1, 100);
        {
            let _alloc = rm.reserve(ResourceRequest::new(60)).await.unwrap();
            assert_eq!(rm.utilization().memory_in_use_mb, 60);
            assert_eq!(rm.utilization().slots_in_use, 1);
        }
        assert_eq!(rm.utilization().memory_in_use_mb, 0);
        assert_eq!(rm.utilization().slots_in_use, 0);

        // Peak survives the release.
        assert_eq!(rm.utilization().peak_memory_mb, 60);
    }

    #[tokio::test]
    async fn overallocation_is_flagged_not_fatal() {
        let rm = manager(2, 100);
        let mut alloc = rm.reserve(ResourceRequest::new(10)).await.unwrap();

        alloc.record_usage(8);
        assert!(!alloc.overallocated());

        alloc.record_usage(50);
        alloc.record_usage(30);
        assert!(alloc.overallocated());
        assert_eq!(alloc.peak_used_mb(), 50);
        assert_eq!(alloc.average_used_mb(), Some((8 + 50 + 30) / 3));
        assert_eq!(rm.utilization().overallocation_count, 1);
    }
}
