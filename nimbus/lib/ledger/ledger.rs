use std::collections::HashMap;

use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    config::{PlanLimits, DEFAULT_DISK_MIB, DEFAULT_MEMORY_MIB, DEFAULT_VCPUS},
    error::QuotaResource,
    NimbusError, NimbusResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A resource allocation for one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Virtual CPUs.
    pub vcpus: u32,

    /// Memory in MiB.
    pub memory_mib: u64,

    /// Disk in MiB.
    pub disk_mib: u64,
}

/// A team's current consumption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamUsage {
    /// vCPUs held by active sandboxes.
    pub vcpus: u32,

    /// Memory in MiB held by active sandboxes.
    pub memory_mib: u64,

    /// Disk in MiB held by non-terminated sandboxes, paused ones included.
    pub disk_mib: u64,

    /// Sandboxes currently holding compute.
    pub sandboxes: u32,
}

/// Proof that capacity was admitted. Handing it back to [`ResourceLedger::release`] returns the
/// capacity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ReservationToken {
    /// The reservation id.
    id: String,

    /// The team that owns the reservation.
    team: String,
}

/// The resource ledger.
///
/// All admission decisions for a team happen under one lock, so concurrent reservations can
/// never push usage beyond the plan.
#[derive(Debug)]
pub struct ResourceLedger {
    default_plan: PlanLimits,
    team_plans: HashMap<String, PlanLimits>,
    state: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    usage: HashMap<String, TeamUsage>,
    reservations: HashMap<String, Reservation>,
}

#[derive(Debug)]
struct Reservation {
    team: String,
    resources: Resources,
    compute_held: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ResourceLedger {
    /// Creates a ledger enforcing `default_plan`, with per-team overrides.
    pub fn new(default_plan: PlanLimits, team_plans: HashMap<String, PlanLimits>) -> Self {
        Self {
            default_plan,
            team_plans,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// The plan that applies to `team`.
    pub fn plan_for(&self, team: &str) -> PlanLimits {
        self.team_plans
            .get(team)
            .copied()
            .unwrap_or(self.default_plan)
    }

    /// Atomically admits `resources` for `team`, or fails with `QuotaExceeded` without changing
    /// anything.
    pub async fn reserve(&self, team: &str, resources: Resources) -> NimbusResult<ReservationToken> {
        if resources.vcpus == 0 || resources.memory_mib == 0 {
            return Err(NimbusError::InvalidArgument(
                "a sandbox needs at least one vCPU and some memory".into(),
            ));
        }

        let plan = self.plan_for(team);
        let mut state = self.state.lock().await;
        let usage = state.usage.get(team).copied().unwrap_or_default();

        check_compute(&plan, &usage, &resources)?;
        check(
            QuotaResource::DiskMib,
            resources.disk_mib,
            usage.disk_mib,
            plan.disk_mib,
        )?;

        let usage = state.usage.entry(team.to_string()).or_default();
        usage.vcpus += resources.vcpus;
        usage.memory_mib += resources.memory_mib;
        usage.disk_mib += resources.disk_mib;
        usage.sandboxes += 1;

        let id = Uuid::new_v4().simple().to_string();
        state.reservations.insert(
            id.clone(),
            Reservation {
                team: team.to_string(),
                resources,
                compute_held: true,
            },
        );

        tracing::debug!(team, reservation = %id, ?resources, "reserved capacity");
        Ok(ReservationToken {
            id,
            team: team.to_string(),
        })
    }

    /// Returns everything `token` holds. Returns false if it was already released.
    pub async fn release(&self, token: &ReservationToken) -> bool {
        let mut state = self.state.lock().await;
        let Some(reservation) = state.reservations.remove(&token.id) else {
            return false;
        };

        let usage = state.usage.entry(reservation.team.clone()).or_default();
        if reservation.compute_held {
            subtract_compute(usage, &reservation.resources);
        }
        usage.disk_mib = usage.disk_mib.saturating_sub(reservation.resources.disk_mib);

        tracing::debug!(team = %reservation.team, reservation = %token.id, "released capacity");
        true
    }

    /// Returns the CPU, memory and concurrency slot of a reservation while keeping its disk.
    ///
    /// Used when a sandbox is paused. Does nothing if compute is not currently held.
    pub async fn suspend_compute(&self, token: &ReservationToken) -> NimbusResult<()> {
        let mut state = self.state.lock().await;
        let LedgerState {
            usage,
            reservations,
        } = &mut *state;

        let reservation = reservations
            .get_mut(&token.id)
            .ok_or_else(|| NimbusError::custom(anyhow::anyhow!("unknown reservation")))?;
        if !reservation.compute_held {
            return Ok(());
        }

        let usage = usage.entry(reservation.team.clone()).or_default();
        subtract_compute(usage, &reservation.resources);
        reservation.compute_held = false;
        Ok(())
    }

    /// Re-admits the CPU, memory and concurrency slot of a suspended reservation.
    pub async fn resume_compute(&self, token: &ReservationToken) -> NimbusResult<()> {
        let plan = self.plan_for(&token.team);
        let mut state = self.state.lock().await;
        let LedgerState {
            usage,
            reservations,
        } = &mut *state;

        let reservation = reservations
            .get_mut(&token.id)
            .ok_or_else(|| NimbusError::custom(anyhow::anyhow!("unknown reservation")))?;
        if reservation.compute_held {
            return Ok(());
        }

        let usage = usage.entry(reservation.team.clone()).or_default();
        check_compute(&plan, usage, &reservation.resources)?;
        usage.vcpus += reservation.resources.vcpus;
        usage.memory_mib += reservation.resources.memory_mib;
        usage.sandboxes += 1;
        reservation.compute_held = true;
        Ok(())
    }

    /// A team's current usage.
    pub async fn usage(&self, team: &str) -> TeamUsage {
        self.state
            .lock()
            .await
            .usage
            .get(team)
            .copied()
            .unwrap_or_default()
    }

    /// The number of outstanding reservations across all teams.
    pub async fn outstanding(&self) -> usize {
        self.state.lock().await.reservations.len()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn check_compute(plan: &PlanLimits, usage: &TeamUsage, resources: &Resources) -> NimbusResult<()> {
    check(QuotaResource::Sandboxes, 1, usage.sandboxes as u64, plan.concurrent_sandboxes as u64)?;
    check(
        QuotaResource::Vcpus,
        resources.vcpus as u64,
        usage.vcpus as u64,
        plan.vcpus as u64,
    )?;
    check(
        QuotaResource::MemoryMib,
        resources.memory_mib,
        usage.memory_mib,
        plan.memory_mib,
    )
}

fn check(resource: QuotaResource, requested: u64, used: u64, limit: u64) -> NimbusResult<()> {
    let available = limit.saturating_sub(used);
    if requested > available {
        return Err(NimbusError::QuotaExceeded {
            resource,
            requested,
            available,
        });
    }

    Ok(())
}

fn subtract_compute(usage: &mut TeamUsage, resources: &Resources) {
    usage.vcpus = usage.vcpus.saturating_sub(resources.vcpus);
    usage.memory_mib = usage.memory_mib.saturating_sub(resources.memory_mib);
    usage.sandboxes = usage.sandboxes.saturating_sub(1);
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for Resources {
    fn default() -> Self {
        Self {
            vcpus: DEFAULT_VCPUS,
            memory_mib: DEFAULT_MEMORY_MIB,
            disk_mib: DEFAULT_DISK_MIB,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn plan(vcpus: u32, sandboxes: u32) -> PlanLimits {
        PlanLimits {
            vcpus,
            memory_mib: 4096,
            disk_mib: 4096,
            concurrent_sandboxes: sandboxes,
        }
    }

    fn small() -> Resources {
        Resources {
            vcpus: 1,
            memory_mib: 256,
            disk_mib: 512,
        }
    }

    #[tokio::test]
    async fn test_reserve_and_release() -> anyhow::Result<()> {
        let ledger = ResourceLedger::new(plan(2, 10), HashMap::new());

        let a = ledger.reserve("team", small()).await?;
        let b = ledger.reserve("team", small()).await?;
        let err = ledger.reserve("team", small()).await.unwrap_err();
        assert!(matches!(
            err,
            NimbusError::QuotaExceeded {
                resource: QuotaResource::Vcpus,
                requested: 1,
                available: 0
            }
        ));

        // Other teams are unaffected.
        ledger.reserve("other", small()).await?;

        assert!(ledger.release(&a).await);
        assert!(!ledger.release(&a).await);
        ledger.reserve("team", small()).await?;
        assert!(ledger.release(&b).await);

        let usage = ledger.usage("team").await;
        assert_eq!(usage.vcpus, 1);
        assert_eq!(usage.sandboxes, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_over_admit() {
        let ledger = Arc::new(ResourceLedger::new(plan(100, 5), HashMap::new()));

        let handles = (0..32)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.reserve("team", small()).await.is_ok() })
            })
            .collect::<Vec<_>>();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 5);
        assert_eq!(ledger.usage("team").await.sandboxes, 5);
    }

    #[tokio::test]
    async fn test_suspend_keeps_disk() -> anyhow::Result<()> {
        let ledger = ResourceLedger::new(plan(1, 1), HashMap::new());
        let token = ledger.reserve("team", small()).await?;

        ledger.suspend_compute(&token).await?;
        let usage = ledger.usage("team").await;
        assert_eq!(usage.vcpus, 0);
        assert_eq!(usage.sandboxes, 0);
        assert_eq!(usage.disk_mib, 512);

        // The freed slot can be taken by someone else, which blocks the resume.
        let other = ledger.reserve("team", small()).await?;
        assert!(ledger.resume_compute(&token).await.is_err());
        ledger.release(&other).await;
        ledger.resume_compute(&token).await?;
        assert_eq!(ledger.usage("team").await.vcpus, 1);

        ledger.release(&token).await;
        assert_eq!(ledger.usage("team").await, TeamUsage::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_team_plan_override() -> anyhow::Result<()> {
        let ledger = ResourceLedger::new(
            plan(1, 1),
            HashMap::from([("big".to_string(), plan(8, 8))]),
        );

        let big = Resources {
            vcpus: 4,
            ..small()
        };
        assert!(ledger.reserve("team", big).await.is_err());
        ledger.reserve("big", big).await?;
        Ok(())
    }
}
