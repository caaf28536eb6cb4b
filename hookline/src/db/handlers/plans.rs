//! Lookup of the plan a tenant is subscribed to.

use dashmap::DashMap;

use crate::db::errors::Result;
use crate::db::models::plans::Plan;
use crate::types::OwnerId;

/// Read access to tenant plans. Billing owns the data; the engine only reads it for quota checks.
#[async_trait::async_trait]
pub trait PlanStore: Send + Sync {
    /// The owner's plan, or `None` when billing has no record for them.
    async fn plan_for_owner(&self, owner_id: OwnerId) -> Result<Option<Plan>>;
}

#[derive(Debug, Default)]
pub struct InMemoryPlans {
    plans: DashMap<OwnerId, Plan>,
}

impl InMemoryPlans {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_plan(&self, owner_id: OwnerId, plan: Plan) {
        self.plans.insert(owner_id, plan);
    }
}

#[async_trait::async_trait]
impl PlanStore for InMemoryPlans {
    async fn plan_for_owner(&self, owner_id: OwnerId) -> Result<Option<Plan>> {
        Ok(self.plans.get(&owner_id).map(|entry| *entry.value()))
    }
}
