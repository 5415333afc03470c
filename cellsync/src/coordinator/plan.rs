//! Routing a shared plan to the cells that can execute it.

use std::collections::BTreeSet;

use crate::error::CellError;
use crate::link::Transport;
use crate::protocol::{PlanRef, Signal, SignalKey, codes};
use crate::trace::info;

use super::pairing::RoleMode;
use super::service::RequestHandler;
use super::Coordinator;

/// A plan shared by both cells, reduced to what routing needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedPlan {
    pub reference: PlanRef,
    /// Sensor kinds the plan's measurement content is written for.
    pub content: BTreeSet<String>,
}

impl SharedPlan {
    pub fn new<I, S>(reference: PlanRef, content: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reference,
            content: content.into_iter().map(Into::into).collect(),
        }
    }
}

/// Sensor kinds installed in one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareProfile {
    pub sensors: BTreeSet<String>,
}

impl HardwareProfile {
    pub fn new<I, S>(sensors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sensors: sensors.into_iter().map(Into::into).collect(),
        }
    }

    /// True if any of the plan's content can run on this hardware.
    pub fn supports(&self, plan: &SharedPlan) -> bool {
        !self.sensors.is_disjoint(&plan.content)
    }
}

/// Where a shared plan executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanRoute {
    Dual,
    LocalOnly,
    PeerOnly,
}

impl PlanRoute {
    /// `None` when neither cell has compatible content.
    pub fn decide(
        plan: &SharedPlan,
        local: &HardwareProfile,
        peer: &HardwareProfile,
    ) -> Option<Self> {
        match (local.supports(plan), peer.supports(plan)) {
            (true, true) => Some(Self::Dual),
            (true, false) => Some(Self::LocalOnly),
            (false, true) => Some(Self::PeerOnly),
            (false, false) => None,
        }
    }
}

impl<T: Transport, H: RequestHandler> Coordinator<T, H> {
    /// Opens `plan` on the cells that can execute it.
    ///
    /// If only the peer has compatible content it is sent `OPEN` and
    /// `SINGLE_SIDE` and the local plan is abandoned. If only this cell has
    /// content nothing is forwarded. While unpaired or without a link the
    /// plan opens locally.
    pub fn open_shared_plan(
        &mut self,
        plan: &SharedPlan,
        local: &HardwareProfile,
        peer: &HardwareProfile,
    ) -> Result<PlanRoute, CellError> {
        self.await_pairing_settled()?;

        let route = if self.is_paired() {
            PlanRoute::decide(plan, local, peer)
        } else {
            local.supports(plan).then_some(PlanRoute::LocalOnly)
        };
        let Some(route) = route else {
            return Err(CellError::fault(
                codes::NO_COMPATIBLE_CONTENT,
                format!("plan {} has no compatible content", plan.reference),
            ));
        };
        info!(plan = %plan.reference, ?route, "routing shared plan");

        let reference = plan.reference.clone();
        match route {
            PlanRoute::PeerOnly => {
                self.local_plan = None;
                self.set_mode(RoleMode::alone(self.role().peer()));
                self.run_requests(
                    vec![Signal::Open(reference.clone()), Signal::SingleSide(reference)],
                    self.config.link.phase_timeout(),
                )?;
            }
            PlanRoute::LocalOnly => {
                self.local_plan = Some(plan.clone());
                self.set_mode(RoleMode::alone(self.role()));
            }
            PlanRoute::Dual => {
                self.local_plan = Some(plan.clone());
                self.set_mode(RoleMode::Dual);
                self.run_requests(vec![Signal::Open(reference)], self.config.link.phase_timeout())?;
            }
        }
        Ok(route)
    }

    /// Blocks while a pairing change is outstanding at the peer.
    fn await_pairing_settled(&mut self) -> Result<(), CellError> {
        if !self.ledger.has_todo(SignalKey::Unpair) {
            return Ok(());
        }
        let generation = self.generation;
        let timeout = self.config.link.phase_timeout();
        self.wait_for(timeout, |c| {
            let settled = !c.ledger.has_todo(SignalKey::Unpair) || c.generation != generation;
            Ok(settled.then_some(()))
        })
        .map_err(|e| match e {
            CellError::Cancelled => self.abort(),
            other => other,
        })
    }
}
