// libs/scheduling-cell/src/services/lifecycle.rs
use tracing::{debug, warn};

use crate::models::{AppointmentStatus, ProposalState, SchedulingError};

/// Single source of truth for appointment and proposal state transitions.
/// Call sites never compare status strings themselves.
pub struct AppointmentLifecycleService;

impl AppointmentLifecycleService {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_status_transition(
        &self,
        current: &AppointmentStatus,
        next: &AppointmentStatus,
    ) -> Result<(), SchedulingError> {
        debug!("Validating status transition {} -> {}", current, next);

        if !self.valid_transitions(current).contains(next) {
            warn!("Invalid status transition attempted: {} -> {}", current, next);
            return Err(SchedulingError::InvalidStatusTransition(*current));
        }

        Ok(())
    }

    pub fn valid_transitions(&self, current: &AppointmentStatus) -> Vec<AppointmentStatus> {
        match current {
            AppointmentStatus::Planifie => vec![
                AppointmentStatus::Confirme,
                AppointmentStatus::Annule,
            ],
            AppointmentStatus::Confirme => vec![
                AppointmentStatus::EnCours,
                AppointmentStatus::Annule,
            ],
            AppointmentStatus::EnCours => vec![
                AppointmentStatus::Termine,
                AppointmentStatus::Annule,
            ],
            // Terminal states
            AppointmentStatus::Termine => vec![],
            AppointmentStatus::Annule => vec![],
        }
    }

    pub fn is_terminal(&self, status: &AppointmentStatus) -> bool {
        self.valid_transitions(status).is_empty()
    }

    pub fn validate_proposal_transition(
        &self,
        current: &ProposalState,
        next: &ProposalState,
    ) -> Result<(), SchedulingError> {
        debug!("Validating proposal transition {} -> {}", current, next);

        if !self.valid_proposal_transitions(current).contains(next) {
            warn!(
                "Invalid proposal transition attempted: {} -> {}",
                current, next
            );
            return Err(SchedulingError::InvalidProposalTransition(*current));
        }

        Ok(())
    }

    /// A resolved proposal (accepted or refused) leaves the appointment open
    /// to a fresh proposal later.
    pub fn valid_proposal_transitions(&self, current: &ProposalState) -> Vec<ProposalState> {
        match current {
            ProposalState::Active => vec![ProposalState::Proposed],
            ProposalState::Proposed => vec![ProposalState::Accepted, ProposalState::Refused],
            ProposalState::Accepted => vec![ProposalState::Proposed],
            ProposalState::Refused => vec![ProposalState::Proposed],
        }
    }

    /// Statuses from which a provider may open a reschedule negotiation.
    pub fn can_propose_from(&self, status: &AppointmentStatus) -> bool {
        matches!(
            status,
            AppointmentStatus::Planifie | AppointmentStatus::Confirme
        )
    }
}

impl Default for AppointmentLifecycleService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planned_appointment_can_be_confirmed_or_cancelled() {
        let lifecycle = AppointmentLifecycleService::new();

        assert!(lifecycle
            .validate_status_transition(&AppointmentStatus::Planifie, &AppointmentStatus::Confirme)
            .is_ok());
        assert!(lifecycle
            .validate_status_transition(&AppointmentStatus::Planifie, &AppointmentStatus::Annule)
            .is_ok());
        assert!(lifecycle
            .validate_status_transition(&AppointmentStatus::Planifie, &AppointmentStatus::Termine)
            .is_err());
    }

    #[test]
    fn completion_is_only_reachable_from_in_progress() {
        let lifecycle = AppointmentLifecycleService::new();

        assert!(lifecycle
            .validate_status_transition(&AppointmentStatus::EnCours, &AppointmentStatus::Termine)
            .is_ok());
        assert!(lifecycle
            .validate_status_transition(&AppointmentStatus::Confirme, &AppointmentStatus::Termine)
            .is_err());
        assert!(lifecycle
            .validate_status_transition(&AppointmentStatus::Planifie, &AppointmentStatus::Termine)
            .is_err());
    }

    #[test]
    fn terminal_states_allow_no_transition() {
        let lifecycle = AppointmentLifecycleService::new();

        assert!(lifecycle.is_terminal(&AppointmentStatus::Termine));
        assert!(lifecycle.is_terminal(&AppointmentStatus::Annule));
        assert!(lifecycle
            .validate_status_transition(&AppointmentStatus::Annule, &AppointmentStatus::Confirme)
            .is_err());
        assert!(lifecycle
            .validate_status_transition(&AppointmentStatus::Termine, &AppointmentStatus::EnCours)
            .is_err());
    }

    #[test]
    fn proposal_flow_follows_negotiation_states() {
        let lifecycle = AppointmentLifecycleService::new();

        assert!(lifecycle
            .validate_proposal_transition(&ProposalState::Active, &ProposalState::Proposed)
            .is_ok());
        assert!(lifecycle
            .validate_proposal_transition(&ProposalState::Proposed, &ProposalState::Accepted)
            .is_ok());
        assert!(lifecycle
            .validate_proposal_transition(&ProposalState::Proposed, &ProposalState::Refused)
            .is_ok());
        // No acceptance without a pending proposal.
        assert!(lifecycle
            .validate_proposal_transition(&ProposalState::Active, &ProposalState::Accepted)
            .is_err());
        // A resolved negotiation can be reopened with a new proposal.
        assert!(lifecycle
            .validate_proposal_transition(&ProposalState::Refused, &ProposalState::Proposed)
            .is_ok());
        assert!(lifecycle
            .validate_proposal_transition(&ProposalState::Accepted, &ProposalState::Proposed)
            .is_ok());
    }
}
