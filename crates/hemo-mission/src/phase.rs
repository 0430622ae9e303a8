//! Legal mission phase transitions.

use hemo_proto::mission::MissionPhase;

use MissionPhase::*;

/// Forward edges of a nominal delivery, in flight order.
const FORWARD: &[(MissionPhase, MissionPhase)] = &[
    (Pending, Armed),
    (Armed, TakingOff),
    (TakingOff, EnRouteToSource),
    (EnRouteToSource, EnRouteToDestination),
    (EnRouteToDestination, ReturningToLaunch),
    (ReturningToLaunch, Landed),
    (Landed, Completed),
];

/// Every non-terminal phase may end in Aborted or Failed; terminal phases absorb.
pub fn can_transition(from: MissionPhase, to: MissionPhase) -> bool {
    if from.is_terminal() {
        return false;
    }
    matches!(to, Aborted | Failed) || FORWARD.contains(&(from, to))
}

/// True once the vehicle may have left the ground.
pub fn airborne(phase: MissionPhase) -> bool {
    matches!(phase, TakingOff | EnRouteToSource | EnRouteToDestination | ReturningToLaunch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_chain_is_legal() {
        for (a, b) in FORWARD {
            assert!(can_transition(*a, *b), "{} -> {}", a, b);
        }
    }

    #[test]
    fn no_skipping_or_going_back() {
        assert!(!can_transition(Pending, TakingOff));
        assert!(!can_transition(EnRouteToDestination, EnRouteToSource));
        assert!(!can_transition(Armed, Completed));
    }

    #[test]
    fn abort_and_fail_from_any_active_phase() {
        let active = [
            Pending,
            Armed,
            TakingOff,
            EnRouteToSource,
            EnRouteToDestination,
            ReturningToLaunch,
            Landed,
        ];
        for p in active {
            assert!(can_transition(p, Aborted));
            assert!(can_transition(p, Failed));
        }
    }

    #[test]
    fn terminal_phases_absorb() {
        for p in [Completed, Aborted, Failed] {
            assert!(!can_transition(p, Aborted));
            assert!(!can_transition(p, Failed));
            assert!(!can_transition(p, Pending));
        }
    }
}
