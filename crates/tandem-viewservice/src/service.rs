//! View assignment state machine.
//!
//! The service never initiates a view change. It reacts only to joins and
//! to explicit failure reports, and every change bumps the generation by
//! exactly one.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use tandem_types::{Generation, ParticipantId, ReplicationParams, View};
use tandem_wire::{Message, Query, ReportFailure, ViewReply};
use tracing::{info, warn};

/// Authoritative view state.
#[derive(Debug, Clone)]
pub struct ViewService {
    params: ReplicationParams,
    view: Option<View>,
    /// Joined participants and their advertised addresses. A participant
    /// leaves the roster when its failure is confirmed and returns on its
    /// next join.
    roster: BTreeMap<ParticipantId, SocketAddr>,
}

impl ViewService {
    pub fn new(params: ReplicationParams) -> Self {
        Self {
            params,
            view: None,
            roster: BTreeMap::new(),
        }
    }

    /// Current view, if any participant has joined yet.
    pub fn view(&self) -> Option<&View> {
        self.view.as_ref()
    }

    pub fn params(&self) -> ReplicationParams {
        self.params
    }

    pub fn roster(&self) -> &BTreeMap<ParticipantId, SocketAddr> {
        &self.roster
    }

    /// Registers `name` and returns the resulting view.
    ///
    /// The first joiner becomes primary, the second becomes backup, and
    /// everyone after that only updates the roster.
    pub fn join(&mut self, name: ParticipantId, address: SocketAddr) -> View {
        self.roster.insert(name.clone(), address);

        let next = match &self.view {
            None => View::initial(name, address),
            Some(view) if view.backup.is_none() && view.primary != name => View {
                generation: view.generation.next(),
                primary: view.primary.clone(),
                backup: Some(name),
                primary_address: view.primary_address,
            },
            Some(view) => return view.clone(),
        };

        info!(view = %next, "view change on join");
        self.view = Some(next.clone());
        next
    }

    /// Applies a failure report and returns the resulting view.
    ///
    /// Returns `None` only when no view exists yet. Stale or inconsistent
    /// reports are logged and answered with the current view unchanged.
    pub fn report_failure(
        &mut self,
        generation: Generation,
        failed: ParticipantId,
        replacement: ParticipantId,
    ) -> Option<View> {
        let Some(view) = &self.view else {
            warn!(%failed, %replacement, "failure report before any view exists");
            return None;
        };

        if generation != view.generation {
            info!(
                reported = %generation,
                current = %view.generation,
                %failed,
                "ignoring failure report for another generation"
            );
            return Some(view.clone());
        }

        if !self.roster.contains_key(&replacement) {
            warn!(%failed, %replacement, "anomaly: replacement is not in the roster");
            return Some(view.clone());
        }

        let next = if view.is_primary(&failed) {
            let Some(backup) = view.backup.clone() else {
                warn!(%failed, "anomaly: primary failed with no backup to promote");
                return Some(view.clone());
            };
            if replacement == backup || replacement == failed {
                warn!(%failed, %replacement, "anomaly: replacement cannot take the backup slot");
                return Some(view.clone());
            }
            let Some(address) = self.roster.get(&backup).copied() else {
                warn!(%backup, "anomaly: backup missing from roster");
                return Some(view.clone());
            };
            View {
                generation: view.generation.next(),
                primary: backup,
                backup: Some(replacement),
                primary_address: address,
            }
        } else if view.is_backup(&failed) {
            if replacement == view.primary || replacement == failed {
                warn!(%failed, %replacement, "anomaly: replacement cannot take the backup slot");
                return Some(view.clone());
            }
            View {
                generation: view.generation.next(),
                primary: view.primary.clone(),
                backup: Some(replacement),
                primary_address: view.primary_address,
            }
        } else {
            warn!(%failed, view = %view, "anomaly: failure report names neither primary nor backup");
            return Some(view.clone());
        };

        info!(view = %next, %failed, "view change on failure report");
        self.roster.remove(&failed);
        self.view = Some(next.clone());
        Some(next)
    }

    /// Answers one request. Returns `None` when there is nothing to send.
    pub fn handle(&mut self, message: Message) -> Option<Message> {
        let view = match message {
            Message::Query(Query { name, address }) => Some(self.join(name, address)),
            Message::ReportFailure(ReportFailure {
                generation,
                failed,
                replacement,
            }) => self.report_failure(generation, failed, replacement),
            other => {
                warn!(kind = other.name(), "anomaly: unexpected message at view service");
                None
            }
        }?;

        Some(Message::ViewReply(ViewReply {
            view,
            params: self.params,
        }))
    }
}

impl Default for ViewService {
    fn default() -> Self {
        Self::new(ReplicationParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tandem_wire::Heartbeat;
    use test_case::test_case;

    fn id(name: &str) -> ParticipantId {
        ParticipantId::new(name).unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// A, B, C joined in order: gen 2, primary A, backup B.
    fn three_joined() -> ViewService {
        let mut service = ViewService::default();
        service.join(id("a"), addr(1));
        service.join(id("b"), addr(2));
        service.join(id("c"), addr(3));
        service
    }

    #[test]
    fn join_order_assigns_primary_then_backup() {
        let mut service = ViewService::default();

        let v1 = service.join(id("a"), addr(1));
        assert_eq!(v1.generation, Generation::new(1));
        assert_eq!(v1.primary, id("a"));
        assert_eq!(v1.backup, None);
        assert_eq!(v1.primary_address, addr(1));

        let v2 = service.join(id("b"), addr(2));
        assert_eq!(v2.generation, Generation::new(2));
        assert_eq!(v2.primary, id("a"));
        assert_eq!(v2.backup, Some(id("b")));

        let v3 = service.join(id("c"), addr(3));
        assert_eq!(v3, v2, "third joiner only updates the roster");
        assert_eq!(service.roster().len(), 3);
    }

    #[test]
    fn primary_rejoining_does_not_become_backup() {
        let mut service = ViewService::default();
        service.join(id("a"), addr(1));
        let view = service.join(id("a"), addr(1));
        assert_eq!(view.generation, Generation::new(1));
        assert_eq!(view.backup, None);
    }

    #[test]
    fn failed_primary_promotes_backup() {
        let mut service = three_joined();
        let view = service
            .report_failure(Generation::new(2), id("a"), id("c"))
            .unwrap();

        assert_eq!(view.generation, Generation::new(3));
        assert_eq!(view.primary, id("b"));
        assert_eq!(view.backup, Some(id("c")));
        assert_eq!(view.primary_address, addr(2));
    }

    #[test]
    fn failed_backup_is_replaced() {
        let mut service = three_joined();
        let view = service
            .report_failure(Generation::new(2), id("b"), id("c"))
            .unwrap();

        assert_eq!(view.generation, Generation::new(3));
        assert_eq!(view.primary, id("a"));
        assert_eq!(view.backup, Some(id("c")));
        assert_eq!(view.primary_address, addr(1));
    }

    #[test]
    fn confirmed_failure_leaves_the_roster_until_rejoin() {
        let mut service = three_joined();
        service
            .report_failure(Generation::new(2), id("b"), id("c"))
            .unwrap();
        assert!(!service.roster().contains_key(&id("b")));

        // b cannot come back as a replacement without joining again.
        let echoed = service
            .report_failure(Generation::new(3), id("c"), id("b"))
            .unwrap();
        assert_eq!(echoed.generation, Generation::new(3));
        assert_eq!(echoed.backup, Some(id("c")));

        service.join(id("b"), addr(2));
        let view = service
            .report_failure(Generation::new(3), id("c"), id("b"))
            .unwrap();
        assert_eq!(view.generation, Generation::new(4));
        assert_eq!(view.backup, Some(id("b")));
        assert!(!service.roster().contains_key(&id("c")));
    }

    #[test]
    fn failed_primary_leaves_the_roster() {
        let mut service = three_joined();
        service
            .report_failure(Generation::new(2), id("a"), id("c"))
            .unwrap();
        assert!(!service.roster().contains_key(&id("a")));
        assert!(service.roster().contains_key(&id("b")));
        assert!(service.roster().contains_key(&id("c")));
    }

    #[test]
    fn duplicate_report_is_idempotent() {
        let mut service = three_joined();
        let first = service.report_failure(Generation::new(2), id("a"), id("c"));
        let second = service.report_failure(Generation::new(2), id("a"), id("c"));
        assert_eq!(first, second);
        assert_eq!(service.view().unwrap().generation, Generation::new(3));
    }

    #[test_case(1, "a", "c"; "stale generation")]
    #[test_case(3, "a", "c"; "future generation")]
    #[test_case(2, "c", "a"; "unknown failed id")]
    #[test_case(2, "b", "a"; "replacement is primary")]
    #[test_case(2, "a", "b"; "replacement is promoted backup")]
    #[test_case(2, "a", "ghost"; "replacement never joined")]
    fn anomalous_reports_echo_current_view(generation: u64, failed: &str, replacement: &str) {
        let mut service = three_joined();
        let before = service.view().cloned();
        let after = service.report_failure(Generation::new(generation), id(failed), id(replacement));
        assert_eq!(after, before);
    }

    #[test]
    fn failed_primary_without_backup_is_echoed() {
        let mut service = ViewService::default();
        service.join(id("a"), addr(1));
        service.roster.insert(id("b"), addr(2));

        let view = service
            .report_failure(Generation::new(1), id("a"), id("b"))
            .unwrap();
        assert_eq!(view.generation, Generation::new(1));
        assert_eq!(view.primary, id("a"));
    }

    #[test]
    fn report_before_any_view_has_no_answer() {
        let mut service = ViewService::default();
        assert!(
            service
                .report_failure(Generation::new(1), id("a"), id("b"))
                .is_none()
        );
    }

    #[test]
    fn handle_answers_queries_with_params() {
        let params = ReplicationParams { n: 4, k: 2 };
        let mut service = ViewService::new(params);
        let reply = service.handle(Message::Query(Query {
            name: id("a"),
            address: addr(1),
        }));

        match reply {
            Some(Message::ViewReply(reply)) => {
                assert_eq!(reply.params, params);
                assert_eq!(reply.view.primary, id("a"));
            }
            other => panic!("expected view reply, got {other:?}"),
        }
    }

    #[test]
    fn handle_ignores_unexpected_messages() {
        let mut service = three_joined();
        assert!(
            service
                .handle(Message::Heartbeat(Heartbeat { name: id("a") }))
                .is_none()
        );
        assert!(service.handle(Message::SyncOk).is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Join(u8),
        Report { stale: bool, failed: u8, replacement: u8 },
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6).prop_map(Op::Join),
            (any::<bool>(), 0u8..6, 0u8..6).prop_map(|(stale, failed, replacement)| Op::Report {
                stale,
                failed,
                replacement
            }),
        ]
    }

    fn nth(n: u8) -> ParticipantId {
        id(&format!("p{n}"))
    }

    proptest! {
        #[test]
        fn generations_increase_and_primary_differs_from_backup(
            ops in proptest::collection::vec(arb_op(), 1..64),
        ) {
            let mut service = ViewService::default();
            let mut last = Generation::ZERO;

            for op in ops {
                let view = match op {
                    Op::Join(n) => Some(service.join(nth(n), addr(u16::from(n) + 1))),
                    Op::Report { stale, failed, replacement } => {
                        let current = service.view().map_or(Generation::ZERO, |v| v.generation);
                        let generation = if stale {
                            Generation::new(current.as_u64().saturating_sub(1))
                        } else {
                            current
                        };
                        service.report_failure(generation, nth(failed), nth(replacement))
                    }
                };

                if let Some(view) = view {
                    prop_assert!(view.generation >= last);
                    prop_assert!(view.generation > last || Some(&view) == service.view());
                    prop_assert_ne!(Some(&view.primary), view.backup.as_ref());
                    prop_assert_ne!(view.generation, Generation::ZERO);
                    prop_assert_eq!(Some(&view.primary_address), service.roster().get(&view.primary));
                    last = view.generation;
                }
            }
        }
    }
}
