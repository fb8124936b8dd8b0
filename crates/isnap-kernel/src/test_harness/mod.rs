//! Test harness: the simulated array plus a seeded registry simulator.
//!
//! The registry simulator throws random operation sequences at a
//! [`SnapshotRegistry`] and checks the registry invariants after every
//! step, so a regression in commit or transition logic shows up as a
//! reproducible seed.

pub mod simulator;

pub use simulator::*;

use crate::registry::SnapshotRegistry;
use crate::state_machine;
use crate::types::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct RegistrySimConfig {
    pub seed: u64,
    pub total_operations: u64,
    /// Volumes snapshots are spread over; fewer volumes means longer chains
    pub volumes: usize,
    pub stop_on_first_violation: bool,
}

impl Default for RegistrySimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            total_operations: 2_000,
            volumes: 3,
            stop_on_first_violation: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SimulatedOperation {
    Backup { volume: String, copy: CopyId },
    Transition(SnapshotId, SnapshotEvent),
    Mount { snapshot: SnapshotId, host: String, complete: bool },
    Unmount { snapshot: SnapshotId, host: String },
    Revert(SnapshotId),
    OpenEdge { source: SnapshotId, derived: CopyId },
    CloseEdge { source: SnapshotId, derived: CopyId, state: EdgeState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantCheck {
    AuditChainUnbroken,
    AuditTransitionsInTable,
    OneLiveSnapshotPerJobCopy,
    OneMountPerDestination,
    MountedMatchesActiveMounts,
    NoPendingClaimsLeft,
}

#[derive(Debug, Clone)]
pub struct InvariantViolation {
    pub operation_index: u64,
    pub check: InvariantCheck,
    pub details: String,
}

#[derive(Debug, Clone, Default)]
pub struct OperationStats {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub rejected_operations: u64,
    pub operations_by_type: HashMap<String, u64>,
}

impl OperationStats {
    fn record(&mut self, operation: &SimulatedOperation, ok: bool) {
        self.total_operations += 1;
        let name = format!("{operation:?}");
        let type_name = name
            .split([' ', '('])
            .next()
            .unwrap_or("Unknown")
            .to_string();
        *self.operations_by_type.entry(type_name).or_insert(0) += 1;
        if ok {
            self.successful_operations += 1;
        } else {
            self.rejected_operations += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatorReport {
    pub config: RegistrySimConfig,
    pub stats: OperationStats,
    pub violations: Vec<InvariantViolation>,
    pub final_snapshot_count: usize,
}

impl SimulatorReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        report.push_str("=== Registry Simulator Report ===\n\n");
        report.push_str(&format!("Seed: {}\n", self.config.seed));
        report.push_str(&format!("Total Operations: {}\n", self.stats.total_operations));
        report.push_str(&format!("Successful: {}\n", self.stats.successful_operations));
        report.push_str(&format!("Rejected: {}\n", self.stats.rejected_operations));
        report.push_str(&format!("Snapshots: {}\n", self.final_snapshot_count));
        report.push_str(&format!("Violations: {}\n", self.violations.len()));
        for (i, v) in self.violations.iter().enumerate() {
            report.push_str(&format!("{}. {:?}\n", i + 1, v));
        }
        report.push_str(&format!(
            "\n=== Result: {} ===\n",
            if self.passed() { "PASS" } else { "FAIL" }
        ));
        report
    }
}

const SIM_POLICY: StoragePolicyId = StoragePolicyId(900);
const SIM_PRIMARY: CopyId = CopyId(901);
const SIM_VAULT: CopyId = CopyId(902);

fn sim_policy() -> StoragePolicy {
    let copy = |id: CopyId, name: &str, kind: CopyKind| PolicyCopy {
        id,
        name: name.to_string(),
        policy: SIM_POLICY,
        kind,
        retention: RetentionPolicy::default(),
        precedence: kind.default_rank(),
    };
    StoragePolicy {
        id: SIM_POLICY,
        name: "simulated".to_string(),
        copies: vec![
            copy(SIM_PRIMARY, "Primary", CopyKind::Primary),
            copy(SIM_VAULT, "Vault", CopyKind::Vault),
        ],
        backup_copy_source: None,
    }
}

/// Runs a seeded operation sequence against an in-memory registry.
pub fn run_registry_simulator(config: RegistrySimConfig) -> SimulatorReport {
    let registry = SnapshotRegistry::in_memory();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut stats = OperationStats::default();
    let mut violations = Vec::new();

    if let Err(e) = registry.define_policy(sim_policy()) {
        violations.push(InvariantViolation {
            operation_index: 0,
            check: InvariantCheck::AuditChainUnbroken,
            details: format!("setup failed: {e}"),
        });
    }

    for i in 0..config.total_operations {
        let ids: Vec<SnapshotId> = registry.list_all().iter().map(|s| s.id).collect();
        let operation = generate_operation(&mut rng, &config, &ids);
        let ok = execute_operation(&registry, &operation);
        stats.record(&operation, ok);

        let found = check_invariants(&registry, i);
        if !found.is_empty() {
            violations.extend(found);
            if config.stop_on_first_violation {
                break;
            }
        }
    }

    SimulatorReport {
        final_snapshot_count: registry.list_all().len(),
        config,
        stats,
        violations,
    }
}

fn generate_operation(rng: &mut StdRng, config: &RegistrySimConfig, ids: &[SnapshotId]) -> SimulatedOperation {
    const EVENTS: [SnapshotEvent; 5] = [
        SnapshotEvent::Catalog,
        SnapshotEvent::Invalidate,
        SnapshotEvent::BeginDelete,
        SnapshotEvent::ConfirmDelete,
        SnapshotEvent::AbortDelete,
    ];
    let host = format!("host{}", rng.gen_range(0..2));
    let derived = if rng.gen_bool(0.5) { SIM_VAULT } else { SIM_PRIMARY };
    if ids.is_empty() || rng.gen_bool(0.15) {
        let volume = format!("/vol/{}", rng.gen_range(0..config.volumes.max(1)));
        let copy = if rng.gen_bool(0.8) { SIM_PRIMARY } else { SIM_VAULT };
        return SimulatedOperation::Backup { volume, copy };
    }
    let snapshot = ids[rng.gen_range(0..ids.len())];
    match rng.gen_range(0..10) {
        0..=3 => SimulatedOperation::Transition(snapshot, EVENTS[rng.gen_range(0..EVENTS.len())]),
        4 | 5 => SimulatedOperation::Mount {
            snapshot,
            host,
            complete: rng.gen_bool(0.8),
        },
        6 => SimulatedOperation::Unmount { snapshot, host },
        7 => SimulatedOperation::Revert(snapshot),
        8 => SimulatedOperation::OpenEdge {
            source: snapshot,
            derived,
        },
        _ => SimulatedOperation::CloseEdge {
            source: snapshot,
            derived,
            state: if rng.gen_bool(0.7) {
                EdgeState::Materialized
            } else {
                EdgeState::Failed
            },
        },
    }
}

fn execute_operation(registry: &SnapshotRegistry, operation: &SimulatedOperation) -> bool {
    match operation {
        SimulatedOperation::Backup { volume, copy } => registry
            .record_job(BackupLevel::Full, "sim", volume, now())
            .and_then(|job| registry.register(job.id, *copy, None, None))
            .is_ok(),
        SimulatedOperation::Transition(id, event) => {
            registry.transition(*id, *event, None).is_ok()
        }
        SimulatedOperation::Mount {
            snapshot,
            host,
            complete,
        } => {
            let Ok(current) = registry.get(*snapshot) else {
                return false;
            };
            let Ok(claim) = registry.claim_mount(
                *snapshot,
                &Destination::new(host.as_str()),
                "/mnt/sim",
                AccessMode::ReadOnly,
            ) else {
                return false;
            };
            if *complete {
                claim.complete(current.state, None).is_ok()
            } else {
                drop(claim);
                false
            }
        }
        SimulatedOperation::Unmount { snapshot, host } => registry
            .complete_unmount(*snapshot, &Destination::new(host.as_str()), None)
            .is_ok(),
        SimulatedOperation::Revert(id) => registry.revert_chain(*id, None).is_ok(),
        SimulatedOperation::OpenEdge { source, derived } => {
            registry.open_edge(*source, *derived).is_ok()
        }
        SimulatedOperation::CloseEdge {
            source,
            derived,
            state,
        } => registry.update_edge(*source, *derived, None, *state).is_ok(),
    }
}

/// Checks every registry invariant; returns what failed.
pub fn check_invariants(registry: &SnapshotRegistry, operation_index: u64) -> Vec<InvariantViolation> {
    let mut out = Vec::new();
    let mut fail = |check, details: String| {
        out.push(InvariantViolation {
            operation_index,
            check,
            details,
        });
    };
    let state = registry.export();

    if let Err(e) = registry.verify_audit() {
        fail(InvariantCheck::AuditChainUnbroken, e.to_string());
    }
    let audit = registry.audit().unwrap_or_default();
    for r in audit.records() {
        let legal = match r.event {
            SnapshotEvent::AbortDelete => {
                r.from == SnapshotState::Deleting
                    && state_machine::allows(r.to, SnapshotEvent::BeginDelete)
            }
            event => state_machine::apply(r.from, event, None) == Some(r.to),
        };
        if !legal {
            fail(
                InvariantCheck::AuditTransitionsInTable,
                format!("seq {}: {} --{}--> {}", r.seq, r.from, r.event, r.to),
            );
        }
    }

    let mut live = HashSet::new();
    for s in state.snapshots.values().filter(|s| !s.state.is_retired()) {
        if !live.insert((s.job, s.copy)) {
            fail(
                InvariantCheck::OneLiveSnapshotPerJobCopy,
                format!("{} / {} has more than one live snapshot", s.job, s.copy),
            );
        }
    }

    let mut slots = HashSet::new();
    for m in &state.mounts {
        if !slots.insert((m.snapshot, m.destination.clone())) {
            fail(
                InvariantCheck::OneMountPerDestination,
                format!("{} mounted twice on {}", m.snapshot, m.destination),
            );
        }
        if m.lease == LeaseState::Pending {
            fail(
                InvariantCheck::NoPendingClaimsLeft,
                format!("{} still pending on {}", m.snapshot, m.destination),
            );
        }
    }

    for s in state.snapshots.values() {
        let active = state
            .mounts
            .iter()
            .any(|m| m.snapshot == s.id && m.lease == LeaseState::Active);
        if (s.state == SnapshotState::Mounted) != active {
            fail(
                InvariantCheck::MountedMatchesActiveMounts,
                format!("{} is {} with active mount = {active}", s.id, s.state),
            );
        }
    }
    out
}
