//! Reservation scheduling and conflict resolution.
//!
//! Every pass rebuilds the whole reservation set from scratch: manual
//! reservations are re-validated against the EPG, rule reservations are
//! regenerated from each enabled rule's search predicate, and the combined
//! candidates are walked once over the virtual tuner slots. The resulting
//! set (admitted + skipped + conflicted, sorted by start time) atomically
//! replaces the previous one.

mod slots;
mod store;

pub use store::{ReserveStore, StoreError};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use tunerec_protocol::{Program, RecordOption};

use crate::database::{Database, DatabaseError};
use crate::epg::{EpgError, EpgStore};
use crate::tuner::TunerDevice;

use slots::{tuner_max_position, TunerSlot};

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Program {0} is already reserved")]
    Duplicate(i64),

    #[error("No tuner available for program {0}")]
    Conflict(i64),

    #[error("A scheduling pass is already running")]
    Busy,

    #[error("Program {0} not found in the EPG")]
    ProgramNotFound(i64),

    #[error("Reservation for program {0} not found")]
    ReserveNotFound(i64),

    #[error(transparent)]
    Epg(#[from] EpgError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// A program plus scheduling metadata.
///
/// Rule reservations are regenerated wholesale on every pass; manual ones
/// (`rule_id = None`) persist until explicitly cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub program: Program,
    /// Originating rule; `None` means a manual reservation.
    pub rule_id: Option<i64>,
    /// Creation timestamp (ms) of a manual reservation, used as the
    /// earlier-created-wins tie-break.
    pub manual_id: Option<i64>,
    #[serde(default)]
    pub option: RecordOption,
    /// User excluded this program without deleting the reservation.
    pub is_skip: bool,
    /// Computed each pass; not a source-of-truth intent.
    pub is_conflict: bool,
    /// Admitted by evicting someone this pass. The recorder raises its
    /// tuning-priority hint so the tuner source does not starve it.
    #[serde(default)]
    pub won_conflict: bool,
}

impl Reservation {
    pub fn is_manual(&self) -> bool {
        self.rule_id.is_none()
    }

    /// Admitted to a tuner slot this pass.
    pub fn is_admitted(&self) -> bool {
        !self.is_skip && !self.is_conflict
    }
}

struct SchedulerState {
    reservations: Vec<Reservation>,
    store: ReserveStore,
}

/// The reservation scheduler. One pass runs at a time; a pass already in
/// progress makes new ones fail fast rather than queue.
pub struct ReservationScheduler {
    epg: Arc<dyn EpgStore>,
    db: Arc<Mutex<Database>>,
    devices: Vec<TunerDevice>,
    state: Mutex<SchedulerState>,
}

impl ReservationScheduler {
    pub fn new(
        epg: Arc<dyn EpgStore>,
        db: Arc<Mutex<Database>>,
        devices: Vec<TunerDevice>,
        store: ReserveStore,
    ) -> Result<Self, SchedulerError> {
        let reservations = store.load()?;
        info!(
            "Loaded {} reservations from snapshot, {} tuner devices",
            reservations.len(),
            devices.len()
        );
        Ok(Self {
            epg,
            db,
            devices,
            state: Mutex::new(SchedulerState {
                reservations,
                store,
            }),
        })
    }

    /// Current reservation set, sorted by start time.
    pub async fn reservations(&self) -> Vec<Reservation> {
        self.state.lock().await.reservations.clone()
    }

    /// Reservations holding a tuner slot this pass.
    pub async fn admitted(&self) -> Vec<Reservation> {
        self.state
            .lock()
            .await
            .reservations
            .iter()
            .filter(|r| r.is_admitted())
            .cloned()
            .collect()
    }

    pub async fn find(&self, program_id: i64) -> Option<Reservation> {
        self.state
            .lock()
            .await
            .reservations
            .iter()
            .find(|r| r.program.id == program_id)
            .cloned()
    }

    /// Run a full scheduling pass. Fails fast with [`SchedulerError::Busy`]
    /// when another pass holds the lock.
    pub async fn update_all(&self) -> Result<(), SchedulerError> {
        let mut state = self.state.try_lock().map_err(|_| SchedulerError::Busy)?;
        self.run_pass(&mut state).await
    }

    /// Add a manual reservation.
    ///
    /// Fails with [`SchedulerError::Duplicate`] when the program is already
    /// reserved, and with [`SchedulerError::Conflict`] when no tuner can
    /// take it even before eviction is considered (the probe item never
    /// evicts an existing reservation). On success a full pass runs with
    /// the new reservation included.
    pub async fn add_manual(
        &self,
        program_id: i64,
        option: RecordOption,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.try_lock().map_err(|_| SchedulerError::Busy)?;

        if state
            .reservations
            .iter()
            .any(|r| r.program.id == program_id)
        {
            return Err(SchedulerError::Duplicate(program_id));
        }

        let program = self
            .epg
            .find_program(program_id)
            .await?
            .ok_or(SchedulerError::ProgramNotFound(program_id))?;

        let candidate = Reservation {
            program,
            rule_id: None,
            manual_id: Some(Utc::now().timestamp_millis()),
            option,
            is_skip: false,
            is_conflict: false,
            won_conflict: false,
        };

        // Self-conflict probe: resolve with the candidate included but
        // forbidden from evicting anyone. If it still cannot be placed,
        // reject without mutating state.
        let mut probe_candidates = self.assemble_candidates(&state.reservations).await?;
        probe_candidates.insert(0, candidate.clone());
        let probed = resolve(
            &self.devices,
            probe_candidates,
            Some(program_id),
            Utc::now().timestamp_millis(),
        );
        let conflicted = probed
            .iter()
            .find(|r| r.program.id == program_id)
            .map(|r| r.is_conflict)
            .unwrap_or(true);
        if conflicted {
            return Err(SchedulerError::Conflict(program_id));
        }

        state.reservations.push(candidate);
        self.run_pass(&mut state).await
    }

    /// Cancel a reservation by program id.
    pub async fn cancel(&self, program_id: i64) -> Result<(), SchedulerError> {
        let mut state = self.state.try_lock().map_err(|_| SchedulerError::Busy)?;

        let before = state.reservations.len();
        state.reservations.retain(|r| r.program.id != program_id);
        if state.reservations.len() == before {
            return Err(SchedulerError::ReserveNotFound(program_id));
        }
        self.run_pass(&mut state).await
    }

    /// Set or clear the skip flag. The flag is carried forward by program
    /// id across passes, so it survives rule regeneration.
    pub async fn set_skip(&self, program_id: i64, skip: bool) -> Result<(), SchedulerError> {
        let mut state = self.state.try_lock().map_err(|_| SchedulerError::Busy)?;

        let found = state
            .reservations
            .iter_mut()
            .find(|r| r.program.id == program_id);
        match found {
            Some(r) => r.is_skip = skip,
            None => return Err(SchedulerError::ReserveNotFound(program_id)),
        }
        self.run_pass(&mut state).await
    }

    /// Drop the reservation for a program that finished recording. Called
    /// by the recorder after finalize; waits for the pass lock instead of
    /// failing fast.
    pub async fn remove_finished(&self, program_id: i64) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        let before = state.reservations.len();
        state.reservations.retain(|r| r.program.id != program_id);
        if state.reservations.len() != before {
            let reservations = state.reservations.clone();
            state.store.save(&reservations)?;
        }
        Ok(())
    }

    async fn run_pass(&self, state: &mut SchedulerState) -> Result<(), SchedulerError> {
        let candidates = self.assemble_candidates(&state.reservations).await?;
        let resolved = resolve(
            &self.devices,
            candidates,
            None,
            Utc::now().timestamp_millis(),
        );

        debug!(
            "Scheduling pass: {} candidates resolved, {} admitted, {} conflicted",
            resolved.len(),
            resolved.iter().filter(|r| r.is_admitted()).count(),
            resolved.iter().filter(|r| r.is_conflict).count()
        );

        state.reservations = resolved;
        state.store.save(&state.reservations)?;
        Ok(())
    }

    /// Assemble this pass's candidates: surviving manual reservations with
    /// refreshed program data, then one group per enabled rule from a fresh
    /// EPG search. Skip flags from the previous set carry forward.
    async fn assemble_candidates(
        &self,
        previous: &[Reservation],
    ) -> Result<Vec<Reservation>, SchedulerError> {
        let skip_flags: HashMap<i64, bool> = previous
            .iter()
            .map(|r| (r.program.id, r.is_skip))
            .collect();

        let mut candidates = Vec::new();

        for r in previous.iter().filter(|r| r.is_manual()) {
            let mut manual = r.clone();
            // Refresh from the guide when it still carries the program; a
            // guide outage must not drop a manual reservation.
            match self.epg.find_program(manual.program.id).await {
                Ok(Some(program)) => manual.program = program,
                Ok(None) => {}
                Err(e) => warn!(
                    "EPG lookup failed for manual reservation {}: {}",
                    manual.program.id, e
                ),
            }
            candidates.push(manual);
        }

        let rules = {
            let db = self.db.lock().await;
            db.list_enabled_rules()?
        };

        for rule in rules {
            let programs = self.epg.search(&rule.search).await?;
            for program in programs {
                let is_skip = skip_flags.get(&program.id).copied().unwrap_or(false);
                candidates.push(Reservation {
                    program,
                    rule_id: Some(rule.id),
                    manual_id: None,
                    option: rule.option.clone(),
                    is_skip,
                    is_conflict: false,
                    won_conflict: false,
                });
            }
        }

        Ok(candidates)
    }
}

/// Decide whether admitted entry `t` yields its slot to candidate `m`.
///
/// A fully elapsed entry (start and end both in the past) is always
/// evictable so a zombie cannot block capacity forever. Otherwise manual
/// outranks rule, and the earlier-created id wins within the same kind.
fn should_evict(t: &Reservation, m: &Reservation, now_ms: i64) -> bool {
    if t.program.is_elapsed(now_ms) {
        return true;
    }
    match (t.rule_id, m.rule_id) {
        (None, None) => t.manual_id.unwrap_or(i64::MAX) > m.manual_id.unwrap_or(i64::MAX),
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (Some(t_rule), Some(m_rule)) => t_rule > m_rule,
    }
}

/// One admission walk over the virtual tuner slots.
///
/// `probe` names a program that must not evict existing entries; it is set
/// only for the manual-add self-conflict check. Deterministic for a given
/// candidate set: manual group first, rule groups by ascending rule id,
/// descending physical channel within each group so multiplex-mates are
/// placed consecutively.
fn resolve(
    devices: &[TunerDevice],
    candidates: Vec<Reservation>,
    probe: Option<i64>,
    now_ms: i64,
) -> Vec<Reservation> {
    let mut manuals: Vec<Reservation> = Vec::new();
    let mut rule_groups: BTreeMap<i64, Vec<Reservation>> = BTreeMap::new();
    for r in candidates {
        match r.rule_id {
            None => manuals.push(r),
            Some(rule_id) => rule_groups.entry(rule_id).or_default().push(r),
        }
    }

    manuals.sort_by(|a, b| b.program.channel.cmp(&a.program.channel));
    for group in rule_groups.values_mut() {
        group.sort_by(|a, b| b.program.channel.cmp(&a.program.channel));
    }

    let order = manuals
        .into_iter()
        .chain(rule_groups.into_values().flatten());

    let mut slots: Vec<TunerSlot> = devices.iter().map(TunerSlot::new).collect();
    let mut seen: HashSet<i64> = HashSet::new();
    let mut skipped: Vec<Reservation> = Vec::new();
    let mut conflicted: Vec<Reservation> = Vec::new();

    for mut r in order {
        // First occurrence wins.
        if !seen.insert(r.program.id) {
            continue;
        }
        r.won_conflict = false;

        if r.is_skip {
            r.is_conflict = false;
            skipped.push(r);
            continue;
        }

        let Some(max_pos) = tuner_max_position(&slots, r.program.channel_type) else {
            // No device receives this channel type at all.
            r.is_conflict = true;
            conflicted.push(r);
            continue;
        };

        let can_evict = probe != Some(r.program.id);
        for (i, slot) in slots.iter_mut().enumerate() {
            if !slot.supports(r.program.channel_type) {
                continue;
            }

            if slot.find_conflict(&r.program).is_none() {
                r.is_conflict = false;
                slot.entries.push(r);
                break;
            }

            if i < max_pos {
                // A later device may still take it.
                continue;
            }

            // Last device for this type: evict or give up.
            loop {
                match slot.find_conflict(&r.program) {
                    None => {
                        r.is_conflict = false;
                        slot.entries.push(r);
                        break;
                    }
                    Some(j) if can_evict && should_evict(&slot.entries[j], &r, now_ms) => {
                        let mut evicted = slot.entries.remove(j);
                        evicted.is_conflict = true;
                        conflicted.push(evicted);
                        r.won_conflict = true;
                    }
                    Some(_) => {
                        r.is_conflict = true;
                        conflicted.push(r);
                        break;
                    }
                }
            }
            break;
        }
    }

    let mut result: Vec<Reservation> = slots
        .into_iter()
        .flat_map(|s| s.entries)
        .chain(skipped)
        .chain(conflicted)
        .collect();
    result.sort_by(|a, b| {
        a.program
            .start_at
            .cmp(&b.program.start_at)
            .then(a.program.id.cmp(&b.program.id))
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tunerec_protocol::{ChannelType, RuleSearchOption};

    fn program(id: i64, channel: &str, service_id: i64, start_min: i64, end_min: i64) -> Program {
        Program {
            id,
            channel_id: id,
            channel: channel.to_string(),
            service_id,
            channel_type: ChannelType::Gr,
            start_at: start_min * 60_000,
            end_at: end_min * 60_000,
            name: format!("program {}", id),
            description: None,
            extended: None,
            genre1: None,
            genre2: None,
            is_free: true,
            channel_name: "Ch".to_string(),
        }
    }

    fn manual(id: i64, channel: &str, service_id: i64, start: i64, end: i64) -> Reservation {
        Reservation {
            program: program(id, channel, service_id, start, end),
            rule_id: None,
            manual_id: Some(id),
            option: RecordOption::default(),
            is_skip: false,
            is_conflict: false,
            won_conflict: false,
        }
    }

    fn ruled(
        id: i64,
        rule_id: i64,
        channel: &str,
        service_id: i64,
        start: i64,
        end: i64,
    ) -> Reservation {
        Reservation {
            program: program(id, channel, service_id, start, end),
            rule_id: Some(rule_id),
            manual_id: None,
            option: RecordOption::default(),
            is_skip: false,
            is_conflict: false,
            won_conflict: false,
        }
    }

    fn one_gr_tuner() -> Vec<TunerDevice> {
        vec![TunerDevice {
            name: "t0".to_string(),
            types: vec![ChannelType::Gr],
        }]
    }

    const FUTURE: i64 = 0; // all test programs start at/after minute 0

    #[test]
    fn test_non_overlapping_share_one_tuner() {
        let resolved = resolve(
            &one_gr_tuner(),
            vec![manual(1, "T27", 1, 0, 30), manual(2, "T28", 2, 30, 60)],
            None,
            FUTURE,
        );
        assert!(resolved.iter().all(|r| r.is_admitted()));
    }

    #[test]
    fn test_overlap_different_channel_one_conflicted() {
        let resolved = resolve(
            &one_gr_tuner(),
            vec![ruled(1, 1, "T27", 1, 0, 30), ruled(2, 1, "T28", 2, 15, 45)],
            None,
            FUTURE,
        );
        let admitted = resolved.iter().filter(|r| r.is_admitted()).count();
        let conflicted = resolved.iter().filter(|r| r.is_conflict).count();
        assert_eq!((admitted, conflicted), (1, 1));
    }

    #[test]
    fn test_multiplex_sharing_admits_both() {
        let resolved = resolve(
            &one_gr_tuner(),
            vec![manual(1, "T27", 1, 0, 30), manual(2, "T27", 2, 15, 45)],
            None,
            FUTURE,
        );
        assert!(resolved.iter().all(|r| r.is_admitted()));
    }

    #[test]
    fn test_manual_beats_rule() {
        // Rule candidate comes first in the input; the manual group is
        // still walked first and the rule entry loses the head-to-head.
        let resolved = resolve(
            &one_gr_tuner(),
            vec![ruled(1, 1, "T27", 1, 0, 30), manual(2, "T28", 2, 15, 45)],
            None,
            FUTURE,
        );
        let winner = resolved.iter().find(|r| r.program.id == 2).unwrap();
        let loser = resolved.iter().find(|r| r.program.id == 1).unwrap();
        assert!(winner.is_admitted());
        assert!(loser.is_conflict);
    }

    #[test]
    fn test_lower_rule_id_wins() {
        let resolved = resolve(
            &one_gr_tuner(),
            vec![ruled(2, 9, "T28", 2, 15, 45), ruled(1, 3, "T27", 1, 0, 30)],
            None,
            FUTURE,
        );
        assert!(resolved.iter().find(|r| r.program.id == 1).unwrap().is_admitted());
        assert!(resolved.iter().find(|r| r.program.id == 2).unwrap().is_conflict);
    }

    #[test]
    fn test_earlier_manual_wins_tie() {
        let mut early = manual(1, "T27", 1, 0, 30);
        early.manual_id = Some(100);
        let mut late = manual(2, "T28", 2, 15, 45);
        late.manual_id = Some(200);

        // Later-created walks first (channel sort), still loses on id.
        let resolved = resolve(&one_gr_tuner(), vec![late, early], None, FUTURE);
        assert!(resolved.iter().find(|r| r.program.id == 1).unwrap().is_admitted());
        assert!(resolved.iter().find(|r| r.program.id == 2).unwrap().is_conflict);
    }

    #[test]
    fn test_stale_entry_is_evicted() {
        // Entry 1's window is fully past; candidate 2 overlaps it on
        // another channel and may take the slot despite a higher rule id.
        let stale = ruled(1, 1, "T27", 1, 0, 30);
        let fresh = ruled(2, 9, "T28", 2, 15, 45);
        let now_ms = 40 * 60_000;

        let resolved = resolve(&one_gr_tuner(), vec![stale, fresh], None, now_ms);
        assert!(resolved.iter().find(|r| r.program.id == 1).unwrap().is_conflict);
        let winner = resolved.iter().find(|r| r.program.id == 2).unwrap();
        assert!(winner.is_admitted());
        assert!(winner.won_conflict);
    }

    #[test]
    fn test_ongoing_program_is_not_stale() {
        // Started but still on air: must not be treated as a zombie.
        let ongoing = ruled(1, 1, "T27", 1, 0, 60);
        let fresh = ruled(2, 9, "T28", 2, 15, 45);
        let now_ms = 30 * 60_000;

        let resolved = resolve(&one_gr_tuner(), vec![ongoing, fresh], None, now_ms);
        assert!(resolved.iter().find(|r| r.program.id == 1).unwrap().is_admitted());
        assert!(resolved.iter().find(|r| r.program.id == 2).unwrap().is_conflict);
    }

    #[test]
    fn test_skip_frees_the_slot() {
        let mut skipping = ruled(1, 1, "T27", 1, 0, 30);
        skipping.is_skip = true;
        let other = ruled(2, 9, "T28", 2, 15, 45);

        let resolved = resolve(&one_gr_tuner(), vec![skipping, other], None, FUTURE);
        let skipped = resolved.iter().find(|r| r.program.id == 1).unwrap();
        assert!(skipped.is_skip);
        assert!(!skipped.is_conflict);
        assert!(resolved.iter().find(|r| r.program.id == 2).unwrap().is_admitted());
    }

    #[test]
    fn test_duplicate_program_first_occurrence_wins() {
        let resolved = resolve(
            &one_gr_tuner(),
            vec![manual(1, "T27", 1, 0, 30), ruled(1, 1, "T27", 1, 0, 30)],
            None,
            FUTURE,
        );
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].is_manual());
    }

    #[test]
    fn test_unsupported_channel_type_conflicts() {
        let mut r = manual(1, "BS1", 1, 0, 30);
        r.program.channel_type = ChannelType::Bs;
        let resolved = resolve(&one_gr_tuner(), vec![r], None, FUTURE);
        assert!(resolved[0].is_conflict);
    }

    #[test]
    fn test_second_device_takes_the_overflow() {
        let devices = vec![
            TunerDevice {
                name: "t0".to_string(),
                types: vec![ChannelType::Gr],
            },
            TunerDevice {
                name: "t1".to_string(),
                types: vec![ChannelType::Gr],
            },
        ];
        let resolved = resolve(
            &devices,
            vec![ruled(1, 1, "T27", 1, 0, 30), ruled(2, 1, "T28", 2, 15, 45)],
            None,
            FUTURE,
        );
        assert!(resolved.iter().all(|r| r.is_admitted()));
    }

    #[test]
    fn test_result_sorted_by_start() {
        let resolved = resolve(
            &one_gr_tuner(),
            vec![manual(2, "T28", 2, 40, 60), manual(1, "T27", 1, 0, 30)],
            None,
            FUTURE,
        );
        assert_eq!(resolved[0].program.id, 1);
        assert_eq!(resolved[1].program.id, 2);
    }

    // Async scheduler surface, backed by a fixed EPG and in-memory DB.

    struct FixedEpg(Vec<Program>);

    #[async_trait]
    impl EpgStore for FixedEpg {
        async fn find_program(&self, program_id: i64) -> Result<Option<Program>, EpgError> {
            Ok(self.0.iter().find(|p| p.id == program_id).cloned())
        }

        async fn search(&self, option: &RuleSearchOption) -> Result<Vec<Program>, EpgError> {
            Ok(self
                .0
                .iter()
                .filter(|p| crate::epg::matches(option, p))
                .cloned()
                .collect())
        }
    }

    fn scheduler_with(
        programs: Vec<Program>,
        devices: Vec<TunerDevice>,
    ) -> (ReservationScheduler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ReserveStore::new(dir.path().join("reserves.json"));
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let scheduler =
            ReservationScheduler::new(Arc::new(FixedEpg(programs)), db, devices, store).unwrap();
        (scheduler, dir)
    }

    #[tokio::test]
    async fn test_add_manual_duplicate() {
        let (s, _dir) = scheduler_with(vec![program(1, "T27", 1, 0, 30)], one_gr_tuner());
        s.add_manual(1, RecordOption::default()).await.unwrap();
        assert!(matches!(
            s.add_manual(1, RecordOption::default()).await,
            Err(SchedulerError::Duplicate(1))
        ));
    }

    #[tokio::test]
    async fn test_add_manual_unknown_program() {
        let (s, _dir) = scheduler_with(vec![], one_gr_tuner());
        assert!(matches!(
            s.add_manual(42, RecordOption::default()).await,
            Err(SchedulerError::ProgramNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_add_manual_self_conflict() {
        // Two manual reserves saturate the single tuner; a third overlapping
        // one must be rejected without evicting either.
        let programs = vec![
            program(1, "T27", 1, 0, 30),
            program(2, "T28", 2, 0, 30),
            program(3, "T29", 3, 10, 40),
        ];
        let (s, _dir) = scheduler_with(programs, one_gr_tuner());
        s.add_manual(1, RecordOption::default()).await.unwrap();

        // Second overlapping manual on another channel: no capacity.
        assert!(matches!(
            s.add_manual(2, RecordOption::default()).await,
            Err(SchedulerError::Conflict(2))
        ));

        assert_eq!(s.reservations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_busy_when_pass_lock_held() {
        let (s, _dir) = scheduler_with(vec![program(1, "T27", 1, 0, 30)], one_gr_tuner());
        let _guard = s.state.try_lock().unwrap();
        assert!(matches!(s.update_all().await, Err(SchedulerError::Busy)));
        assert!(matches!(
            s.add_manual(1, RecordOption::default()).await,
            Err(SchedulerError::Busy)
        ));
    }

    #[tokio::test]
    async fn test_cancel_and_skip() {
        let (s, _dir) = scheduler_with(
            vec![program(1, "T27", 1, 0, 30), program(2, "T28", 2, 40, 60)],
            one_gr_tuner(),
        );
        s.add_manual(1, RecordOption::default()).await.unwrap();
        s.add_manual(2, RecordOption::default()).await.unwrap();

        s.set_skip(1, true).await.unwrap();
        let r = s.find(1).await.unwrap();
        assert!(r.is_skip && !r.is_conflict);
        assert_eq!(s.admitted().await.len(), 1);

        s.cancel(1).await.unwrap();
        assert!(s.find(1).await.is_none());
        assert!(matches!(
            s.cancel(1).await,
            Err(SchedulerError::ReserveNotFound(1))
        ));
    }

    #[tokio::test]
    async fn test_rule_reservations_regenerated() {
        let programs = vec![program(1, "T27", 1, 0, 30), program(2, "T28", 2, 40, 60)];
        let (s, _dir) = scheduler_with(programs, one_gr_tuner());
        {
            let db = s.db.lock().await;
            db.insert_rule(
                &RuleSearchOption {
                    keyword: Some("program".to_string()),
                    title: true,
                    ..Default::default()
                },
                &RecordOption::default(),
                true,
            )
            .unwrap();
        }

        s.update_all().await.unwrap();
        assert_eq!(s.reservations().await.len(), 2);

        // Skip carries forward across regeneration.
        s.set_skip(1, true).await.unwrap();
        s.update_all().await.unwrap();
        assert!(s.find(1).await.unwrap().is_skip);
    }
}
