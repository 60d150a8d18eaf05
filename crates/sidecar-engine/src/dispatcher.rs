//! The dispatch engine: host events in, concurrent add-on units out.
//!
//! One cycle runs at a time. A cycle resolves the event to a turn, classifies
//! the enabled add-ons, drains the pending trigger queue, groups the run-set
//! and fans out one task per execution unit. Units report independently; a
//! failing unit never touches its siblings.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use sidecar_core::{
    Addon, AddonId, ModelInvoker, Persister, RequestMode, ResultMeta, SidecarEvent, StoredResult, TriggerMode,
    Turn, TurnId, TurnRef, TurnSource,
};
use sidecar_settings::DispatchSettings;
use sidecar_store::{RestoreOutcome, ResultRepo, ResultView};

use crate::batch::{self, SplitTier};
use crate::classify::{classify, matches};
use crate::debounce::Debouncer;
use crate::error::EngineError;
use crate::grouping::{plan, BatchGroup, ExecutionPlan};
use crate::prompt::{CycleCache, PromptAssembler};
use crate::resolve::{resolve, HostPayload};
use crate::sanitize::sanitize;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub batch_separator: String,
    pub context_turns: usize,
    pub persist_debounce: Duration,
}

impl From<&DispatchSettings> for DispatcherConfig {
    fn from(settings: &DispatchSettings) -> Self {
        Self {
            batch_separator: settings.batch_separator.clone(),
            context_turns: settings.context_turns,
            persist_debounce: Duration::from_millis(settings.persist_debounce_ms),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&DispatchSettings::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPhase {
    Idle,
    Resolving,
    Classifying,
    Grouping,
    Executing,
    Persisting,
}

/// A unit that did not produce a stored result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitFailure {
    pub addon_id: AddonId,
    pub error: String,
    pub kind: String,
}

/// What one execution pass produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleReport {
    pub turn: TurnRef,
    pub succeeded: Vec<AddonId>,
    pub failed: Vec<UnitFailure>,
}

impl CycleReport {
    fn new(turn: TurnRef) -> Self {
        Self {
            turn,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn record(&mut self, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Succeeded(id) => self.succeeded.push(id),
            UnitOutcome::Failed(failure) => self.failed.push(failure),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of handling one host event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Another cycle was in flight; the event was dropped.
    Busy,
    /// Neither the payload nor the log yielded a turn.
    Unresolved,
    /// A user turn; matching trigger add-ons now wait for the next AI turn.
    TriggersQueued { turn: TurnRef, matched: Vec<AddonId> },
    /// This turn variant was already dispatched.
    Duplicate { turn: TurnRef },
    NothingToRun { turn: TurnRef },
    Dispatched(CycleReport),
}

#[derive(Debug, Default)]
struct CycleState {
    pending: BTreeSet<AddonId>,
    last_dispatched: Option<(TurnId, usize)>,
}

enum UnitOutcome {
    Succeeded(AddonId),
    Failed(UnitFailure),
}

struct SpawnedUnit {
    addon_ids: Vec<AddonId>,
    handle: JoinHandle<Vec<UnitOutcome>>,
}

/// Everything an execution unit needs once it is detached from the dispatcher.
#[derive(Clone)]
struct UnitContext {
    host: Arc<dyn TurnSource>,
    invoker: Arc<dyn ModelInvoker>,
    repo: ResultRepo,
    view: Arc<Mutex<ResultView>>,
    events: broadcast::Sender<SidecarEvent>,
    persist: Debouncer,
    separator: Arc<str>,
}

impl UnitContext {
    fn emit(&self, event: SidecarEvent) {
        let event_type = event.event_type();
        if self.events.send(event).is_err() {
            debug!(event_type, "no subscribers, signal dropped");
        }
    }

    fn started(&self, addon: &Addon, turn: &TurnRef) {
        self.emit(SidecarEvent::UnitStarted {
            addon_id: addon.id.clone(),
            turn: turn.clone(),
        });
    }

    fn fail(&self, addon_id: &AddonId, turn: &TurnRef, error: String, kind: &str) -> UnitOutcome {
        warn!(addon_id = %addon_id, turn = %turn, error = %error, error_kind = kind, "unit failed");
        self.emit(SidecarEvent::UnitFailed {
            addon_id: addon_id.clone(),
            turn: turn.clone(),
            error: error.clone(),
            error_kind: kind.to_string(),
        });
        UnitOutcome::Failed(UnitFailure {
            addon_id: addon_id.clone(),
            error,
            kind: kind.to_string(),
        })
    }

    async fn run_standalone(self, addon: Addon, prompt: String, turn: TurnRef) -> Vec<UnitOutcome> {
        self.started(&addon, &turn);
        match self.invoker.invoke(&addon, &prompt).await {
            Ok(raw) => vec![self.store(&addon, &turn, &raw)],
            Err(e) => vec![self.fail(&addon.id, &turn, e.to_string(), e.error_kind())],
        }
    }

    async fn run_batch(self, group: BatchGroup, prompts: Vec<String>, turn: TurnRef) -> Vec<UnitOutcome> {
        for addon in &group.addons {
            self.started(addon, &turn);
        }
        let combined = batch::encode(&group.addons, &prompts, &self.separator);
        match self.invoker.invoke_batch(&group.addons, &combined).await {
            Ok(raw) => {
                let decoded = batch::decode(&raw, group.addons.len(), &self.separator);
                if decoded.tier != SplitTier::Separator {
                    warn!(group = %group.key(), tier = decoded.tier.as_str(), "batch response split degraded");
                }
                group
                    .addons
                    .iter()
                    .zip(decoded.parts)
                    .map(|(addon, part)| self.store(addon, &turn, &part))
                    .collect()
            }
            Err(e) => group
                .addons
                .iter()
                .map(|addon| self.fail(&addon.id, &turn, e.to_string(), e.error_kind()))
                .collect(),
        }
    }

    /// Sanitize, write, expose, signal.
    fn store(&self, addon: &Addon, turn: &TurnRef, raw: &str) -> UnitOutcome {
        let content = sanitize(raw);
        if content.trim().is_empty() {
            return self.fail(&addon.id, turn, "model returned an empty response".into(), "empty_response");
        }
        let meta = ResultMeta::for_addon(addon);
        match self
            .repo
            .save(&turn.turn_id, turn.variant_index, &addon.id, &content, &meta)
        {
            Ok(saved) => {
                self.persist.schedule();
                self.show(saved);
                self.emit(SidecarEvent::UnitSucceeded {
                    addon_id: addon.id.clone(),
                    turn: turn.clone(),
                    content,
                    location: addon.response_location,
                });
                debug!(addon_id = %addon.id, turn = %turn, "unit succeeded");
                UnitOutcome::Succeeded(addon.id.clone())
            }
            Err(e) => self.fail(&addon.id, turn, e.to_string(), "store"),
        }
    }

    /// Materialize a fresh result unless the user has since moved to another variant.
    fn show(&self, result: StoredResult) {
        let active = self
            .host
            .turns()
            .into_iter()
            .find(|t| t.id == result.turn_id)
            .map(|t| t.current_variant_index);
        if active.is_none_or(|v| v == result.variant_index) {
            self.view.lock().materialize(result);
        } else {
            debug!(
                turn_id = %result.turn_id,
                variant = result.variant_index,
                "result stored for an inactive variant, not shown"
            );
        }
    }
}

struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Tracks the cycle's phase and returns it to `Idle` on every exit path.
struct PhaseGuard<'a>(&'a Mutex<DispatchPhase>);

impl PhaseGuard<'_> {
    fn enter(&self, phase: DispatchPhase) {
        *self.0.lock() = phase;
        debug!(phase = ?phase, "dispatch phase");
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = DispatchPhase::Idle;
    }
}

pub struct Dispatcher {
    host: Arc<dyn TurnSource>,
    addons: RwLock<Vec<Addon>>,
    assembler: PromptAssembler,
    units: UnitContext,
    in_flight: AtomicBool,
    phase: Mutex<DispatchPhase>,
    state: Mutex<CycleState>,
}

impl Dispatcher {
    /// Must be called inside a tokio runtime; the persistence timer is spawned here.
    pub fn new(
        host: Arc<dyn TurnSource>,
        invoker: Arc<dyn ModelInvoker>,
        persister: Arc<dyn Persister>,
        repo: ResultRepo,
        addons: Vec<Addon>,
        config: DispatcherConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let units = UnitContext {
            host: Arc::clone(&host),
            invoker,
            repo,
            view: Arc::new(Mutex::new(ResultView::new())),
            events,
            persist: Debouncer::spawn(persister, config.persist_debounce),
            separator: Arc::from(config.batch_separator.as_str()),
        };
        Self {
            host,
            addons: RwLock::new(addons),
            assembler: PromptAssembler::new(config.context_turns),
            units,
            in_flight: AtomicBool::new(false),
            phase: Mutex::new(DispatchPhase::Idle),
            state: Mutex::new(CycleState::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SidecarEvent> {
        self.units.events.subscribe()
    }

    pub fn phase(&self) -> DispatchPhase {
        *self.phase.lock()
    }

    pub fn repo(&self) -> &ResultRepo {
        &self.units.repo
    }

    pub fn addons(&self) -> Vec<Addon> {
        self.addons.read().clone()
    }

    /// Swap the configured add-ons. Takes effect from the next cycle; queued
    /// trigger ids that are no longer enabled are dropped when the queue drains.
    pub fn replace_addons(&self, addons: Vec<Addon>) {
        info!(count = addons.len(), "add-on configuration replaced");
        *self.addons.write() = addons;
    }

    pub fn pending_triggers(&self) -> Vec<AddonId> {
        self.state.lock().pending.iter().cloned().collect()
    }

    /// Results currently exposed for a turn.
    pub fn visible(&self, turn_id: &TurnId) -> Vec<StoredResult> {
        self.units.view.lock().visible(turn_id)
    }

    /// Run any pending host save now.
    pub async fn flush_persistence(&self) {
        self.units.persist.flush().await;
    }

    /// Process one host event. Dropped events and duplicates are outcomes, not errors.
    #[instrument(skip_all)]
    pub async fn handle_host_event(&self, payload: &HostPayload) -> Result<DispatchOutcome, EngineError> {
        let Some(_flight) = FlightGuard::try_acquire(&self.in_flight) else {
            debug!("dispatch cycle in flight, event dropped");
            return Ok(DispatchOutcome::Busy);
        };
        let phase = PhaseGuard(&self.phase);

        phase.enter(DispatchPhase::Resolving);
        let turns = self.host.turns();
        let resolved = resolve(payload, &turns);
        let (index, turn) = match resolved.turn {
            Some(turn) => (resolved.turn_index, turn),
            None => match latest_ai_turn(&turns) {
                Some((i, turn)) => {
                    debug!(turn_index = i, "falling back to latest AI turn");
                    (Some(i), turn.clone())
                }
                None => return Ok(DispatchOutcome::Unresolved),
            },
        };
        // A turn object the log does not contain is treated as the next turn.
        let position = index.unwrap_or(turns.len());
        let turn_ref = TurnRef::of(&turn, position);

        phase.enter(DispatchPhase::Classifying);
        let enabled: Vec<Addon> = self.addons.read().iter().filter(|a| a.enabled).cloned().collect();
        let classified = classify(&enabled);

        if turn.is_user_turn() {
            let matched = self.queue_triggers(&classified.trigger, turn.text());
            return Ok(DispatchOutcome::TriggersQueued { turn: turn_ref, matched });
        }
        if !turn.role_known() {
            debug!(turn = %turn_ref, "turn role unknown, treating as AI turn");
        }

        let key = (turn.id.clone(), turn.current_variant_index);
        if self.state.lock().last_dispatched.as_ref() == Some(&key) {
            debug!(turn = %turn_ref, "turn variant already dispatched");
            return Ok(DispatchOutcome::Duplicate { turn: turn_ref });
        }

        // Catch trigger matches whose user-turn event never arrived.
        if let Some(previous) = index.and_then(|i| i.checked_sub(1)).and_then(|i| turns.get(i)) {
            if previous.is_user_turn() {
                self.queue_triggers(&classified.trigger, previous.text());
            }
        }

        let pending = std::mem::take(&mut self.state.lock().pending);
        let mut run_set = classified.auto;
        for addon in &enabled {
            if pending.contains(&addon.id) && !run_set.iter().any(|a| a.id == addon.id) {
                run_set.push(addon.clone());
            }
        }
        let consumed = enabled.iter().filter(|a| pending.contains(&a.id)).count();
        if consumed < pending.len() {
            debug!(dropped = pending.len() - consumed, "pending triggers no longer enabled");
        }
        if run_set.is_empty() {
            debug!(turn = %turn_ref, "no add-ons to run");
            return Ok(DispatchOutcome::NothingToRun { turn: turn_ref });
        }

        phase.enter(DispatchPhase::Grouping);
        let execution = plan(run_set);

        phase.enter(DispatchPhase::Executing);
        let mut cache = CycleCache::new();
        let history = &turns[..position.min(turns.len())];
        let (report, spawned) = self.spawn_plan(execution, &turn, history, &turn_ref, &mut cache);
        self.state.lock().last_dispatched = Some(key);
        let report = self.collect(report, spawned).await;
        cache.clear();

        phase.enter(DispatchPhase::Persisting);
        info!(
            turn = %turn_ref,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "dispatch cycle complete"
        );
        Ok(DispatchOutcome::Dispatched(report))
    }

    /// Run add-ons on the latest AI turn on explicit request. `None` runs every
    /// enabled manual add-on; explicit ids may name any configured add-on.
    /// Ignores the dedup memo.
    #[instrument(skip(self))]
    pub async fn run_manual(&self, addon_ids: Option<Vec<AddonId>>) -> Result<CycleReport, EngineError> {
        let turns = self.host.turns();
        let (index, turn) = latest_ai_turn(&turns).ok_or(EngineError::NoTurn)?;
        let configured = self.addons();
        let selected: Vec<Addon> = match addon_ids {
            Some(ids) => {
                let mut selected: Vec<Addon> = Vec::new();
                for id in ids {
                    let addon = configured
                        .iter()
                        .find(|a| a.id == id)
                        .ok_or_else(|| EngineError::UnknownAddon(id.clone()))?;
                    if !selected.iter().any(|a| a.id == addon.id) {
                        selected.push(addon.clone());
                    }
                }
                selected
            }
            None => configured
                .into_iter()
                .filter(|a| a.enabled && a.trigger_mode == TriggerMode::Manual)
                .collect(),
        };

        let turn_ref = TurnRef::of(turn, index);
        let mut cache = CycleCache::new();
        let (report, spawned) = self.spawn_plan(plan(selected), turn, &turns[..index], &turn_ref, &mut cache);
        let report = self.collect(report, spawned).await;
        cache.clear();
        Ok(report)
    }

    /// Re-run one add-on for a specific turn variant. Batch add-ons re-run with
    /// the group members that produced results for that variant. Ignores the dedup memo.
    #[instrument(skip(self, turn_ref), fields(turn = %turn_ref))]
    pub async fn retry(&self, addon_id: &AddonId, turn_ref: &TurnRef) -> Result<CycleReport, EngineError> {
        let turns = self.host.turns();
        let (index, turn) = locate_variant(&turns, turn_ref)?;
        let configured = self.addons();
        let addon = configured
            .iter()
            .find(|a| &a.id == addon_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownAddon(addon_id.clone()))?;

        let mut selected = vec![addon.clone()];
        if addon.request_mode == RequestMode::Batch {
            let ran: Vec<AddonId> = self
                .units
                .repo
                .list_for_turn(&turn.id, turn.current_variant_index)?
                .into_iter()
                .map(|r| r.addon_id)
                .collect();
            selected.extend(
                configured
                    .iter()
                    .filter(|a| {
                        a.id != addon.id
                            && a.enabled
                            && a.request_mode == RequestMode::Batch
                            && a.provider == addon.provider
                            && a.model == addon.model
                            && ran.contains(&a.id)
                    })
                    .cloned(),
            );
        }

        let turn_ref = TurnRef::of(&turn, index);
        let mut cache = CycleCache::new();
        let (report, spawned) = self.spawn_plan(plan(selected), &turn, &turns[..index], &turn_ref, &mut cache);
        let report = self.collect(report, spawned).await;
        cache.clear();
        Ok(report)
    }

    /// Replace a stored result with user-edited content. The result is marked edited.
    pub fn edit_result(&self, turn_ref: &TurnRef, addon_id: &AddonId, content: &str) -> Result<StoredResult, EngineError> {
        let repo = &self.units.repo;
        let existing = repo.get(&turn_ref.turn_id, turn_ref.variant_index, addon_id)?;
        let meta = match (self.addons.read().iter().find(|a| &a.id == addon_id), &existing) {
            (Some(addon), _) => ResultMeta::for_addon(addon),
            (None, Some(stored)) => ResultMeta {
                addon_name: stored.addon_name.clone(),
                format_style: stored.format_style,
                response_location: stored.response_location,
            },
            (None, None) => {
                return Err(EngineError::ResultNotFound {
                    addon_id: addon_id.clone(),
                    turn_id: turn_ref.turn_id.clone(),
                    variant_index: turn_ref.variant_index,
                })
            }
        };

        let content = sanitize(content);
        let updated = repo.update(&turn_ref.turn_id, turn_ref.variant_index, addon_id, &content, &meta)?;
        self.units.persist.schedule();
        self.units.show(updated.clone());
        self.units.emit(SidecarEvent::UnitSucceeded {
            addon_id: addon_id.clone(),
            turn: turn_ref.clone(),
            content,
            location: meta.response_location,
        });
        info!(addon_id = %addon_id, turn = %turn_ref, "result edited");
        Ok(updated)
    }

    /// Remove a stored result. Returns whether one existed.
    pub fn delete_result(&self, turn_ref: &TurnRef, addon_id: &AddonId) -> Result<bool, EngineError> {
        let removed = self
            .units
            .repo
            .delete(&turn_ref.turn_id, turn_ref.variant_index, addon_id)?;
        if removed {
            self.units
                .view
                .lock()
                .forget(&turn_ref.turn_id, turn_ref.variant_index, addon_id);
            self.units.persist.schedule();
            info!(addon_id = %addon_id, turn = %turn_ref, "result deleted");
        }
        Ok(removed)
    }

    /// Re-expose results after the user switched a turn's active variant.
    pub fn on_variant_switched(&self, payload: &HostPayload) -> Result<RestoreOutcome, EngineError> {
        let turns = self.host.turns();
        let turn = resolve(payload, &turns).turn.ok_or(EngineError::Unresolved)?;
        let outcome = self.units.view.lock().restore_turn(&self.units.repo, &turn)?;
        Ok(outcome)
    }

    /// Reset per-chat dispatch state and restore results for every AI turn.
    /// Calling it again for the same chat changes nothing.
    pub fn on_chat_loaded(&self) -> Result<RestoreOutcome, EngineError> {
        {
            let mut state = self.state.lock();
            state.pending.clear();
            state.last_dispatched = None;
        }
        let turns = self.host.turns();
        let mut view = self.units.view.lock();
        let mut outcome = RestoreOutcome {
            hidden: view.retain(|id| turns.iter().any(|t| &t.id == id)),
            ..Default::default()
        };
        for turn in turns.iter().filter(|t| !t.is_user_turn()) {
            outcome.merge(view.restore_turn(&self.units.repo, turn)?);
        }
        info!(
            turns = turns.len(),
            shown = outcome.shown.len(),
            hidden = outcome.hidden.len(),
            "chat restored"
        );
        Ok(outcome)
    }

    /// Add matching trigger add-ons to the pending queue. Returns the matches.
    fn queue_triggers(&self, candidates: &[Addon], text: &str) -> Vec<AddonId> {
        let matched: Vec<AddonId> = candidates
            .iter()
            .filter(|a| matches(text, a.trigger_config.as_ref()))
            .map(|a| a.id.clone())
            .collect();
        if !matched.is_empty() {
            let mut state = self.state.lock();
            state.pending.extend(matched.iter().cloned());
            debug!(matched = matched.len(), pending = state.pending.len(), "trigger add-ons queued");
        }
        matched
    }

    /// Render prompts and spawn one task per unit. Nothing is awaited here.
    fn spawn_plan(
        &self,
        execution: ExecutionPlan,
        turn: &Turn,
        history: &[Turn],
        turn_ref: &TurnRef,
        cache: &mut CycleCache,
    ) -> (CycleReport, Vec<SpawnedUnit>) {
        let mut report = CycleReport::new(turn_ref.clone());
        let mut spawned = Vec::with_capacity(execution.unit_count());

        for (addon, err) in execution.rejected {
            report.record(self.units.fail(&addon.id, turn_ref, err.to_string(), "configuration"));
        }

        for addon in execution.standalone {
            let prompt = self.assembler.render(&addon, history, turn, cache);
            let addon_ids = vec![addon.id.clone()];
            let ctx = self.units.clone();
            let unit_turn = turn_ref.clone();
            spawned.push(SpawnedUnit {
                addon_ids,
                handle: tokio::spawn(ctx.run_standalone(addon, prompt, unit_turn)),
            });
        }

        for group in execution.batches {
            if let Err(err) = group.validate() {
                for addon in &group.addons {
                    report.record(self.units.fail(&addon.id, turn_ref, err.to_string(), "configuration"));
                }
                continue;
            }
            let prompts = group
                .addons
                .iter()
                .map(|addon| self.assembler.render(addon, history, turn, cache))
                .collect();
            let addon_ids = group.addons.iter().map(|a| a.id.clone()).collect();
            let ctx = self.units.clone();
            let unit_turn = turn_ref.clone();
            spawned.push(SpawnedUnit {
                addon_ids,
                handle: tokio::spawn(ctx.run_batch(group, prompts, unit_turn)),
            });
        }

        debug!(units = spawned.len(), turn = %turn_ref, "execution units scheduled");
        (report, spawned)
    }

    /// Fan in. A crashed task fails its own add-ons only.
    async fn collect(&self, mut report: CycleReport, spawned: Vec<SpawnedUnit>) -> CycleReport {
        let (ids, handles): (Vec<_>, Vec<_>) = spawned.into_iter().map(|u| (u.addon_ids, u.handle)).unzip();
        let joined = futures::future::join_all(handles).await;
        for (addon_ids, result) in ids.into_iter().zip(joined) {
            match result {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        report.record(outcome);
                    }
                }
                Err(join_err) => {
                    error!(error = %join_err, "execution unit task failed");
                    for addon_id in addon_ids {
                        let outcome =
                            self.units
                                .fail(&addon_id, &report.turn, "execution unit crashed".into(), "internal");
                        report.record(outcome);
                    }
                }
            }
        }
        report
    }
}

/// Most recent turn that is not a user turn.
fn latest_ai_turn(turns: &[Turn]) -> Option<(usize, &Turn)> {
    turns.iter().enumerate().rev().find(|(_, t)| !t.is_user_turn())
}

/// Find the referenced turn (by id, then by index) with the referenced variant made active.
fn locate_variant(turns: &[Turn], turn_ref: &TurnRef) -> Result<(usize, Turn), EngineError> {
    let index = turns
        .iter()
        .position(|t| t.id == turn_ref.turn_id)
        .ok_or_else(|| EngineError::TurnNotFound(turn_ref.turn_id.clone()))?;
    let mut turn = turns[index].clone();
    if turn_ref.variant_index >= turn.variants.len().max(1) {
        return Err(EngineError::VariantOutOfRange {
            turn_id: turn.id,
            variant_index: turn_ref.variant_index,
        });
    }
    turn.current_variant_index = turn_ref.variant_index;
    Ok((index, turn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use sidecar_core::{InvokeError, PersistError, Transcript, TriggerType};
    use sidecar_llm::{MockInvoker, MockResponse};
    use sidecar_store::Database;

    #[derive(Default)]
    struct CountingPersister {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Persister for CountingPersister {
        async fn persist(&self) -> Result<(), PersistError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        transcript: Arc<Transcript>,
        mock: Arc<MockInvoker>,
        persister: Arc<CountingPersister>,
    }

    fn harness(addons: Vec<Addon>, mock: MockInvoker, turns: Vec<Turn>) -> Harness {
        let transcript = Arc::new(Transcript::new(turns));
        let mock = Arc::new(mock);
        let persister = Arc::new(CountingPersister::default());
        let repo = ResultRepo::new(Database::in_memory().unwrap());
        let config = DispatcherConfig {
            persist_debounce: Duration::from_secs(60),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(
            transcript.clone(),
            mock.clone(),
            persister.clone(),
            repo,
            addons,
            config,
        );
        Harness {
            dispatcher: Arc::new(dispatcher),
            transcript,
            mock,
            persister,
        }
    }

    fn chat() -> Vec<Turn> {
        vec![Turn::user("hi there"), Turn::assistant("hello")]
    }

    fn ids(list: &[AddonId]) -> Vec<&str> {
        list.iter().map(AddonId::as_str).collect()
    }

    fn report(outcome: DispatchOutcome) -> CycleReport {
        match outcome {
            DispatchOutcome::Dispatched(report) => report,
            other => panic!("expected a dispatched cycle, got {other:?}"),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SidecarEvent>) -> Vec<SidecarEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn auto_addons_run_and_results_are_sanitized() {
        let h = harness(
            vec![Addon::new("a", "A"), Addon::new("b", "B")],
            MockInvoker::new()
                .respond("a", MockResponse::text("calm"))
                .respond("b", MockResponse::text("<script>x</script>sunny")),
            chat(),
        );
        let report = report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        assert_eq!(ids(&report.succeeded), vec!["a", "b"]);
        assert!(report.is_clean());

        let turn = h.transcript.get(1).unwrap();
        let b = h.dispatcher.repo().get(&turn.id, 0, &AddonId::from("b")).unwrap().unwrap();
        assert_eq!(b.content, "sunny");
        assert!(!b.edited);
        assert_eq!(h.dispatcher.visible(&turn.id).len(), 2);
        assert_eq!(h.dispatcher.phase(), DispatchPhase::Idle);
    }

    #[tokio::test]
    async fn same_turn_variant_is_dispatched_once() {
        let h = harness(
            vec![Addon::new("a", "A")],
            MockInvoker::new().respond("a", MockResponse::text("calm")),
            chat(),
        );
        report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        let second = h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap();
        assert!(matches!(second, DispatchOutcome::Duplicate { .. }));
        assert_eq!(h.mock.call_count(), 1);
    }

    #[tokio::test]
    async fn regenerated_variant_is_dispatched_and_isolated() {
        let h = harness(
            vec![Addon::new("a", "A")],
            MockInvoker::new()
                .respond("a", MockResponse::text("for v0"))
                .respond("a", MockResponse::text("for v1")),
            chat(),
        );
        report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        h.transcript.regenerate(1, "hello again");
        let second = report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        assert_eq!(second.turn.variant_index, 1);
        assert_eq!(h.mock.call_count(), 2);

        let turn = h.transcript.get(1).unwrap();
        let visible = h.dispatcher.visible(&turn.id);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].content, "for v1");
        assert_eq!(visible[0].variant_index, 1);
        // The v0 result is still stored under its own key.
        let v0 = h.dispatcher.repo().get(&turn.id, 0, &AddonId::from("a")).unwrap().unwrap();
        assert_eq!(v0.content, "for v0");
    }

    #[tokio::test]
    async fn failing_unit_leaves_siblings_intact() {
        let h = harness(
            vec![Addon::new("a", "A"), Addon::new("b", "B"), Addon::new("c", "C")],
            MockInvoker::new()
                .respond("a", MockResponse::text("one"))
                .respond("b", MockResponse::Error(InvokeError::ServerError { status: 503, body: "down".into() }))
                .respond("c", MockResponse::text("three")),
            chat(),
        );
        let mut rx = h.dispatcher.subscribe();
        let report = report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        assert_eq!(ids(&report.succeeded), vec!["a", "c"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].addon_id.as_str(), "b");
        assert_eq!(report.failed[0].kind, "server_error");

        let turn = h.transcript.get(1).unwrap();
        let repo = h.dispatcher.repo();
        assert!(repo.get(&turn.id, 0, &AddonId::from("a")).unwrap().is_some());
        assert!(repo.get(&turn.id, 0, &AddonId::from("b")).unwrap().is_none());
        assert!(repo.get(&turn.id, 0, &AddonId::from("c")).unwrap().is_some());

        let events = drain(&mut rx);
        let started = events.iter().filter(|e| e.event_type() == "unit_started").count();
        assert_eq!(started, 3);
        let failed: Vec<_> = events.iter().filter(|e| e.event_type() == "unit_failed").collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].addon_id().as_str(), "b");
    }

    #[tokio::test]
    async fn batch_group_makes_one_call_and_splits() {
        let h = harness(
            vec![
                Addon::new("a", "A").batched("openai", "gpt-4"),
                Addon::new("b", "B").batched("openai", "gpt-4"),
                Addon::new("c", "C").standalone("openai", "gpt-4"),
            ],
            MockInvoker::new()
                .respond("a", MockResponse::text("calm\n<<<SIDECAR_SPLIT>>>\nsunny"))
                .respond("c", MockResponse::text("solo")),
            chat(),
        );
        let report = report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        assert_eq!(report.succeeded.len(), 3);

        let calls = h.mock.calls();
        assert_eq!(calls.len(), 2);
        let batch_call = calls.iter().find(|c| c.batch).unwrap();
        assert_eq!(ids(&batch_call.addon_ids), vec!["a", "b"]);
        assert!(batch_call.prompt.contains("<<<SIDECAR_SPLIT>>>"));

        let turn = h.transcript.get(1).unwrap();
        let get = |id: &str| h.dispatcher.repo().get(&turn.id, 0, &AddonId::from(id)).unwrap().unwrap().content;
        assert_eq!(get("a"), "calm");
        assert_eq!(get("b"), "sunny");
        assert_eq!(get("c"), "solo");
    }

    #[tokio::test]
    async fn unsplittable_batch_reply_goes_to_first_member() {
        let h = harness(
            vec![
                Addon::new("a", "A").batched("openai", "gpt-4"),
                Addon::new("b", "B").batched("openai", "gpt-4"),
            ],
            MockInvoker::new().respond("a", MockResponse::text("one blob of text")),
            chat(),
        );
        let report = report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        assert_eq!(ids(&report.succeeded), vec!["a"]);
        assert_eq!(report.failed[0].addon_id.as_str(), "b");
        assert_eq!(report.failed[0].kind, "empty_response");
    }

    #[tokio::test]
    async fn misconfigured_batch_addon_is_rejected_without_a_call() {
        let h = harness(
            vec![Addon::new("x", "X").batched("openai", "")],
            MockInvoker::new(),
            chat(),
        );
        let report = report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        assert_eq!(report.failed[0].kind, "configuration");
        assert_eq!(h.mock.call_count(), 0);
    }

    #[tokio::test]
    async fn trigger_match_applies_to_exactly_one_ai_turn() {
        let h = harness(
            vec![
                Addon::new("a", "A"),
                Addon::new("t", "Weather").with_trigger(TriggerType::Keyword, &["rain"]),
            ],
            MockInvoker::new()
                .respond("a", MockResponse::text("ok"))
                .respond("t", MockResponse::text("umbrella")),
            vec![Turn::user("Will it RAIN today?")],
        );
        let queued = h.dispatcher.handle_host_event(&HostPayload::Index(0)).await.unwrap();
        match queued {
            DispatchOutcome::TriggersQueued { matched, .. } => assert_eq!(ids(&matched), vec!["t"]),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.mock.call_count(), 0);

        h.transcript.push(Turn::assistant("maybe"));
        let first = report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        assert_eq!(ids(&first.succeeded), vec!["a", "t"]);
        assert!(h.dispatcher.pending_triggers().is_empty());

        h.transcript.push(Turn::user("thanks"));
        h.dispatcher.handle_host_event(&HostPayload::Index(2)).await.unwrap();
        h.transcript.push(Turn::assistant("you're welcome"));
        let second = report(h.dispatcher.handle_host_event(&HostPayload::Index(3)).await.unwrap());
        assert_eq!(ids(&second.succeeded), vec!["a"]);
    }

    #[tokio::test]
    async fn missed_user_event_is_recovered_from_preceding_turn() {
        let h = harness(
            vec![Addon::new("t", "Weather").with_trigger(TriggerType::Regex, &[r"(?i)\brain\b"])],
            MockInvoker::new().respond("t", MockResponse::text("umbrella")),
            vec![Turn::user("rain later?"), Turn::assistant("probably")],
        );
        let report = report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        assert_eq!(ids(&report.succeeded), vec!["t"]);
    }

    #[tokio::test]
    async fn queued_trigger_for_disabled_addon_is_dropped() {
        let weather = Addon::new("t", "Weather").with_trigger(TriggerType::Keyword, &["rain"]);
        let h = harness(
            vec![weather.clone()],
            MockInvoker::new().respond("t", MockResponse::text("umbrella")),
            vec![Turn::user("rain?")],
        );
        h.dispatcher.handle_host_event(&HostPayload::Index(0)).await.unwrap();
        assert_eq!(ids(&h.dispatcher.pending_triggers()), vec!["t"]);

        h.dispatcher.replace_addons(vec![weather.disabled()]);
        h.transcript.push(Turn::assistant("maybe"));
        let outcome = h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::NothingToRun { .. }));
        assert!(h.dispatcher.pending_triggers().is_empty());
        assert_eq!(h.mock.call_count(), 0);
    }

    #[tokio::test]
    async fn unresolved_event_falls_back_to_latest_ai_turn() {
        let h = harness(
            vec![Addon::new("a", "A")],
            MockInvoker::new().respond("a", MockResponse::text("ok")),
            vec![Turn::user("q"), Turn::assistant("a"), Turn::user("follow-up")],
        );
        let report = report(h.dispatcher.handle_host_event(&HostPayload::Empty).await.unwrap());
        assert_eq!(report.turn.turn_index, 1);
    }

    #[tokio::test]
    async fn no_ai_turn_means_unresolved() {
        let h = harness(vec![Addon::new("a", "A")], MockInvoker::new(), vec![Turn::user("q")]);
        let outcome = h.dispatcher.handle_host_event(&HostPayload::Index(7)).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Unresolved);
    }

    #[tokio::test(start_paused = true)]
    async fn event_during_active_cycle_is_dropped() {
        let h = harness(
            vec![Addon::new("a", "A")],
            MockInvoker::new().respond(
                "a",
                MockResponse::delayed(Duration::from_millis(50), MockResponse::text("slow")),
            ),
            chat(),
        );
        let dispatcher = h.dispatcher.clone();
        let first = tokio::spawn(async move { dispatcher.handle_host_event(&HostPayload::Index(1)).await });
        while h.dispatcher.phase() != DispatchPhase::Executing {
            tokio::task::yield_now().await;
        }

        let dropped = h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap();
        assert_eq!(dropped, DispatchOutcome::Busy);

        let first = report(first.await.unwrap().unwrap());
        assert_eq!(ids(&first.succeeded), vec!["a"]);
        assert_eq!(h.mock.call_count(), 1);
        assert_eq!(h.dispatcher.phase(), DispatchPhase::Idle);
    }

    #[tokio::test]
    async fn retry_reruns_failed_unit_despite_dedup() {
        let h = harness(
            vec![Addon::new("a", "A"), Addon::new("b", "B")],
            MockInvoker::new()
                .respond("a", MockResponse::text("one"))
                .respond("b", MockResponse::Error(InvokeError::Timeout(Duration::from_secs(30))))
                .respond("b", MockResponse::text("two")),
            chat(),
        );
        let first = report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        assert_eq!(first.failed[0].kind, "timeout");

        let retried = h.dispatcher.retry(&AddonId::from("b"), &first.turn).await.unwrap();
        assert_eq!(ids(&retried.succeeded), vec!["b"]);
        assert_eq!(h.mock.call_count(), 3);
        assert_eq!(h.dispatcher.visible(&first.turn.turn_id).len(), 2);
    }

    #[tokio::test]
    async fn retrying_a_batch_member_reruns_its_group() {
        let h = harness(
            vec![
                Addon::new("a", "A").batched("openai", "gpt-4"),
                Addon::new("b", "B").batched("openai", "gpt-4"),
            ],
            MockInvoker::new()
                .respond("a", MockResponse::text("x<<<SIDECAR_SPLIT>>>y"))
                .respond("b", MockResponse::text("y2<<<SIDECAR_SPLIT>>>x2")),
            chat(),
        );
        let first = report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        let retried = h.dispatcher.retry(&AddonId::from("b"), &first.turn).await.unwrap();
        assert_eq!(retried.succeeded.len(), 2);
        let a = h.dispatcher.repo().get(&first.turn.turn_id, 0, &AddonId::from("a")).unwrap().unwrap();
        assert_eq!(a.content, "x2");

        let last = h.mock.calls().pop().unwrap();
        assert!(last.batch);
        assert_eq!(ids(&last.addon_ids), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn retry_of_unknown_turn_or_variant_fails() {
        let h = harness(vec![Addon::new("a", "A")], MockInvoker::new(), chat());
        let turn = h.transcript.get(1).unwrap();
        let bad_variant = TurnRef {
            turn_id: turn.id.clone(),
            turn_index: 1,
            variant_index: 4,
        };
        let err = h.dispatcher.retry(&AddonId::from("a"), &bad_variant).await.unwrap_err();
        assert!(matches!(err, EngineError::VariantOutOfRange { .. }));

        let missing = TurnRef {
            turn_id: TurnId::from_raw("gone"),
            turn_index: 0,
            variant_index: 0,
        };
        let err = h.dispatcher.retry(&AddonId::from("a"), &missing).await.unwrap_err();
        assert!(matches!(err, EngineError::TurnNotFound(_)));
    }

    #[tokio::test]
    async fn manual_addons_only_run_on_request() {
        let h = harness(
            vec![
                Addon::new("m", "Summary").with_mode(TriggerMode::Manual),
                Addon::new("a", "A"),
            ],
            MockInvoker::new()
                .respond("m", MockResponse::text("summary"))
                .respond("a", MockResponse::text("auto")),
            chat(),
        );
        let cycle = report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        assert_eq!(ids(&cycle.succeeded), vec!["a"]);

        let manual = h.dispatcher.run_manual(None).await.unwrap();
        assert_eq!(ids(&manual.succeeded), vec!["m"]);
        assert_eq!(manual.turn.turn_index, 1);

        let explicit = h.dispatcher.run_manual(Some(vec![AddonId::from("a")])).await.unwrap();
        assert_eq!(ids(&explicit.succeeded), vec!["a"]);

        let err = h.dispatcher.run_manual(Some(vec![AddonId::from("ghost")])).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownAddon(_)));
    }

    #[tokio::test]
    async fn run_manual_without_ai_turn_fails() {
        let h = harness(vec![], MockInvoker::new(), vec![Turn::user("q")]);
        assert!(matches!(h.dispatcher.run_manual(None).await, Err(EngineError::NoTurn)));
    }

    #[tokio::test]
    async fn edit_marks_result_edited_and_delete_hides_it() {
        let h = harness(
            vec![Addon::new("a", "A")],
            MockInvoker::new().respond("a", MockResponse::text("calm")),
            chat(),
        );
        let cycle = report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        let addon = AddonId::from("a");

        let edited = h
            .dispatcher
            .edit_result(&cycle.turn, &addon, "<b>very</b> calm<iframe src=x></iframe>")
            .unwrap();
        assert!(edited.edited);
        assert_eq!(edited.content, "<b>very</b> calm");
        assert_eq!(h.dispatcher.visible(&cycle.turn.turn_id)[0].content, "<b>very</b> calm");

        assert!(h.dispatcher.delete_result(&cycle.turn, &addon).unwrap());
        assert!(!h.dispatcher.delete_result(&cycle.turn, &addon).unwrap());
        assert!(h.dispatcher.visible(&cycle.turn.turn_id).is_empty());
        assert!(h.dispatcher.repo().get(&cycle.turn.turn_id, 0, &addon).unwrap().is_none());
    }

    #[tokio::test]
    async fn deleting_inactive_variant_keeps_active_result_visible() {
        let h = harness(
            vec![Addon::new("a", "A")],
            MockInvoker::new()
                .respond("a", MockResponse::text("for v0"))
                .respond("a", MockResponse::text("for v1")),
            chat(),
        );
        let first = report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        h.transcript.regenerate(1, "hello again");
        report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        let addon = AddonId::from("a");
        assert_eq!(first.turn.variant_index, 0);

        assert!(h.dispatcher.delete_result(&first.turn, &addon).unwrap());
        let visible = h.dispatcher.visible(&first.turn.turn_id);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].content, "for v1");
        assert!(h.dispatcher.repo().get(&first.turn.turn_id, 0, &addon).unwrap().is_none());
    }

    #[tokio::test]
    async fn editing_unknown_result_of_unknown_addon_fails() {
        let h = harness(vec![], MockInvoker::new(), chat());
        let turn = TurnRef::of(&h.transcript.get(1).unwrap(), 1);
        let err = h.dispatcher.edit_result(&turn, &AddonId::from("ghost"), "x").unwrap_err();
        assert!(matches!(err, EngineError::ResultNotFound { .. }));
    }

    #[tokio::test]
    async fn variant_switch_restores_only_active_variant() {
        let h = harness(
            vec![Addon::new("a", "A")],
            MockInvoker::new().respond("a", MockResponse::text("for v0")),
            chat(),
        );
        let cycle = report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        let turn_id = cycle.turn.turn_id.clone();

        h.transcript.regenerate(1, "new reply");
        let switched = h.dispatcher.on_variant_switched(&HostPayload::Index(1)).unwrap();
        assert_eq!(switched.hidden.len(), 1);
        assert!(h.dispatcher.visible(&turn_id).is_empty());

        h.transcript.swipe(1, 0);
        let back = h.dispatcher.on_variant_switched(&HostPayload::Index(1)).unwrap();
        assert_eq!(back.shown.len(), 1);
        assert_eq!(h.dispatcher.visible(&turn_id)[0].content, "for v0");

        let again = h.dispatcher.on_variant_switched(&HostPayload::Index(1)).unwrap();
        assert!(again.is_noop());
    }

    #[tokio::test]
    async fn chat_load_is_idempotent_and_resets_dispatch_state() {
        let h = harness(
            vec![Addon::new("a", "A")],
            MockInvoker::new().respond("a", MockResponse::text("calm")),
            chat(),
        );
        report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());

        let first = h.dispatcher.on_chat_loaded().unwrap();
        assert!(first.is_noop());
        assert_eq!(first.unchanged, 1);
        let second = h.dispatcher.on_chat_loaded().unwrap();
        assert_eq!(first, second);

        // The memo was reset, so the same variant dispatches again.
        let outcome = h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Dispatched(_)));
    }

    #[tokio::test]
    async fn writes_are_persisted_through_the_debouncer() {
        let h = harness(
            vec![Addon::new("a", "A"), Addon::new("b", "B")],
            MockInvoker::new()
                .respond("a", MockResponse::text("one"))
                .respond("b", MockResponse::text("two")),
            chat(),
        );
        report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        h.dispatcher.flush_persistence().await;
        assert_eq!(h.persister.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_model_reply_is_a_unit_failure() {
        let h = harness(
            vec![Addon::new("a", "A")],
            MockInvoker::new().respond("a", MockResponse::text("  \n ")),
            chat(),
        );
        let report = report(h.dispatcher.handle_host_event(&HostPayload::Index(1)).await.unwrap());
        assert_eq!(report.failed[0].kind, "empty_response");
        assert_eq!(h.dispatcher.repo().count().unwrap(), 0);
    }
}
