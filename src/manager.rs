//! The destination-choice model manager.
//!
//! Worker threads check pooled [`LocationChoiceModel`]s out of the manager, use them for a batch of
//! decision makers and check them back in. The manager owns the SOA probability cache and makes
//! sure that the tables for a domain are recomputed exactly once when a checkout presents a newer
//! outer iteration, before any model for that iteration is handed out.
//!
//! Every operation runs under one lock, so the manager behaves as a monitor. The recorded
//! iteration of each domain is mirrored in an atomic, which allows a cheap check of whether the
//! tables are current without taking the lock; any decision to recompute is always re-made once
//! the lock is held.
use crate::model::{DestinationUtility, LocationChoiceModel, Logsum};
use crate::parameters::ModelParameters;
use crate::pool::ObjectPool;
use crate::segment::{Domain, TaskKind};
use crate::size::{SizeTermProvider, SizeTerms};
use crate::soa::{DistanceUtility, DomainTables, SoaProbabilityCache};
use crate::zone::{DistanceSkims, ZoneData};
use anyhow::{Context, Result, ensure};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use strum::IntoEnumIterator;

/// Value of a domain's atomic iteration when it has no resident tables
const NOT_RESIDENT: u64 = u64::MAX;

/// The external collaborators injected into the manager at setup
#[derive(Clone)]
pub struct Collaborators {
    /// Zone geography
    pub zones: Arc<dyn ZoneData>,
    /// Computes distance utilities between macro-zones
    pub distance_utility: Arc<dyn DistanceUtility>,
    /// Mode-choice logsums, used by model instances
    pub logsum: Arc<dyn Logsum>,
    /// Destination utilities, used by model instances
    pub utility: Arc<dyn DestinationUtility>,
    /// Source of size-term snapshots
    pub size_terms: Arc<dyn SizeTermProvider>,
    /// Optional distances between macro-zones, shared by all model instances
    pub skims: Option<Arc<DistanceSkims>>,
}

/// Diagnostics for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStats {
    /// The iteration for which the domain's tables were last computed
    pub iteration: u32,
    /// Instances created since setup or the last clear
    pub instances_created: usize,
    /// Instances currently waiting in the pools
    pub instances_pooled: usize,
    /// Units of work completed since the tables were last recomputed
    pub completed_units: u64,
    /// Times the tables have been recomputed since setup or the last clear
    pub recompute_count: usize,
    /// Whether the domain's tables are resident
    pub tables_resident: bool,
}

/// Mutable state for one domain
struct DomainState {
    iteration: u32,
    generation: u64,
    next_index: usize,
    completed_units: u64,
    recompute_count: usize,
    failed: bool,
    pools: HashMap<TaskKind, ObjectPool<LocationChoiceModel>>,
}

impl DomainState {
    fn new(domain: Domain, generation: u64) -> Self {
        Self {
            iteration: 0,
            generation,
            next_index: 0,
            completed_units: 0,
            recompute_count: 0,
            failed: false,
            pools: domain
                .task_kinds()
                .map(|kind| (kind, ObjectPool::new()))
                .collect(),
        }
    }

    fn pool(&mut self, task_kind: TaskKind) -> &mut ObjectPool<LocationChoiceModel> {
        self.pools.entry(task_kind).or_default()
    }

    fn num_pooled(&self) -> usize {
        self.pools.values().map(ObjectPool::len).sum()
    }
}

/// Everything the manager holds between setup and teardown
struct ManagerState {
    parameters: ModelParameters,
    collaborators: Collaborators,
    cache: SoaProbabilityCache,
    work: DomainState,
    school: DomainState,
}

impl ManagerState {
    fn domain(&self, domain: Domain) -> &DomainState {
        match domain {
            Domain::Work => &self.work,
            Domain::School => &self.school,
        }
    }

    fn domain_mut(&mut self, domain: Domain) -> &mut DomainState {
        match domain {
            Domain::Work => &mut self.work,
            Domain::School => &mut self.school,
        }
    }

    /// Recompute the tables for `domain` from `size_terms`
    fn recompute(&mut self, domain: Domain, iteration: u32, size_terms: &SizeTerms) -> Result<()> {
        size_terms.check_zones(self.collaborators.zones.as_ref())?;
        match domain {
            Domain::Work => self.cache.recompute_work_domain(
                size_terms,
                &self.parameters.work_segments,
                iteration,
            ),
            Domain::School => self.cache.recompute_school_domain(
                size_terms,
                &self.parameters.school_segments.by_type(),
                iteration,
            ),
        }
    }
}

/// Hands out pooled destination-choice models to worker threads and keeps their shared
/// probability tables up to date
pub struct DestChoiceModelManager {
    state: Mutex<Option<ManagerState>>,
    recorded: [AtomicU64; 2],
    generations: AtomicU64,
}

impl Default for DestChoiceModelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DestChoiceModelManager {
    /// Create a manager which has not yet been set up
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            recorded: [AtomicU64::new(NOT_RESIDENT), AtomicU64::new(NOT_RESIDENT)],
            generations: AtomicU64::new(0),
        }
    }

    fn recorded(&self, domain: Domain) -> &AtomicU64 {
        match domain {
            Domain::Work => &self.recorded[0],
            Domain::School => &self.recorded[1],
        }
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    /// Prepare the manager for use.
    ///
    /// A second call while already set up does nothing. Otherwise, the iteration of every domain
    /// is reset to 0 and the collaborators are stored for later use. The current size-term
    /// snapshot is checked against the zone system and the configured segments.
    ///
    /// # Arguments
    ///
    /// * `parameters` - Model parameters
    /// * `collaborators` - The external collaborators used by the cache and model instances
    pub fn setup(&self, parameters: ModelParameters, collaborators: Collaborators) -> Result<()> {
        let mut guard = self.state.lock();
        if guard.is_some() {
            debug!("Model manager is already set up");
            return Ok(());
        }

        parameters.validate()?;
        let size_terms = collaborators.size_terms.snapshot();
        size_terms.check_zones(collaborators.zones.as_ref())?;
        for id in parameters
            .work_segments
            .iter()
            .chain(parameters.school_segments.iter())
        {
            size_terms
                .segment_map()
                .index_of(&id.0)
                .with_context(|| format!("No size terms for segment {id}"))?;
        }

        let cache = SoaProbabilityCache::new(
            Arc::clone(&collaborators.zones),
            Arc::clone(&collaborators.distance_utility),
        );
        *guard = Some(ManagerState {
            parameters,
            collaborators,
            cache,
            work: DomainState::new(Domain::Work, self.next_generation()),
            school: DomainState::new(Domain::School, self.next_generation()),
        });
        for domain in Domain::iter() {
            self.recorded(domain).store(NOT_RESIDENT, Ordering::Release);
        }
        info!("Destination-choice model manager set up");

        Ok(())
    }

    /// The current size-term snapshot from the size-term provider
    pub fn size_terms(&self) -> Result<Arc<SizeTerms>> {
        let guard = self.state.lock();
        let state = guard
            .as_ref()
            .context("Model manager must be set up before size terms can be read")?;

        Ok(state.collaborators.size_terms.snapshot())
    }

    /// Whether the tables for `domain` are resident and valid for `iteration`.
    ///
    /// This does not take the lock, so the answer may already be out of date.
    pub fn is_current(&self, domain: Domain, iteration: u32) -> bool {
        let recorded = self.recorded(domain).load(Ordering::Acquire);
        recorded != NOT_RESIDENT && u64::from(iteration) <= recorded
    }

    /// Check out a model for a task.
    ///
    /// If the domain's tables are missing or `iteration` is newer than the one they were computed
    /// for, they are recomputed first. The oldest pooled model for `task_kind` is reused if there
    /// is one; otherwise a new model is created.
    ///
    /// # Arguments
    ///
    /// * `task_kind` - The kind of task the model is for
    /// * `iteration` - The caller's outer (shadow-pricing) iteration
    /// * `size_terms` - The size terms for `iteration`
    /// * `task_index` - Identifies the caller's batch of work, for logging
    ///
    /// # Returns
    ///
    /// The model, or an error if the manager is not set up, the domain has no segments, the
    /// tables could not be computed or `size_terms` does not fit the tables.
    pub fn checkout(
        &self,
        task_kind: TaskKind,
        iteration: u32,
        size_terms: &Arc<SizeTerms>,
        task_index: usize,
    ) -> Result<LocationChoiceModel> {
        let domain = task_kind.domain();
        if !self.is_current(domain, iteration) {
            debug!("{domain} SOA probabilities may be stale for iteration {iteration}");
        }

        let mut guard = self.state.lock();
        let state = guard
            .as_mut()
            .context("Model manager must be set up before models can be checked out")?;
        if domain == Domain::School {
            ensure!(
                !state.parameters.school_segments.is_empty(),
                "Cannot check out a {task_kind} model: no school segments are configured"
            );
        }
        ensure!(
            !state.domain(domain).failed,
            "Cannot check out a {task_kind} model: {domain} SOA probabilities failed to compute"
        );

        let tables = self.ensure_tables(state, domain, iteration, size_terms)?;
        size_terms
            .check_zones(state.collaborators.zones.as_ref())
            .and_then(|()| tables.check_segment_indices(size_terms))
            .with_context(|| {
                format!(
                    "Cannot check out a {task_kind} model: size terms do not match the {domain} \
                    SOA probabilities"
                )
            })?;
        let sample_size = state.parameters.soa_sample_size;
        let ManagerState {
            collaborators,
            work,
            school,
            ..
        } = state;
        let domain_state = match domain {
            Domain::Work => work,
            Domain::School => school,
        };

        if let Some(mut model) = domain_state.pool(task_kind).acquire() {
            model.rebind(Arc::clone(size_terms), tables);
            info!(
                "Removed {task_kind} model {} from pool for iteration {iteration}, \
                task {task_index}",
                model.index()
            );
            return Ok(model);
        }

        let index = domain_state.next_index;
        domain_state.next_index += 1;
        info!("Created {task_kind} model {index} for iteration {iteration}, task {task_index}");

        Ok(LocationChoiceModel::new(
            task_kind,
            index,
            domain_state.generation,
            sample_size,
            collaborators,
            tables,
            Arc::clone(size_terms),
        ))
    }

    /// Recompute the tables for `domain` if they are missing or older than `iteration`.
    ///
    /// Must be called with the lock held. Returns the tables to hand out.
    fn ensure_tables(
        &self,
        state: &mut ManagerState,
        domain: Domain,
        iteration: u32,
        size_terms: &SizeTerms,
    ) -> Result<Arc<DomainTables>> {
        if let Some(tables) = state.cache.tables(domain)
            && iteration <= state.domain(domain).iteration
        {
            return Ok(Arc::clone(tables));
        }

        if state.parameters.is_past_final_iteration(iteration) {
            warn!(
                "Iteration {iteration} is past the last shadow-pricing iteration ({})",
                state.parameters.max_shadow_price_iterations - 1
            );
        }
        info!("Recomputing {domain} SOA probabilities for iteration {iteration}");
        if let Err(err) = state.recompute(domain, iteration, size_terms) {
            let err = err.context(format!(
                "Failed to recompute {domain} SOA probabilities for iteration {iteration}"
            ));
            error!("{err:?}");
            state.domain_mut(domain).failed = true;
            return Err(err);
        }

        let domain_state = state.domain_mut(domain);
        domain_state.iteration = iteration;
        domain_state.completed_units = 0;
        domain_state.recompute_count += 1;
        self.recorded(domain).store(u64::from(iteration), Ordering::Release);
        info!("Finished computing {domain} SOA probabilities for iteration {iteration}");

        state
            .cache
            .tables(domain)
            .cloned()
            .with_context(|| format!("No {domain} SOA probabilities after recomputing"))
    }

    /// Return a model to its pool.
    ///
    /// `units_completed` is added to the domain's count of completed work. A model created before
    /// its domain was cleared is dropped rather than pooled, and its units are not counted.
    pub fn checkin(&self, model: LocationChoiceModel, units_completed: u64) {
        let task_kind = model.task_kind();
        let domain = task_kind.domain();
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            debug!("Dropping {task_kind} model {}: manager is not set up", model.index());
            return;
        };

        let domain_state = state.domain_mut(domain);
        if model.generation() != domain_state.generation {
            info!(
                "Dropping {task_kind} model {} created before the {domain} domain was cleared",
                model.index()
            );
            return;
        }

        domain_state.completed_units += units_completed;

        info!(
            "Returned {task_kind} model {} to pool after {units_completed} units ({} completed \
            for {domain} this iteration)",
            model.index(),
            domain_state.completed_units
        );
        domain_state.pool(task_kind).release(model);
    }

    /// Release all pooled models and the probability tables for `domain`.
    ///
    /// The next checkout for the domain behaves as the first ever: tables are recomputed and
    /// creation indices start again from zero. Models which are checked out at the time are
    /// dropped when they are checked in.
    pub fn clear_domain(&self, domain: Domain) {
        if let Some(state) = self.state.lock().as_mut() {
            self.clear_domain_locked(state, domain);
        }
    }

    /// Clear `domain` while the lock is held
    fn clear_domain_locked(&self, state: &mut ManagerState, domain: Domain) {
        let generation = self.next_generation();
        let domain_state = state.domain_mut(domain);
        let num_dropped: usize = domain_state
            .pools
            .values_mut()
            .map(|pool| pool.drain_all().len())
            .sum();
        let failed = domain_state.failed;
        *domain_state = DomainState::new(domain, generation);
        domain_state.failed = failed;

        state.cache.release(domain);
        self.recorded(domain).store(NOT_RESIDENT, Ordering::Release);
        info!("Cleared {domain} domain, dropping {num_dropped} pooled models");
    }

    /// Release all pooled models and the probability tables for the work domain
    pub fn clear_work_domain(&self) {
        self.clear_domain(Domain::Work);
    }

    /// Release all pooled models and the probability tables for the school domain
    pub fn clear_school_domain(&self) {
        self.clear_domain(Domain::School);
    }

    /// Clear every domain and release all shared data, including distance skims.
    ///
    /// The manager must be set up again before it can be used.
    pub fn clear_all(&self) {
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            return;
        };

        for domain in Domain::iter() {
            self.clear_domain_locked(state, domain);
        }
        *guard = None;
        info!("Released all destination-choice model data");
    }

    /// Diagnostics for `domain`, or `None` if the manager is not set up
    pub fn stats(&self, domain: Domain) -> Option<ManagerStats> {
        let guard = self.state.lock();
        let state = guard.as_ref()?;
        let domain_state = state.domain(domain);

        Some(ManagerStats {
            iteration: domain_state.iteration,
            instances_created: domain_state.next_index,
            instances_pooled: domain_state.num_pooled(),
            completed_units: domain_state.completed_units,
            recompute_count: domain_state.recompute_count,
            tables_resident: state.cache.tables(domain).is_some(),
        })
    }
}
