use super::{Decision, EvaluationInput, RegulationError, Regulator};
use crate::{
    config::{RegulationConfig, RegulationMode},
    metrics,
    stat::{StatRegistry, WindowCounts},
    types::{EndpointInfo, EndpointKey, RegulationState},
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::broadcast,
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// A consumer whose endpoints are subject to regulation.
#[async_trait]
pub trait RegulatedConsumer: Send + Sync {
    fn consumer_id(&self) -> &str;

    /// Every endpoint currently known to the consumer, across all address groups.
    fn endpoints(&self) -> Vec<Arc<EndpointInfo>>;

    /// Closes the consumer's connection to a newly regulated endpoint.
    async fn release_connection(&self, key: &EndpointKey);
}

/// Bookkeeping for an endpoint outside `Normal`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndpointRegulation {
    pub entered_at: Instant,
    pub current_degrade: Duration,
    /// Failed recoveries since the endpoint was last `Normal`.
    pub strikes: u32,
    /// Samples accumulated while `Recovering`.
    pub probe: WindowCounts,
}

impl EndpointRegulation {
    fn new(entered_at: Instant, current_degrade: Duration) -> Self {
        Self { entered_at, current_degrade, strikes: 0, probe: WindowCounts::default() }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub evaluated: usize,
    pub regulated: usize,
    pub recovering: usize,
    pub escalated: usize,
    pub restored: usize,
    /// Transitions refused by the availability guards.
    pub blocked: usize,
    /// Transitions logged but not applied in observe mode.
    pub observed: usize,
    pub errors: usize,
}

type BookKey = (Arc<str>, EndpointKey);

/// Availability budget of one consumer during a tick.
struct Guard {
    selectable: usize,
    regulated: usize,
}

/// Periodic driver of endpoint regulation across every registered consumer.
pub struct RegulationLoop {
    config: RegulationConfig,
    regulator: Arc<dyn Regulator>,
    stats: Arc<StatRegistry>,
    consumers: DashMap<Arc<str>, Arc<dyn RegulatedConsumer>>,
    book: Mutex<HashMap<BookKey, EndpointRegulation>>,
}

impl RegulationLoop {
    #[must_use]
    pub fn new(
        config: RegulationConfig,
        regulator: Arc<dyn Regulator>,
        stats: Arc<StatRegistry>,
    ) -> Self {
        Self {
            config,
            regulator,
            stats,
            consumers: DashMap::new(),
            book: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegulationConfig {
        &self.config
    }

    pub fn register(&self, consumer: Arc<dyn RegulatedConsumer>) {
        let id: Arc<str> = Arc::from(consumer.consumer_id());
        debug!(consumer = %id, regulator = self.regulator.alias(), "consumer registered for regulation");
        self.consumers.insert(id, consumer);
    }

    /// Stops regulating a consumer and forgets its bookkeeping.
    pub fn unregister(&self, consumer_id: &str) {
        self.consumers.remove(consumer_id);
        self.book.lock().retain(|(owner, _), _| owner.as_ref() != consumer_id);
    }

    /// Bookkeeping for one endpoint of one consumer, if it is outside `Normal`.
    #[must_use]
    pub fn entry(&self, consumer_id: &str, key: &EndpointKey) -> Option<EndpointRegulation> {
        self.book.lock().get(&(Arc::from(consumer_id), key.clone())).copied()
    }

    pub fn start_with_shutdown(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let window = self.config.window();

        tokio::spawn(async move {
            let mut interval = interval(window);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let summary = this.tick().await;
                        if summary.errors > 0 {
                            warn!(errors = summary.errors, "regulation tick finished with errors");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("regulation loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Rotates every stat window and applies the resulting decisions.
    pub async fn tick(&self) -> TickSummary {
        let now = Instant::now();
        let consumers: Vec<_> = self.consumers.iter().map(|e| Arc::clone(e.value())).collect();

        let mut summary = TickSummary::default();
        let mut releases = Vec::new();
        for consumer in consumers {
            for key in self.tick_consumer(consumer.as_ref(), now, &mut summary) {
                releases.push((Arc::clone(&consumer), key));
            }
        }
        for (consumer, key) in releases {
            consumer.release_connection(&key).await;
        }

        debug!(
            evaluated = summary.evaluated,
            regulated = summary.regulated,
            recovering = summary.recovering,
            restored = summary.restored,
            "regulation tick"
        );
        summary
    }

    /// Returns the endpoints whose connections should be released.
    fn tick_consumer(
        &self,
        consumer: &dyn RegulatedConsumer,
        now: Instant,
        summary: &mut TickSummary,
    ) -> Vec<EndpointKey> {
        let id: Arc<str> = Arc::from(consumer.consumer_id());
        let endpoints = consumer.endpoints();
        let selectable = endpoints.iter().filter(|ep| ep.regulation_state().is_selectable()).count();
        let mut guard = Guard { selectable, regulated: endpoints.len() - selectable };
        let mut releases = Vec::new();

        let mut book = self.book.lock();
        let present: HashSet<&EndpointKey> = endpoints.iter().map(|ep| ep.key()).collect();
        book.retain(|(owner, key), _| owner != &id || present.contains(key));

        for endpoint in &endpoints {
            let window = self
                .stats
                .get(&id, endpoint.key())
                .and_then(|stat| stat.rotate())
                .map(|snapshot| snapshot.counts)
                .unwrap_or_default();
            summary.evaluated += 1;

            match self.step(&id, endpoint, window, now, &mut book, &mut guard, summary) {
                Ok(true) if self.config.close_connection_on_regulation => {
                    releases.push(endpoint.key().clone());
                }
                Ok(_) => {}
                Err(e) => {
                    summary.errors += 1;
                    warn!(consumer = %id, endpoint = %endpoint.key(), error = %e, "regulation step failed");
                }
            }
        }
        drop(book);

        metrics::record_regulated_endpoints(&id, guard.regulated);
        releases
    }

    /// Evaluates and applies one endpoint. Returns whether it became regulated.
    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        id: &Arc<str>,
        endpoint: &Arc<EndpointInfo>,
        window: WindowCounts,
        now: Instant,
        book: &mut HashMap<BookKey, EndpointRegulation>,
        guard: &mut Guard,
        summary: &mut TickSummary,
    ) -> Result<bool, RegulationError> {
        let key = (Arc::clone(id), endpoint.key().clone());
        let state = endpoint.regulation_state();

        if state != RegulationState::Normal && !book.contains_key(&key) {
            book.insert(key, EndpointRegulation::new(now, self.config.degrade_duration()));
            return Err(RegulationError::MissingBookkeeping {
                consumer: id.to_string(),
                endpoint: endpoint.key().to_string(),
                state: state.as_str(),
            });
        }
        let entry = match state {
            RegulationState::Normal => None,
            _ => book.get_mut(&key),
        };

        let input = match entry {
            Some(entry) => {
                if state == RegulationState::Recovering {
                    entry.probe.add(window);
                }
                EvaluationInput {
                    state,
                    window,
                    probe: entry.probe,
                    since_transition: now.saturating_duration_since(entry.entered_at),
                    current_degrade: entry.current_degrade,
                }
            }
            None => EvaluationInput {
                state,
                window,
                probe: WindowCounts::default(),
                since_transition: Duration::ZERO,
                current_degrade: self.config.degrade_duration(),
            },
        };

        let decision = self.regulator.evaluate(&input)?;
        if decision == Decision::Keep {
            return Ok(false);
        }

        if self.config.mode == RegulationMode::Observe {
            summary.observed += 1;
            info!(
                consumer = %id,
                endpoint = %endpoint.key(),
                decision = decision.as_str(),
                ratio = input.window.exception_ratio(),
                "regulation decision observed, not applied"
            );
            return Ok(false);
        }

        match decision {
            Decision::Keep => Ok(false),
            Decision::Regulate => {
                if let Err(reason) = self.admit(guard) {
                    summary.blocked += 1;
                    warn!(consumer = %id, endpoint = %endpoint.key(), reason, "regulation blocked");
                    return Ok(false);
                }
                book.insert(key, EndpointRegulation::new(now, self.config.degrade_duration()));
                self.transition(id, endpoint, RegulationState::Regulated, &input);
                summary.regulated += 1;
                Ok(true)
            }
            Decision::Escalate => {
                let blocked = self.admit(guard).err();
                let entry = book.entry(key).or_insert_with(|| {
                    EndpointRegulation::new(now, self.config.degrade_duration())
                });
                entry.entered_at = now;
                entry.probe = WindowCounts::default();
                if let Some(reason) = blocked {
                    summary.blocked += 1;
                    warn!(
                        consumer = %id,
                        endpoint = %endpoint.key(),
                        reason,
                        "escalation blocked, endpoint keeps probing"
                    );
                    return Ok(false);
                }
                entry.strikes += 1;
                entry.current_degrade = self.config.escalated_degrade(entry.strikes);
                let degrade = entry.current_degrade;
                self.transition(id, endpoint, RegulationState::Regulated, &input);
                info!(consumer = %id, endpoint = %endpoint.key(), ?degrade, "recovery failed, degrade escalated");
                summary.escalated += 1;
                Ok(true)
            }
            Decision::BeginRecovery => {
                if let Some(entry) = book.get_mut(&key) {
                    entry.entered_at = now;
                    entry.probe = WindowCounts::default();
                }
                guard.regulated = guard.regulated.saturating_sub(1);
                guard.selectable += 1;
                self.transition(id, endpoint, RegulationState::Recovering, &input);
                summary.recovering += 1;
                Ok(false)
            }
            Decision::Restore => {
                book.remove(&key);
                self.transition(id, endpoint, RegulationState::Normal, &input);
                summary.restored += 1;
                Ok(false)
            }
        }
    }

    /// Reserves room for one more regulated endpoint.
    fn admit(&self, guard: &mut Guard) -> Result<(), &'static str> {
        if guard.selectable <= 1 && !self.config.allow_regulate_all {
            return Err("last selectable endpoint");
        }
        if self.config.max_regulated_count.is_some_and(|max| guard.regulated >= max) {
            return Err("regulated endpoint cap reached");
        }
        guard.selectable = guard.selectable.saturating_sub(1);
        guard.regulated += 1;
        Ok(())
    }

    fn transition(
        &self,
        id: &str,
        endpoint: &EndpointInfo,
        to: RegulationState,
        input: &EvaluationInput,
    ) {
        let from = endpoint.regulation_state();
        endpoint.set_regulation_state(to);
        metrics::record_regulation_transition(from, to);
        info!(
            consumer = id,
            endpoint = %endpoint.key(),
            from = from.as_str(),
            to = to.as_str(),
            invocations = input.window.invocations,
            exceptions = input.window.exceptions,
            probe_invocations = input.probe.invocations,
            "regulation state changed"
        );
    }
}
