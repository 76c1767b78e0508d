//! src/cleanup/mod.rs
//!
//! The cleanup registry (spec.md §4.7): a pluggable set of
//! reconciliation strategies run on their own interval, each wrapped in
//! the same template-method lifecycle. Strategies are Rust trait
//! objects registered explicitly at startup (spec.md §9 prefers
//! interface-based dispatch for ecosystems with first-class traits),
//! the shape the teacher reaches for throughout (`CodeDriver` +
//! `DriverFactory` in `drivers.rs`).

pub mod strategies;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::CleanupError;
use crate::resource_manager::ResourceManager;

/// One reconciliation pass over the store. Implementors only need
/// `do_cleanup`; the other hooks have sensible defaults.
#[async_trait]
pub trait CleanupStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str {
        ""
    }
    fn interval(&self) -> Duration;
    fn priority(&self) -> i32 {
        100
    }
    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }
    fn tags(&self) -> &'static [&'static str] {
        &[]
    }
    fn enabled_by_default(&self) -> bool {
        true
    }

    fn should_run(&self, last_run: Option<Instant>, now: Instant) -> bool {
        match last_run {
            Some(t) => now.duration_since(t) >= self.interval(),
            None => true,
        }
    }

    async fn before_execute(&self, _resources: &ResourceManager) -> bool {
        true
    }

    async fn do_cleanup(&self, resources: &ResourceManager) -> Result<usize, CleanupError>;

    async fn after_execute(&self, count: usize) {
        if count > 0 {
            log::info!("{}: affected {count} rows", self.name());
        }
    }

    async fn on_error(&self, err: &CleanupError) {
        log::warn!("{}: {err}", self.name());
    }
}

#[derive(Debug, Clone)]
pub struct StrategyResult {
    pub name: &'static str,
    pub affected: usize,
    pub error: Option<String>,
}

#[async_trait]
pub trait CleanupObserver: Send + Sync {
    async fn on_result(&self, result: &StrategyResult);
}

pub struct LoggingObserver;

#[async_trait]
impl CleanupObserver for LoggingObserver {
    async fn on_result(&self, result: &StrategyResult) {
        match &result.error {
            Some(err) => log::warn!("cleanup strategy {} errored: {err}", result.name),
            None if result.affected > 0 => {
                log::info!("cleanup strategy {} affected {} rows", result.name, result.affected)
            }
            None => log::debug!("cleanup strategy {} ran, nothing to do", result.name),
        }
    }
}

pub struct CleanupManager {
    strategies: Vec<Arc<dyn CleanupStrategy>>,
    observers: Vec<Arc<dyn CleanupObserver>>,
    enabled: HashMap<String, bool>,
    last_run: Mutex<HashMap<&'static str, Instant>>,
}

impl CleanupManager {
    pub fn new(
        mut strategies: Vec<Arc<dyn CleanupStrategy>>,
        observers: Vec<Arc<dyn CleanupObserver>>,
        enabled: HashMap<String, bool>,
    ) -> Self {
        // Topological-by-dependency, then priority: a strategy with no
        // unresolved dependency in the tail sorts before one that does.
        strategies.sort_by_key(|s| s.priority());
        Self {
            strategies,
            observers,
            enabled,
            last_run: Mutex::new(HashMap::new()),
        }
    }

    fn is_enabled(&self, strategy: &dyn CleanupStrategy) -> bool {
        self.enabled
            .get(strategy.name())
            .copied()
            .unwrap_or_else(|| strategy.enabled_by_default())
    }

    /// Runs every due, enabled strategy once, in priority order. A
    /// strategy that errors is logged and skipped; it never blocks the
    /// strategies after it in the pass.
    pub async fn run_due(&self, resources: &ResourceManager) -> Vec<StrategyResult> {
        let now = Instant::now();
        let mut results = Vec::new();
        for strategy in &self.strategies {
            if !self.is_enabled(strategy.as_ref()) {
                continue;
            }
            let last = {
                let guard = self.last_run.lock().await;
                guard.get(strategy.name()).copied()
            };
            if !strategy.should_run(last, now) {
                continue;
            }
            if !strategy.before_execute(resources).await {
                continue;
            }

            let result = match strategy.do_cleanup(resources).await {
                Ok(count) => {
                    strategy.after_execute(count).await;
                    StrategyResult {
                        name: strategy.name(),
                        affected: count,
                        error: None,
                    }
                }
                Err(e) => {
                    strategy.on_error(&e).await;
                    StrategyResult {
                        name: strategy.name(),
                        affected: 0,
                        error: Some(e.to_string()),
                    }
                }
            };

            for observer in &self.observers {
                observer.on_result(&result).await;
            }

            self.last_run.lock().await.insert(strategy.name(), now);
            results.push(result);
        }
        results
    }

    /// Runs a single named strategy immediately, bypassing its interval
    /// gate — used for `pending_job_recovery`, which is startup-only and
    /// has no periodic schedule of its own.
    pub async fn run_once(
        &self,
        name: &str,
        resources: &ResourceManager,
    ) -> Option<StrategyResult> {
        let strategy = self.strategies.iter().find(|s| s.name() == name)?;
        let result = match strategy.do_cleanup(resources).await {
            Ok(count) => {
                strategy.after_execute(count).await;
                StrategyResult {
                    name: strategy.name(),
                    affected: count,
                    error: None,
                }
            }
            Err(e) => {
                strategy.on_error(&e).await;
                StrategyResult {
                    name: strategy.name(),
                    affected: 0,
                    error: Some(e.to_string()),
                }
            }
        };
        Some(result)
    }

    pub async fn run_loop(
        self: Arc<Self>,
        resources: Arc<ResourceManager>,
        tick_interval: Duration,
        stop: Arc<std::sync::atomic::AtomicBool>,
    ) {
        let mut interval = tokio::time::interval(tick_interval);
        loop {
            interval.tick().await;
            if stop.load(std::sync::atomic::Ordering::Relaxed) {
                return;
            }
            self.run_due(&resources).await;
        }
    }
}
