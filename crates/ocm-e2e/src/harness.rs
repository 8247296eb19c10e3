//! Scenario runner: features made of setup, assess and teardown steps
//!
//! A [`Feature`] runs its steps strictly in order against a shared
//! environment:
//!
//! 1. every setup step; the first failure skips all assessments
//! 2. every assessment; the first failure skips the remaining ones
//! 3. every teardown step, always, even after a failure or panic
//!
//! Teardown errors are logged and reported but never replace the failure
//! that came first. Each feature produces a [`FeatureReport`]; the
//! [`TestHarness`] collects them into a PASS/FAIL summary.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::environment::Environment;
use crate::{Error, Result};

// =============================================================================
// Step context
// =============================================================================

/// Typed key/value bag threaded through the steps of one feature.
///
/// Values are reference counted so the runner can keep the last good
/// context when a step fails and hand it to teardown.
#[derive(Clone, Default)]
pub struct StepContext {
    values: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("StepContext").field("keys", &keys).finish()
    }
}

impl StepContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous value under `key`
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Arc::new(value));
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with<T: Any + Send + Sync>(mut self, key: impl Into<String>, value: T) -> Self {
        self.insert(key, value);
        self
    }

    /// Value under `key`, if present with type `T`
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref::<T>()
    }

    /// Value under `key`; an error names the missing key or wrong type
    pub fn require<T: Any + Send + Sync>(&self, key: &str) -> Result<&T> {
        match self.values.get(key) {
            None => Err(Error::internal_with_context(
                "step_context",
                format!("no value stored under {:?}", key),
            )),
            Some(value) => value.downcast_ref::<T>().ok_or_else(|| {
                Error::internal_with_context(
                    "step_context",
                    format!(
                        "value under {:?} is not a {}",
                        key,
                        std::any::type_name::<T>()
                    ),
                )
            }),
        }
    }

    /// Whether anything is stored under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// =============================================================================
// Steps and features
// =============================================================================

/// One unit of work: `(environment, context) -> context`
pub type Step<E = Environment> =
    Arc<dyn Fn(Arc<E>, StepContext) -> BoxFuture<'static, Result<StepContext>> + Send + Sync>;

/// Wrap an async closure into a [`Step`]
pub fn step<E, F, Fut>(f: F) -> Step<E>
where
    E: Send + Sync + 'static,
    F: Fn(Arc<E>, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepContext>> + Send + 'static,
{
    Arc::new(move |env, ctx| f(env, ctx).boxed())
}

/// A named scenario
pub struct Feature<E = Environment> {
    name: String,
    setups: Vec<Step<E>>,
    assessments: Vec<(String, Step<E>)>,
    teardowns: Vec<Step<E>>,
}

impl<E: Send + Sync + 'static> Feature<E> {
    /// Empty feature
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setups: Vec::new(),
            assessments: Vec::new(),
            teardowns: Vec::new(),
        }
    }

    /// Append a setup step
    pub fn setup(mut self, step: Step<E>) -> Self {
        self.setups.push(step);
        self
    }

    /// Append a named assessment
    pub fn assess(mut self, name: impl Into<String>, step: Step<E>) -> Self {
        self.assessments.push((name.into(), step));
        self
    }

    /// Append a teardown step
    pub fn teardown(mut self, step: Step<E>) -> Self {
        self.teardowns.push(step);
        self
    }

    /// Feature name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run every phase against `env`
    pub async fn run(&self, env: Arc<E>) -> FeatureReport {
        let start = Instant::now();
        info!(feature = %self.name, "[Feature] Starting");
        let mut report = FeatureReport::new(&self.name);
        let mut ctx = StepContext::new();

        for (index, setup) in self.setups.iter().enumerate() {
            match run_step(setup, env.clone(), ctx.clone()).await {
                Ok(next) => ctx = next,
                Err(e) => {
                    error!(feature = %self.name, step = index, error = %e, "[Feature] Setup failed");
                    report.setup_error = Some(format!("setup step {}: {}", index + 1, e));
                    break;
                }
            }
        }

        if report.setup_error.is_some() {
            report.skipped = self.assessments.iter().map(|(name, _)| name.clone()).collect();
        } else {
            let mut failed = false;
            for (name, assessment) in &self.assessments {
                if failed {
                    report.skipped.push(name.clone());
                    continue;
                }
                let step_start = Instant::now();
                let result = run_step(assessment, env.clone(), ctx.clone()).await;
                let duration = step_start.elapsed();
                match result {
                    Ok(next) => {
                        ctx = next;
                        info!(feature = %self.name, assessment = %name, "[Feature] Assessment passed");
                        report.assessments.push(AssessResult::pass(name, duration));
                    }
                    Err(e) => {
                        error!(feature = %self.name, assessment = %name, error = %e, "[Feature] Assessment failed");
                        report.assessments.push(AssessResult::fail(name, duration, e));
                        failed = true;
                    }
                }
            }
        }

        for (index, teardown) in self.teardowns.iter().enumerate() {
            match run_step(teardown, env.clone(), ctx.clone()).await {
                Ok(next) => ctx = next,
                Err(e) => {
                    warn!(feature = %self.name, step = index, error = %e, "[Feature] Teardown failed");
                    report
                        .teardown_errors
                        .push(format!("teardown step {}: {}", index + 1, e));
                }
            }
        }

        report.duration = start.elapsed();
        info!(
            feature = %self.name,
            passed = report.passed(),
            elapsed_ms = report.duration.as_millis() as u64,
            "[Feature] Finished"
        );
        report
    }
}

/// Run one step, turning a panic into an error
async fn run_step<E>(step: &Step<E>, env: Arc<E>, ctx: StepContext) -> Result<StepContext> {
    match AssertUnwindSafe(step(env, ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Error::internal_with_context("step", format!("PANIC: {}", panic_message(panic)))),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one assessment
#[derive(Clone, Debug)]
pub struct AssessResult {
    /// Assessment name
    pub name: String,
    /// Whether it passed
    pub passed: bool,
    /// Wall time
    pub duration: Duration,
    /// Failure message
    pub error: Option<String>,
}

impl AssessResult {
    fn pass(name: &str, duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            duration,
            error: None,
        }
    }

    fn fail(name: &str, duration: Duration, error: Error) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            duration,
            error: Some(error.to_string()),
        }
    }
}

/// Outcome of one feature
#[derive(Clone, Debug)]
pub struct FeatureReport {
    /// Feature name
    pub name: String,
    /// First failing setup step, if any
    pub setup_error: Option<String>,
    /// Assessments that ran, in order
    pub assessments: Vec<AssessResult>,
    /// Assessments skipped after a failure
    pub skipped: Vec<String>,
    /// Teardown failures, logged and kept for the summary
    pub teardown_errors: Vec<String>,
    /// Wall time of all phases
    pub duration: Duration,
}

impl FeatureReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            setup_error: None,
            assessments: Vec::new(),
            skipped: Vec::new(),
            teardown_errors: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// True when setup, every assessment and every teardown step succeeded
    pub fn passed(&self) -> bool {
        self.setup_error.is_none()
            && self.skipped.is_empty()
            && self.assessments.iter().all(|a| a.passed)
            && self.teardown_errors.is_empty()
    }

    /// The first failure; teardown errors only when nothing failed before
    pub fn failure(&self) -> Option<String> {
        if let Some(e) = &self.setup_error {
            return Some(e.clone());
        }
        if let Some(a) = self.assessments.iter().find(|a| !a.passed) {
            return Some(format!(
                "{}: {}",
                a.name,
                a.error.as_deref().unwrap_or("failed")
            ));
        }
        if !self.teardown_errors.is_empty() {
            return Some(self.teardown_errors.join("; "));
        }
        None
    }
}

// =============================================================================
// Run summary
// =============================================================================

/// One line of the run summary
pub struct TestResult {
    /// Feature name
    pub name: String,
    /// Whether it passed
    pub passed: bool,
    /// Wall time
    pub duration: Duration,
    /// Failure message
    pub error: Option<String>,
}

/// Collects results and prints a PASS/FAIL summary
pub struct TestHarness {
    suite: String,
    results: Arc<Mutex<Vec<TestResult>>>,
}

impl TestHarness {
    /// Empty harness for a suite
    pub fn new(suite: &str) -> Self {
        Self {
            suite: suite.to_string(),
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run a feature and record its report
    pub async fn run_feature<E: Send + Sync + 'static>(&self, feature: &Feature<E>, env: Arc<E>) -> FeatureReport {
        let report = feature.run(env).await;
        self.record_report(&report);
        report
    }

    /// Record a finished feature
    pub fn record_report(&self, report: &FeatureReport) {
        self.record(&report.name, report.passed(), report.duration, report.failure());
    }

    /// Record a result
    pub fn record(&self, name: &str, passed: bool, duration: Duration, error: Option<String>) {
        self.lock().push(TestResult {
            name: name.to_string(),
            passed,
            duration,
            error,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TestResult>> {
        self.results.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Log the summary; an error names every failed feature
    pub fn finish(&self) -> Result<()> {
        let results = self.lock();
        let total_duration: Duration = results.iter().map(|r| r.duration).sum();
        let passed = results.iter().filter(|r| r.passed).count();
        let failed = results.iter().filter(|r| !r.passed).count();

        info!("========================================");
        info!("  {}", self.suite.to_uppercase());
        info!("========================================");
        for r in results.iter() {
            let tag = if r.passed { "PASS" } else { "FAIL" };
            info!("  {tag}  {:40} {:.1}s", r.name, r.duration.as_secs_f64());
            if let Some(ref e) = r.error {
                info!("        -> {}", truncate(e, 200));
            }
        }
        info!("----------------------------------------");
        info!(
            "  {} passed, {} failed ({:.1}s total)",
            passed,
            failed,
            total_duration.as_secs_f64()
        );
        info!("========================================");

        if failed > 0 {
            let failures: Vec<_> = results
                .iter()
                .filter(|r| !r.passed)
                .map(|r| r.name.as_str())
                .collect();
            Err(Error::assertion(
                self.suite.clone(),
                "all features pass",
                format!("{} feature(s) failed: {}", failed, failures.join(", ")),
            ))
        } else {
            Ok(())
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Environment double that records which steps ran
    #[derive(Default)]
    struct Journal {
        entries: StdMutex<Vec<String>>,
    }

    impl Journal {
        fn push(&self, entry: &str) {
            self.entries.lock().unwrap().push(entry.to_string());
        }

        fn entries(&self) -> Vec<String> {
            self.entries.lock().unwrap().clone()
        }
    }

    fn record(entry: &'static str) -> Step<Journal> {
        step(move |env: Arc<Journal>, ctx| async move {
            env.push(entry);
            Ok(ctx)
        })
    }

    fn fail(entry: &'static str) -> Step<Journal> {
        step(move |env: Arc<Journal>, _ctx| async move {
            env.push(entry);
            Err(Error::assertion(entry, "ok", "broken"))
        })
    }

    #[test]
    fn context_values_are_typed() {
        let ctx = StepContext::new().with("repo", "test".to_string()).with("pr", 1i64);

        assert_eq!(ctx.get::<String>("repo").map(String::as_str), Some("test"));
        assert_eq!(ctx.get::<i64>("pr"), Some(&1));
        assert!(ctx.get::<u32>("pr").is_none());
        assert!(ctx.contains("repo"));
        assert_eq!(ctx.len(), 2);

        let err = ctx.require::<u32>("pr").unwrap_err();
        assert!(err.to_string().contains("not a u32"));
        let err = ctx.require::<String>("missing").unwrap_err();
        assert!(err.to_string().contains("\"missing\""));
    }

    #[tokio::test]
    async fn story_phases_run_in_order_and_pass() {
        let env = Arc::new(Journal::default());
        let feature = Feature::new("ordering")
            .setup(record("setup-1"))
            .setup(record("setup-2"))
            .assess("first", record("assess-1"))
            .assess("second", record("assess-2"))
            .teardown(record("teardown-1"));

        let report = feature.run(env.clone()).await;

        assert!(report.passed());
        assert_eq!(report.failure(), None);
        assert_eq!(
            env.entries(),
            vec!["setup-1", "setup-2", "assess-1", "assess-2", "teardown-1"]
        );
    }

    #[tokio::test]
    async fn context_flows_from_setup_to_assess() {
        let env = Arc::new(Journal::default());
        let feature = Feature::new("context")
            .setup(step(|_env: Arc<Journal>, ctx| async move { Ok(ctx.with("repo", "test".to_string())) }))
            .assess(
                "reads repo",
                step(|env: Arc<Journal>, ctx: StepContext| async move {
                    let repo = ctx.require::<String>("repo")?.clone();
                    env.push(&repo);
                    Ok(ctx)
                }),
            );

        let report = feature.run(env.clone()).await;

        assert!(report.passed());
        assert_eq!(env.entries(), vec!["test"]);
    }

    #[tokio::test]
    async fn story_failed_assessment_skips_the_rest_but_teardown_runs() {
        let env = Arc::new(Journal::default());
        let feature = Feature::new("abort")
            .setup(record("setup"))
            .assess("first", fail("assess-1"))
            .assess("second", record("assess-2"))
            .teardown(record("teardown"));

        let report = feature.run(env.clone()).await;

        assert!(!report.passed());
        assert_eq!(env.entries(), vec!["setup", "assess-1", "teardown"]);
        assert_eq!(report.skipped, vec!["second"]);
        assert!(report.failure().unwrap().starts_with("first: "));
    }

    #[tokio::test]
    async fn failed_setup_skips_all_assessments() {
        let env = Arc::new(Journal::default());
        let feature = Feature::new("setup fails")
            .setup(fail("setup-1"))
            .setup(record("setup-2"))
            .assess("first", record("assess-1"))
            .teardown(record("teardown"));

        let report = feature.run(env.clone()).await;

        assert_eq!(env.entries(), vec!["setup-1", "teardown"]);
        assert_eq!(report.skipped, vec!["first"]);
        assert!(report.failure().unwrap().starts_with("setup step 1"));
    }

    #[tokio::test]
    async fn teardown_errors_do_not_mask_the_first_failure() {
        let env = Arc::new(Journal::default());
        let feature = Feature::new("masking")
            .assess("first", fail("assess"))
            .teardown(fail("teardown-1"))
            .teardown(record("teardown-2"));

        let report = feature.run(env.clone()).await;

        assert_eq!(env.entries(), vec!["assess", "teardown-1", "teardown-2"]);
        assert_eq!(report.teardown_errors.len(), 1);
        assert!(report.failure().unwrap().starts_with("first: "));
    }

    #[tokio::test]
    async fn teardown_error_alone_fails_the_feature() {
        let env = Arc::new(Journal::default());
        let feature = Feature::new("teardown only")
            .assess("first", record("assess"))
            .teardown(fail("teardown"));

        let report = feature.run(env).await;

        assert!(!report.passed());
        assert!(report.failure().unwrap().starts_with("teardown step 1"));
    }

    #[tokio::test]
    async fn panicking_step_is_reported_not_propagated() {
        let env = Arc::new(Journal::default());
        let feature = Feature::new("panics")
            .assess(
                "boom",
                step(|_env: Arc<Journal>, _ctx| async move {
                    if true {
                        panic!("exploded");
                    }
                    Ok(StepContext::new())
                }),
            )
            .teardown(record("teardown"));

        let report = feature.run(env.clone()).await;

        assert_eq!(env.entries(), vec!["teardown"]);
        assert!(report.failure().unwrap().contains("PANIC: exploded"));
    }

    #[tokio::test]
    async fn harness_finish_names_failed_features() {
        let env = Arc::new(Journal::default());
        let harness = TestHarness::new("scenarios");
        harness
            .run_feature(&Feature::new("good").assess("ok", record("ok")), env.clone())
            .await;
        harness
            .run_feature(&Feature::new("bad").assess("broken", fail("broken")), env)
            .await;

        let err = harness.finish().unwrap_err();
        assert!(err.to_string().contains("1 feature(s) failed: bad"));
    }

    #[test]
    fn harness_finish_passes_when_everything_passed() {
        let harness = TestHarness::new("scenarios");
        harness.record("a", true, Duration::from_secs(1), None);
        harness.finish().unwrap();
    }

    #[test]
    fn long_errors_are_truncated_on_char_boundaries() {
        let message = "ä".repeat(300);
        let truncated = truncate(&message, 200);
        assert_eq!(truncated.chars().count(), 203);
        assert_eq!(truncate("short", 200), "short");
    }
}
