//! The reconciliation wait engine
//!
//! A [`Poller`] repeatedly fetches its target through a
//! [`ResourceAccessor`], evaluates a [`Predicate`] against what it saw and
//! stops on the first of: the predicate holds (`Satisfied`), the deadline
//! passes (`TimedOut`), or the accessor reports anything other than
//! "not found" (`TransportFailed`).
//!
//! "Not found" is an ordinary observation here. It means "not yet" for
//! every predicate except deletion, for which it means "done".
//!
//! The deadline is a single timer for the whole wait: a fetch still in
//! flight when it fires is dropped, and the wait reports `TimedOut` with
//! the last observation that did complete.

use std::fmt;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::accessor::{decode, gvk_of, KubeKind, ResourceAccessor};
use crate::conditions::{deployment_rollout_complete, ConditionLookup, Predicate};
use crate::{Error, Result, DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT};

/// Where a poller is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollState {
    /// Still ticking
    Polling,
    /// The predicate held on the last tick
    Satisfied,
    /// The deadline passed first
    TimedOut,
    /// The accessor returned a fatal error (transport, auth, decode)
    TransportFailed,
}

impl PollState {
    /// Whether no further ticks will happen
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Polling)
    }
}

/// What a wait observes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitTarget {
    /// A single object by name
    Named {
        /// Namespace, empty for cluster-scoped kinds
        namespace: String,
        /// Object name
        name: String,
    },
    /// Any object matching a label selector
    Selected {
        /// Namespace, empty for all namespaces
        namespace: String,
        /// Label selector, e.g. `app=registry`
        label_selector: String,
    },
}

impl fmt::Display for WaitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named { namespace, name } if namespace.is_empty() => f.write_str(name),
            Self::Named { namespace, name } => write!(f, "{}/{}", namespace, name),
            Self::Selected {
                namespace,
                label_selector,
            } => write!(f, "{} matching {}", namespace, label_selector),
        }
    }
}

/// One wait: target, predicate, timeout and cadence
#[derive(Clone, Debug)]
pub struct WaitRequest<K> {
    /// Object or selector to observe
    pub target: WaitTarget,
    /// Condition that ends the wait
    pub predicate: Predicate<K>,
    /// Upper bound for the whole wait
    pub timeout: Duration,
    /// Pause between ticks
    pub interval: Duration,
    /// When set, only objects whose generation advanced past this value
    /// (and whose controller observed it) can satisfy the predicate
    pub generation_baseline: Option<i64>,
}

impl<K> WaitRequest<K> {
    /// Wait on a single named object
    pub fn named(namespace: impl Into<String>, name: impl Into<String>, predicate: Predicate<K>) -> Self {
        Self::new(
            WaitTarget::Named {
                namespace: namespace.into(),
                name: name.into(),
            },
            predicate,
        )
    }

    /// Wait until some object matching `label_selector` satisfies the
    /// predicate (or, for deletion, until none is left)
    pub fn selected(
        namespace: impl Into<String>,
        label_selector: impl Into<String>,
        predicate: Predicate<K>,
    ) -> Self {
        Self::new(
            WaitTarget::Selected {
                namespace: namespace.into(),
                label_selector: label_selector.into(),
            },
            predicate,
        )
    }

    fn new(target: WaitTarget, predicate: Predicate<K>) -> Self {
        Self {
            target,
            predicate,
            timeout: DEFAULT_WAIT_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
            generation_baseline: None,
        }
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Require `metadata.generation > baseline` before the predicate can
    /// hold. Use after a patch to avoid accepting a condition left over
    /// from before it.
    pub fn require_generation_advance(mut self, baseline: i64) -> Self {
        self.generation_baseline = Some(baseline);
        self
    }

    fn expectation(&self) -> String {
        match self.generation_baseline {
            Some(baseline) => format!("{} (generation > {})", self.predicate.describe(), baseline),
            None => self.predicate.describe(),
        }
    }
}

/// Drives one [`WaitRequest`] to a terminal state
pub struct Poller<'a, A: ?Sized, K> {
    accessor: &'a A,
    request: WaitRequest<K>,
    state: PollState,
    ticks: u32,
    /// `None` until a fetch completes; `Some(vec![])` means "absent"
    last_observed: Option<Vec<K>>,
}

impl<'a, A, K> Poller<'a, A, K>
where
    A: ResourceAccessor + ?Sized,
    K: KubeKind,
{
    /// Create a poller in the `Polling` state
    pub fn new(accessor: &'a A, request: WaitRequest<K>) -> Self {
        Self {
            accessor,
            request,
            state: PollState::Polling,
            ticks: 0,
            last_observed: None,
        }
    }

    /// Current state
    pub fn state(&self) -> PollState {
        self.state
    }

    /// Number of fetches started so far
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Poll until a terminal state.
    ///
    /// Returns the object that satisfied the predicate, or `None` when the
    /// predicate is satisfied by absence (deletion). Calling `run` again on
    /// a finished poller returns a `Lifecycle` error without fetching.
    pub async fn run(&mut self) -> Result<Option<K>> {
        if self.state.is_terminal() {
            return Err(Error::lifecycle(
                "poller",
                format!("wait for {} already finished as {:?}", self.describe_target(), self.state),
            ));
        }

        let start = Instant::now();
        let deadline = start + self.request.timeout;
        debug!(
            target_ref = %self.describe_target(),
            expected = %self.request.expectation(),
            timeout_ms = self.request.timeout.as_millis() as u64,
            "waiting"
        );

        loop {
            if Instant::now() >= deadline {
                return Err(self.timed_out(start));
            }

            self.ticks += 1;
            let fetched = tokio::time::timeout_at(deadline, self.observe()).await;
            let observed = match fetched {
                Err(_) => return Err(self.timed_out(start)),
                Ok(Err(e)) => {
                    self.state = PollState::TransportFailed;
                    warn!(
                        target_ref = %self.describe_target(),
                        tick = self.ticks,
                        error = %e,
                        "wait aborted"
                    );
                    return Err(e);
                }
                Ok(Ok(observed)) => observed,
            };

            if let Some(hit) = self.find_satisfying(&observed) {
                self.state = PollState::Satisfied;
                info!(
                    target_ref = %self.describe_target(),
                    expected = %self.request.expectation(),
                    ticks = self.ticks,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "wait satisfied"
                );
                return Ok(hit);
            }

            debug!(
                target_ref = %self.describe_target(),
                tick = self.ticks,
                observed = observed.len(),
                "not yet"
            );
            self.last_observed = Some(observed);

            let next = Instant::now() + self.request.interval;
            tokio::time::sleep_until(next.min(deadline)).await;
        }
    }

    async fn observe(&self) -> Result<Vec<K>> {
        let gvk = gvk_of::<K>();
        match &self.request.target {
            WaitTarget::Named { namespace, name } => {
                match self.accessor.get(&gvk, namespace, name).await {
                    Ok(obj) => Ok(vec![decode(obj)?]),
                    Err(e) if e.is_not_found() => Ok(Vec::new()),
                    Err(e) => Err(e),
                }
            }
            WaitTarget::Selected {
                namespace,
                label_selector,
            } => self
                .accessor
                .list(&gvk, namespace, label_selector)
                .await?
                .into_iter()
                .map(decode)
                .collect(),
        }
    }

    /// `Some(Some(obj))` for a present object that satisfies the predicate,
    /// `Some(None)` when absence satisfies it, `None` otherwise
    fn find_satisfying(&self, observed: &[K]) -> Option<Option<K>> {
        if observed.is_empty() {
            return self.check(None).then_some(None);
        }
        observed
            .iter()
            .find(|obj| self.check(Some(*obj)))
            .map(|obj| Some(obj.clone()))
    }

    fn check(&self, observed: Option<&K>) -> bool {
        match self.request.generation_baseline {
            Some(baseline) => self.request.predicate.evaluate_since(observed, baseline),
            None => self.request.predicate.evaluate(observed),
        }
    }

    fn timed_out(&mut self, start: Instant) -> Error {
        self.state = PollState::TimedOut;
        let last_observed = match &self.last_observed {
            None => "<no completed fetch>".to_string(),
            Some(objs) if objs.is_empty() => "<absent>".to_string(),
            Some(objs) if objs.len() == 1 => {
                serde_json::to_string(&objs[0]).unwrap_or_else(|e| format!("<unserializable: {}>", e))
            }
            Some(objs) => serde_json::to_string(objs).unwrap_or_else(|e| format!("<unserializable: {}>", e)),
        };
        warn!(
            target_ref = %self.describe_target(),
            expected = %self.request.expectation(),
            ticks = self.ticks,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "wait timed out"
        );
        Error::Timeout {
            target: self.describe_target(),
            expected: self.request.expectation(),
            timeout: self.request.timeout,
            last_observed,
        }
    }

    fn describe_target(&self) -> String {
        format!("{} {}", K::kind(&()), self.request.target)
    }
}

/// Run a wait to completion
pub async fn wait_for<A, K>(accessor: &A, request: WaitRequest<K>) -> Result<Option<K>>
where
    A: ResourceAccessor + ?Sized,
    K: KubeKind,
{
    Poller::new(accessor, request).run().await
}

fn expect_present<K: KubeKind>(hit: Option<K>, namespace: &str, name: &str) -> Result<K> {
    hit.ok_or_else(|| {
        Error::internal_with_context(
            "wait",
            format!("{} {}/{} satisfied by absence", K::kind(&()), namespace, name),
        )
    })
}

/// Wait until `condition_type` is `True` on a named object
pub async fn wait_for_condition_true<A, K>(
    accessor: &A,
    namespace: &str,
    name: &str,
    condition_type: &str,
    timeout: Duration,
) -> Result<K>
where
    A: ResourceAccessor + ?Sized,
    K: KubeKind + ConditionLookup,
{
    let request = WaitRequest::named(namespace, name, Predicate::condition_true(condition_type))
        .with_timeout(timeout);
    let hit = wait_for(accessor, request).await?;
    expect_present(hit, namespace, name)
}

/// Wait until a named object exists
pub async fn wait_for_existence<A, K>(
    accessor: &A,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<K>
where
    A: ResourceAccessor + ?Sized,
    K: KubeKind,
{
    let request = WaitRequest::named(namespace, name, Predicate::exists()).with_timeout(timeout);
    let hit = wait_for(accessor, request).await?;
    expect_present(hit, namespace, name)
}

/// Wait until a named object is gone
pub async fn wait_for_deletion<A, K>(
    accessor: &A,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<()>
where
    A: ResourceAccessor + ?Sized,
    K: KubeKind,
{
    let request = WaitRequest::<K>::named(namespace, name, Predicate::deleted()).with_timeout(timeout);
    wait_for(accessor, request).await.map(|_| ())
}

/// Wait until a Deployment finished rolling out and reports
/// `Available=True`, optionally only after its generation advanced past
/// `generation_baseline`. See [`deployment_rollout_complete`].
pub async fn wait_for_deployment_available<A>(
    accessor: &A,
    namespace: &str,
    name: &str,
    timeout: Duration,
    generation_baseline: Option<i64>,
) -> Result<Deployment>
where
    A: ResourceAccessor + ?Sized,
{
    let mut request = WaitRequest::named(
        namespace,
        name,
        Predicate::<Deployment>::matches("Available and rollout complete", deployment_rollout_complete),
    )
    .with_timeout(timeout);
    if let Some(baseline) = generation_baseline {
        request = request.require_generation_advance(baseline);
    }
    let hit = wait_for(accessor, request).await?;
    expect_present(hit, namespace, name)
}
