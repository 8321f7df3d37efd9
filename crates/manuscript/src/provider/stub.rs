//! Scripted in-process provider.
//!
//! Used by tests and local dry runs. Replies are chosen by the first rule
//! whose needle occurs in the request's system prompt or prompt; requests
//! matching no rule get the default reply. Every call is logged and the
//! peak number of concurrent calls is tracked.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use super::{GenerationProvider, GenerationRequest, ProviderError, ProviderErrorKind};

/// A recorded call.
#[derive(Debug, Clone)]
pub struct StubCall {
    pub system: Option<String>,
    pub prompt: String,
    pub model: String,
}

impl StubCall {
    pub fn contains(&self, needle: &str) -> bool {
        self.prompt.contains(needle) || self.system.as_deref().is_some_and(|s| s.contains(needle))
    }
}

enum Action {
    Reply(String),
    /// Fail `remaining` more times, then fall through; `None` fails forever.
    Fail {
        kind: ProviderErrorKind,
        remaining: Option<u32>,
    },
    Hold(StubGate),
}

struct Rule {
    needle: String,
    action: Action,
}

const RELEASE_PERMITS: usize = 1 << 16;

/// Parks matching calls until released.
#[derive(Clone)]
pub struct StubGate {
    entered: Arc<Notify>,
    release: Arc<Semaphore>,
}

impl StubGate {
    fn new() -> Self {
        Self {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Semaphore::new(0)),
        }
    }

    /// Resolves once a matching call has reached the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Lets every parked and future matching call through.
    pub fn release(&self) {
        self.release.add_permits(RELEASE_PERMITS);
    }

    async fn pass(&self) {
        self.entered.notify_one();
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }
}

/// Scripted provider with a call log and a concurrency high-water mark.
pub struct StubProvider {
    name: String,
    default_reply: String,
    delay: Duration,
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<StubCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::warn!("StubProvider lock poisoned, recovering");
        poisoned.into_inner()
    })
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StubProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_reply: "This section was produced by the stub provider.".to_string(),
            delay: Duration::ZERO,
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    /// Sleeps this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn reply_when(self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.push_rule(needle, Action::Reply(reply.into()));
        self
    }

    /// Every matching call fails with `kind`.
    pub fn fail_when(self, needle: impl Into<String>, kind: ProviderErrorKind) -> Self {
        self.push_rule(
            needle,
            Action::Fail {
                kind,
                remaining: None,
            },
        );
        self
    }

    /// The first `times` matching calls fail with `kind`; later ones fall through.
    pub fn fail_times_when(
        self,
        needle: impl Into<String>,
        times: u32,
        kind: ProviderErrorKind,
    ) -> Self {
        self.push_rule(
            needle,
            Action::Fail {
                kind,
                remaining: Some(times),
            },
        );
        self
    }

    /// Parks matching calls at a gate. Returns the gate handle.
    pub fn hold_when(&self, needle: impl Into<String>) -> StubGate {
        let gate = StubGate::new();
        self.push_rule(needle, Action::Hold(gate.clone()));
        gate
    }

    fn push_rule(&self, needle: impl Into<String>, action: Action) {
        lock(&self.rules).push(Rule {
            needle: needle.into(),
            action,
        });
    }

    pub fn calls(&self) -> Vec<StubCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn calls_matching(&self, needle: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.contains(needle)).count()
    }

    /// Highest number of calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Picks the outcome for a call. Holds apply regardless of the order
    /// rules were added in; the first matching hold wins. The gate is
    /// returned separately so the lock is not kept across an await.
    fn decide(&self, call: &StubCall) -> (Option<StubGate>, Result<String, ProviderError>) {
        let mut rules = lock(&self.rules);
        let gate = rules.iter().find_map(|rule| match &rule.action {
            Action::Hold(gate) if call.contains(&rule.needle) => Some(gate.clone()),
            _ => None,
        });

        for rule in rules.iter_mut().filter(|rule| call.contains(&rule.needle)) {
            let kind = match &mut rule.action {
                Action::Reply(text) => return (gate, Ok(text.clone())),
                Action::Fail {
                    kind,
                    remaining: None,
                } => *kind,
                Action::Fail {
                    kind,
                    remaining: Some(n),
                } if *n > 0 => {
                    *n -= 1;
                    *kind
                }
                Action::Fail { .. } | Action::Hold(_) => continue,
            };
            let err = ProviderError::new(kind, format!("scripted {} failure", kind));
            return (gate, Err(err));
        }
        (gate, Ok(self.default_reply.clone()))
    }
}

#[async_trait]
impl GenerationProvider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let call = StubCall {
            system: request.system.clone(),
            prompt: request.prompt.clone(),
            model: request.params.model.clone(),
        };
        lock(&self.calls).push(call.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let (gate, outcome) = self.decide(&call);
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        outcome
    }
}
