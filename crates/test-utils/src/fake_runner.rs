use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stepflow::exec::{BackendRegistry, RunFuture, RunnerFactory, StepContext, StepError, StepRunner};
use stepflow::store::records::now_nanos;
use stepflow::store::{StateStore, StepOutput};
use tokio_util::sync::CancellationToken;

/// Command-type prefix routed to [`FakeBackend`].
pub const FAKE_PREFIX: &str = "fake:";

/// What a fake step does when run.
#[derive(Debug, Clone)]
pub enum FakeBehaviour {
    Succeed,
    /// Exit with the given non-zero code.
    Fail(i32),
    /// Sleep, then succeed.
    Sleep(Duration),
    /// Run until manually stopped.
    Hang,
    Panic,
    /// Emit these output lines, then succeed.
    Output(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    Started(String),
    Finished(String),
}

/// A backend that:
/// - records when each step starts and finishes
/// - behaves according to a per-step-name script (default: succeed).
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    behaviours: Arc<Mutex<HashMap<String, FakeBehaviour>>>,
    events: Arc<Mutex<Vec<FakeEvent>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, step: &str, behaviour: FakeBehaviour) -> &Self {
        self.behaviours
            .lock()
            .unwrap()
            .insert(step.to_string(), behaviour);
        self
    }

    /// Process backend as default, this backend under [`FAKE_PREFIX`].
    pub fn registry(&self) -> BackendRegistry {
        let mut registry = BackendRegistry::default();
        registry.register(FAKE_PREFIX, self.clone());
        registry
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Names of started steps in start order.
    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FakeEvent::Started(name) => Some(name),
                FakeEvent::Finished(_) => None,
            })
            .collect()
    }

    /// Position of an event in the log, if it happened.
    pub fn position(&self, event: &FakeEvent) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

impl RunnerFactory for FakeBackend {
    fn create(&self, ctx: StepContext, store: StateStore) -> Box<dyn StepRunner> {
        let behaviour = self
            .behaviours
            .lock()
            .unwrap()
            .get(&ctx.name)
            .cloned()
            .unwrap_or(FakeBehaviour::Succeed);
        Box::new(FakeRunner {
            ctx,
            store,
            behaviour,
            events: Arc::clone(&self.events),
        })
    }
}

/// Runner created by [`FakeBackend`]; never spawns a process.
pub struct FakeRunner {
    ctx: StepContext,
    store: StateStore,
    behaviour: FakeBehaviour,
    events: Arc<Mutex<Vec<FakeEvent>>>,
}

impl FakeRunner {
    fn record(&self, event: FakeEvent) {
        self.events.lock().unwrap().push(event);
    }

    async fn execute(&mut self, cancel: CancellationToken) -> Result<(), StepError> {
        self.record(FakeEvent::Started(self.ctx.name.clone()));

        let result = match self.behaviour.clone() {
            FakeBehaviour::Succeed => Ok(()),
            FakeBehaviour::Fail(code) => Err(StepError::NonZeroExit(code)),
            FakeBehaviour::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
            FakeBehaviour::Hang => {
                cancel.cancelled().await;
                Err(StepError::ManualStop)
            }
            FakeBehaviour::Panic => panic!("fake step '{}' panicked", self.ctx.name),
            FakeBehaviour::Output(lines) => {
                let ttl = self.ctx.key_ttl + self.ctx.timeout;
                for (i, content) in lines.iter().enumerate() {
                    let output = StepOutput {
                        line: i as u64 + 1,
                        timestamp: now_nanos(),
                        content: content.clone(),
                    };
                    self.store
                        .append_output(&self.ctx.task_id, self.ctx.index, &output, ttl);
                }
                self.store
                    .set_output_done(&self.ctx.task_id, self.ctx.index, lines.len() as u64, ttl);
                Ok(())
            }
        };

        self.record(FakeEvent::Finished(self.ctx.name.clone()));
        result
    }
}

impl StepRunner for FakeRunner {
    fn run(&mut self, cancel: CancellationToken) -> RunFuture<'_> {
        Box::pin(self.execute(cancel))
    }

    fn cleanup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
