use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::classifier::Classifier;
use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{LedgerError, Result};
use crate::models::ProgramState;
use crate::queue::TaskQueue;
use crate::store::Store;

/// Published on every program state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramEvent {
    pub program_id: Uuid,
    pub state: ProgramState,
    pub at: DateTime<Utc>,
}

/// Everything an engine operation needs, passed explicitly.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn TaskQueue>,
    pub clock: Arc<dyn Clock>,
    pub settings: Settings,
    classifier: Classifier,
    events: broadcast::Sender<ProgramEvent>,
}

impl Context {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        settings: Settings,
    ) -> Result<Self> {
        settings.validate()?;
        let classifier = Classifier::new(settings.on_time_tolerance_minutes, settings.timezone()?);
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            store,
            queue,
            clock,
            settings,
            classifier,
            events,
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn tz(&self) -> FixedOffset {
        self.classifier.tz()
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgramEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, program_id: Uuid, state: ProgramState) {
        let event = ProgramEvent {
            program_id,
            state,
            at: self.now(),
        };
        if self.events.send(event).is_err() {
            debug!(%program_id, %state, "no subscribers for program event");
        }
    }

    /// Runs a store or queue call under the configured deadline.
    pub async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.settings.store_timeout(), fut)
            .await
            .map_err(|_| LedgerError::Timeout(op))?
    }
}
