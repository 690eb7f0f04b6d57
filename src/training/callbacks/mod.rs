//! Training lifecycle events and their listeners
//!
//! The training loop emits three kinds of events. Listeners register for the
//! kinds they care about and the [`EventDispatcher`] routes each event to them.
//!
//! - `Log` - periodic metrics (train loss, learning rate, or eval loss)
//! - `Evaluate` - the result of an evaluation pass
//! - `TrainEnd` - once, after the last step

mod early_stopping;
mod logging;

pub use early_stopping::EarlyStoppingCallback;
pub use logging::{
    LogRecord, LoggingCallback, LossPoint, TrainingSummary, LOG_FILE_PREFIX, SUMMARY_FILE,
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Event kinds a listener can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Log,
    Evaluate,
    TrainEnd,
}

/// Metrics carried by a log or evaluate event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grad_norm: Option<f64>,
}

impl Metrics {
    pub fn train(loss: f64, learning_rate: f64, grad_norm: f64) -> Self {
        Self {
            loss: Some(loss),
            learning_rate: Some(learning_rate),
            grad_norm: Some(grad_norm),
            ..Default::default()
        }
    }

    pub fn eval(eval_loss: f64) -> Self {
        Self {
            eval_loss: Some(eval_loss),
            ..Default::default()
        }
    }
}

/// A metrics event at a given point of the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEvent {
    pub step: usize,
    pub epoch: f64,
    #[serde(flatten)]
    pub metrics: Metrics,
}

/// Final state of a run, passed to `TrainEnd` listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_steps: usize,
    pub total_epochs: f64,
    pub stopped_early: bool,
}

/// Action to take after a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// Continue training normally
    Continue,
    /// Stop training after the current step
    Stop,
}

/// A training-loop listener.
///
/// All methods have no-op defaults, so a listener only implements the events
/// it subscribes to.
pub trait TrainingListener {
    fn name(&self) -> &'static str;

    fn handle_log(&mut self, _event: &MetricsEvent) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn handle_evaluate(&mut self, _event: &MetricsEvent) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn handle_train_end(&mut self, _summary: &RunSummary) -> Result<()> {
        Ok(())
    }
}

/// Routes events to the listeners registered for them
#[derive(Default)]
pub struct EventDispatcher {
    listeners: Vec<Box<dyn TrainingListener>>,
    routes: HashMap<EventKind, Vec<usize>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for the given event kinds
    pub fn register(&mut self, listener: Box<dyn TrainingListener>, kinds: &[EventKind]) {
        let index = self.listeners.len();
        tracing::debug!("Registering listener {} for {:?}", listener.name(), kinds);
        self.listeners.push(listener);
        for kind in kinds {
            let route = self.routes.entry(*kind).or_default();
            if !route.contains(&index) {
                route.push(index);
            }
        }
    }

    /// Register a listener for every event kind
    pub fn register_all(&mut self, listener: Box<dyn TrainingListener>) {
        self.register(listener, &[EventKind::Log, EventKind::Evaluate, EventKind::TrainEnd]);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn route(&self, kind: EventKind) -> Vec<usize> {
        self.routes.get(&kind).cloned().unwrap_or_default()
    }

    /// Every routed listener sees the event; `Stop` from any of them wins
    pub fn log(&mut self, event: &MetricsEvent) -> Result<CallbackAction> {
        let mut action = CallbackAction::Continue;
        for i in self.route(EventKind::Log) {
            if self.listeners[i].handle_log(event)? == CallbackAction::Stop {
                action = CallbackAction::Stop;
            }
        }
        Ok(action)
    }

    pub fn evaluate(&mut self, event: &MetricsEvent) -> Result<CallbackAction> {
        let mut action = CallbackAction::Continue;
        for i in self.route(EventKind::Evaluate) {
            if self.listeners[i].handle_evaluate(event)? == CallbackAction::Stop {
                tracing::info!("{} requested stop at step {}", self.listeners[i].name(), event.step);
                action = CallbackAction::Stop;
            }
        }
        Ok(action)
    }

    pub fn train_end(&mut self, summary: &RunSummary) -> Result<()> {
        for i in self.route(EventKind::TrainEnd) {
            self.listeners[i].handle_train_end(summary)?;
        }
        Ok(())
    }
}
