//! Session lifecycle state machine.
//!
//! The controller owns the single "current session" slot. All browser triggers and
//! popup requests reach it through one queue and are handled strictly one at a time,
//! each awaited to completion (storage included) before the next is taken. That
//! ordering is what rules out two opens without a close in between.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    buffer::LocalBuffer,
    category::{Categorizer, Category, OverrideStats},
    clock::Clock,
    domain,
    error::{CategoryError, StoreError},
    session::{ContextSnapshot, SessionRecord},
    stats::{todays_summary, TodaySummary},
    sync::SyncEngine,
};

const COMMAND_QUEUE_DEPTH: usize = 256;

/// Browser-side events that can move the active viewing context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// The user switched to another tab.
    ContextActivated { context: ContextSnapshot },
    /// A tab navigated. `active` tells whether it is the tab on screen.
    #[serde(rename_all = "camelCase")]
    ContentChanged {
        context_id: i64,
        locator: String,
        #[serde(default = "default_true")]
        active: bool,
    },
    /// The browser window lost focus to another application or window.
    FocusLost,
    /// A browser window gained focus; `active` is its visible tab, if any.
    FocusGained {
        #[serde(default)]
        active: Option<ContextSnapshot>,
    },
    #[serde(rename_all = "camelCase")]
    ContextDestroyed { context_id: i64 },
}

fn default_true() -> bool {
    true
}

pub enum Command {
    Trigger(Trigger, oneshot::Sender<()>),
    Stats(oneshot::Sender<TodaySummary>),
    Clear(oneshot::Sender<Result<(), StoreError>>),
    SetCategory {
        domain: String,
        category: Category,
        reply: oneshot::Sender<Result<(), CategoryError>>,
    },
    Categories(oneshot::Sender<OverrideStats>),
    Current(oneshot::Sender<Option<SessionRecord>>),
}

pub struct Controller {
    device_id: String,
    clock: Arc<dyn Clock>,
    categorizer: Categorizer,
    buffer: LocalBuffer,
    sync: Option<Arc<SyncEngine>>,
    current: Option<SessionRecord>,
    focused: bool,
    /// Tab last reported as on screen; navigation in any other tab is background noise.
    active_context: Option<i64>,
}

impl Controller {
    pub fn new(
        device_id: String,
        clock: Arc<dyn Clock>,
        categorizer: Categorizer,
        buffer: LocalBuffer,
        sync: Option<Arc<SyncEngine>>,
    ) -> Self {
        Self {
            device_id,
            clock,
            categorizer,
            buffer,
            sync,
            current: None,
            focused: true,
            active_context: None,
        }
    }

    pub fn current(&self) -> Option<&SessionRecord> {
        self.current.as_ref()
    }

    pub fn active_context(&self) -> Option<i64> {
        self.active_context
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    pub fn categorizer(&self) -> &Categorizer {
        &self.categorizer
    }

    pub async fn handle(&mut self, trigger: Trigger) {
        match trigger {
            Trigger::ContextActivated { context } => {
                debug!("context activated: {}", context.context_id);
                self.active_context = Some(context.context_id);
                if self.continues_current(context.context_id, context.locator.as_deref()) {
                    debug!("activation repeats the open session; ignored");
                    return;
                }
                self.close_current().await;
                if self.focused {
                    self.open_new(&context);
                }
            }
            Trigger::ContentChanged {
                context_id,
                locator,
                active,
            } => {
                if !active || self.active_context.is_some_and(|id| id != context_id) {
                    debug!("navigation in background context {context_id}; ignored");
                    return;
                }
                self.active_context = Some(context_id);
                if self.continues_current(context_id, Some(&locator)) {
                    return;
                }
                debug!("context {context_id} navigated to a new domain");
                self.close_current().await;
                if self.focused {
                    self.open_new(&ContextSnapshot {
                        context_id,
                        window_id: None,
                        locator: Some(locator),
                    });
                }
            }
            Trigger::FocusLost => {
                info!("browser lost focus");
                self.focused = false;
                self.close_current().await;
            }
            Trigger::FocusGained { active } => {
                info!("browser gained focus");
                self.focused = true;
                if let Some(context) = active {
                    self.active_context = Some(context.context_id);
                    if self.continues_current(context.context_id, context.locator.as_deref()) {
                        return;
                    }
                    if self.current.is_some() {
                        warn!("session still open when focus returned; closing it first");
                    }
                    self.close_current().await;
                    self.open_new(&context);
                }
            }
            Trigger::ContextDestroyed { context_id } => {
                if self.active_context == Some(context_id) {
                    self.active_context = None;
                }
                if self
                    .current
                    .as_ref()
                    .is_some_and(|s| s.tracking_context_id == context_id)
                {
                    info!("active context {context_id} closed");
                    self.close_current().await;
                }
            }
        }
    }

    /// True when the open session already covers this context and the locator's domain.
    fn continues_current(&self, context_id: i64, locator: Option<&str>) -> bool {
        let (Some(session), Some(locator)) = (self.current.as_ref(), locator) else {
            return false;
        };
        session.tracking_context_id == context_id
            && domain::is_trackable(locator)
            && session.domain == domain::extract(locator)
    }

    /// Closes the open session, if any, and hands it to the buffer.
    pub async fn close_current(&mut self) {
        let Some(open) = self.current.take() else {
            return;
        };
        let record = open.close(self.clock.now());
        info!(
            "session ended: {} {}s ({})",
            record.domain, record.duration_seconds, record.category
        );
        match self.buffer.append(record).await {
            Ok(size) => {
                if let Some(sync) = &self.sync {
                    if sync.should_flush(size) {
                        debug!("buffer at {size}, requesting flush");
                        sync.request_flush();
                    }
                }
            }
            Err(err) => {
                error!("closed session dropped, buffer write failed: {err}");
            }
        }
    }

    /// Opens a session for `context` unless its locator is missing or internal.
    pub fn open_new(&mut self, context: &ContextSnapshot) {
        let Some(locator) = context.locator.as_deref() else {
            return;
        };
        if !domain::is_trackable(locator) {
            debug!("not tracking internal page in context {}", context.context_id);
            return;
        }
        if let Some(stale) = self.current.take() {
            // Only reachable through a bug in the transition table; keep the time anyway.
            error!("open_new with a session still open: {}", stale.domain);
            self.current = Some(stale);
            return;
        }
        let domain = domain::extract(locator);
        let category = self.categorizer.classify(&domain);
        let session = SessionRecord::open(
            &self.device_id,
            domain,
            locator.to_string(),
            category,
            context.context_id,
            self.clock.now(),
        );
        info!("session started: {} ({})", session.domain, session.category);
        self.current = Some(session);
    }

    pub async fn stats(&self) -> TodaySummary {
        let buffered = self.buffer.read_all().await;
        let now = self.clock.now();
        todays_summary(
            &self.device_id,
            &buffered,
            self.current.as_ref(),
            now,
            self.clock.day_bounds(now),
        )
    }

    /// Drops the open session without recording it and empties the buffer.
    /// On a failed clear nothing changes, the open session included.
    pub async fn clear_data(&mut self) -> Result<(), StoreError> {
        self.buffer.clear().await?;
        self.current = None;
        info!("tracking data cleared");
        Ok(())
    }

    pub async fn set_category(
        &mut self,
        domain: &str,
        category: Category,
    ) -> Result<(), CategoryError> {
        self.categorizer.set_override(domain, category).await
    }

    async fn dispatch(&mut self, command: Command) {
        match command {
            Command::Trigger(trigger, reply) => {
                self.handle(trigger).await;
                let _ = reply.send(());
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats().await);
            }
            Command::Clear(reply) => {
                let _ = reply.send(self.clear_data().await);
            }
            Command::SetCategory {
                domain,
                category,
                reply,
            } => {
                let _ = reply.send(self.set_category(&domain, category).await);
            }
            Command::Categories(reply) => {
                let _ = reply.send(self.categorizer.override_stats());
            }
            Command::Current(reply) => {
                let _ = reply.send(self.current.clone());
            }
        }
    }

    /// Consumes commands until every handle is dropped, then records the open session.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.dispatch(command).await;
        }
        self.close_current().await;
        info!("controller stopped");
    }

    /// Spawns the controller loop and returns the handle used to talk to it.
    pub fn spawn(self) -> (ControllerHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let task = tokio::spawn(self.run(rx));
        (ControllerHandle { tx }, task)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("controller is not running")]
pub struct ControllerGone;

#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ControllerGone> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| ControllerGone)?;
        rx.await.map_err(|_| ControllerGone)
    }

    /// Delivers a trigger and waits until the controller has fully processed it.
    pub async fn trigger(&self, trigger: Trigger) -> Result<(), ControllerGone> {
        self.request(|reply| Command::Trigger(trigger, reply)).await
    }

    pub async fn stats(&self) -> Result<TodaySummary, ControllerGone> {
        self.request(Command::Stats).await
    }

    pub async fn clear(&self) -> Result<Result<(), StoreError>, ControllerGone> {
        self.request(Command::Clear).await
    }

    pub async fn set_category(
        &self,
        domain: String,
        category: Category,
    ) -> Result<Result<(), CategoryError>, ControllerGone> {
        self.request(|reply| Command::SetCategory {
            domain,
            category,
            reply,
        })
        .await
    }

    pub async fn categories(&self) -> Result<OverrideStats, ControllerGone> {
        self.request(Command::Categories).await
    }

    pub async fn current(&self) -> Result<Option<SessionRecord>, ControllerGone> {
        self.request(Command::Current).await
    }
}
