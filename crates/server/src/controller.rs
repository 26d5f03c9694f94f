//! Owns the [`TimerEngine`] and serialises every mutation through one task:
//! manual controls, feed credits and the countdown tick.

use std::{sync::Arc, time::Duration};

use feed_client::FeedEvent;
use shared::{
    domain::{EventCategory, IncrementSettings, SettingsUpdate, TimerState, TimerUpdate},
    error::SettingsError,
    protocol::UiEvent,
};
use storage::Storage;
use thiserror::Error;
use timer_core::{translate, TimerEngine, TimerPhase};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::overlay::BroadcastHub;

#[derive(Debug, Error)]
#[error("timer controller has stopped")]
pub struct ControllerClosed;

#[derive(Debug)]
pub enum TimerCommand {
    Set(u64),
    Add(f64),
    Start,
    Pause,
    Reset,
    Snapshot(oneshot::Sender<TimerState>),
    Increments(oneshot::Sender<IncrementSettings>),
    UpdateSettings(
        SettingsUpdate,
        oneshot::Sender<Result<IncrementSettings, SettingsError>>,
    ),
}

#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<TimerCommand>,
}

impl ControllerHandle {
    async fn send(&self, command: TimerCommand) -> Result<(), ControllerClosed> {
        self.commands.send(command).await.map_err(|_| ControllerClosed)
    }

    /// Applies `command` and returns the state right after it.
    pub async fn apply(&self, command: TimerCommand) -> Result<TimerState, ControllerClosed> {
        self.send(command).await?;
        self.snapshot().await
    }

    pub async fn snapshot(&self) -> Result<TimerState, ControllerClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(TimerCommand::Snapshot(tx)).await?;
        rx.await.map_err(|_| ControllerClosed)
    }

    pub async fn increments(&self) -> Result<IncrementSettings, ControllerClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(TimerCommand::Increments(tx)).await?;
        rx.await.map_err(|_| ControllerClosed)
    }

    pub async fn update_settings(
        &self,
        update: SettingsUpdate,
    ) -> Result<Result<IncrementSettings, SettingsError>, ControllerClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(TimerCommand::UpdateSettings(update, tx)).await?;
        rx.await.map_err(|_| ControllerClosed)
    }
}

/// Increment settings from storage, or the defaults when the document is
/// missing, unreadable or invalid.
pub fn load_increments(storage: &Storage) -> IncrementSettings {
    match storage.load_increments() {
        Ok(Some(increments)) => match increments.validate() {
            Ok(()) => increments,
            Err(error) => {
                warn!(%error, "stored increment settings are invalid; using defaults");
                IncrementSettings::default()
            }
        },
        Ok(None) => IncrementSettings::default(),
        Err(error) => {
            warn!(%error, "failed to load increment settings; using defaults");
            IncrementSettings::default()
        }
    }
}

pub struct TimerController {
    engine: TimerEngine,
    increments: IncrementSettings,
    storage: Storage,
    hub: Arc<BroadcastHub>,
    ui: broadcast::Sender<UiEvent>,
    tick_interval: Duration,
}

impl TimerController {
    pub fn new(
        engine: TimerEngine,
        increments: IncrementSettings,
        storage: Storage,
        hub: Arc<BroadcastHub>,
        ui: broadcast::Sender<UiEvent>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            engine,
            increments,
            storage,
            hub,
            ui,
            tick_interval,
        }
    }

    pub fn spawn(self, feed: Option<mpsc::UnboundedReceiver<FeedEvent>>) -> ControllerHandle {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(self.run(rx, feed));
        ControllerHandle { commands: tx }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<TimerCommand>,
        mut feed: Option<mpsc::UnboundedReceiver<FeedEvent>>,
    ) {
        let mut ticker: Option<Interval> = None;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_feed_event(&mut feed) => match event {
                    Some(event) => self.handle_feed_event(event).await,
                    None => {
                        debug!("feed event stream ended");
                        feed = None;
                    }
                },
                _ = next_tick(&mut ticker) => {
                    if let Some(update) = self.engine.tick() {
                        self.publish(update).await;
                    }
                }
            }

            match (self.engine.phase() == TimerPhase::Running, ticker.is_some()) {
                (true, false) => {
                    let mut interval = time::interval_at(
                        Instant::now() + self.tick_interval,
                        self.tick_interval,
                    );
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    ticker = Some(interval);
                }
                (false, true) => ticker = None,
                _ => {}
            }
        }
        info!("timer controller stopped");
    }

    async fn handle_command(&mut self, command: TimerCommand) {
        match command {
            TimerCommand::Set(seconds) => {
                let update = self.engine.set_time(seconds);
                self.publish(update).await;
            }
            TimerCommand::Add(seconds) => {
                let update = self.engine.add_time(seconds);
                self.publish(update).await;
            }
            TimerCommand::Start => {
                if let Some(update) = self.engine.start() {
                    self.publish(update).await;
                }
            }
            TimerCommand::Pause => {
                let update = self.engine.pause();
                self.publish(update).await;
            }
            TimerCommand::Reset => {
                let update = self.engine.reset();
                self.publish(update).await;
            }
            TimerCommand::Snapshot(reply) => {
                let _ = reply.send(self.engine.state());
            }
            TimerCommand::Increments(reply) => {
                let _ = reply.send(self.increments);
            }
            TimerCommand::UpdateSettings(update, reply) => {
                let _ = reply.send(self.update_settings(update).await);
            }
        }
    }

    async fn update_settings(
        &mut self,
        update: SettingsUpdate,
    ) -> Result<IncrementSettings, SettingsError> {
        update.increments.validate()?;
        self.increments = update.increments;
        if let Err(error) = self.storage.save_increments(&self.increments) {
            warn!(%error, "failed to persist increment settings");
        }
        if let Some(theme) = update.theme() {
            self.hub.update_theme(theme).await;
        }
        info!(increments = ?self.increments, "increment settings updated");
        Ok(self.increments)
    }

    async fn handle_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Status(status) => {
                let _ = self.ui.send(UiEvent::FeedStatus { status });
            }
            FeedEvent::Notification(notification) => {
                let category = notification.subscription.kind.as_str();
                if EventCategory::from_type(category).is_none() {
                    debug!(category, "passing through unrecognised notification");
                    let _ = self.ui.send(UiEvent::RawNotification(notification));
                    return;
                }
                let translation = translate(category, &notification.event, &self.increments);
                if !translation.is_credit() {
                    info!(reason = %translation.reason, "no time credited");
                    return;
                }
                info!(
                    delta_seconds = translation.delta_seconds,
                    reason = %translation.reason,
                    "crediting time"
                );
                let _ = self.ui.send(UiEvent::TimerIncrement {
                    time_to_add: translation.delta_seconds,
                    reason: translation.reason,
                });
                let update = self.engine.add_time(translation.delta_seconds);
                debug!(
                    remaining_seconds = update.remaining_seconds,
                    carry_millis = self.engine.carry_millis(),
                    "feed credit applied"
                );
                self.publish(update).await;
            }
        }
    }

    async fn publish(&self, update: TimerUpdate) {
        let _ = self.ui.send(UiEvent::TimerUpdate(update));
        self.hub.broadcast_timer(self.engine.state()).await;
    }
}

async fn next_feed_event(
    feed: &mut Option<mpsc::UnboundedReceiver<FeedEvent>>,
) -> Option<FeedEvent> {
    match feed {
        Some(feed) => feed.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) -> Instant {
    match ticker {
        Some(ticker) => ticker.tick().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
