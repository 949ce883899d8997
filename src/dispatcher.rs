//! The dispatcher loop
//!
//! Single owner of the session, the controller and every timer. Transport
//! events, schedule ticks and timer expiries are serialized through one
//! `select!` so no two of them ever act on the controller at the same time.

use crate::config::Config;
use crate::controller::{Action, AttemptOutcome, DeliveryController, DeliveryReport};
use crate::error::{Error, Result};
use crate::hooks::{notify_all, OutcomeListener};
use crate::schedule::{Clock, ScheduleClock};
use crate::session::{SessionManager, StateChange, Transport, TransportEvent};
use crate::state::SendStateStore;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Daily ticks from the schedule clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Fire,
    Midnight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run until cancelled, one delivery per day
    Daemon,
    /// Return as soon as the current day has an outcome
    Once,
}

enum Wake {
    Shutdown,
    Transport(TransportEvent),
    Connection(StateChange),
    Tick(Tick),
    Reconnect,
    Retry,
    Deadline,
}

type Timer = Option<Pin<Box<Sleep>>>;

async fn wait(timer: &mut Timer) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

pub struct Dispatcher<T: Transport> {
    config: Config,
    clock: Arc<dyn Clock>,
    session: SessionManager<T>,
    controller: DeliveryController,
    transport_rx: mpsc::Receiver<TransportEvent>,
    state_rx: mpsc::UnboundedReceiver<StateChange>,
    listeners: Vec<Arc<dyn OutcomeListener>>,
    /// In `RunMode::Once`, the date whose report ends the run
    once_date: Option<NaiveDate>,
    once_report: Option<DeliveryReport>,
    reconnect: Timer,
    retry: Timer,
    deadline: Timer,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(config: Config, transport: Arc<T>, clock: Arc<dyn Clock>) -> Result<Self> {
        let (transport_tx, transport_rx) = mpsc::channel(32);
        let mut session = SessionManager::new(transport, transport_tx, &config);
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        session.on_state_change(Box::new(move |change| {
            let _ = state_tx.send(*change);
        }));
        let store = SendStateStore::new(config.state_path());
        let controller = DeliveryController::from_config(&config, store, clock.now())?;

        Ok(Self {
            config,
            clock,
            session,
            controller,
            transport_rx,
            state_rx,
            listeners: Vec::new(),
            once_date: None,
            once_report: None,
            reconnect: None,
            retry: None,
            deadline: None,
        })
    }

    pub fn add_listener(&mut self, listener: Arc<dyn OutcomeListener>) {
        self.listeners.push(listener);
    }

    pub fn controller(&self) -> &DeliveryController {
        &self.controller
    }

    pub fn session(&self) -> &SessionManager<T> {
        &self.session
    }

    /// Drive deliveries until `cancel` fires (or, in [`RunMode::Once`], until
    /// the outcome for the date the run started on is known).
    ///
    /// In `Once` mode the returned report is always for that start date, even
    /// when its run finishes after local midnight. Losing the session's
    /// credentials ends the loop with `Error::Auth`.
    pub async fn run(
        &mut self,
        mode: RunMode,
        cancel: CancellationToken,
    ) -> Result<Option<DeliveryReport>> {
        let spec = self.config.schedule()?;
        let (tick_tx, mut tick_rx) = mpsc::channel(8);
        let mut schedule = ScheduleClock::new(self.clock.clone(), &cancel);
        schedule.arm(spec, tick_tx.clone(), Tick::Fire);
        schedule.arm_daily_reset(spec.timezone, tick_tx, Tick::Midnight);

        info!(
            "Dispatching to \"{}\" daily at {} (state: {})",
            self.config.group,
            spec,
            self.config.state_path().display()
        );

        let run_date = spec.local_date(self.clock.now());
        if mode == RunMode::Once {
            self.once_date = Some(run_date);
        }

        self.connect().await?;
        let actions = self.controller.startup(self.clock.now(), self.session.state());
        self.execute(actions).await?;

        loop {
            if mode == RunMode::Once {
                // Already-sent days finish without emitting a report
                let done = self.once_report.take().or_else(|| {
                    self.controller
                        .completed_report()
                        .filter(|r| r.date == run_date)
                });
                if let Some(report) = done {
                    schedule.cancel();
                    return Ok(Some(report));
                }
            }

            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Shutdown,
                Some(event) = self.transport_rx.recv() => Wake::Transport(event),
                Some(change) = self.state_rx.recv() => Wake::Connection(change),
                Some(tick) = tick_rx.recv() => Wake::Tick(tick),
                _ = wait(&mut self.reconnect) => Wake::Reconnect,
                _ = wait(&mut self.retry) => Wake::Retry,
                _ = wait(&mut self.deadline) => Wake::Deadline,
            };

            let now = self.clock.now();
            let state = self.session.state();
            match wake {
                Wake::Shutdown => {
                    info!("Shutting down dispatcher");
                    return Ok(self.controller.completed_report());
                }
                Wake::Transport(event) => self.on_transport_event(event)?,
                Wake::Connection(change) if change.state == state => {
                    let actions = self.controller.on_connection(now, change.state);
                    self.execute(actions).await?;
                }
                Wake::Connection(change) => {
                    debug!("Skipping superseded transition to {}", change.state);
                }
                Wake::Tick(Tick::Fire) => {
                    debug!("Schedule fired at {}", now);
                    let actions = self.controller.on_trigger(now, state);
                    self.execute(actions).await?;
                }
                Wake::Tick(Tick::Midnight) => {
                    let actions = self.controller.on_midnight(now, state);
                    self.execute(actions).await?;
                }
                Wake::Reconnect => {
                    self.reconnect = None;
                    self.connect().await?;
                }
                Wake::Retry => {
                    self.retry = None;
                    let actions = self.controller.on_retry(now, state);
                    self.execute(actions).await?;
                }
                Wake::Deadline => {
                    self.deadline = None;
                    let actions = self.controller.on_deadline(now, state);
                    self.execute(actions).await?;
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<()> {
        match self.session.connect().await {
            Ok(()) => {
                self.schedule_reconnect();
                Ok(())
            }
            Err(Error::Auth(reason)) => Err(self.fatal(reason)),
            Err(e) => Err(e),
        }
    }

    /// Transitions reach the controller through the session's state listener
    fn on_transport_event(&mut self, event: TransportEvent) -> Result<()> {
        match self.session.handle_event(event) {
            Ok(_) => {}
            Err(Error::Auth(reason)) => return Err(self.fatal(reason)),
            Err(e) => warn!("Transport event failed: {}", e),
        }
        self.schedule_reconnect();
        Ok(())
    }

    async fn execute(&mut self, actions: Vec<Action>) -> Result<()> {
        let mut queue: VecDeque<Action> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                Action::Attempt => {
                    let result = self
                        .session
                        .deliver(&self.config.group, &self.config.message)
                        .await;
                    if let Err(Error::Auth(reason)) = result {
                        return Err(self.fatal(reason));
                    }

                    let outcome = AttemptOutcome::from_result(result);
                    let follow_up = self.controller.on_attempt_result(
                        self.clock.now(),
                        self.session.state(),
                        outcome,
                    );
                    queue.extend(follow_up);
                    self.schedule_reconnect();
                }
                Action::ScheduleRetry(at) => self.retry = Some(self.timer_at(at)),
                Action::ArmDeadline(at) => self.deadline = Some(self.timer_at(at)),
                Action::DisarmTimers => {
                    self.retry = None;
                    self.deadline = None;
                }
                Action::Report(report) => {
                    notify_all(&self.listeners, &report);
                    if self.once_date == Some(report.date) && self.once_report.is_none() {
                        // Anything queued after this belongs to the next day
                        self.once_report = Some(report);
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Close out the day after a logout and produce the error to return
    fn fatal(&mut self, reason: String) -> Error {
        self.reconnect = None;
        self.retry = None;
        self.deadline = None;

        for action in self.controller.on_fatal(self.clock.now(), &reason) {
            if let Action::Report(report) = action {
                notify_all(&self.listeners, &report);
            }
        }
        Error::Auth(reason)
    }

    fn schedule_reconnect(&mut self) {
        if let Some(delay) = self.session.take_reconnect_request() {
            debug!("Reconnect scheduled in {:?}", delay);
            self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
        }
    }

    fn timer_at(&self, at: DateTime<Utc>) -> Pin<Box<Sleep>> {
        Box::pin(tokio::time::sleep_until(self.clock.instant_at(at)))
    }
}

/// Cancel the returned token on SIGINT or SIGTERM
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT, shutting down"),
                        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    warn!("Could not install SIGTERM handler: {}", e);
                    let _ = ctrl_c.await;
                    info!("Received SIGINT, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received Ctrl+C, shutting down");
        }

        token_clone.cancel();
    });

    token
}
