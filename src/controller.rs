//! Delivery controller - decides once per day whether, when and how often to send
//!
//! A synchronous state machine. Every input carries the current wall time and
//! whether the session is open, and returns the [`Action`]s the dispatcher
//! must carry out. Only this type mutates the durable [`SendState`].
//!
//! ```text
//! Idle --fire, open--------> Attempting --success------> Done(Sent)
//!   \--fire, not open--> Waiting --open--^  \--group missing / deadline--> Done(FailedFinal)
//!                          \--deadline--> Done(FailedFinal)
//! Done --local midnight--> Idle
//! ```

use crate::config::Config;
use crate::error::{Error, Result};
use crate::schedule::ScheduleSpec;
use crate::session::ConnectionState;
use crate::state::{SendState, SendStateStore};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Classified result of one resolve-and-send attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    TransportUnavailable,
    SendError(String),
    GroupNotFound(String),
}

impl AttemptOutcome {
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => AttemptOutcome::Success,
            Err(Error::TransportUnavailable) => AttemptOutcome::TransportUnavailable,
            Err(Error::GroupNotFound(name)) => AttemptOutcome::GroupNotFound(name),
            Err(e) => AttemptOutcome::SendError(e.to_string()),
        }
    }

    fn describe(&self) -> String {
        match self {
            AttemptOutcome::Success => "success".to_string(),
            AttemptOutcome::TransportUnavailable => "transport unavailable".to_string(),
            AttemptOutcome::SendError(msg) => msg.clone(),
            AttemptOutcome::GroupNotFound(name) => format!("group \"{}\" not found", name),
        }
    }
}

/// One attempt within a day's retry loop; never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

/// Why a day ended without a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    GroupNotFound(String),
    DeadlineExceeded { last_error: Option<String> },
    SessionUnavailable,
    MissedWindow,
    AuthLost(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::GroupNotFound(name) => write!(f, "group \"{}\" not found", name),
            FailureReason::DeadlineExceeded { last_error: Some(e) } => {
                write!(f, "deadline exceeded (last error: {})", e)
            }
            FailureReason::DeadlineExceeded { last_error: None } => write!(f, "deadline exceeded"),
            FailureReason::SessionUnavailable => {
                write!(f, "session never opened before the deadline")
            }
            FailureReason::MissedWindow => write!(f, "started after the delivery window closed"),
            FailureReason::AuthLost(reason) => write!(f, "logged out: {}", reason),
        }
    }
}

/// Terminal result for one calendar day
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    FailedFinal(FailureReason),
}

impl Outcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Outcome::Sent)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Sent => write!(f, "sent"),
            Outcome::FailedFinal(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// The day's outcome signal handed to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub date: NaiveDate,
    pub outcome: Outcome,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the day's trigger
    Idle,
    /// Triggered, session not open yet
    Waiting { deadline: DateTime<Utc> },
    /// Sending, with retries until the deadline
    Attempting { deadline: DateTime<Utc> },
    Done(Outcome),
}

/// Work the dispatcher performs on the controller's behalf
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Resolve the group and send now, then call `on_attempt_result`
    Attempt,
    ScheduleRetry(DateTime<Utc>),
    ArmDeadline(DateTime<Utc>),
    /// Drop any pending retry and deadline timers
    DisarmTimers,
    Report(DeliveryReport),
}

pub struct DeliveryController {
    spec: ScheduleSpec,
    window: ChronoDuration,
    retry_interval: ChronoDuration,
    store: SendStateStore,
    state: SendState,
    phase: Phase,
    reset_pending: bool,
    attempt_started: Option<DateTime<Utc>>,
    last_attempt: Option<DeliveryAttempt>,
}

impl DeliveryController {
    pub fn new(
        spec: ScheduleSpec,
        window: Duration,
        retry_interval: Duration,
        store: SendStateStore,
        now: DateTime<Utc>,
    ) -> Self {
        let today = spec.local_date(now);
        let state = match store.load(today) {
            Ok(state) => state,
            Err(e) => {
                warn!("Could not read send state, starting fresh: {}", e);
                SendState::fresh(today)
            }
        };
        debug!("Loaded send state: {:?}", state);

        Self {
            spec,
            window: to_chrono(window),
            retry_interval: to_chrono(retry_interval),
            store,
            state,
            phase: Phase::Idle,
            reset_pending: false,
            attempt_started: None,
            last_attempt: None,
        }
    }

    pub fn from_config(config: &Config, store: SendStateStore, now: DateTime<Utc>) -> Result<Self> {
        Ok(Self::new(
            config.schedule()?,
            config.window(),
            config.retry_interval(),
            store,
            now,
        ))
    }

    pub fn state(&self) -> &SendState {
        &self.state
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn last_attempt(&self) -> Option<&DeliveryAttempt> {
        self.last_attempt.as_ref()
    }

    /// End of the delivery window for a local date
    pub fn deadline_for(&self, date: NaiveDate) -> DateTime<Utc> {
        self.spec.fire_on(date) + self.window
    }

    /// Report for the current date once it has reached a terminal outcome
    pub fn completed_report(&self) -> Option<DeliveryReport> {
        match &self.phase {
            Phase::Done(outcome) => Some(DeliveryReport {
                date: self.state.date,
                outcome: outcome.clone(),
                attempts: self.state.attempts,
            }),
            _ => None,
        }
    }

    /// Decide what today still owes at process start (catch-up path)
    pub fn startup(&mut self, now: DateTime<Utc>, connection: ConnectionState) -> Vec<Action> {
        let today = self.spec.local_date(now);
        if today > self.state.date {
            self.start_new_day(today);
        }
        self.evaluate_day(now, connection)
    }

    /// The daily schedule fired
    pub fn on_trigger(&mut self, now: DateTime<Utc>, connection: ConnectionState) -> Vec<Action> {
        let today = self.spec.local_date(now);
        if today > self.state.date {
            if self.is_running() {
                debug!("Trigger for {} while {} is still running, ignoring", today, self.state.date);
                return Vec::new();
            }
            // Midnight reset was missed (host asleep); roll over first
            self.start_new_day(today);
        }

        if self.phase != Phase::Idle {
            debug!("Ignoring duplicate trigger for {} ({:?})", self.state.date, self.phase);
            return Vec::new();
        }

        if self.state.sent {
            info!("Message for {} already delivered, nothing to do", self.state.date);
            self.phase = Phase::Done(Outcome::Sent);
            return Vec::new();
        }

        let deadline = self.deadline_for(self.state.date);
        if now >= deadline {
            return self.finish(now, connection, Outcome::FailedFinal(FailureReason::MissedWindow));
        }

        info!("Delivery due for {} (deadline {})", self.state.date, deadline);
        self.begin(now, connection, deadline)
    }

    /// The session reported a connection state transition
    pub fn on_connection(&mut self, now: DateTime<Utc>, connection: ConnectionState) -> Vec<Action> {
        match self.phase {
            Phase::Waiting { deadline } if connection == ConnectionState::Open => {
                if now >= deadline {
                    return self.finish(
                        now,
                        connection,
                        Outcome::FailedFinal(FailureReason::SessionUnavailable),
                    );
                }
                info!("Session open, attempting delivery for {}", self.state.date);
                self.phase = Phase::Attempting { deadline };
                self.attempt_started = Some(now);
                vec![Action::Attempt]
            }
            _ => Vec::new(),
        }
    }

    /// Result of the attempt requested by [`Action::Attempt`]
    pub fn on_attempt_result(
        &mut self,
        now: DateTime<Utc>,
        connection: ConnectionState,
        outcome: AttemptOutcome,
    ) -> Vec<Action> {
        let deadline = match self.phase {
            Phase::Attempting { deadline } => deadline,
            _ => {
                warn!("Attempt result {:?} outside of an attempt run, ignoring", outcome);
                return Vec::new();
            }
        };

        self.state.attempts += 1;
        self.last_attempt = Some(DeliveryAttempt {
            timestamp: now,
            outcome: outcome.clone(),
        });

        match outcome {
            AttemptOutcome::Success => {
                self.state.sent = true;
                self.persist();
                self.finish(now, connection, Outcome::Sent)
            }
            AttemptOutcome::GroupNotFound(name) => {
                self.persist();
                self.finish(
                    now,
                    connection,
                    Outcome::FailedFinal(FailureReason::GroupNotFound(name)),
                )
            }
            AttemptOutcome::TransportUnavailable | AttemptOutcome::SendError(_) => {
                self.persist();
                let retry_at = self.attempt_started.unwrap_or(now) + self.retry_interval;
                if retry_at >= deadline {
                    warn!(
                        "Attempt {} failed ({}); no time left for another before {}",
                        self.state.attempts,
                        outcome.describe(),
                        deadline
                    );
                    return Vec::new();
                }
                warn!(
                    "Attempt {} failed ({}); retrying at {}",
                    self.state.attempts,
                    outcome.describe(),
                    retry_at
                );
                vec![Action::ScheduleRetry(retry_at)]
            }
        }
    }

    /// The retry timer fired
    pub fn on_retry(&mut self, now: DateTime<Utc>, connection: ConnectionState) -> Vec<Action> {
        match self.phase {
            Phase::Attempting { deadline } if now >= deadline => {
                let last_error = self.last_error();
                self.finish(
                    now,
                    connection,
                    Outcome::FailedFinal(FailureReason::DeadlineExceeded { last_error }),
                )
            }
            Phase::Attempting { .. } => {
                self.attempt_started = Some(now);
                vec![Action::Attempt]
            }
            _ => Vec::new(),
        }
    }

    /// The day's window closed
    pub fn on_deadline(&mut self, now: DateTime<Utc>, connection: ConnectionState) -> Vec<Action> {
        let reason = match self.phase {
            Phase::Waiting { .. } => FailureReason::SessionUnavailable,
            Phase::Attempting { .. } => FailureReason::DeadlineExceeded {
                last_error: self.last_error(),
            },
            _ => return Vec::new(),
        };
        self.finish(now, connection, Outcome::FailedFinal(reason))
    }

    /// Local midnight passed
    pub fn on_midnight(&mut self, now: DateTime<Utc>, connection: ConnectionState) -> Vec<Action> {
        let today = self.spec.local_date(now);
        if today <= self.state.date {
            return Vec::new();
        }
        if self.is_running() {
            info!(
                "Midnight reached while delivery for {} is running; reset deferred",
                self.state.date
            );
            self.reset_pending = true;
            return Vec::new();
        }

        self.start_new_day(today);
        self.evaluate_day(now, connection)
    }

    /// Credentials were revoked; close out a running day
    pub fn on_fatal(&mut self, now: DateTime<Utc>, reason: &str) -> Vec<Action> {
        if !self.is_running() {
            return Vec::new();
        }
        self.reset_pending = false;
        self.finish(
            now,
            ConnectionState::Disconnected,
            Outcome::FailedFinal(FailureReason::AuthLost(reason.to_string())),
        )
    }

    fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Waiting { .. } | Phase::Attempting { .. })
    }

    fn last_error(&self) -> Option<String> {
        self.last_attempt.as_ref().map(|a| a.outcome.describe())
    }

    /// Catch-up: what does the current date owe at `now`?
    fn evaluate_day(&mut self, now: DateTime<Utc>, connection: ConnectionState) -> Vec<Action> {
        if self.state.sent {
            info!("Message for {} already delivered", self.state.date);
            self.phase = Phase::Done(Outcome::Sent);
            return Vec::new();
        }

        let fire = self.spec.fire_on(self.state.date);
        if now < fire {
            self.phase = Phase::Idle;
            return Vec::new();
        }

        let deadline = fire + self.window;
        if now >= deadline {
            return self.finish(now, connection, Outcome::FailedFinal(FailureReason::MissedWindow));
        }

        info!(
            "Scheduled time {} already passed, catching up before {}",
            fire, deadline
        );
        self.begin(now, connection, deadline)
    }

    fn begin(
        &mut self,
        now: DateTime<Utc>,
        connection: ConnectionState,
        deadline: DateTime<Utc>,
    ) -> Vec<Action> {
        self.last_attempt = None;
        if connection == ConnectionState::Open {
            self.phase = Phase::Attempting { deadline };
            self.attempt_started = Some(now);
            vec![Action::ArmDeadline(deadline), Action::Attempt]
        } else {
            info!("Session is {}, waiting for it to open", connection);
            self.phase = Phase::Waiting { deadline };
            vec![Action::ArmDeadline(deadline)]
        }
    }

    fn finish(
        &mut self,
        now: DateTime<Utc>,
        connection: ConnectionState,
        outcome: Outcome,
    ) -> Vec<Action> {
        self.phase = Phase::Done(outcome.clone());
        self.attempt_started = None;

        let mut actions = vec![
            Action::DisarmTimers,
            Action::Report(DeliveryReport {
                date: self.state.date,
                outcome,
                attempts: self.state.attempts,
            }),
        ];

        if self.reset_pending {
            self.reset_pending = false;
            let today = self.spec.local_date(now);
            if today > self.state.date {
                self.start_new_day(today);
                actions.extend(self.evaluate_day(now, connection));
            }
        }
        actions
    }

    /// Open a new record for `date`; the old one is overwritten on disk
    fn start_new_day(&mut self, date: NaiveDate) {
        let closed = std::mem::replace(&mut self.state, SendState::fresh(date));
        info!(
            "Closing record for {} (sent: {}, attempts: {}); new day {}",
            closed.date, closed.sent, closed.attempts, date
        );
        self.phase = Phase::Idle;
        self.attempt_started = None;
        self.last_attempt = None;
        self.persist();
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.state) {
            warn!("Failed to persist send state (continuing in memory): {}", e);
        }
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(1))
}
