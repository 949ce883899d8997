//! Integration tests for the dispatcher
//!
//! Full dispatcher runs against a scripted transport, on paused tokio time
//! so a day of schedule passes in milliseconds.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use daily_dispatch::config::Config;
use daily_dispatch::controller::{DeliveryReport, FailureReason, Outcome};
use daily_dispatch::dispatcher::{Dispatcher, RunMode};
use daily_dispatch::hooks::OutcomeListener;
use daily_dispatch::schedule::{Clock, MonotonicClock};
use daily_dispatch::session::{GroupInfo, Transport, TransportEvent};
use daily_dispatch::state::{SendState, SendStateStore};
use daily_dispatch::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How the scripted transport behaves
#[derive(Default)]
struct Script {
    open_delay: Duration,
    failing_sends: u32,
    always_fail: bool,
    close_on_failure: bool,
    logout_on_send: bool,
    missing_group: bool,
}

#[derive(Default)]
struct ScriptedTransport {
    script: Script,
    opens: AtomicU32,
    send_calls: AtomicU32,
    delivered: Mutex<Vec<(String, String)>>,
    current: Mutex<Option<(u64, mpsc::Sender<TransportEvent>)>>,
}

impl ScriptedTransport {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            ..Default::default()
        })
    }

    fn delivered(&self) -> Vec<(String, String)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, generation: u64, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().unwrap() = Some((generation, events.clone()));

        let delay = self.script.open_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(TransportEvent::opened(generation)).await;
        });
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<GroupInfo>> {
        if self.script.missing_group {
            return Ok(vec![GroupInfo {
                address: "99@g.us".to_string(),
                name: "Work".to_string(),
            }]);
        }
        Ok(vec![GroupInfo {
            address: "1203630@g.us".to_string(),
            name: "Test Group".to_string(),
        }])
    }

    async fn send_text(&self, address: &str, text: &str) -> Result<()> {
        let call = self.send_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if self.script.logout_on_send {
            return Err(Error::Auth("401 logged out".to_string()));
        }
        if self.script.always_fail || call <= self.script.failing_sends {
            if self.script.close_on_failure {
                if let Some((generation, events)) = self.current.lock().unwrap().take() {
                    let _ = events.try_send(TransportEvent::closed(generation, "stream errored"));
                }
            }
            return Err(Error::Send("rate limited".to_string()));
        }

        self.delivered
            .lock()
            .unwrap()
            .push((address.to_string(), text.to_string()));
        Ok(())
    }
}

/// Forwards every report to the test
struct Recorder(mpsc::UnboundedSender<DeliveryReport>);

impl OutcomeListener for Recorder {
    fn on_delivery_outcome(&self, report: &DeliveryReport) {
        let _ = self.0.send(report.clone());
    }
}

fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, d, h, m, 0).unwrap()
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

fn dispatcher(
    temp: &TempDir,
    transport: Arc<ScriptedTransport>,
    start: DateTime<Utc>,
) -> (Dispatcher<ScriptedTransport>, Arc<dyn Clock>) {
    dispatcher_at("09:00", temp, transport, start)
}

fn dispatcher_at(
    send_time: &str,
    temp: &TempDir,
    transport: Arc<ScriptedTransport>,
    start: DateTime<Utc>,
) -> (Dispatcher<ScriptedTransport>, Arc<dyn Clock>) {
    let mut config = Config::for_test(temp.path());
    config.send_time = send_time.to_string();
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::starting_at(start));
    let dispatcher = Dispatcher::new(config, transport, clock.clone()).unwrap();
    (dispatcher, clock)
}

fn stored(temp: &TempDir) -> Option<SendState> {
    SendStateStore::new(Config::for_test(temp.path()).state_path())
        .read()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_sends_once_at_scheduled_time() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(Script::default());
    let (mut dispatcher, clock) = dispatcher(&temp, transport.clone(), at(15, 8, 59));

    let report = dispatcher
        .run(RunMode::Once, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome, Outcome::Sent);
    assert_eq!(report.attempts, 1);
    assert_eq!(report.date, day(15));
    assert_eq!(clock.now(), at(15, 9, 0));
    assert_eq!(
        transport.delivered(),
        vec![("1203630@g.us".to_string(), "Good morning!".to_string())]
    );
    assert_eq!(
        stored(&temp),
        Some(SendState {
            date: day(15),
            sent: true,
            attempts: 1
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_group_not_found_sends_nothing() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(Script {
        missing_group: true,
        ..Default::default()
    });
    let (mut dispatcher, _clock) = dispatcher(&temp, transport.clone(), at(15, 8, 59));

    let report = dispatcher
        .run(RunMode::Once, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        report.outcome,
        Outcome::FailedFinal(FailureReason::GroupNotFound("Test Group".to_string()))
    );
    assert_eq!(report.attempts, 1);
    assert_eq!(transport.send_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_stop_at_window() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(Script {
        always_fail: true,
        ..Default::default()
    });
    let (mut dispatcher, clock) = dispatcher(&temp, transport.clone(), at(15, 8, 59));

    let report = dispatcher
        .run(RunMode::Once, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(
        report.outcome,
        Outcome::FailedFinal(FailureReason::DeadlineExceeded { last_error: Some(_) })
    ));
    assert_eq!(report.attempts, 10);
    assert_eq!(transport.send_calls.load(Ordering::SeqCst), 10);
    assert_eq!(clock.now(), at(15, 9, 5));

    let state = stored(&temp).unwrap();
    assert!(!state.sent);
    assert_eq!(state.attempts, 10);
}

#[tokio::test(start_paused = true)]
async fn test_session_opens_late_within_window() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(Script {
        open_delay: Duration::from_secs(180),
        ..Default::default()
    });
    let (mut dispatcher, clock) = dispatcher(&temp, transport.clone(), at(15, 8, 59));

    let report = dispatcher
        .run(RunMode::Once, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome, Outcome::Sent);
    assert_eq!(report.attempts, 1);
    assert_eq!(clock.now(), at(15, 9, 2));
}

#[tokio::test(start_paused = true)]
async fn test_session_never_opens() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(Script {
        open_delay: Duration::from_secs(3600),
        ..Default::default()
    });
    let (mut dispatcher, _clock) = dispatcher(&temp, transport.clone(), at(15, 8, 59));

    let report = dispatcher
        .run(RunMode::Once, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        report.outcome,
        Outcome::FailedFinal(FailureReason::SessionUnavailable)
    );
    assert_eq!(report.attempts, 0);
    assert!(transport.delivered().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_restart_inside_window_catches_up() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(Script::default());
    let (mut dispatcher, _clock) = dispatcher(&temp, transport.clone(), at(15, 9, 2));

    let report = dispatcher
        .run(RunMode::Once, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome, Outcome::Sent);
    assert_eq!(transport.delivered().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_window_misses_day() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(Script::default());
    let (mut dispatcher, _clock) = dispatcher(&temp, transport.clone(), at(15, 9, 30));

    let report = dispatcher
        .run(RunMode::Once, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome, Outcome::FailedFinal(FailureReason::MissedWindow));
    assert_eq!(transport.send_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_already_sent_today_is_not_resent() {
    let temp = TempDir::new().unwrap();
    SendStateStore::new(Config::for_test(temp.path()).state_path())
        .save(&SendState {
            date: day(15),
            sent: true,
            attempts: 1,
        })
        .unwrap();

    let transport = ScriptedTransport::new(Script::default());
    let (mut dispatcher, _clock) = dispatcher(&temp, transport.clone(), at(15, 9, 1));

    let report = dispatcher
        .run(RunMode::Once, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome, Outcome::Sent);
    assert_eq!(transport.send_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_flapping_connection_delivers_exactly_once() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(Script {
        failing_sends: 2,
        close_on_failure: true,
        ..Default::default()
    });
    let (mut dispatcher, _clock) = dispatcher(&temp, transport.clone(), at(15, 8, 59));

    let report = dispatcher
        .run(RunMode::Once, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome, Outcome::Sent);
    assert_eq!(report.attempts, 3);
    assert_eq!(transport.delivered().len(), 1);
    // Initial connection plus one reconnect per dropped stream
    assert_eq!(transport.opens.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_logout_is_fatal_and_reported() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(Script {
        logout_on_send: true,
        ..Default::default()
    });
    let (mut dispatcher, _clock) = dispatcher(&temp, transport.clone(), at(15, 8, 59));
    let (tx, mut rx) = mpsc::unbounded_channel();
    dispatcher.add_listener(Arc::new(Recorder(tx)));

    let result = dispatcher.run(RunMode::Once, CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::Auth(_))));
    assert!(dispatcher.session().is_terminal());

    let report = rx.recv().await.unwrap();
    assert!(matches!(
        report.outcome,
        Outcome::FailedFinal(FailureReason::AuthLost(_))
    ));
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_daemon_sends_once_per_day() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(Script::default());
    let (mut dispatcher, clock) = dispatcher(&temp, transport.clone(), at(15, 8, 59));
    let (tx, mut rx) = mpsc::unbounded_channel();
    dispatcher.add_listener(Arc::new(Recorder(tx)));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { dispatcher.run(RunMode::Daemon, cancel).await }
    });

    let first = rx.recv().await.unwrap();
    assert_eq!((first.date, first.outcome.clone()), (day(15), Outcome::Sent));

    let second = rx.recv().await.unwrap();
    assert_eq!((second.date, second.outcome.clone()), (day(16), Outcome::Sent));
    assert_eq!(clock.now(), at(16, 9, 0));

    cancel.cancel();
    let last = handle.await.unwrap().unwrap();
    assert_eq!(last.map(|r| r.date), Some(day(16)));

    assert_eq!(transport.delivered().len(), 2);
    assert_eq!(stored(&temp).unwrap().date, day(16));
}

#[tokio::test(start_paused = true)]
async fn test_once_run_crossing_midnight_returns_start_day() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(Script {
        open_delay: Duration::from_secs(180),
        ..Default::default()
    });
    let (mut dispatcher, clock) = dispatcher_at("23:58", &temp, transport.clone(), at(15, 23, 58));
    let (tx, mut rx) = mpsc::unbounded_channel();
    dispatcher.add_listener(Arc::new(Recorder(tx)));

    let report = dispatcher
        .run(RunMode::Once, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        report,
        DeliveryReport {
            date: day(15),
            outcome: Outcome::Sent,
            attempts: 1,
        }
    );
    assert_eq!(clock.now(), at(16, 0, 1));
    assert_eq!(transport.delivered().len(), 1);

    // Exactly one outcome signal, for the start day
    assert_eq!(rx.recv().await.map(|r| r.date), Some(day(15)));
    assert!(rx.try_recv().is_err());

    // The deferred reset still opened the new day's record
    assert_eq!(stored(&temp), Some(SendState::fresh(day(16))));
}

#[tokio::test(start_paused = true)]
async fn test_once_failure_crossing_midnight_is_not_masked() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(Script {
        open_delay: Duration::from_secs(3600),
        ..Default::default()
    });
    let (mut dispatcher, clock) = dispatcher_at("23:58", &temp, transport.clone(), at(15, 23, 58));

    let report = dispatcher
        .run(RunMode::Once, CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.date, day(15));
    assert_eq!(
        report.outcome,
        Outcome::FailedFinal(FailureReason::SessionUnavailable)
    );
    assert_eq!(clock.now(), at(16, 0, 3));
    assert!(transport.delivered().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_daemon_run_crossing_midnight_then_next_day() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(Script {
        open_delay: Duration::from_secs(180),
        ..Default::default()
    });
    let (mut dispatcher, clock) = dispatcher_at("23:58", &temp, transport.clone(), at(15, 23, 58));
    let (tx, mut rx) = mpsc::unbounded_channel();
    dispatcher.add_listener(Arc::new(Recorder(tx)));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { dispatcher.run(RunMode::Daemon, cancel).await }
    });

    let first = rx.recv().await.unwrap();
    assert_eq!((first.date, first.outcome.clone()), (day(15), Outcome::Sent));
    assert_eq!(clock.now(), at(16, 0, 1));
    assert_eq!(transport.delivered().len(), 1);

    let second = rx.recv().await.unwrap();
    assert_eq!((second.date, second.outcome.clone()), (day(16), Outcome::Sent));
    assert_eq!(clock.now(), at(16, 23, 58));

    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert!(rx.try_recv().is_err());
    assert_eq!(transport.delivered().len(), 2);
    assert_eq!(
        stored(&temp),
        Some(SendState {
            date: day(16),
            sent: true,
            attempts: 1
        })
    );
}
