//! Cyclic polling of a register map.
//!
//! A cycle reads every readable register once, in map order, and publishes
//! one [`Sample`] per register. Cycles that fail on the communication level
//! push the next cycle out with exponential backoff.
//!
//! With a non-zero [`PollConfig::slow_interval`], registers not marked
//! `fast_poll` are only read by the first cycle after that interval has
//! passed, while fast ones are read by every cycle. Variables are evaluated
//! after each cycle over the latest sample of every register.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{broadcast, watch, Notify},
    task::JoinHandle,
    time::{sleep, sleep_until},
};

use crate::regs::{Register, RegisterMap};
use crate::sample::{ErrorKind, Sample};
use crate::session::{Link, Session};
use crate::variables::{VariableSet, VariableValue};

#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub interval: Duration,
    /// First backoff delay, doubled on every further failed cycle.
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    /// Minimum time between reads of registers without `fast_poll`. Zero
    /// reads every register on every cycle.
    pub slow_interval: Duration,
    /// Samples buffered per subscriber before it starts lagging.
    pub capacity: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: Duration::from_millis(100),
            backoff_base: Duration::from_millis(100),
            max_backoff: Duration::from_millis(5000),
            slow_interval: Duration::ZERO,
            capacity: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Backoff {
            base,
            cap,
            failures: 0,
        }
    }

    /// Records a failure and returns the delay before the next attempt:
    /// `min(base * 2^(n-1), cap)` after the n-th consecutive failure.
    pub fn fail(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay()
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn delay(&self) -> Duration {
        if self.failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(self.failures - 1).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Polling,
    Publishing,
    Sleeping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    Running(Phase),
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollStatistics {
    pub cycles: u64,
    pub failed_cycles: u64,
    /// Error samples published so far.
    pub errors: u64,
    pub consecutive_failures: u32,
    pub last_cycle: Option<Duration>,
    /// Delay chosen after the last cycle.
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollStatus {
    pub state: SchedulerState,
    pub stats: PollStatistics,
}

#[derive(Error, Debug, PartialEq)]
pub enum PollError {
    #[error("poll scheduler is already running")]
    AlreadyRunning,
    #[error("no readable register to poll")]
    NothingToPoll,
}

pub struct PollScheduler {
    config: PollConfig,
    samples: broadcast::Sender<Sample>,
    variable_values: broadcast::Sender<VariableValue>,
    variables: Arc<VariableSet>,
    status: Arc<watch::Sender<PollStatus>>,
    status_rx: watch::Receiver<PollStatus>,
    waker: Arc<Notify>,
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl PollScheduler {
    pub fn new(config: PollConfig) -> Self {
        let (samples, _) = broadcast::channel(config.capacity.max(1));
        let (variable_values, _) = broadcast::channel(config.capacity.max(1));
        let (status, status_rx) = watch::channel(PollStatus {
            state: SchedulerState::Idle,
            stats: PollStatistics::default(),
        });

        PollScheduler {
            config,
            samples,
            variable_values,
            variables: Arc::new(VariableSet::new()),
            status: Arc::new(status),
            status_rx,
            waker: Arc::new(Notify::new()),
            stop: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Sample> {
        self.samples.subscribe()
    }

    /// Variable values, one per variable and cycle.
    pub fn subscribe_variables(&self) -> broadcast::Receiver<VariableValue> {
        self.variable_values.subscribe()
    }

    /// Variables evaluated by schedulers started from now on.
    pub fn set_variables(&mut self, variables: VariableSet) {
        self.variables = Arc::new(variables);
    }

    pub fn status(&self) -> PollStatus {
        self.status_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PollStatus> {
        self.status_rx.clone()
    }

    /// Notifying it cuts the interval sleep short and starts the next cycle.
    /// A backoff delay after a failed cycle is sat out regardless.
    pub fn waker(&self) -> Arc<Notify> {
        self.waker.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Starts polling the registers of `session`, as they are now.
    pub fn start(&mut self, session: &Session) -> Result<(), PollError> {
        if self.is_running() {
            return Err(PollError::AlreadyRunning);
        }
        let registers = session.registers();
        if !registers.iter().any(|r| r.definition().access.is_readable()) {
            return Err(PollError::NothingToPoll);
        }

        self.stop.store(false, Ordering::SeqCst);
        self.status.send_modify(|status| {
            status.state = SchedulerState::Running(Phase::Polling);
            status.stats = PollStatistics::default();
        });

        let poller = Poller {
            link: session.link(),
            unit: session.unit(),
            latest: vec![None; registers.len()],
            registers,
            variables: self.variables.clone(),
            interval: self.config.interval,
            slow_interval: self.config.slow_interval,
            last_slow: None,
            backoff: Backoff::new(self.config.backoff_base, self.config.max_backoff),
            samples: self.samples.clone(),
            variable_values: self.variable_values.clone(),
            status: self.status.clone(),
            waker: self.waker.clone(),
            stop: self.stop.clone(),
            faulted: HashSet::new(),
            cycle: 0,
        };

        self.task = Some(tokio::spawn(poller.run()));
        Ok(())
    }

    /// Asks the cycle task to finish and waits for it. An exchange already
    /// on the line completes first.
    pub async fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.waker.notify_one();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("poll task ended abnormally: {}", e);
            }
        }

        self.status
            .send_modify(|status| status.state = SchedulerState::Stopped);
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.waker.notify_one();
    }
}

struct Poller {
    link: Link,
    // used for registers without a unit of their own
    unit: u8,
    registers: Arc<RegisterMap>,
    variables: Arc<VariableSet>,
    // last sample of every register, by index
    latest: Vec<Option<Sample>>,
    interval: Duration,
    slow_interval: Duration,
    last_slow: Option<Instant>,
    backoff: Backoff,
    samples: broadcast::Sender<Sample>,
    variable_values: broadcast::Sender<VariableValue>,
    status: Arc<watch::Sender<PollStatus>>,
    waker: Arc<Notify>,
    stop: Arc<AtomicBool>,
    // registers whose configuration fault has already been logged
    faulted: HashSet<usize>,
    cycle: u64,
}

struct CycleOutcome {
    samples: Vec<Sample>,
    failed: bool,
}

impl Poller {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SchedulerState) {
        self.status.send_if_modified(|status| {
            let changed = status.state != state;
            status.state = state;
            changed
        });
    }

    async fn run(mut self) {
        info!(
            "polling {} registers of unit {} every {:?}",
            self.registers.len(),
            self.unit,
            self.interval
        );

        while !self.stopping() {
            let started = Instant::now();
            self.cycle += 1;
            self.set_state(SchedulerState::Running(Phase::Polling));

            let outcome = match self.poll_cycle().await {
                Some(outcome) => outcome,
                None => break,
            };

            self.set_state(SchedulerState::Running(Phase::Publishing));
            let errors = outcome.samples.iter().filter(|s| !s.is_ok()).count() as u64;
            for sample in outcome.samples {
                let index = sample.index;
                // no subscribers is fine
                let _ = self.samples.send(sample.clone());
                if let Some(slot) = self.latest.get_mut(index) {
                    *slot = Some(sample);
                }
            }
            self.publish_variables();

            let elapsed = started.elapsed();
            let delay = if outcome.failed {
                let delay = self.backoff.fail();
                warn!(
                    "cycle {} failed ({} in a row), retrying in {:?}",
                    self.cycle,
                    self.backoff.failures(),
                    delay
                );
                delay
            } else {
                if self.backoff.failures() > 0 {
                    info!("communication restored after {} failed cycles", self.backoff.failures());
                }
                self.backoff.reset();
                self.interval.saturating_sub(elapsed)
            };

            let failures = self.backoff.failures();
            self.status.send_modify(|status| {
                let stats = &mut status.stats;
                stats.cycles += 1;
                stats.failed_cycles += outcome.failed as u64;
                stats.errors += errors;
                stats.consecutive_failures = failures;
                stats.last_cycle = Some(elapsed);
                stats.delay = delay;
            });

            if self.stopping() {
                break;
            }

            self.set_state(SchedulerState::Running(Phase::Sleeping));
            if outcome.failed {
                self.back_off(delay).await;
            } else if delay.is_zero() {
                // give writers and other tasks a turn
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = self.waker.notified() => debug!("woken early"),
                }
            }
        }

        self.set_state(SchedulerState::Stopped);
        info!("polling stopped after {} cycles", self.cycle);
    }

    /// Waits out `delay`. Wakes from writes do not shorten it, a stop
    /// request does.
    async fn back_off(&self, delay: Duration) {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return,
                _ = self.waker.notified() => {
                    if self.stopping() {
                        return;
                    }
                    debug!("wake ignored during backoff");
                }
            }
        }
    }

    fn publish_variables(&self) {
        if self.variables.is_empty() {
            return;
        }
        let latest: Vec<Sample> = self.latest.iter().flatten().cloned().collect();
        for value in self.variables.evaluate(self.cycle, &latest) {
            let _ = self.variable_values.send(value);
        }
    }

    /// Whether this cycle also reads the registers without `fast_poll`.
    fn slow_due(&mut self) -> bool {
        if self.slow_interval.is_zero() {
            return true;
        }
        let due = self
            .last_slow
            .map_or(true, |last| last.elapsed() >= self.slow_interval);
        if due {
            self.last_slow = Some(Instant::now());
        }
        due
    }

    /// Reads every readable register due in this cycle once. `None` when a
    /// stop request interrupted the cycle.
    async fn poll_cycle(&mut self) -> Option<CycleOutcome> {
        let registers = self.registers.clone();
        let slow_due = self.slow_due();
        let mut samples = Vec::with_capacity(registers.len());
        let mut reads = 0;
        let mut comm_failures = 0;
        let mut aborted: Option<String> = None;

        for (index, register) in registers.iter().enumerate() {
            let definition = register.definition();
            if !definition.access.is_readable() || !(slow_due || definition.fast_poll) {
                continue;
            }
            let unit = register.unit_or(self.unit);

            if let Some(reason) = &aborted {
                samples.push(Sample::error(
                    self.cycle,
                    index,
                    unit,
                    register,
                    vec![],
                    ErrorKind::Connection,
                    reason.clone(),
                ));
                continue;
            }

            if self.stopping() {
                return None;
            }

            // the lock is held for exactly one exchange
            let result = self
                .link
                .lock()
                .await
                .read_registers(unit, register.address(), register.count())
                .await;
            reads += 1;

            let sample = match result {
                Ok(words) => self.decode(index, unit, register, words),
                Err(e) => {
                    let kind = ErrorKind::from(&e);
                    if e.is_connection() {
                        warn!("cycle {} aborted: {}", self.cycle, e);
                        aborted = Some(e.to_string());
                    }
                    if kind.is_transient() {
                        comm_failures += 1;
                    } else if kind.is_configuration() {
                        self.note_fault(index, register, &e.to_string());
                    }
                    debug!("register {}: {}", register.address(), e);
                    Sample::error(self.cycle, index, unit, register, vec![], kind, e.to_string())
                }
            };
            samples.push(sample);
        }

        Some(CycleOutcome {
            samples,
            failed: aborted.is_some() || (reads > 0 && comm_failures == reads),
        })
    }

    fn decode(&mut self, index: usize, unit: u8, register: &Register, words: Vec<u16>) -> Sample {
        match register.scale(&words) {
            Ok(value) => {
                if self.faulted.remove(&index) {
                    info!("register {} recovered", register.definition().name());
                }
                Sample::ok(self.cycle, index, unit, register, words, value)
            }
            Err(fault) => {
                self.note_fault(index, register, &fault.to_string());
                let kind = ErrorKind::from(&fault);
                Sample::error(self.cycle, index, unit, register, words, kind, fault.to_string())
            }
        }
    }

    fn note_fault(&mut self, index: usize, register: &Register, reason: &str) {
        if self.faulted.insert(index) {
            warn!("register {}: {}", register.definition().name(), reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataType;
    use crate::protocol::rtu::ExceptionCode;
    use crate::regs::{Access, RegisterDefinition};
    use crate::sample::SampleStatus;
    use crate::testing::Simulated;
    use crate::variables::VariableDefinition;
    use tokio::time::timeout;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(backoff.delay(), Duration::ZERO);

        let delays: Vec<u64> = (0..6).map(|_| backoff.fail().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.fail(), Duration::from_millis(100));
    }

    #[test]
    fn backoff_survives_many_failures() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..100 {
            backoff.fail();
        }
        assert_eq!(backoff.delay(), Duration::from_secs(30));
    }

    async fn collect(rx: &mut broadcast::Receiver<Sample>, n: usize) -> Vec<Sample> {
        let mut out = Vec::new();
        while out.len() < n {
            out.push(rx.recv().await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn one_sample_per_register_and_cycle() {
        let sim = Simulated::new(
            |bank| {
                bank.set(0, &[10]);
                bank.set(1, &[0xFFFF]);
                bank.set(10, &[0x4248, 0x0000]);
                bank.set(20, &[1]);
            },
            vec![
                RegisterDefinition::new(0, DataType::UInt16),
                RegisterDefinition::new(1, DataType::Int16),
                RegisterDefinition::new(5, DataType::UInt16),
                RegisterDefinition::new(10, DataType::Float32).expression("value * 2"),
                RegisterDefinition::new(20, DataType::UInt16).access(Access::W),
            ],
        );

        let mut scheduler = PollScheduler::new(PollConfig {
            interval: Duration::from_millis(10),
            ..Default::default()
        });
        let mut rx = scheduler.subscribe();
        scheduler.start(&sim.session).unwrap();

        let samples = timeout(Duration::from_secs(5), collect(&mut rx, 8))
            .await
            .unwrap();
        scheduler.stop().await;

        for (cycle, chunk) in samples.chunks(4).enumerate() {
            let indexes: Vec<usize> = chunk.iter().map(|s| s.index).collect();
            assert_eq!(indexes, vec![0, 1, 2, 3]);
            assert!(chunk.iter().all(|s| s.cycle == cycle as u64 + 1));

            assert_eq!(chunk[0].value, Some(10.0));
            assert_eq!(chunk[1].value, Some(-1.0));
            assert_eq!(
                chunk[2].status,
                SampleStatus::Error(ErrorKind::IllegalAddress)
            );
            assert_eq!(chunk[2].value, None);
            assert_eq!(chunk[3].value, Some(100.0));
            assert_eq!(chunk[3].raw, vec![0x4248, 0x0000]);
        }

        let status = scheduler.status();
        assert_eq!(status.state, SchedulerState::Stopped);
        assert!(status.stats.cycles >= 2);
        assert_eq!(status.stats.failed_cycles, 0);
        assert!(status.stats.errors >= 2);

        let stats = sim.finish().await;
        assert_eq!(stats.discarded, 0);
        assert_eq!(stats.overlapped, 0);
    }

    #[tokio::test]
    async fn device_exceptions_do_not_fail_the_cycle() {
        let sim = Simulated::new(
            |bank| {
                bank.set(0, &[1]);
                bank.inject_fault(0, ExceptionCode::SlaveDeviceFailure);
            },
            vec![RegisterDefinition::new(0, DataType::UInt16)],
        );

        let mut scheduler = PollScheduler::new(PollConfig {
            interval: Duration::from_millis(5),
            ..Default::default()
        });
        let mut rx = scheduler.subscribe();
        scheduler.start(&sim.session).unwrap();
        let samples = timeout(Duration::from_secs(5), collect(&mut rx, 3))
            .await
            .unwrap();
        scheduler.stop().await;

        assert!(samples
            .iter()
            .all(|s| s.error_kind() == Some(ErrorKind::SlaveDeviceFailure)));
        assert_eq!(scheduler.status().stats.failed_cycles, 0);
    }

    #[tokio::test]
    async fn mute_device_backs_off_then_recovers() {
        let sim = Simulated::with_timeout(
            |bank| {
                bank.set(0, &[1, 2]);
                bank.set_mute(true);
            },
            vec![
                RegisterDefinition::new(0, DataType::UInt16),
                RegisterDefinition::new(1, DataType::UInt16),
            ],
            Duration::from_millis(10),
        );

        let mut scheduler = PollScheduler::new(PollConfig {
            interval: Duration::from_millis(5),
            backoff_base: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            capacity: 64,
            ..Default::default()
        });
        let mut status = scheduler.watch();
        scheduler.start(&sim.session).unwrap();

        let mut seen = Vec::new();
        timeout(Duration::from_secs(5), async {
            while seen.len() < 4 {
                status.changed().await.unwrap();
                let stats = status.borrow().stats.clone();
                if stats.consecutive_failures as usize > seen.len() {
                    seen.push(stats.delay.as_millis() as u64);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(seen, vec![10, 20, 40, 40]);

        sim.bank.lock().await.set_mute(false);
        timeout(Duration::from_secs(5), async {
            loop {
                status.changed().await.unwrap();
                if status.borrow().stats.consecutive_failures == 0 {
                    break;
                }
            }
        })
        .await
        .unwrap();

        scheduler.stop().await;
        let stats = scheduler.status().stats;
        assert!(stats.failed_cycles >= 4);
        assert!(stats.delay <= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn start_twice_and_restart() {
        let sim = Simulated::new(
            |bank| bank.set(0, &[1]),
            vec![RegisterDefinition::new(0, DataType::UInt16)],
        );

        let mut scheduler = PollScheduler::new(PollConfig::default());
        assert_eq!(scheduler.status().state, SchedulerState::Idle);

        scheduler.start(&sim.session).unwrap();
        assert_eq!(scheduler.start(&sim.session), Err(PollError::AlreadyRunning));
        scheduler.stop().await;
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.status().state, SchedulerState::Stopped);

        let mut rx = scheduler.subscribe();
        scheduler.start(&sim.session).unwrap();
        let sample = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.cycle, 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn closed_line_aborts_the_cycle() {
        let sim = Simulated::new(
            |bank| bank.set(0, &[1, 2]),
            vec![
                RegisterDefinition::new(0, DataType::UInt16),
                RegisterDefinition::new(1, DataType::UInt16),
            ],
        );
        sim.session.disconnect().await;

        let mut scheduler = PollScheduler::new(PollConfig::default());
        let mut rx = scheduler.subscribe();
        scheduler.start(&sim.session).unwrap();
        let samples = timeout(Duration::from_secs(5), collect(&mut rx, 2))
            .await
            .unwrap();
        scheduler.stop().await;

        assert!(samples
            .iter()
            .all(|s| s.error_kind() == Some(ErrorKind::Connection)));
        assert!(scheduler.status().stats.failed_cycles >= 1);
    }

    #[tokio::test]
    async fn nothing_readable_is_refused() {
        let sim = Simulated::new(
            |_| {},
            vec![RegisterDefinition::new(0, DataType::UInt16).access(Access::W)],
        );
        let mut scheduler = PollScheduler::new(PollConfig {
            interval: Duration::ZERO,
            ..Default::default()
        });
        assert_eq!(scheduler.start(&sim.session), Err(PollError::NothingToPoll));
        assert!(!scheduler.is_running());

        let empty = Simulated::new(|_| {}, vec![]);
        assert_eq!(scheduler.start(&empty.session), Err(PollError::NothingToPoll));
    }

    #[tokio::test]
    async fn configuration_fault_leaves_siblings_alone() {
        let sim = Simulated::new(
            |bank| bank.set(0, &[4, 5, 6]),
            vec![
                RegisterDefinition::new(0, DataType::UInt16),
                RegisterDefinition::new(1, DataType::UInt16).expression("sqrt(value - 1000)"),
                RegisterDefinition::new(2, DataType::UInt16).expression("value * 10"),
            ],
        );

        let mut scheduler = PollScheduler::new(PollConfig {
            interval: Duration::from_millis(5),
            ..Default::default()
        });
        let mut rx = scheduler.subscribe();
        scheduler.start(&sim.session).unwrap();
        let samples = timeout(Duration::from_secs(5), collect(&mut rx, 6))
            .await
            .unwrap();
        scheduler.stop().await;

        for chunk in samples.chunks(3) {
            assert_eq!(chunk[0].value, Some(4.0));
            assert_eq!(chunk[1].status, SampleStatus::Error(ErrorKind::Expression));
            assert_eq!(chunk[1].raw, vec![5]);
            assert_eq!(chunk[1].value, None);
            assert_eq!(chunk[2].value, Some(60.0));
        }

        let stats = scheduler.status().stats;
        assert_eq!(stats.failed_cycles, 0);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn registers_use_their_own_unit() {
        let sim = Simulated::with_timeout(
            |bank| bank.set(0, &[7, 8]),
            vec![
                RegisterDefinition::new(0, DataType::UInt16),
                RegisterDefinition::new(1, DataType::UInt16).unit(2),
            ],
            Duration::from_millis(20),
        );

        let mut scheduler = PollScheduler::new(PollConfig {
            interval: Duration::from_millis(5),
            ..Default::default()
        });
        let mut rx = scheduler.subscribe();
        scheduler.start(&sim.session).unwrap();
        let samples = timeout(Duration::from_secs(5), collect(&mut rx, 2))
            .await
            .unwrap();
        scheduler.stop().await;

        assert_eq!((samples[0].unit, samples[0].value), (1, Some(7.0)));
        // the simulated device only answers unit 1
        assert_eq!(samples[1].unit, 2);
        assert_eq!(samples[1].error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(scheduler.status().stats.failed_cycles, 0);
    }

    #[tokio::test]
    async fn slow_registers_wait_for_their_interval() {
        let sim = Simulated::new(
            |bank| bank.set(0, &[1, 2]),
            vec![
                RegisterDefinition::new(0, DataType::UInt16).fast_poll(true),
                RegisterDefinition::new(1, DataType::UInt16),
            ],
        );

        let mut scheduler = PollScheduler::new(PollConfig {
            interval: Duration::from_millis(5),
            slow_interval: Duration::from_secs(3600),
            ..Default::default()
        });
        let mut rx = scheduler.subscribe();
        scheduler.start(&sim.session).unwrap();
        let samples = timeout(Duration::from_secs(5), collect(&mut rx, 5))
            .await
            .unwrap();
        scheduler.stop().await;

        let seen: Vec<(u64, usize)> = samples.iter().map(|s| (s.cycle, s.index)).collect();
        assert_eq!(seen, vec![(1, 0), (1, 1), (2, 0), (3, 0), (4, 0)]);
    }

    #[tokio::test]
    async fn idle_cycles_do_not_starve_other_tasks() {
        let sim = Simulated::new(
            |bank| bank.set(0, &[1]),
            vec![RegisterDefinition::new(0, DataType::UInt16)],
        );

        // after the first cycle nothing is due, so cycles never touch the line
        let mut scheduler = PollScheduler::new(PollConfig {
            interval: Duration::ZERO,
            slow_interval: Duration::from_secs(3600),
            ..Default::default()
        });
        scheduler.start(&sim.session).unwrap();

        timeout(Duration::from_secs(5), sleep(Duration::from_millis(20)))
            .await
            .unwrap();
        let other = tokio::spawn(async { 42 });
        assert_eq!(timeout(Duration::from_secs(5), other).await.unwrap().unwrap(), 42);

        scheduler.stop().await;
        assert!(scheduler.status().stats.cycles > 1);
    }

    #[tokio::test]
    async fn variables_follow_every_cycle() {
        let sim = Simulated::new(
            |bank| bank.set(10, &[230, 5]),
            vec![
                RegisterDefinition::new(10, DataType::UInt16),
                RegisterDefinition::new(11, DataType::UInt16).expression("value / 10"),
            ],
        );

        let mut scheduler = PollScheduler::new(PollConfig {
            interval: Duration::from_millis(5),
            ..Default::default()
        });
        scheduler.set_variables(
            VariableSet::from_definitions(vec![
                VariableDefinition::new("power", "R10 * R11"),
                VariableDefinition::new("missing", "R12"),
            ])
            .unwrap(),
        );
        let mut rx = scheduler.subscribe_variables();
        scheduler.start(&sim.session).unwrap();

        let values = timeout(Duration::from_secs(5), async {
            let mut out = Vec::new();
            while out.len() < 4 {
                out.push(rx.recv().await.unwrap());
            }
            out
        })
        .await
        .unwrap();
        scheduler.stop().await;

        for (cycle, pair) in values.chunks(2).enumerate() {
            assert_eq!(pair[0].cycle, cycle as u64 + 1);
            assert_eq!((pair[0].name.as_str(), pair[0].value), ("power", Some(115.0)));
            assert_eq!((pair[1].name.as_str(), pair[1].value), ("missing", None));
        }
    }

    #[tokio::test]
    async fn wakes_do_not_shorten_a_backoff() {
        let sim = Simulated::with_timeout(
            |bank| {
                bank.set(0, &[1]);
                bank.set_mute(true);
            },
            vec![RegisterDefinition::new(0, DataType::UInt16)],
            Duration::from_millis(10),
        );

        let mut scheduler = PollScheduler::new(PollConfig {
            interval: Duration::from_millis(5),
            backoff_base: Duration::from_millis(300),
            max_backoff: Duration::from_millis(300),
            ..Default::default()
        });
        let status = scheduler.watch();
        let waker = scheduler.waker();
        scheduler.start(&sim.session).unwrap();

        let failures = |n: u32| {
            let mut status = status.clone();
            async move {
                while status.borrow().stats.consecutive_failures < n {
                    status.changed().await.unwrap();
                }
                Instant::now()
            }
        };

        let first = timeout(Duration::from_secs(5), failures(1)).await.unwrap();
        waker.notify_one();
        sleep(Duration::from_millis(20)).await;
        waker.notify_one();
        let second = timeout(Duration::from_secs(5), failures(2)).await.unwrap();
        assert!(second - first >= Duration::from_millis(250), "{:?}", second - first);

        scheduler.stop().await;
        assert_eq!(scheduler.status().state, SchedulerState::Stopped);
    }
}
