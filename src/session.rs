//! One live connection to the bench: the link, its two background loops and the
//! telemetry they maintain.
//!
//! - The **receive loop** drains the port, decodes frames and folds them into the
//!   [`TelemetryStore`]. It stops on the first read error.
//! - The **keep-alive loop** waits for the one-shot "board configured" signal,
//!   then sends the status request every `keep_alive_period` until stopped. It
//!   stops on the first write error.
//!
//! Both loops share the link with the foreground [`TestSequencer`]; the link's
//! writer lock keeps their commands from interleaving on the wire.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info, trace, warn};
use parking_lot::RwLock;

use crate::codec::{Command, CommandFrame, FrameDecoder, TelemetryEvent};
use crate::config::{BenchConfig, TestProfile, WireTiming};
use crate::discovery;
use crate::errors::{BenchError, Result};
use crate::link::Link;
use crate::report::TestResult;
use crate::sequencer::{bring_up_board, CancelToken, TestSequencer, TestStage};
use crate::store::{TelemetrySnapshot, TelemetryStore};

/// Opens a fresh link; called at start-up and again on every link reset.
pub type Connector = Box<dyn FnMut() -> Result<Link> + Send>;

fn keep_alive_loop(
    link: Arc<Link>,
    frame: CommandFrame,
    wire: WireTiming,
    period: Duration,
    ready: Receiver<()>,
    stop: Receiver<()>,
) {
    select! {
        recv(ready) -> msg => {
            if msg.is_err() {
                debug!("keep-alive: session ended before the board was configured");
                return;
            }
        }
        recv(stop) -> _ => return,
    }
    info!("keep-alive running every {:?}", period);

    loop {
        if let Err(e) = link.send(&frame, &wire) {
            error!("keep-alive stopped: {}", e);
            return;
        }
        trace!("keep-alive sent");
        match stop.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => return,
        }
    }
}

fn receive_loop(link: Arc<Link>, store: Arc<TelemetryStore>, poll: Duration, stop: Receiver<()>) {
    let mut decoder = FrameDecoder::new();
    loop {
        match stop.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => break,
        }

        let chunk = match link.read_available() {
            Ok(chunk) => chunk,
            Err(e) => {
                error!("receive loop stopped: {}", e);
                break;
            }
        };
        if chunk.is_empty() {
            match stop.recv_timeout(poll) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        }

        trace!("RX {}", hex::encode(&chunk));
        let Some(event) = decoder.push(&chunk) else {
            continue;
        };
        match &event {
            TelemetryEvent::Unrecognized(raw) => {
                debug!("dropping unrecognized frame ({} bytes)", raw.len())
            }
            TelemetryEvent::Ack => trace!("ack"),
            _ => {}
        }
        store.apply(&event);
    }
    debug!("receive loop exited");
}

/// Handles of the two background threads.
struct Workers {
    stop: Option<Sender<()>>,
    ready: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    fn spawn(link: &Arc<Link>, store: &Arc<TelemetryStore>, config: &BenchConfig) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (ready_tx, ready_rx) = bounded::<()>(1);
        let mut workers = Self {
            stop: Some(stop_tx),
            ready: Some(ready_tx),
            handles: Vec::with_capacity(2),
        };

        let rx_link = Arc::clone(link);
        let rx_store = Arc::clone(store);
        let rx_stop = stop_rx.clone();
        let poll = config.poll_interval();
        workers.handles.push(
            thread::Builder::new()
                .name("dze-receive".into())
                .spawn(move || receive_loop(rx_link, rx_store, poll, rx_stop))?,
        );

        let ka_link = Arc::clone(link);
        let frame = Command::StatusRequest.frame()?;
        let wire = config.wire;
        let period = config.keep_alive_period();
        workers.handles.push(
            thread::Builder::new()
                .name("dze-keep-alive".into())
                .spawn(move || keep_alive_loop(ka_link, frame, wire, period, ready_rx, stop_rx))?,
        );

        Ok(workers)
    }

    /// Fire the one-shot signal that lets the keep-alive loop start.
    fn release_keep_alive(&mut self) {
        if let Some(ready) = self.ready.take() {
            if ready.send(()).is_err() {
                warn!("keep-alive loop exited before it was released");
            }
        }
    }

    fn stop(&mut self) {
        // Dropping the senders disconnects both loops' receivers.
        self.ready.take();
        self.stop.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("background loop panicked");
            }
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A live bench session.
pub struct Session {
    config: BenchConfig,
    profile: TestProfile,
    connect: Connector,
    link: Arc<Link>,
    store: Arc<TelemetryStore>,
    stage: Arc<RwLock<TestStage>>,
    workers: Option<Workers>,
}

impl Session {
    /// Open the configured port (or discover it over USB) and bring the board up.
    pub fn open(config: BenchConfig) -> Result<Self> {
        let port = match &config.port {
            Some(port) => port.clone(),
            None => discovery::find_bench_port(&config.usb)?,
        };
        let baud_rate = config.baud_rate;
        let read_timeout = config.read_timeout();
        Self::with_connector(
            config,
            Box::new(move || Link::open(&port, baud_rate, read_timeout)),
        )
    }

    /// Start a session over links produced by `connect`, e.g. a simulated bench.
    pub fn with_connector(config: BenchConfig, mut connect: Connector) -> Result<Self> {
        let profile = config.test_profile()?;
        let link = Arc::new(connect()?);
        let store = Arc::new(TelemetryStore::new(profile.voltage_scale));

        let mut session = Self {
            config,
            profile,
            connect,
            link,
            store,
            stage: Arc::new(RwLock::new(TestStage::Idle)),
            workers: None,
        };
        session.start()?;
        Ok(session)
    }

    fn start(&mut self) -> Result<()> {
        let mut workers = Workers::spawn(&self.link, &self.store, &self.config)?;
        bring_up_board(&self.link, &self.config.bring_up_wire)?;
        workers.release_keep_alive();
        self.workers = Some(workers);
        info!("session on {} ready", self.link.port());
        Ok(())
    }

    /// Run one acceptance test. `cancel` may be triggered from any thread.
    pub fn run_test(&self, cancel: &CancelToken) -> Result<TestResult> {
        if self.workers.is_none() {
            return Err(BenchError::LinkClosed);
        }
        let mut sequencer = TestSequencer::new(&self.link, &self.store, &self.profile, self.config.wire)
            .with_cancel(cancel.clone())
            .with_stage(Arc::clone(&self.stage));
        if self.config.bring_up_each_test {
            sequencer = sequencer.with_bring_up(self.config.bring_up_wire);
        }
        sequencer.run()
    }

    /// Close and reopen the link, then bring the board up again.
    pub fn reset_link(&mut self) -> Result<()> {
        info!("resetting link {}", self.link.port());
        self.stop();
        self.store.clear();
        *self.stage.write() = TestStage::Idle;
        thread::sleep(self.config.reset_delay());

        self.link = Arc::new((self.connect)()?);
        self.start()
    }

    /// Stop both loops and close the link. Idempotent.
    pub fn shutdown(&mut self) {
        if self.workers.is_some() {
            info!("shutting down session on {}", self.link.port());
        }
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(mut workers) = self.workers.take() {
            workers.stop();
        }
        self.link.close();
    }

    /// Switch to another profile; takes effect with the next test.
    pub fn set_profile(&mut self, profile: TestProfile) {
        self.store.set_voltage_scale(profile.voltage_scale);
        self.profile = profile;
    }

    pub fn profile(&self) -> &TestProfile {
        &self.profile
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.store.snapshot()
    }

    pub fn store(&self) -> Arc<TelemetryStore> {
        Arc::clone(&self.store)
    }

    pub fn stage(&self) -> TestStage {
        *self.stage.read()
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn is_running(&self) -> bool {
        self.workers.is_some() && self.link.is_open()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("link", &self.link)
            .field("profile", &self.profile.name)
            .field("stage", &self.stage())
            .finish()
    }
}
