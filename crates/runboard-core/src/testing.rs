//! Scripted spawn capability for tests.
//!
//! Compiled for this crate's tests and, with the `test-support` feature,
//! for downstream crates that drive a registry without real processes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::broadcast::OutputEvent;
use crate::error::{RunboardError, RunboardResult};
use crate::session::Session;
use crate::spawn::{PtyControl, PtyEvent, PtySpawner, SpawnRequest, SpawnedPty};

/// Control handle that records input and kill requests. A kill makes the
/// process exit, like a real signal would.
#[derive(Clone)]
pub struct ScriptedControl {
    events: Option<mpsc::UnboundedSender<PtyEvent>>,
    input: Arc<Mutex<Vec<u8>>>,
    kills: Arc<AtomicUsize>,
    kill_error: Arc<AtomicBool>,
}

impl ScriptedControl {
    /// A control not wired to any event stream.
    pub fn detached() -> Self {
        Self {
            events: None,
            input: Arc::default(),
            kills: Arc::default(),
            kill_error: Arc::default(),
        }
    }

    /// Make every later kill fail, like signalling an already reaped child.
    pub fn fail_kills(&self) {
        self.kill_error.store(true, Ordering::SeqCst);
    }

    pub fn input(&self) -> Vec<u8> {
        self.input.lock().clone()
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

impl PtyControl for ScriptedControl {
    fn write(&self, data: &[u8]) -> RunboardResult<()> {
        self.input.lock().extend_from_slice(data);
        Ok(())
    }

    fn kill(&self) -> RunboardResult<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if self.kill_error.load(Ordering::SeqCst) {
            return Err(RunboardError::Io(std::io::Error::from_raw_os_error(3)));
        }
        if let Some(events) = &self.events {
            let _ = events.send(PtyEvent::Exit { code: None });
        }
        Ok(())
    }
}

/// Spawner whose processes only do what the test tells them to.
#[derive(Default)]
pub struct ScriptedSpawner {
    next_pid: AtomicU32,
    fail: AtomicBool,
    processes: Mutex<HashMap<u32, ScriptedControl>>,
    requests: Mutex<Vec<SpawnRequest>>,
}

impl ScriptedSpawner {
    pub fn new() -> Arc<Self> {
        let spawner = Self::default();
        spawner.next_pid.store(100, Ordering::SeqCst);
        Arc::new(spawner)
    }

    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    fn control(&self, pid: u32) -> ScriptedControl {
        self.processes
            .lock()
            .get(&pid)
            .cloned()
            .unwrap_or_else(|| panic!("no scripted process {pid}"))
    }

    pub fn emit(&self, pid: u32, data: &[u8]) {
        if let Some(events) = &self.control(pid).events {
            let _ = events.send(PtyEvent::Data(data.to_vec()));
        }
    }

    pub fn exit(&self, pid: u32, code: i32) {
        if let Some(events) = &self.control(pid).events {
            let _ = events.send(PtyEvent::Exit { code: Some(code) });
        }
    }

    pub fn input(&self, pid: u32) -> Vec<u8> {
        self.control(pid).input()
    }

    pub fn kill_count(&self, pid: u32) -> usize {
        self.control(pid).kill_count()
    }

    pub fn requests(&self) -> Vec<SpawnRequest> {
        self.requests.lock().clone()
    }
}

impl PtySpawner for ScriptedSpawner {
    fn spawn(&self, request: SpawnRequest) -> RunboardResult<SpawnedPty> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(RunboardError::Spawn("scripted failure".into()));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let control = ScriptedControl {
            events: Some(tx),
            input: Arc::default(),
            kills: Arc::default(),
            kill_error: Arc::default(),
        };
        self.processes.lock().insert(pid, control.clone());
        self.requests.lock().push(request);
        Ok(SpawnedPty {
            pid,
            control: Box::new(control),
            events: rx,
        })
    }
}

/// Wait until `session` has processed its exit event.
pub async fn wait_finished(session: &Session) {
    let mut attachment = session.attach(false);
    let wait = async {
        while let Some(event) = attachment.subscription.recv().await {
            if event == OutputEvent::End {
                return;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("session did not finish in time");
}

/// Wait until `session` has buffered at least `len` bytes.
pub async fn wait_buffered(session: &Session, len: usize) {
    let wait = async {
        while session.buffer().len() < len {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("output did not arrive in time");
}
