//! Scripted client sessions against an in-process lock manager.
//!
//! Each inbound call runs on its own blocking task, the way a server hands
//! every request to a worker thread. The loopback transport records what
//! the server sends so the scripts can wait on it and check the outcome.

use anyhow::{anyhow, Context};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::LockdConfig;
use crate::dispatch::{Dispatcher, Disposition, OperationKind};
use crate::granted::GrantOutcome;
use crate::logging::{LogEvent, MemoryDiagnostics};
use crate::metrics::MetricsSnapshot;
use crate::primitive::MemoryLockTable;
use crate::region::{ClientId, FileHandle, OwnerId};
use crate::store::MemoryFileStore;
use crate::transport::{RecordingTransport, TransportEvent};
use crate::wire::{Alock, Call, CallArgs, CallHeader, Extent, NlmStatus, ProtocolVersion};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Scenario {
    Blocked,
    LostGrant,
    UnlockRace,
    Disjoint,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::Blocked,
        Scenario::LostGrant,
        Scenario::UnlockRace,
        Scenario::Disjoint,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::Blocked => "blocked",
            Scenario::LostGrant => "lost-grant",
            Scenario::UnlockRace => "unlock-race",
            Scenario::Disjoint => "disjoint",
        }
    }

    /// Accepts the scenario name or its letter (`a` to `d`).
    pub fn parse(s: &str) -> Option<Scenario> {
        let s = s.to_ascii_lowercase();
        Self::ALL.iter().enumerate().find_map(|(i, scenario)| {
            let letter = ((b'a' + i as u8) as char).to_string();
            (s == scenario.name() || s == letter).then_some(*scenario)
        })
    }

    pub fn description(self) -> &'static str {
        match self {
            Scenario::Blocked => "blocking LOCK waits behind another owner and is granted once it unlocks",
            Scenario::LostGrant => "granted callback is lost; the retransmitted LOCK is answered GRANTED",
            Scenario::UnlockRace => "client unlocks before it sees the granted callback",
            Scenario::Disjoint => "two clients block on adjacent ranges and are granted independently",
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub label: String,
    pub disposition: String,
    pub stat: Option<NlmStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub description: &'static str,
    pub passed: bool,
    pub checks: Vec<Check>,
    pub steps: Vec<Step>,
    pub granted_notices: usize,
    /// Blocked requests on the file while the scenario was waiting
    pub registry_dump: Vec<String>,
    pub metrics: MetricsSnapshot,
    pub trace: Vec<LogEvent>,
}

impl ScenarioReport {
    fn new(scenario: Scenario) -> Self {
        ScenarioReport {
            scenario,
            description: scenario.description(),
            passed: true,
            checks: Vec::new(),
            steps: Vec::new(),
            granted_notices: 0,
            registry_dump: Vec::new(),
            metrics: MetricsSnapshot::default(),
            trace: Vec::new(),
        }
    }

    fn check(&mut self, name: impl Into<String>, passed: bool) {
        let name = name.into();
        if !passed {
            log::warn!("check failed: {}", name);
        }
        self.passed &= passed;
        self.checks.push(Check { name, passed });
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl std::fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Scenario {}: {} [{}]",
            self.scenario,
            self.description,
            if self.passed { "PASS" } else { "FAIL" }
        )?;
        writeln!(f, "  Calls:")?;
        for step in &self.steps {
            writeln!(f, "    {:<40} {}", step.label, step.disposition)?;
        }
        writeln!(f, "  Checks:")?;
        for check in &self.checks {
            writeln!(f, "    [{}] {}", if check.passed { "ok" } else { "FAILED" }, check.name)?;
        }
        if !self.registry_dump.is_empty() {
            writeln!(f, "  Blocked requests:")?;
            for line in &self.registry_dump {
                writeln!(f, "    {}", line)?;
            }
        }
        writeln!(f, "  Granted notices sent: {}", self.granted_notices)?;
        write!(f, "{}", self.metrics)
    }
}

/// One lock manager with in-memory collaborators.
pub struct Simulation {
    dispatcher: Arc<Dispatcher>,
    transport: Arc<RecordingTransport>,
    locks: Arc<MemoryLockTable>,
    diagnostics: Arc<MemoryDiagnostics>,
    steps: Arc<Mutex<Vec<Step>>>,
    next_xid: AtomicU32,
    retry_interval: Duration,
}

impl Simulation {
    pub fn new(config: &LockdConfig) -> Self {
        let mut config = config.clone();
        // Scripts issue fresh requests right away and cancel lost
        // callbacks themselves
        config.recovery.grace_period_ms = 0;
        config.grant.max_attempts = None;

        let store = Arc::new(MemoryFileStore::new());
        store.export(file());
        let locks = Arc::new(MemoryLockTable::with_capacity(config.limits.max_locks));
        let transport = Arc::new(RecordingTransport::new());
        let diagnostics = MemoryDiagnostics::from_config(&config.diagnostics);
        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            store,
            locks.clone(),
            transport.clone(),
            diagnostics.clone(),
        ));

        Simulation {
            dispatcher,
            transport,
            locks,
            diagnostics,
            steps: Arc::new(Mutex::new(Vec::new())),
            next_xid: AtomicU32::new(0x100),
            retry_interval: config.grant.retry_interval(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn transport(&self) -> &Arc<RecordingTransport> {
        &self.transport
    }

    pub fn locks(&self) -> &Arc<MemoryLockTable> {
        &self.locks
    }

    fn header(&self, kind: OperationKind, client: u32) -> CallHeader {
        CallHeader {
            version: ProtocolVersion::V4,
            kind,
            xid: self.next_xid.fetch_add(1, Ordering::Relaxed),
            client: ClientId(client),
        }
    }

    pub fn lock(&self, client: u32, offset: u64, len: u64, block: bool) -> Call {
        let header = self.header(OperationKind::Lock, client);
        let cookie = header.xid.to_be_bytes().to_vec();
        Call {
            header,
            args: CallArgs::Lock {
                cookie,
                block,
                exclusive: true,
                alock: alock(client, offset, len),
                reclaim: false,
                state: 0,
            },
        }
    }

    pub fn unlock(&self, client: u32, offset: u64, len: u64) -> Call {
        let header = self.header(OperationKind::Unlock, client);
        let cookie = header.xid.to_be_bytes().to_vec();
        Call {
            header,
            args: CallArgs::Unlock {
                cookie,
                alock: alock(client, offset, len),
            },
        }
    }

    /// Dispatch `call` on a blocking task.
    pub fn spawn(&self, label: impl Into<String>, call: Call) -> JoinHandle<Disposition> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let steps = Arc::clone(&self.steps);
        let label = label.into();
        tokio::task::spawn_blocking(move || {
            let disposition = dispatcher.dispatch(&call);
            steps.lock().unwrap_or_else(PoisonError::into_inner).push(Step {
                label,
                disposition: describe(&disposition),
                stat: disposition.stat(),
            });
            disposition
        })
    }

    pub async fn call(&self, label: impl Into<String>, call: Call) -> anyhow::Result<Disposition> {
        join(self.spawn(label, call)).await
    }

    /// Wait until the recorded traffic satisfies `pred`.
    pub async fn wait_for<F>(&self, what: &str, pred: F) -> anyhow::Result<()>
    where
        F: Fn(&[TransportEvent]) -> bool + Send + 'static,
    {
        let transport = Arc::clone(&self.transport);
        let seen = tokio::task::spawn_blocking(move || transport.wait_for(WAIT, pred)).await?;
        if seen {
            Ok(())
        } else {
            Err(anyhow!("timed out waiting for {}", what))
        }
    }

    pub async fn wait_for_reply(&self, xid: u32, stat: NlmStatus) -> anyhow::Result<()> {
        self.wait_for(&format!("{:?} reply to xid {:#x}", stat, xid), move |events| {
            events.iter().any(|e| match e {
                TransportEvent::Response { xid: x, reply, .. } | TransportEvent::Result { xid: x, reply, .. } => {
                    *x == xid && reply.stat() == Some(stat)
                }
                TransportEvent::Granted { .. } => false,
            })
        })
        .await
    }

    pub async fn wait_for_granted(&self, client: u32) -> anyhow::Result<()> {
        let client = ClientId(client);
        self.wait_for(&format!("granted notice to client {}", client), move |events| {
            events
                .iter()
                .any(|e| matches!(e, TransportEvent::Granted { client: c, .. } if *c == client))
        })
        .await
    }

    /// Blocked requests currently tracked for the scenario file.
    pub fn dump(&self) -> Vec<String> {
        self.dispatcher
            .files()
            .lookup(&file())
            .map(|registry| registry.lock().dump())
            .unwrap_or_default()
    }

    /// Owners holding locks on the scenario file, with their ranges.
    pub fn holders(&self) -> Vec<(OwnerId, u64, u64)> {
        let mut holders: Vec<_> = self
            .locks
            .holders(&file())
            .into_iter()
            .map(|h| (h.owner, h.offset, h.length))
            .collect();
        holders.sort();
        holders
    }

    fn finish(&self, mut report: ScenarioReport) -> ScenarioReport {
        report.steps = self.steps.lock().unwrap_or_else(PoisonError::into_inner).clone();
        report.granted_notices = self.transport.granted_count();
        report.metrics = self.dispatcher.metrics().snapshot();
        report.trace = self.diagnostics.events();
        report
    }
}

pub fn file() -> FileHandle {
    FileHandle::new(b"export/shared.db".to_vec())
}

fn alock(client: u32, offset: u64, len: u64) -> Alock {
    Alock {
        caller_name: format!("client{}", client),
        fh: file(),
        oh: format!("c{}", client).into_bytes(),
        svid: 1,
        extent: Extent::V4 { offset, len },
    }
}

fn owner(client: u32) -> OwnerId {
    OwnerId::new(client, 1)
}

fn describe(disposition: &Disposition) -> String {
    match disposition {
        Disposition::Replied(reply) => format!("replied {:?}", reply.stat()),
        Disposition::Deferred { grant, .. } => format!("blocked, grant {:?}", grant),
        Disposition::NoReply => "no reply".to_string(),
        Disposition::Dropped => "dropped".to_string(),
    }
}

async fn join(handle: JoinHandle<Disposition>) -> anyhow::Result<Disposition> {
    let disposition = tokio::time::timeout(WAIT, handle)
        .await
        .context("call did not finish")??;
    Ok(disposition)
}

fn grant_of(disposition: &Disposition) -> Option<GrantOutcome> {
    match disposition {
        Disposition::Deferred { grant, .. } => *grant,
        _ => None,
    }
}

/// Run one scenario on the current tokio runtime.
pub async fn run(scenario: Scenario, config: &LockdConfig) -> anyhow::Result<ScenarioReport> {
    log::info!("running scenario {}: {}", scenario, scenario.description());
    let sim = Simulation::new(config);
    let mut report = ScenarioReport::new(scenario);

    match scenario {
        Scenario::Blocked => blocked(&sim, &mut report).await?,
        Scenario::LostGrant => lost_grant(&sim, &mut report).await?,
        Scenario::UnlockRace => unlock_race(&sim, &mut report).await?,
        Scenario::Disjoint => disjoint(&sim, &mut report).await?,
    }

    Ok(sim.finish(report))
}

/// Run every scenario in order.
pub async fn run_all(config: &LockdConfig) -> anyhow::Result<Vec<ScenarioReport>> {
    let mut reports = Vec::with_capacity(Scenario::ALL.len());
    for scenario in Scenario::ALL {
        reports.push(run(scenario, config).await?);
    }
    Ok(reports)
}

/// Client 3 takes [0,100) and client 1 queues behind it. Returns client 1's
/// call and its pending task.
async fn queue_behind_holder(
    sim: &Simulation,
    report: &mut ScenarioReport,
) -> anyhow::Result<(Call, JoinHandle<Disposition>)> {
    let holder = sim.call("C3 LOCK [0,100)", sim.lock(3, 0, 100, false)).await?;
    report.check("C3 holds [0,100)", holder.stat() == Some(NlmStatus::Granted));

    let request = sim.lock(1, 0, 100, true);
    let xid = request.header.xid;
    let waiter = sim.spawn("C1 LOCK [0,100) blocking", request.clone());
    sim.wait_for_reply(xid, NlmStatus::Blocked).await?;
    let dump = sim.dump();
    report.check("C1 is blocked", dump.iter().any(|l| l.contains("Blocked")));
    report.registry_dump = dump;
    Ok((request, waiter))
}

async fn blocked(sim: &Simulation, report: &mut ScenarioReport) -> anyhow::Result<()> {
    let (_, waiter) = queue_behind_holder(sim, report).await?;

    sim.call("C3 UNLOCK [0,100)", sim.unlock(3, 0, 100)).await?;
    let outcome = join(waiter).await?;

    report.check("granted notice acknowledged", grant_of(&outcome) == Some(GrantOutcome::Acknowledged));
    report.check("one notice sent to C1", sim.transport().granted_to(ClientId(1)).len() == 1);
    report.check("C1 holds [0,100)", sim.holders() == vec![(owner(1), 0, 100)]);
    report.check("no blocked requests left", sim.dump().is_empty());
    Ok(())
}

async fn lost_grant(sim: &Simulation, report: &mut ScenarioReport) -> anyhow::Result<()> {
    let (request, waiter) = queue_behind_holder(sim, report).await?;

    sim.transport().lose_granted(usize::MAX);
    sim.call("C3 UNLOCK [0,100)", sim.unlock(3, 0, 100)).await?;
    sim.wait_for_granted(1).await?;

    let again = sim.call("C1 LOCK [0,100) retransmitted", request).await?;
    sim.transport().lose_granted(0);
    report.check("retransmission answered GRANTED", again.stat() == Some(NlmStatus::Granted));

    let outcome = join(waiter).await?;
    report.check("callback loop cancelled", grant_of(&outcome) == Some(GrantOutcome::Suppressed));

    let sent = sim.transport().granted_count();
    tokio::time::sleep(sim.retry_interval * 3).await;
    report.check("no notice after cancellation", sim.transport().granted_count() == sent);
    report.check("C1 holds [0,100)", sim.holders() == vec![(owner(1), 0, 100)]);
    Ok(())
}

async fn unlock_race(sim: &Simulation, report: &mut ScenarioReport) -> anyhow::Result<()> {
    let (_, waiter) = queue_behind_holder(sim, report).await?;

    sim.transport().lose_granted(usize::MAX);
    sim.call("C3 UNLOCK [0,100)", sim.unlock(3, 0, 100)).await?;
    sim.wait_for_granted(1).await?;

    let unlock = sim.call("C1 UNLOCK [0,100)", sim.unlock(1, 0, 100)).await?;
    sim.transport().lose_granted(0);
    report.check("unlock answered GRANTED", unlock.stat() == Some(NlmStatus::Granted));

    let outcome = join(waiter).await?;
    report.check("callback loop cancelled", grant_of(&outcome) == Some(GrantOutcome::Suppressed));
    report.check("nobody holds the range", sim.holders().is_empty());
    report.check("file entry reclaimed", sim.dispatcher().files().is_empty());
    Ok(())
}

async fn disjoint(sim: &Simulation, report: &mut ScenarioReport) -> anyhow::Result<()> {
    let holder = sim.call("C3 LOCK [0,100)", sim.lock(3, 0, 100, false)).await?;
    report.check("C3 holds [0,100)", holder.stat() == Some(NlmStatus::Granted));

    let first = sim.lock(1, 0, 50, true);
    let second = sim.lock(2, 50, 50, true);
    let (xid1, xid2) = (first.header.xid, second.header.xid);
    let w1 = sim.spawn("C1 LOCK [0,50) blocking", first);
    let w2 = sim.spawn("C2 LOCK [50,100) blocking", second);
    sim.wait_for_reply(xid1, NlmStatus::Blocked).await?;
    sim.wait_for_reply(xid2, NlmStatus::Blocked).await?;

    let dump = sim.dump();
    report.check("two independent entries", dump.len() == 2);
    report.registry_dump = dump;

    sim.call("C3 UNLOCK [0,100)", sim.unlock(3, 0, 100)).await?;
    let (o1, o2) = (join(w1).await?, join(w2).await?);

    report.check("C1 acknowledged", grant_of(&o1) == Some(GrantOutcome::Acknowledged));
    report.check("C2 acknowledged", grant_of(&o2) == Some(GrantOutcome::Acknowledged));
    report.check(
        "each client notified once",
        sim.transport().granted_to(ClientId(1)).len() == 1 && sim.transport().granted_to(ClientId(2)).len() == 1,
    );
    report.check("both ranges held", sim.holders() == vec![(owner(1), 0, 50), (owner(2), 50, 50)]);
    Ok(())
}
