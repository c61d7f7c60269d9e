use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::am::asyncutil::TaskTracker;
use crate::am::events::sv_event;
use crate::am::process::{
    invoke_listeners, LaunchSpec, ListenerId, ManagedProcess, ProcessError, ProcessRegistry,
    ProcessStatus, StatusListener,
};

#[derive(Debug, Clone)]
pub struct GroupOptions {
    /// One member going down takes the whole group down. All workers behind
    /// one proxy must stay consistent; partial degradation is opt-out.
    pub stop_all_on_one_crashed: bool,
    pub stop_timeout: Duration,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            stop_all_on_one_crashed: true,
            stop_timeout: Duration::from_secs(15),
        }
    }
}

struct Member {
    process: Arc<ManagedProcess>,
    last_status: ProcessStatus,
    listener: ListenerId,
}

struct GroupState {
    status: ProcessStatus,
    members: BTreeMap<String, Member>,
    listeners: Vec<(ListenerId, StatusListener)>,
    next_listener: u64,
}

/// A named collection of managed processes whose statuses aggregate into one
/// composite status. The group is Started only once no member is still
/// Starting; it is Stopped only once every member has settled.
pub struct ProcessGroup {
    name: String,
    registry: ProcessRegistry,
    tracker: TaskTracker,
    options: GroupOptions,
    state: Mutex<GroupState>,
    weak: Weak<ProcessGroup>,
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl ProcessGroup {
    pub fn new(
        name: impl Into<String>,
        registry: ProcessRegistry,
        tracker: TaskTracker,
        options: GroupOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name: name.into(),
            registry,
            tracker,
            options,
            state: Mutex::new(GroupState {
                status: ProcessStatus::NotStarted,
                members: BTreeMap::new(),
                listeners: Vec::new(),
                next_listener: 0,
            }),
            weak: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ProcessStatus {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).status
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn member(&self, name: &str) -> Option<Arc<ManagedProcess>> {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.members.get(name).map(|m| Arc::clone(&m.process))
    }

    pub fn member_names(&self) -> Vec<String> {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.members.keys().cloned().collect()
    }

    /// Last known status per member, in stable (name) order.
    pub fn member_statuses(&self) -> Vec<(String, ProcessStatus)> {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.members.iter().map(|(n, m)| (n.clone(), m.last_status)).collect()
    }

    pub fn add_status_listener<F>(&self, cb: F) -> ListenerId
    where
        F: Fn(ProcessStatus) + Send + Sync + 'static,
    {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let id = ListenerId::from_raw(st.next_listener);
        st.next_listener += 1;
        st.listeners.push((id, Arc::new(cb)));
        id
    }

    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let before = st.listeners.len();
        st.listeners.retain(|(lid, _)| *lid != id);
        st.listeners.len() != before
    }

    fn announce(&self, status: ProcessStatus) {
        let listeners: Vec<StatusListener> = {
            let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            st.listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        sv_event("group", Some(&self.name), format!("status={status}"));
        invoke_listeners("group", &self.name, status, &listeners);
    }

    fn set_status(&self, status: ProcessStatus) {
        {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            st.status = status;
        }
        self.announce(status);
    }

    /// Atomically transition when the predicate holds; the check-and-set runs
    /// under one lock so racing callers fire a given transition exactly once.
    fn transition_if(&self, pred: impl Fn(ProcessStatus) -> bool, status: ProcessStatus) -> bool {
        {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if !pred(st.status) {
                return false;
            }
            st.status = status;
        }
        self.announce(status);
        true
    }

    /// Add a member. Rejects duplicate names. If the group has been started
    /// already the new member is launched immediately as a tracked task (live
    /// scale-out).
    pub fn add_process(
        &self,
        name: &str,
        spec: LaunchSpec,
    ) -> Result<Arc<ManagedProcess>, ProcessError> {
        let process = ManagedProcess::new(name, spec, self.registry.clone(), self.tracker.clone());

        let weak = self.weak.clone();
        let member_name = name.to_string();
        let listener = process.add_status_listener(move |status| {
            if let Some(group) = weak.upgrade() {
                group.on_member_status(&member_name, status);
            }
        });

        let group_status = {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if st.members.contains_key(name) {
                drop(st);
                process.remove_status_listener(listener);
                return Err(ProcessError::DuplicateMember {
                    group: self.name.clone(),
                    name: name.to_string(),
                });
            }
            st.members.insert(
                name.to_string(),
                Member {
                    process: Arc::clone(&process),
                    last_status: ProcessStatus::NotStarted,
                    listener,
                },
            );
            st.status
        };
        sv_event("group", Some(&self.name), format!("member_added name={name}"));

        if group_status != ProcessStatus::NotStarted {
            let p = Arc::clone(&process);
            let gname = self.name.clone();
            let mname = name.to_string();
            self.tracker.spawn(async move {
                if let Err(e) = p.start().await {
                    sv_event(
                        "group",
                        Some(&gname),
                        format!("ERROR member_start_failed name={mname} err={e}"),
                    );
                }
            });
        }
        Ok(process)
    }

    /// Remove a member. The entry is deleted (and its internal listener
    /// detached) before the process is stopped, so the removal can never
    /// cascade into a group-wide stop.
    pub async fn remove_process(&self, name: &str) -> Result<(), ProcessError> {
        let (member, ever_started) = {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let Some(member) = st.members.remove(name) else {
                return Err(ProcessError::UnknownMember {
                    group: self.name.clone(),
                    name: name.to_string(),
                });
            };
            (member, st.status != ProcessStatus::NotStarted)
        };
        member.process.remove_status_listener(member.listener);
        sv_event("group", Some(&self.name), format!("member_removed name={name}"));

        if !ever_started {
            return Ok(());
        }
        match member.process.stop(self.options.stop_timeout).await {
            Ok(_) => Ok(()),
            Err(e @ ProcessError::InvalidState { .. }) => {
                sv_event(
                    "group",
                    Some(&self.name),
                    format!("member_stop_skipped name={name} err={e}"),
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Internal listener attached to every member: caches the status, drives
    /// the crash cascade, and re-evaluates the Starting -> Started flip.
    fn on_member_status(&self, member: &str, status: ProcessStatus) {
        let cascade = {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let Some(m) = st.members.get_mut(member) else {
                // Member was removed; its exit is no longer the group's concern.
                return;
            };
            m.last_status = status;
            if status.is_down()
                && self.options.stop_all_on_one_crashed
                && matches!(st.status, ProcessStatus::Starting | ProcessStatus::Started)
            {
                // Check-and-set under the lock: the cascade fires exactly once
                // even when several members go down together.
                st.status = ProcessStatus::Stopping;
                true
            } else {
                false
            }
        };

        if cascade {
            sv_event(
                "group",
                Some(&self.name),
                format!("ERROR member_down name={member} status={status}; stopping group"),
            );
            self.announce(ProcessStatus::Stopping);
            if let Some(group) = self.weak.upgrade() {
                self.tracker.spawn(async move {
                    group.stop_members_and_settle().await;
                });
            }
        } else {
            self.reevaluate_started();
        }
    }

    /// Flip Starting -> Started once no member is still Starting.
    fn reevaluate_started(&self) {
        {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if st.status != ProcessStatus::Starting {
                return;
            }
            if st.members.values().any(|m| m.last_status == ProcessStatus::Starting) {
                return;
            }
            st.status = ProcessStatus::Started;
        }
        self.announce(ProcessStatus::Started);
    }

    /// Launch every member as a tracked task and wait for all launches to
    /// return. The aggregate flips to Started via the member listeners (or
    /// right here for an empty group).
    pub async fn start(&self) -> Result<(), ProcessError> {
        {
            let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            match st.status {
                ProcessStatus::NotStarted
                | ProcessStatus::Stopped
                | ProcessStatus::Terminated
                | ProcessStatus::StartFailed
                | ProcessStatus::Restarting => {}
                other => {
                    return Err(ProcessError::InvalidState {
                        name: self.name.clone(),
                        status: other,
                        expected: "NOTSTARTED|STOPPED|TERMINATED|STARTFAILED|RESTARTING",
                    })
                }
            }
        }
        self.set_status(ProcessStatus::Starting);

        let mut handles = Vec::new();
        for (mname, process) in self.processes() {
            let gname = self.name.clone();
            handles.push(self.tracker.spawn(async move {
                if let Err(e) = process.start().await {
                    sv_event(
                        "group",
                        Some(&gname),
                        format!("ERROR member_start_failed name={mname} err={e}"),
                    );
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        self.reevaluate_started();
        Ok(())
    }

    /// Stop every member as a tracked task; one member's failed stop never
    /// blocks the others. Waits for every member to settle, then marks the
    /// group Stopped.
    pub async fn stop(&self) {
        // Do not mask a restart in progress.
        if self.status() != ProcessStatus::Restarting {
            let _ = self.transition_if(|s| s != ProcessStatus::Stopping, ProcessStatus::Stopping);
        }
        self.stop_members_and_settle().await;
    }

    async fn stop_members_and_settle(&self) {
        let mut handles = Vec::new();
        for (mname, process) in self.processes() {
            let gname = self.name.clone();
            let timeout = self.options.stop_timeout;
            handles.push(self.tracker.spawn(async move {
                let mut result = process.stop(timeout).await;
                if matches!(result, Err(ProcessError::InvalidState { .. }))
                    && process.status() == ProcessStatus::Starting
                {
                    // Raced an in-flight launch: wait for it to land, then
                    // stop the fresh process.
                    for _ in 0..250 {
                        if process.status() != ProcessStatus::Starting {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    result = process.stop(timeout).await;
                }
                match result {
                    Ok(_) => {}
                    Err(e) => sv_event(
                        "group",
                        Some(&gname),
                        format!("ERROR member_stop_failed name={mname} err={e}"),
                    ),
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        // Cached member statuses must be final before the group reports
        // Stopped.
        for (_, process) in self.processes() {
            process.wait_for_completion().await;
        }
        let _ = self.transition_if(|s| s == ProcessStatus::Stopping, ProcessStatus::Stopped);
    }

    /// Two-phase restart at group granularity, chaining stop and start the
    /// same way a single managed process does.
    pub async fn restart(&self) -> Result<(), ProcessError> {
        self.set_status(ProcessStatus::Restarting);
        self.stop_members_and_settle().await;
        self.start().await
    }

    /// True if any member is live or on its way down/around.
    pub fn is_running(&self) -> bool {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.members.values().any(|m| {
            matches!(
                m.last_status,
                ProcessStatus::Started | ProcessStatus::Stopping | ProcessStatus::Restarting
            )
        })
    }

    /// Fan a signal out to every member unconditionally (config reload).
    pub fn send_signal(&self, sig: Signal) {
        sv_event("group", Some(&self.name), format!("signal sig={sig} fanout={}", self.len()));
        for (_, process) in self.processes() {
            process.send_signal(sig);
        }
    }

    fn processes(&self) -> Vec<(String, Arc<ManagedProcess>)> {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.members
            .iter()
            .map(|(n, m)| (n.clone(), Arc::clone(&m.process)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time as tokio_time;

    const TRAP_INT_LOOP: &str = r#"trap 'exit 0' INT; while :; do sleep 0.05; done"#;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new(vec!["/bin/sh".into(), "-c".into(), script.into()])
    }

    fn group_with(options: GroupOptions) -> Arc<ProcessGroup> {
        ProcessGroup::new("g", ProcessRegistry::default(), TaskTracker::new(), options)
    }

    async fn wait_group_status(g: &Arc<ProcessGroup>, want: ProcessStatus, ms: u64) -> bool {
        for _ in 0..(ms / 10).max(1) {
            if g.status() == want {
                return true;
            }
            tokio_time::sleep(Duration::from_millis(10)).await;
        }
        g.status() == want
    }

    async fn wait_member_status(
        g: &Arc<ProcessGroup>,
        name: &str,
        want: ProcessStatus,
        ms: u64,
    ) -> bool {
        for _ in 0..(ms / 10).max(1) {
            if g.member(name).map(|p| p.status()) == Some(want) {
                return true;
            }
            tokio_time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn duplicate_member_names_are_rejected() {
        let g = group_with(GroupOptions::default());
        g.add_process("w1", sh("exit 0")).unwrap();
        let err = g.add_process("w1", sh("exit 0")).unwrap_err();
        assert!(matches!(err, ProcessError::DuplicateMember { .. }));
        assert_eq!(g.len(), 1);
    }

    #[tokio::test]
    async fn group_reports_started_only_when_no_member_is_starting() {
        let g = group_with(GroupOptions::default());
        g.add_process("w1", sh(TRAP_INT_LOOP)).unwrap();
        g.add_process("w2", sh(TRAP_INT_LOOP)).unwrap();

        // Capture the member statuses at the instant the group reports
        // Started: none may still be Starting.
        let at_started: Arc<Mutex<Vec<Vec<(String, ProcessStatus)>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let weak = Arc::downgrade(&g);
        let snap = Arc::clone(&at_started);
        g.add_status_listener(move |status| {
            if status == ProcessStatus::Started {
                if let Some(group) = weak.upgrade() {
                    snap.lock().unwrap().push(group.member_statuses());
                }
            }
        });

        g.start().await.unwrap();
        assert!(wait_group_status(&g, ProcessStatus::Started, 2000).await);

        let snapshots = at_started.lock().unwrap().clone();
        assert!(!snapshots.is_empty());
        for snapshot in &snapshots {
            assert!(snapshot.iter().all(|(_, s)| *s != ProcessStatus::Starting));
        }

        g.stop().await;
        assert_eq!(g.status(), ProcessStatus::Stopped);
        assert!(!g.is_running());
    }

    #[tokio::test]
    async fn start_while_started_is_invalid_state() {
        let g = group_with(GroupOptions::default());
        g.add_process("w1", sh(TRAP_INT_LOOP)).unwrap();
        g.start().await.unwrap();
        assert!(wait_group_status(&g, ProcessStatus::Started, 2000).await);

        let err = g.start().await.unwrap_err();
        assert!(matches!(err, ProcessError::InvalidState { .. }));

        g.stop().await;
    }

    #[tokio::test]
    async fn one_member_crash_stops_the_group_exactly_once() {
        let g = group_with(GroupOptions::default());
        g.add_process("w1", sh(TRAP_INT_LOOP)).unwrap();
        g.add_process("w2", sh("sleep 0.3; exit 3")).unwrap();

        let stopping_seen = Arc::new(AtomicUsize::new(0));
        let n = Arc::clone(&stopping_seen);
        g.add_status_listener(move |status| {
            if status == ProcessStatus::Stopping {
                n.fetch_add(1, Ordering::SeqCst);
            }
        });

        g.start().await.unwrap();
        assert!(wait_group_status(&g, ProcessStatus::Started, 2000).await);

        // w2 crashes; the cascade takes w1 (and the group) down with it.
        assert!(wait_group_status(&g, ProcessStatus::Stopped, 5000).await);
        assert_eq!(stopping_seen.load(Ordering::SeqCst), 1);
        assert_eq!(g.member("w1").unwrap().status(), ProcessStatus::Stopped);
        assert_eq!(g.member("w2").unwrap().status(), ProcessStatus::Terminated);
    }

    #[tokio::test]
    async fn crash_cascade_can_be_disabled() {
        let g = group_with(GroupOptions {
            stop_all_on_one_crashed: false,
            ..GroupOptions::default()
        });
        g.add_process("w1", sh(TRAP_INT_LOOP)).unwrap();
        g.add_process("w2", sh("sleep 0.2; exit 3")).unwrap();

        g.start().await.unwrap();
        assert!(wait_group_status(&g, ProcessStatus::Started, 2000).await);
        assert!(wait_member_status(&g, "w2", ProcessStatus::Terminated, 5000).await);

        // Give a cascade (if any) time to fire, then verify none did.
        tokio_time::sleep(Duration::from_millis(300)).await;
        assert_eq!(g.status(), ProcessStatus::Started);
        assert!(g.member("w1").unwrap().is_running().unwrap());

        g.stop().await;
    }

    #[tokio::test]
    async fn removing_a_member_does_not_cascade() {
        let g = group_with(GroupOptions::default());
        g.add_process("w1", sh(TRAP_INT_LOOP)).unwrap();
        g.add_process("w2", sh(TRAP_INT_LOOP)).unwrap();

        g.start().await.unwrap();
        assert!(wait_group_status(&g, ProcessStatus::Started, 2000).await);
        tokio_time::sleep(Duration::from_millis(100)).await;

        let w1 = g.member("w1").unwrap();
        g.remove_process("w1").await.unwrap();
        w1.wait_for_completion().await;
        assert!(w1.status().is_down());

        // w2 keeps running; the group never saw a crash.
        tokio_time::sleep(Duration::from_millis(200)).await;
        assert_eq!(g.status(), ProcessStatus::Started);
        assert_eq!(g.member("w2").unwrap().status(), ProcessStatus::Started);
        assert_eq!(g.member_names(), vec!["w2".to_string()]);

        g.stop().await;
    }

    #[tokio::test]
    async fn removing_an_unknown_member_errors() {
        let g = group_with(GroupOptions::default());
        let err = g.remove_process("nope").await.unwrap_err();
        assert!(matches!(err, ProcessError::UnknownMember { .. }));
    }

    #[tokio::test]
    async fn member_added_to_a_running_group_is_started() {
        let g = group_with(GroupOptions::default());
        g.add_process("w1", sh(TRAP_INT_LOOP)).unwrap();
        g.start().await.unwrap();
        assert!(wait_group_status(&g, ProcessStatus::Started, 2000).await);

        g.add_process("w2", sh(TRAP_INT_LOOP)).unwrap();
        assert!(wait_member_status(&g, "w2", ProcessStatus::Started, 2000).await);

        g.stop().await;
    }

    #[tokio::test]
    async fn restart_brings_every_member_back() {
        let g = group_with(GroupOptions::default());
        g.add_process("w1", sh(TRAP_INT_LOOP)).unwrap();
        g.add_process("w2", sh(TRAP_INT_LOOP)).unwrap();

        g.start().await.unwrap();
        assert!(wait_group_status(&g, ProcessStatus::Started, 2000).await);
        tokio_time::sleep(Duration::from_millis(100)).await;
        let old_pid = g.member("w1").unwrap().pid().unwrap();

        g.restart().await.unwrap();
        assert!(wait_group_status(&g, ProcessStatus::Started, 5000).await);
        let new_pid = g.member("w1").unwrap().pid().unwrap();
        assert_ne!(old_pid, new_pid);
        assert!(g.is_running());

        g.stop().await;
    }
}
