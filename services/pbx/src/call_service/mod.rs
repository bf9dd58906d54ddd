//! The pairing/bridging/teardown state machine (spec.md §4.4) — the core of
//! this worker. Grounded on `app/services/call_service.py` for the protocol
//! shape, restructured around a single `tokio::sync::Mutex` guarding four
//! indices rather than the original's asyncio lock, and around a spawned
//! bridge task in place of `asyncio.create_task`.

pub mod timestamp;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

use crate::ari::{AriPort, ParsedEvent};
use crate::recorder::Recorder;

#[derive(Debug, Clone)]
struct CallSession {
    target_exten: String,
    caller_channel_id: String,
    callee_channel_id: Option<String>,
    bridge_id: Option<String>,
    bridged: bool,
    done: bool,
}

#[derive(Default)]
struct ServiceIndices {
    sessions: HashMap<Uuid, CallSession>,
    pending_by_exten: HashMap<String, VecDeque<Uuid>>,
    channel_to_call: HashMap<String, Uuid>,
    channel_to_bridge: HashMap<String, String>,
}

/// Owns the four in-memory indices and exposes the single `handle_event`
/// entry point. Cheap to share: clone the `Arc<CallService<_, _>>` into the
/// worker loop and any spawned tasks.
pub struct CallService<A, R> {
    ari: Arc<A>,
    recorder: Arc<R>,
    indices: Arc<Mutex<ServiceIndices>>,
}

impl<A, R> CallService<A, R>
where
    A: AriPort + 'static,
    R: Recorder + 'static,
{
    pub fn new(ari: Arc<A>, recorder: Arc<R>) -> Self {
        Self {
            ari,
            recorder,
            indices: Arc::new(Mutex::new(ServiceIndices::default())),
        }
    }

    pub async fn handle_event(&self, event: ParsedEvent) {
        if event.etype == "StasisStart" {
            self.handle_stasis_start(&event).await;
        }

        if let Some(channel_id) = &event.channel_id {
            if let Some(bridge_id) = event
                .raw
                .get("bridge")
                .and_then(|b| b.get("id"))
                .and_then(Value::as_str)
            {
                let mut idx = self.indices.lock().await;
                idx.channel_to_bridge
                    .insert(channel_id.clone(), bridge_id.to_string());
            }
        }

        let ts = timestamp::parse_timestamp(event.timestamp.as_deref());

        let (call_id, bridge_id) = match &event.channel_id {
            Some(channel_id) => {
                let idx = self.indices.lock().await;
                (
                    idx.channel_to_call.get(channel_id).copied(),
                    idx.channel_to_bridge.get(channel_id).cloned(),
                )
            }
            None => (None, None),
        };

        let etype = Some(event.etype.as_str()).filter(|e| !e.is_empty());
        if let Err(err) = self
            .recorder
            .add_event(
                call_id,
                ts,
                etype,
                event.channel_id.as_deref(),
                bridge_id.as_deref(),
                event.raw.clone(),
            )
            .await
        {
            error!(error = %err, etype, "failed to persist call event");
        }

        if matches!(event.etype.as_str(), "ChannelHangupRequest" | "ChannelDestroyed") {
            self.handle_hangup(&event, ts).await;
        }
    }

    async fn handle_stasis_start(&self, event: &ParsedEvent) {
        match event.app_args.first().map(String::as_str) {
            Some("callee") => {
                if let Some(extension) = event.app_args.get(1) {
                    self.handle_callee_arm(event, extension).await;
                }
            }
            Some(extension) => self.handle_caller_arm(event, extension).await,
            None => {}
        }
    }

    async fn handle_callee_arm(&self, event: &ParsedEvent, extension: &str) {
        let Some(channel_id) = event.channel_id.clone() else {
            return;
        };

        let bridge_args = {
            let mut idx = self.indices.lock().await;

            let call_id = match idx.pending_by_exten.get_mut(extension) {
                Some(queue) => {
                    let popped = queue.pop_front();
                    if queue.is_empty() {
                        idx.pending_by_exten.remove(extension);
                    }
                    match popped {
                        Some(id) => id,
                        None => {
                            warn!(extension, "orphan callee: pending queue empty");
                            return;
                        }
                    }
                }
                None => {
                    warn!(extension, "orphan callee: no pending caller");
                    return;
                }
            };

            let Some(session) = idx.sessions.get_mut(&call_id) else {
                return;
            };
            if session.done {
                return;
            }
            session.callee_channel_id = Some(channel_id.clone());
            let caller_channel_id = session.caller_channel_id.clone();
            idx.channel_to_call.insert(channel_id.clone(), call_id);

            (call_id, caller_channel_id, channel_id.clone())
        };

        let (call_id, caller_channel_id, callee_channel_id) = bridge_args;
        let indices = self.indices.clone();
        let ari = self.ari.clone();
        let recorder = self.recorder.clone();
        tokio::spawn(async move {
            Self::run_bridge_task(indices, ari, recorder, call_id, caller_channel_id, callee_channel_id).await;
        });
    }

    async fn handle_caller_arm(&self, event: &ParsedEvent, extension: &str) {
        let Some(channel_id) = event.channel_id.clone() else {
            return;
        };

        let call_id = Uuid::new_v4();
        let caller_exten = derive_caller_exten(event.channel_name.as_deref());

        {
            let mut idx = self.indices.lock().await;
            idx.sessions.insert(
                call_id,
                CallSession {
                    target_exten: extension.to_string(),
                    caller_channel_id: channel_id.clone(),
                    callee_channel_id: None,
                    bridge_id: None,
                    bridged: false,
                    done: false,
                },
            );
            idx.channel_to_call.insert(channel_id.clone(), call_id);
            idx.pending_by_exten
                .entry(extension.to_string())
                .or_default()
                .push_back(call_id);
        }

        if let Err(err) = self
            .recorder
            .ensure_call_row(call_id, caller_exten.as_deref(), Some(extension), Some(&channel_id))
            .await
        {
            error!(call_id = %call_id, error = %err, "failed to persist new call row");
        }

        let endpoint = format!("PJSIP/{extension}");
        let app_args = format!("callee,{extension}");
        if let Err(err) = self.ari.originate(&endpoint, &app_args, "ARI", 30).await {
            let reason = err.to_string();
            warn!(call_id = %call_id, error = %reason, "originate failed, tearing down session");
            // This is the one termination path with no prior persist: the
            // caller arm only ran `ensure_call_row` (status still "new"), so
            // the row must be closed out here before cleanup (spec.md §8:
            // "Originate failure transitions the call to ended with reason
            // present").
            if let Err(rec_err) = self.recorder.mark_ended(call_id, None, None, Some(&reason)).await {
                error!(call_id = %call_id, error = %rec_err, "failed to persist originate failure");
            }
            Self::terminate(&self.indices, &self.ari, call_id).await;
        }
    }

    async fn run_bridge_task(
        indices: Arc<Mutex<ServiceIndices>>,
        ari: Arc<A>,
        recorder: Arc<R>,
        call_id: Uuid,
        caller_channel_id: String,
        callee_channel_id: String,
    ) {
        {
            let idx = indices.lock().await;
            match idx.sessions.get(&call_id) {
                Some(session) if !session.done && !session.bridged => {}
                _ => return,
            }
        }

        let bridge_name = format!("call-{}", &call_id.simple().to_string()[..8]);
        let attempt: Result<String, crate::error::AriError> = async {
            let bridge_id = ari.create_bridge(&bridge_name, "mixing").await?;
            ari.add_channel_to_bridge(&bridge_id, &caller_channel_id).await?;
            ari.add_channel_to_bridge(&bridge_id, &callee_channel_id).await?;
            Ok(bridge_id)
        }
        .await;

        match attempt {
            Ok(bridge_id) => {
                let became_bridged = {
                    let mut idx = indices.lock().await;
                    idx.channel_to_bridge.insert(caller_channel_id.clone(), bridge_id.clone());
                    idx.channel_to_bridge.insert(callee_channel_id.clone(), bridge_id.clone());
                    match idx.sessions.get_mut(&call_id) {
                        Some(session) if !session.done => {
                            session.bridge_id = Some(bridge_id.clone());
                            session.bridged = true;
                            true
                        }
                        _ => false,
                    }
                };
                if became_bridged {
                    if let Err(err) = recorder
                        .mark_bridged(call_id, &bridge_id, &caller_channel_id, &callee_channel_id)
                        .await
                    {
                        error!(call_id = %call_id, error = %err, "failed to persist bridge");
                    }
                }
            }
            Err(err) => {
                let reason = err.to_string();
                if let Err(rec_err) = recorder.mark_failed(call_id, &reason).await {
                    error!(call_id = %call_id, error = %rec_err, "failed to persist bridge failure");
                }
                Self::terminate(&indices, &ari, call_id).await;
            }
        }
    }

    async fn handle_hangup(&self, event: &ParsedEvent, ts: Option<chrono::DateTime<chrono::Utc>>) {
        let Some(channel_id) = &event.channel_id else {
            return;
        };
        let call_id = {
            let idx = self.indices.lock().await;
            idx.channel_to_call.get(channel_id).copied()
        };
        let Some(call_id) = call_id else {
            return;
        };

        let (cause, reason) = extract_cause(&event.raw, &event.etype);
        if let Err(err) = self
            .recorder
            .mark_ended(call_id, ts, cause, reason.as_deref())
            .await
        {
            error!(call_id = %call_id, error = %err, "failed to persist call end");
        }

        Self::terminate(&self.indices, &self.ari, call_id).await;
    }

    /// Idempotent per `call_id` (spec.md §4.4.5): the first caller to flip
    /// `done` runs teardown, every later caller returns immediately.
    async fn terminate(indices: &Arc<Mutex<ServiceIndices>>, ari: &Arc<A>, call_id: Uuid) {
        let snapshot = {
            let mut idx = indices.lock().await;
            let Some(session) = idx.sessions.get_mut(&call_id) else {
                return;
            };
            if session.done {
                return;
            }
            session.done = true;
            (
                session.caller_channel_id.clone(),
                session.callee_channel_id.clone(),
                session.bridge_id.clone(),
                session.target_exten.clone(),
            )
        };
        let (caller_channel_id, callee_channel_id, bridge_id, target_exten) = snapshot;

        if let Some(bridge_id) = &bridge_id {
            if let Err(err) = ari.destroy_bridge(bridge_id).await {
                warn!(call_id = %call_id, error = %err, "failed to destroy bridge during teardown");
            }
        }
        if let Err(err) = ari.hangup_channel(&caller_channel_id).await {
            warn!(call_id = %call_id, error = %err, "failed to hang up caller channel during teardown");
        }
        if let Some(callee_channel_id) = &callee_channel_id {
            if let Err(err) = ari.hangup_channel(callee_channel_id).await {
                warn!(call_id = %call_id, error = %err, "failed to hang up callee channel during teardown");
            }
        }

        let mut idx = indices.lock().await;
        idx.sessions.remove(&call_id);
        idx.channel_to_call.remove(&caller_channel_id);
        idx.channel_to_bridge.remove(&caller_channel_id);
        if let Some(callee_channel_id) = &callee_channel_id {
            idx.channel_to_call.remove(callee_channel_id);
            idx.channel_to_bridge.remove(callee_channel_id);
        }
        if let Some(queue) = idx.pending_by_exten.get_mut(&target_exten) {
            queue.retain(|id| *id != call_id);
            if queue.is_empty() {
                idx.pending_by_exten.remove(&target_exten);
            }
        }
    }
}

/// `"PJSIP/<exten>-<suffix>"` → `<exten>`. Null if the name doesn't match.
fn derive_caller_exten(channel_name: Option<&str>) -> Option<String> {
    let name = channel_name?;
    let after_slash = name.split_once('/')?.1;
    let exten = after_slash.split_once('-')?.0;
    if exten.is_empty() {
        None
    } else {
        Some(exten.to_string())
    }
}

fn extract_cause(raw: &Value, etype: &str) -> (Option<i32>, Option<String>) {
    let cause = raw.get("cause").and_then(|v| {
        v.as_i64()
            .map(|n| n as i32)
            .or_else(|| v.as_str().and_then(|s| s.parse::<i32>().ok()))
    });

    let reason = raw
        .get("cause_txt")
        .and_then(Value::as_str)
        .or_else(|| raw.get("causeText").and_then(Value::as_str))
        .map(str::to_string)
        .or_else(|| Some(etype.to_string()));

    (cause, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::error::{AriError, RecorderError};

    #[derive(Default)]
    struct FakeAri {
        calls: Mutex<Vec<String>>,
        add_channel_attempts: AtomicUsize,
        fail_originate: AtomicBool,
        fail_nth_add_channel: AtomicUsize, // 0 = never fail
    }

    impl FakeAri {
        async fn calls_snapshot(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl AriPort for FakeAri {
        async fn originate(
            &self,
            endpoint: &str,
            app_args: &str,
            _caller_id: &str,
            _timeout_sec: u32,
        ) -> Result<String, AriError> {
            self.calls.lock().await.push(format!("originate {endpoint} {app_args}"));
            if self.fail_originate.load(Ordering::SeqCst) {
                return Err(AriError::Status {
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    body: "engine busy".into(),
                });
            }
            Ok("C-originated".to_string())
        }

        async fn create_bridge(&self, name: &str, bridge_type: &str) -> Result<String, AriError> {
            self.calls.lock().await.push(format!("create_bridge {name} {bridge_type}"));
            Ok("BRIDGE-1".to_string())
        }

        async fn add_channel_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<(), AriError> {
            let n = self.add_channel_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.calls.lock().await.push(format!("add_channel {bridge_id} {channel_id}"));
            let fail_at = self.fail_nth_add_channel.load(Ordering::SeqCst);
            if fail_at != 0 && n == fail_at {
                return Err(AriError::Status {
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    body: "add channel failed".into(),
                });
            }
            Ok(())
        }

        async fn hangup_channel(&self, channel_id: &str) -> Result<(), AriError> {
            self.calls.lock().await.push(format!("hangup {channel_id}"));
            Ok(())
        }

        async fn destroy_bridge(&self, bridge_id: &str) -> Result<(), AriError> {
            self.calls.lock().await.push(format!("destroy_bridge {bridge_id}"));
            Ok(())
        }
    }

    #[derive(Debug, Clone, Default)]
    struct FakeRow {
        caller_exten: Option<String>,
        callee_exten: Option<String>,
        status: String,
        bridge_id: Option<String>,
        answered: bool,
        ended: bool,
        hangup_cause: Option<i32>,
        hangup_reason: Option<String>,
    }

    #[derive(Default)]
    struct FakeRecorder {
        rows: Mutex<StdHashMap<Uuid, FakeRow>>,
        events: Mutex<Vec<(Option<Uuid>, Option<String>)>>,
    }

    impl FakeRecorder {
        async fn row(&self, call_id: Uuid) -> Option<FakeRow> {
            self.rows.lock().await.get(&call_id).cloned()
        }

        async fn event_count(&self) -> usize {
            self.events.lock().await.len()
        }
    }

    #[async_trait]
    impl Recorder for FakeRecorder {
        async fn ensure_call_row(
            &self,
            call_id: Uuid,
            caller_exten: Option<&str>,
            callee_exten: Option<&str>,
            _caller_channel_id: Option<&str>,
        ) -> Result<(), RecorderError> {
            let mut rows = self.rows.lock().await;
            rows.entry(call_id).or_insert_with(|| FakeRow {
                caller_exten: caller_exten.map(str::to_string),
                callee_exten: callee_exten.map(str::to_string),
                status: "new".to_string(),
                ..Default::default()
            });
            Ok(())
        }

        async fn add_event(
            &self,
            call_id: Option<Uuid>,
            _ts: Option<DateTime<Utc>>,
            etype: Option<&str>,
            _channel_id: Option<&str>,
            _bridge_id: Option<&str>,
            _raw: serde_json::Value,
        ) -> Result<(), RecorderError> {
            self.events.lock().await.push((call_id, etype.map(str::to_string)));
            Ok(())
        }

        async fn mark_bridged(
            &self,
            call_id: Uuid,
            bridge_id: &str,
            _caller_channel_id: &str,
            _callee_channel_id: &str,
        ) -> Result<(), RecorderError> {
            let mut rows = self.rows.lock().await;
            if let Some(row) = rows.get_mut(&call_id) {
                row.status = "up".to_string();
                row.bridge_id = Some(bridge_id.to_string());
                row.answered = true;
            }
            Ok(())
        }

        async fn mark_failed(&self, call_id: Uuid, reason: &str) -> Result<(), RecorderError> {
            let mut rows = self.rows.lock().await;
            if let Some(row) = rows.get_mut(&call_id) {
                row.status = "failed".to_string();
                row.hangup_reason = Some(reason.to_string());
            }
            Ok(())
        }

        async fn mark_ended(
            &self,
            call_id: Uuid,
            _ended_at: Option<DateTime<Utc>>,
            hangup_cause: Option<i32>,
            hangup_reason: Option<&str>,
        ) -> Result<(), RecorderError> {
            let mut rows = self.rows.lock().await;
            if let Some(row) = rows.get_mut(&call_id) {
                row.status = "ended".to_string();
                row.ended = true;
                row.hangup_cause = hangup_cause;
                row.hangup_reason = hangup_reason.map(str::to_string);
            }
            Ok(())
        }
    }

    fn stasis_start(channel_id: &str, channel_name: &str, args: &[&str]) -> ParsedEvent {
        crate::ari::parse_event(json!({
            "type": "StasisStart",
            "timestamp": "2024-01-01T00:00:00.000+0000",
            "application": "pbx_ari",
            "args": args,
            "channel": { "id": channel_id, "name": channel_name },
        }))
    }

    fn channel_destroyed(channel_id: &str, cause: i64, cause_txt: &str) -> ParsedEvent {
        crate::ari::parse_event(json!({
            "type": "ChannelDestroyed",
            "timestamp": "2024-01-01T00:00:05.000+0000",
            "channel": { "id": channel_id },
            "cause": cause,
            "cause_txt": cause_txt,
        }))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn happy_path_pairs_bridges_and_tears_down() {
        let ari = Arc::new(FakeAri::default());
        let recorder = Arc::new(FakeRecorder::default());
        let service = CallService::new(ari.clone(), recorder.clone());

        service
            .handle_event(stasis_start("C-A", "PJSIP/1000-00000001", &["1001"]))
            .await;
        service
            .handle_event(stasis_start("C-B", "PJSIP/1001-00000002", &["callee", "1001"]))
            .await;
        settle().await;

        let calls = ari.calls_snapshot().await;
        assert!(calls.iter().any(|c| c == "originate PJSIP/1001 callee,1001"));
        assert!(calls.iter().any(|c| c.starts_with("create_bridge call-")));
        assert!(calls.iter().any(|c| c == "add_channel BRIDGE-1 C-A"));
        assert!(calls.iter().any(|c| c == "add_channel BRIDGE-1 C-B"));

        let rows: Vec<_> = recorder.rows.lock().await.values().cloned().collect();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.caller_exten.as_deref(), Some("1000"));
        assert_eq!(row.callee_exten.as_deref(), Some("1001"));
        assert_eq!(row.status, "up");
        assert!(row.answered);
        assert!(row.bridge_id.is_some());

        let call_id = *recorder.rows.lock().await.keys().next().unwrap();

        service.handle_event(channel_destroyed("C-A", 16, "Normal Clearing")).await;
        settle().await;

        let calls = ari.calls_snapshot().await;
        assert!(calls.iter().any(|c| c == "hangup C-B"));
        assert!(calls.iter().any(|c| c.starts_with("destroy_bridge BRIDGE-1")));

        let row = recorder.row(call_id).await.unwrap();
        assert_eq!(row.status, "ended");
        assert_eq!(row.hangup_cause, Some(16));
        assert_eq!(row.hangup_reason.as_deref(), Some("Normal Clearing"));
    }

    #[tokio::test]
    async fn orphan_callee_produces_only_an_event_row() {
        let ari = Arc::new(FakeAri::default());
        let recorder = Arc::new(FakeRecorder::default());
        let service = CallService::new(ari.clone(), recorder.clone());

        service
            .handle_event(stasis_start("C-B", "PJSIP/1001-00000002", &["callee", "1001"]))
            .await;
        settle().await;

        assert!(ari.calls_snapshot().await.is_empty());
        assert_eq!(recorder.event_count().await, 1);
        assert!(recorder.rows.lock().await.is_empty());
    }

    #[tokio::test]
    async fn originate_failure_cleans_up_the_session() {
        let ari = Arc::new(FakeAri::default());
        ari.fail_originate.store(true, Ordering::SeqCst);
        let recorder = Arc::new(FakeRecorder::default());
        let service = CallService::new(ari.clone(), recorder.clone());

        service
            .handle_event(stasis_start("C-A", "PJSIP/1000-00000001", &["1001"]))
            .await;
        settle().await;

        let call_id = *recorder.rows.lock().await.keys().next().unwrap();
        let row = recorder.row(call_id).await.unwrap();
        assert_eq!(row.status, "ended");
        assert!(row.hangup_reason.is_some());

        // A later callee for the same extension now finds an empty queue.
        service
            .handle_event(stasis_start("C-B", "PJSIP/1001-00000002", &["callee", "1001"]))
            .await;
        settle().await;
        assert!(!ari.calls_snapshot().await.iter().any(|c| c.contains("add_channel")));
    }

    #[tokio::test]
    async fn bridge_partial_failure_fails_and_tears_down() {
        let ari = Arc::new(FakeAri::default());
        ari.fail_nth_add_channel.store(2, Ordering::SeqCst);
        let recorder = Arc::new(FakeRecorder::default());
        let service = CallService::new(ari.clone(), recorder.clone());

        service
            .handle_event(stasis_start("C-A", "PJSIP/1000-00000001", &["1001"]))
            .await;
        service
            .handle_event(stasis_start("C-B", "PJSIP/1001-00000002", &["callee", "1001"]))
            .await;
        settle().await;

        let calls = ari.calls_snapshot().await;
        assert!(calls.iter().any(|c| c.starts_with("destroy_bridge")));
        assert!(calls.iter().any(|c| c == "hangup C-A"));
        assert!(calls.iter().any(|c| c == "hangup C-B"));

        let call_id = *recorder.rows.lock().await.keys().next().unwrap();
        let row = recorder.row(call_id).await.unwrap();
        assert_eq!(row.status, "failed");
        assert!(row.hangup_reason.is_some());
    }

    #[tokio::test]
    async fn cause_extraction_prefers_cause_txt_then_falls_back_to_cause_text() {
        let ari = Arc::new(FakeAri::default());
        let recorder = Arc::new(FakeRecorder::default());
        let service = CallService::new(ari.clone(), recorder.clone());

        service
            .handle_event(stasis_start("C-A", "PJSIP/1000-00000001", &["1001"]))
            .await;
        let call_id = *recorder.rows.lock().await.keys().next().unwrap();

        service
            .handle_event(crate::ari::parse_event(json!({
                "type": "ChannelDestroyed",
                "channel": { "id": "C-A" },
                "causeText": "Busy",
            })))
            .await;
        settle().await;

        let row = recorder.row(call_id).await.unwrap();
        assert_eq!(row.hangup_reason.as_deref(), Some("Busy"));
    }

    #[test]
    fn derives_caller_exten_from_channel_name() {
        assert_eq!(
            derive_caller_exten(Some("PJSIP/1000-00000001")),
            Some("1000".to_string())
        );
        assert_eq!(derive_caller_exten(Some("garbage")), None);
        assert_eq!(derive_caller_exten(None), None);
    }
}
