use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use coordination::{keys, CallRecord, CallTransition};
use serde_json::Value;
use shared::{
    domain::{CallId, CallKind, CallState, RoomId, SignalKind, UserId},
    protocol::{CallPayload, OutboundFrame, ServerEvent},
};
use storage::CallLog;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::{
    context::RealtimeContext, error::RealtimeError, presence::PresenceTracker, session::Session,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Initiation {
    Ringing(CallPayload),
    /// Callee already in a call. No call was created.
    Busy { callee_id: UserId },
}

fn to_payload(record: &CallRecord) -> CallPayload {
    CallPayload {
        call_id: record.call_id.clone(),
        caller_id: record.caller_id,
        callee_id: record.callee_id,
        room_id: record.room_id,
        kind: record.kind,
        state: record.state,
        started_at: record.started_at,
    }
}

/// 1:1 call lifecycle. Call state lives in the coordination store and every
/// transition is a compare-and-set there, so any instance may drive any
/// call. Ring timers are local to the instance that placed the call and are
/// cancelled on every terminal transition, including ones observed on the
/// bus from other instances. While ringing, the shared record and the
/// caller's busy marker expire soon after the ring timeout, so a call whose
/// placing instance died frees its caller; answering extends both to the
/// full call lifetime.
#[derive(Clone)]
pub struct CallSignaling {
    ctx: RealtimeContext,
    presence: PresenceTracker,
    ring_timers: Arc<Mutex<HashMap<CallId, AbortHandle>>>,
}

impl CallSignaling {
    pub fn new(ctx: RealtimeContext, presence: PresenceTracker) -> Self {
        Self {
            ctx,
            presence,
            ring_timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn ringing_ttl(&self) -> Duration {
        self.ctx.config.ring_timeout * 2
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<CallId, AbortHandle>> {
        self.ring_timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn initiate(
        &self,
        session: &Session,
        callee_id: UserId,
        kind: CallKind,
        room_id: Option<RoomId>,
    ) -> Result<Initiation, RealtimeError> {
        let caller_id = session.user_id;
        if callee_id == caller_id {
            return Err(RealtimeError::Validation("cannot call yourself".into()));
        }
        if self.ctx.store.busy_call(callee_id).await?.is_some() {
            debug!(%caller_id, %callee_id, "callee busy");
            self.ctx.hub.send_to(
                &session.connection_id,
                OutboundFrame::Event(ServerEvent::CallBusy { callee_id }),
            );
            return Ok(Initiation::Busy { callee_id });
        }

        let call_id = CallId::generate();
        let ttl = self.ringing_ttl();
        if !self.ctx.store.claim_busy(caller_id, &call_id, ttl).await? {
            return Err(RealtimeError::Validation("already in a call".into()));
        }
        let record = CallRecord {
            call_id: call_id.clone(),
            caller_id,
            callee_id,
            room_id,
            kind,
            state: CallState::Ringing,
            started_at: Utc::now(),
            answered_at: None,
        };
        if let Err(error) = self.ctx.store.put_call(&record, ttl).await {
            let _ = self.ctx.store.release_busy(caller_id, &call_id).await;
            return Err(error.into());
        }
        self.arm_ring_timer(&call_id);

        if let Err(error) = self
            .ctx
            .repo
            .create_call_log(&CallLog {
                call_id: call_id.clone(),
                caller_id,
                callee_id,
                room_id,
                kind,
                status: CallState::Ringing,
                started_at: record.started_at,
                ended_at: None,
                duration_secs: None,
            })
            .await
        {
            warn!(%call_id, %error, "failed to persist call log");
        }

        let payload = to_payload(&record);
        self.notify(
            &[callee_id],
            ServerEvent::CallRinging {
                call: payload.clone(),
            },
        )
        .await;
        self.presence.set_busy(caller_id, true).await;
        info!(%call_id, %caller_id, %callee_id, kind = kind.as_str(), "call ringing");
        Ok(Initiation::Ringing(payload))
    }

    pub async fn accept(&self, session: &Session, call_id: &CallId) -> Result<(), RealtimeError> {
        let record = self.load(call_id).await?;
        let callee_id = session.user_id;
        if record.callee_id != callee_id {
            return Err(RealtimeError::Authorization("only the callee may accept".into()));
        }
        let ttl = self.ctx.config.call_state_ttl;
        if !self.ctx.store.claim_busy(callee_id, call_id, ttl).await?
            && self.ctx.store.busy_call(callee_id).await?.as_ref() != Some(call_id)
        {
            return Err(RealtimeError::Validation("already in another call".into()));
        }

        let active = match self.ctx.store.answer_call(call_id, Utc::now(), ttl).await? {
            CallTransition::Applied(record) => record,
            CallTransition::Mismatch(state) => {
                let _ = self.ctx.store.release_busy(callee_id, call_id).await;
                return Err(RealtimeError::Validation(format!(
                    "call is {}, not ringing",
                    state.as_str()
                )));
            }
            CallTransition::Missing => {
                let _ = self.ctx.store.release_busy(callee_id, call_id).await;
                return Err(RealtimeError::NotFound(format!("call {call_id}")));
            }
        };
        self.cancel_ring_timer(call_id);
        match self
            .ctx
            .store
            .extend_busy(active.caller_id, call_id, ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(%call_id, "caller busy marker already gone"),
            Err(error) => warn!(%call_id, %error, "failed to extend caller busy marker"),
        }
        self.log_status(call_id, CallState::Active, None).await;

        self.notify(
            &[active.caller_id, callee_id],
            ServerEvent::CallAccepted {
                call_id: call_id.clone(),
                by: callee_id,
            },
        )
        .await;
        self.presence.set_busy(callee_id, true).await;
        info!(%call_id, "call accepted");
        Ok(())
    }

    pub async fn reject(&self, session: &Session, call_id: &CallId) -> Result<(), RealtimeError> {
        let record = self.load(call_id).await?;
        let callee_id = session.user_id;
        if record.callee_id != callee_id {
            return Err(RealtimeError::Authorization("only the callee may reject".into()));
        }
        let rejected = match self
            .ctx
            .store
            .transition_call(call_id, &[CallState::Ringing], CallState::Rejected)
            .await?
        {
            CallTransition::Applied(record) => record,
            CallTransition::Mismatch(state) => {
                return Err(RealtimeError::Validation(format!(
                    "call is {}, not ringing",
                    state.as_str()
                )))
            }
            CallTransition::Missing => {
                return Err(RealtimeError::NotFound(format!("call {call_id}")))
            }
        };
        self.cancel_ring_timer(call_id);
        self.retire(&rejected, CallState::Rejected, None).await;

        self.notify(
            &[rejected.caller_id, callee_id],
            ServerEvent::CallRejected {
                call_id: call_id.clone(),
                by: callee_id,
            },
        )
        .await;
        self.presence.set_busy(rejected.caller_id, false).await;
        info!(%call_id, "call rejected");
        Ok(())
    }

    pub async fn end(
        &self,
        session: &Session,
        call_id: &CallId,
        duration_secs: Option<u64>,
    ) -> Result<CallState, RealtimeError> {
        self.end_as(session.user_id, call_id, duration_secs).await
    }

    /// Ends a call on behalf of one of its parties. A call that was never
    /// answered finishes as `cancelled`, an answered one as `ended`.
    pub async fn end_as(
        &self,
        party: UserId,
        call_id: &CallId,
        duration_secs: Option<u64>,
    ) -> Result<CallState, RealtimeError> {
        let mut record = self.load(call_id).await?;
        if record.caller_id != party && record.callee_id != party {
            return Err(RealtimeError::Authorization("not a party to this call".into()));
        }

        // Retry if an accept races the end.
        let mut ended = None;
        for _ in 0..3 {
            let (from, to) = match record.state {
                CallState::Ringing => (CallState::Ringing, CallState::Cancelled),
                CallState::Active => (CallState::Active, CallState::Ended),
                state => {
                    return Err(RealtimeError::Validation(format!(
                        "call already {}",
                        state.as_str()
                    )))
                }
            };
            match self.ctx.store.transition_call(call_id, &[from], to).await? {
                CallTransition::Applied(applied) => {
                    ended = Some((applied, to));
                    break;
                }
                CallTransition::Mismatch(state) => record.state = state,
                CallTransition::Missing => {
                    return Err(RealtimeError::NotFound(format!("call {call_id}")))
                }
            }
        }
        let Some((applied, status)) = ended else {
            return Err(RealtimeError::Validation("call state kept changing".into()));
        };
        self.cancel_ring_timer(call_id);

        let duration = match status {
            CallState::Ended => duration_secs.or_else(|| {
                applied
                    .answered_at
                    .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
            }),
            _ => None,
        };
        self.retire(&applied, status, duration).await;

        self.notify(
            &[applied.caller_id, applied.callee_id],
            ServerEvent::CallEnded {
                call_id: call_id.clone(),
                by: Some(party),
                status,
                duration_secs: duration,
            },
        )
        .await;
        self.presence.set_busy(applied.caller_id, false).await;
        self.presence.set_busy(applied.callee_id, false).await;
        info!(%call_id, status = status.as_str(), ?duration, "call finished");
        Ok(status)
    }

    /// Ring timeout: only a call still ringing becomes `missed`.
    pub async fn expire_ringing(&self, call_id: &CallId) -> Result<bool, RealtimeError> {
        let missed = match self
            .ctx
            .store
            .transition_call(call_id, &[CallState::Ringing], CallState::Missed)
            .await?
        {
            CallTransition::Applied(record) => record,
            CallTransition::Mismatch(_) | CallTransition::Missing => return Ok(false),
        };
        self.retire(&missed, CallState::Missed, None).await;
        self.notify(
            &[missed.caller_id, missed.callee_id],
            ServerEvent::CallMissed {
                call_id: call_id.clone(),
            },
        )
        .await;
        self.presence.set_busy(missed.caller_id, false).await;
        info!(%call_id, "call missed");
        Ok(true)
    }

    /// Ends whatever call the user is busy in. Used when their last session
    /// disconnects.
    pub async fn abandon(&self, user_id: UserId) -> Result<Option<CallState>, RealtimeError> {
        let Some(call_id) = self.ctx.store.busy_call(user_id).await? else {
            return Ok(None);
        };
        match self.end_as(user_id, &call_id, None).await {
            Ok(status) => Ok(Some(status)),
            Err(RealtimeError::NotFound(_)) | Err(RealtimeError::Validation(_)) => {
                // Stale marker whose call is already gone.
                self.ctx.store.release_busy(user_id, &call_id).await?;
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// Pure pass-through of SDP/ICE payloads; never inspected or stored and
    /// not gated by call state.
    pub async fn relay_signal(
        &self,
        session: &Session,
        call_id: Option<CallId>,
        to: UserId,
        kind: SignalKind,
        payload: Value,
    ) -> Result<(), RealtimeError> {
        if to == session.user_id {
            return Err(RealtimeError::Validation("cannot signal yourself".into()));
        }
        self.ctx
            .bus
            .publish(
                &keys::user_channel(to),
                ServerEvent::CallSignal {
                    call_id,
                    from: session.user_id,
                    kind,
                    payload,
                },
            )
            .await?;
        Ok(())
    }

    pub fn cancel_ring_timer(&self, call_id: &CallId) -> bool {
        match self.timers().remove(call_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn has_ring_timer(&self, call_id: &CallId) -> bool {
        self.timers().contains_key(call_id)
    }

    fn arm_ring_timer(&self, call_id: &CallId) {
        let mut timers = self.timers();
        let delay = self.ctx.config.ring_timeout;
        let this = self.clone();
        let id = call_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Dropped, not aborted: this task is the one running.
            this.timers().remove(&id);
            if let Err(error) = this.expire_ringing(&id).await {
                warn!(call_id = %id, %error, "ring timeout handling failed");
            }
        });
        if let Some(previous) = timers.insert(call_id.clone(), task.abort_handle()) {
            previous.abort();
        }
    }

    async fn load(&self, call_id: &CallId) -> Result<CallRecord, RealtimeError> {
        self.ctx
            .store
            .get_call(call_id)
            .await?
            .ok_or_else(|| RealtimeError::NotFound(format!("call {call_id}")))
    }

    /// Terminal bookkeeping: busy markers, shared state and the call log.
    async fn retire(&self, record: &CallRecord, status: CallState, duration: Option<u64>) {
        let call_id = &record.call_id;
        for party in [record.caller_id, record.callee_id] {
            if let Err(error) = self.ctx.store.release_busy(party, call_id).await {
                warn!(%call_id, user_id = %party, %error, "failed to clear busy marker");
            }
        }
        if let Err(error) = self.ctx.store.delete_call(call_id).await {
            warn!(%call_id, %error, "failed to drop call state");
        }
        self.log_status(call_id, status, duration).await;
    }

    async fn log_status(&self, call_id: &CallId, status: CallState, duration: Option<u64>) {
        match self
            .ctx
            .repo
            .update_call_status(call_id, status, duration, Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(%call_id, status = status.as_str(), "call log already final"),
            Err(error) => warn!(%call_id, %error, "failed to persist call status"),
        }
    }

    async fn notify(&self, users: &[UserId], event: ServerEvent) {
        for user_id in users {
            if let Err(error) = self
                .ctx
                .bus
                .publish(&keys::user_channel(*user_id), event.clone())
                .await
            {
                warn!(%user_id, %error, "call notification failed");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/calls_tests.rs"]
mod tests;
