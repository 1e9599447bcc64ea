//! Command serialization gateway — single in-flight link command per session.
//!
//! The radio processes one link-establishment exchange at a time, so every
//! add-peer / update-peer / delete-peer / management-frame command funnels
//! through here. The gateway owns command storage for the command's whole
//! lifetime: each accepted command gets exactly one `Activated` callback
//! (synchronous at submit when the lane is free, otherwise when its turn
//! comes) followed by exactly one terminal callback — `Completed`,
//! `Cancelled`, or `ActiveTimedOut`. Callers never free anything.
//!
//! Pure state machine: timers live in the engine, which arms a timeout on
//! every [`Activation`] it is handed and routes the fire back into
//! [`CommandGateway::on_timeout`]. Ids are monotonic, so a stale timeout
//! for an already-settled command is simply ignored.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use tdls_core::peer::PeerParams;
use tdls_core::wire::{ActionCode, ActionHeader};
use tdls_core::{MacAddr, SessionId, TdlsError};

/// Pending commands allowed per session before submits fail fast.
pub const MAX_PENDING_PER_SESSION: usize = 16;

// ── Command vocabulary ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    AddPeer,
    UpdatePeer,
    DeletePeer,
    SendMgmtFrame,
}

/// Lifecycle callbacks delivered for each accepted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEvent {
    /// The command is now executing.
    Activated,
    /// Normal completion.
    Completed,
    /// Pulled from the queue; the issuer is still told about the failure.
    Cancelled,
    /// Activated but no response arrived within the deadline.
    ActiveTimedOut,
}

impl CommandEvent {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CommandEvent::Activated)
    }
}

#[derive(Debug, Clone)]
pub enum CommandPayload {
    Peer(PeerParams),
    Frame { header: ActionHeader, body: Bytes },
    None,
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub session: SessionId,
    pub kind: CommandKind,
    pub addr: MacAddr,
    pub timeout: Duration,
    pub payload: CommandPayload,
}

impl CommandRequest {
    /// The frame action carried by a `SendMgmtFrame` command.
    pub fn action(&self) -> Option<ActionCode> {
        match &self.payload {
            CommandPayload::Frame { header, .. } => header.action_code(),
            _ => None,
        }
    }

    pub fn dialog_token(&self) -> Option<u8> {
        match &self.payload {
            CommandPayload::Frame { header, .. } => Some(header.dialog_token),
            _ => None,
        }
    }
}

pub type CommandCallback = Box<dyn FnMut(CommandId, &CommandRequest, CommandEvent) + Send>;

/// A command that just became active. The caller owes it a timeout timer.
#[derive(Debug, Clone, Copy)]
pub struct Activation {
    pub id: CommandId,
    pub timeout: Duration,
}

/// What a completed command was, for the caller's follow-up logic.
#[derive(Debug, Clone, Copy)]
pub struct CompletedInfo {
    pub id: CommandId,
    pub addr: MacAddr,
    pub action: Option<ActionCode>,
}

// ── Gateway ──────────────────────────────────────────────────────────────────

struct QueuedCommand {
    id: CommandId,
    req: CommandRequest,
    cb: CommandCallback,
}

impl QueuedCommand {
    fn fire(&mut self, event: CommandEvent) {
        let QueuedCommand { id, req, cb } = self;
        cb(*id, req, event);
    }
}

#[derive(Default)]
struct Lane {
    active: Option<QueuedCommand>,
    pending: VecDeque<QueuedCommand>,
}

pub struct CommandGateway {
    next_id: u64,
    lanes: HashMap<SessionId, Lane>,
}

impl Default for CommandGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandGateway {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            lanes: HashMap::new(),
        }
    }

    /// Enqueue a command. Activates it on the spot when nothing else holds
    /// the session's lane.
    pub fn submit(
        &mut self,
        req: CommandRequest,
        cb: CommandCallback,
    ) -> Result<(CommandId, Option<Activation>), TdlsError> {
        let lane = self.lanes.entry(req.session).or_default();
        if lane.pending.len() >= MAX_PENDING_PER_SESSION {
            return Err(TdlsError::ResourceExhausted("command queue full for session"));
        }
        let id = CommandId(self.next_id);
        self.next_id += 1;

        tracing::trace!(cmd = %id, kind = ?req.kind, peer = %req.addr, "command submitted");
        lane.pending.push_back(QueuedCommand { id, req, cb });
        let activation = if lane.active.is_none() {
            Self::activate_next(lane)
        } else {
            None
        };
        Ok((id, activation))
    }

    /// Terminal `Completed` for the session's active command, which must be
    /// of `kind` — a completion for anything else is a stale or misrouted
    /// response.
    pub fn complete_active(
        &mut self,
        session: SessionId,
        kind: CommandKind,
    ) -> Result<(CompletedInfo, Option<Activation>), TdlsError> {
        let lane = self
            .lanes
            .get_mut(&session)
            .ok_or(TdlsError::ProtocolError("completion for unknown session"))?;
        match &lane.active {
            Some(active) if active.req.kind == kind => {}
            _ => return Err(TdlsError::ProtocolError("completion does not match active command")),
        }
        let mut done = lane.active.take().expect("matched above");
        let info = CompletedInfo {
            id: done.id,
            addr: done.req.addr,
            action: done.req.action(),
        };
        done.fire(CommandEvent::Completed);
        tracing::trace!(cmd = %done.id, kind = ?kind, "command completed");
        Ok((info, Self::activate_next(lane)))
    }

    /// Cancel a command wherever it sits. A pending command is pulled
    /// before activation; cancelling the active command also frees the
    /// lane for the next one.
    pub fn cancel(&mut self, id: CommandId) -> Result<Option<Activation>, TdlsError> {
        for lane in self.lanes.values_mut() {
            if let Some(pos) = lane.pending.iter().position(|c| c.id == id) {
                let mut cmd = lane.pending.remove(pos).expect("position just found");
                cmd.fire(CommandEvent::Cancelled);
                return Ok(None);
            }
            if lane.active.as_ref().map(|c| c.id) == Some(id) {
                let mut cmd = lane.active.take().expect("checked above");
                cmd.fire(CommandEvent::Cancelled);
                return Ok(Self::activate_next(lane));
            }
        }
        Err(TdlsError::InvalidArgument("unknown command id"))
    }

    /// Timeout fire for `id`. Stale fires (the command already settled)
    /// return `None` and are not an error.
    pub fn on_timeout(&mut self, id: CommandId) -> Option<Activation> {
        for lane in self.lanes.values_mut() {
            if lane.active.as_ref().map(|c| c.id) == Some(id) {
                let mut cmd = lane.active.take().expect("checked above");
                tracing::warn!(cmd = %id, kind = ?cmd.req.kind, peer = %cmd.req.addr, "command timed out");
                cmd.fire(CommandEvent::ActiveTimedOut);
                return Self::activate_next(lane);
            }
        }
        None
    }

    /// Synchronous drain for device/link teardown: every pending command is
    /// cancelled, then the active one. Nothing survives.
    pub fn flush_session(&mut self, session: SessionId) {
        let Some(lane) = self.lanes.get_mut(&session) else {
            return;
        };
        while let Some(mut cmd) = lane.pending.pop_front() {
            cmd.fire(CommandEvent::Cancelled);
        }
        if let Some(mut cmd) = lane.active.take() {
            cmd.fire(CommandEvent::Cancelled);
        }
    }

    pub fn active(&self, session: SessionId) -> Option<(CommandId, CommandKind)> {
        self.lanes
            .get(&session)
            .and_then(|l| l.active.as_ref())
            .map(|c| (c.id, c.req.kind))
    }

    pub fn pending_len(&self, session: SessionId) -> usize {
        self.lanes.get(&session).map(|l| l.pending.len()).unwrap_or(0)
    }

    fn activate_next(lane: &mut Lane) -> Option<Activation> {
        debug_assert!(lane.active.is_none());
        let mut cmd = lane.pending.pop_front()?;
        cmd.fire(CommandEvent::Activated);
        let activation = Activation {
            id: cmd.id,
            timeout: cmd.req.timeout,
        };
        lane.active = Some(cmd);
        Some(activation)
    }
}
