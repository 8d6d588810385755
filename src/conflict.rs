//! Conflict resolution for transfer targets that already exist.
//!
//! A decision comes from, in order: the session's cached "apply to all"
//! action, the session's fixed policy, or an interactive prompt answered
//! through [`ConflictResolver::submit`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;

use crate::control::TransferControl;
use crate::errors::{TransferError, TransferResult};
use crate::events::{ConflictPrompt, EventBus, TransferEvent};
use crate::transfer_state::SessionHandle;

/// Upper bound on rename suffixes tried before giving up.
const MAX_RENAME_ATTEMPTS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    Overwrite,
    Rename,
    Skip,
    #[default]
    #[serde(alias = "ask")]
    Prompt,
}

impl ConflictPolicy {
    /// The action applied without asking, if any.
    pub fn fixed_action(self) -> Option<ConflictAction> {
        match self {
            ConflictPolicy::Overwrite => Some(ConflictAction::Overwrite),
            ConflictPolicy::Rename => Some(ConflictAction::Rename),
            ConflictPolicy::Skip => Some(ConflictAction::Skip),
            ConflictPolicy::Prompt => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAction {
    Overwrite,
    Rename,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDecision {
    pub target_path: String,
    pub action: ConflictAction,
    pub final_path: String,
    pub apply_to_all: bool,
}

/// Answer to a [`ConflictPrompt`] from the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResponse {
    pub action: ConflictAction,
    #[serde(default)]
    pub apply_to_all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Decided(ConflictDecision),
    /// The prompt was dismissed; the whole session must be cancelled.
    Cancelled,
}

/// Answers whether a candidate target path is already taken.
#[async_trait]
pub trait TargetProbe: Send + Sync {
    async fn exists(&self, path: &str) -> TransferResult<bool>;
}

/// Probe for download targets on the local filesystem.
pub struct LocalProbe;

#[async_trait]
impl TargetProbe for LocalProbe {
    async fn exists(&self, path: &str) -> TransferResult<bool> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| TransferError::filesystem(std::path::Path::new(path), e))
    }
}

/// Local download targets reserved by running sessions, keyed by path.
///
/// Concurrent downloads consult it so two sessions never pick the same
/// destination before either has written anything.
#[derive(Default)]
pub struct TargetClaims {
    owners: Mutex<HashMap<String, String>>,
}

impl TargetClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `path` for `session_id`. Fails when another session holds it.
    pub fn try_claim(&self, path: &str, session_id: &str) -> bool {
        let mut owners = self.owners.lock();
        match owners.get(path) {
            Some(owner) => owner == session_id,
            None => {
                owners.insert(path.to_string(), session_id.to_string());
                true
            }
        }
    }

    pub fn release_session(&self, session_id: &str) -> usize {
        let mut owners = self.owners.lock();
        let before = owners.len();
        owners.retain(|_, owner| owner != session_id);
        before - owners.len()
    }

    pub fn is_claimed(&self, path: &str) -> bool {
        self.owners.lock().contains_key(path)
    }
}

/// Download probe: a path is taken when it exists on disk or another
/// session has claimed it. A free path is claimed for this session.
pub struct ClaimingProbe<'a> {
    claims: &'a TargetClaims,
    session_id: &'a str,
}

impl<'a> ClaimingProbe<'a> {
    pub fn new(claims: &'a TargetClaims, session_id: &'a str) -> Self {
        Self { claims, session_id }
    }
}

#[async_trait]
impl TargetProbe for ClaimingProbe<'_> {
    async fn exists(&self, path: &str) -> TransferResult<bool> {
        if LocalProbe.exists(path).await? {
            return Ok(true);
        }
        Ok(!self.claims.try_claim(path, self.session_id))
    }
}

fn split_parent(target: &str) -> (&str, &str) {
    match target.rfind(|c| c == '/' || c == std::path::MAIN_SEPARATOR) {
        Some(pos) => (&target[..=pos], &target[pos + 1..]),
        None => ("", target),
    }
}

/// `dir/name (n).ext` for the n-th rename attempt of `dir/name.ext`.
pub fn rename_candidate(target: &str, n: u32) -> String {
    let (parent, file_name) = split_parent(target);
    let (stem, ext) = match file_name.rfind('.') {
        Some(pos) if pos > 0 => (&file_name[..pos], Some(&file_name[pos + 1..])),
        _ => (file_name, None),
    };
    match ext {
        Some(ext) => format!("{}{} ({}).{}", parent, stem, n, ext),
        None => format!("{}{} ({})", parent, stem, n),
    }
}

pub struct ConflictResolver {
    pending: Mutex<HashMap<String, oneshot::Sender<Option<ConflictResponse>>>>,
    events: EventBus,
}

impl ConflictResolver {
    pub fn new(events: EventBus) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub async fn resolve(
        &self,
        session: &SessionHandle,
        control: &TransferControl,
        target: &str,
        name: &str,
        is_directory: bool,
        probe: &dyn TargetProbe,
    ) -> TransferResult<Resolution> {
        let (session_id, cached, policy) = {
            let s = session.read();
            (s.id.clone(), s.apply_to_all, s.conflict_policy)
        };

        let (action, apply_to_all) = if let Some(action) = cached {
            (action, true)
        } else if let Some(action) = policy.fixed_action() {
            (action, false)
        } else {
            match self.prompt(&session_id, control, target, name, is_directory).await? {
                Some(response) => {
                    if response.apply_to_all {
                        session.write().apply_to_all = Some(response.action);
                    }
                    (response.action, response.apply_to_all)
                }
                None => {
                    tracing::info!(session = %session_id, target, "conflict prompt dismissed");
                    return Ok(Resolution::Cancelled);
                }
            }
        };

        let final_path = match action {
            ConflictAction::Rename => {
                let unique = self.unique_path(session, target, probe).await?;
                session.write().claim_path(unique.clone());
                unique
            }
            ConflictAction::Overwrite | ConflictAction::Skip => target.to_string(),
        };

        tracing::debug!(session = %session_id, target, ?action, final_path, "conflict resolved");
        Ok(Resolution::Decided(ConflictDecision {
            target_path: target.to_string(),
            action,
            final_path,
            apply_to_all,
        }))
    }

    async fn prompt(
        &self,
        session_id: &str,
        control: &TransferControl,
        target: &str,
        name: &str,
        is_directory: bool,
    ) -> TransferResult<Option<ConflictResponse>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(session_id) {
                return Err(TransferError::InvalidState(format!(
                    "session {} is already waiting for a conflict decision",
                    session_id
                )));
            }
            pending.insert(session_id.to_string(), tx);
        }

        self.events.emit(TransferEvent::ConflictRequested(ConflictPrompt {
            session_id: session_id.to_string(),
            target_path: target.to_string(),
            name: name.to_string(),
            is_directory,
        }));

        let response = tokio::select! {
            answer = rx => answer.ok().flatten(),
            _ = control.cancelled() => None,
        };
        self.pending.lock().remove(session_id);
        Ok(response)
    }

    /// Delivers the presentation layer's answer. `None` dismisses the prompt.
    pub fn submit(
        &self,
        session_id: &str,
        response: Option<ConflictResponse>,
    ) -> TransferResult<()> {
        let tx = self.pending.lock().remove(session_id).ok_or_else(|| {
            TransferError::InvalidState(format!("no conflict pending for session {}", session_id))
        })?;
        // The waiter may have gone away after a cancel; nothing to deliver then.
        let _ = tx.send(response);
        Ok(())
    }

    pub fn has_pending(&self, session_id: &str) -> bool {
        self.pending.lock().contains_key(session_id)
    }

    pub fn clear_session(&self, session_id: &str) {
        self.pending.lock().remove(session_id);
    }

    async fn unique_path(
        &self,
        session: &SessionHandle,
        target: &str,
        probe: &dyn TargetProbe,
    ) -> TransferResult<String> {
        for n in 1..=MAX_RENAME_ATTEMPTS {
            let candidate = rename_candidate(target, n);
            let known = session.read().is_known_path(&candidate);
            if known {
                continue;
            }
            if probe.exists(&candidate).await? {
                continue;
            }
            return Ok(candidate);
        }
        Err(TransferError::item(
            target,
            format!("no free name after {} attempts", MAX_RENAME_ATTEMPTS),
        ))
    }
}
