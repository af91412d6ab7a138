//! Rotation orchestrator
//!
//! Each target moves through `Idle -> BackingUp -> Generating -> Done`. The
//! live artifact is snapshotted first; generation only starts once the
//! snapshot is verified, and the new artifact set replaces the old one through
//! the store's staged commit. A failure in either stage stops the sequence and
//! leaves the live directory as it was.
//!
//! Scope `all` rotates the certificate, then the key-exchange key. If the
//! second target fails the first stays rotated, and the failure says so.

use crate::artifact_store::ArtifactStore;
use crate::backup::Snapshot;
use crate::error::{Result, TrustError};
use crate::generate_server_cert::IssuanceDecision;
use chrono::Utc;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationScope {
    Cert,
    Kex,
    All,
}

impl RotationScope {
    /// Targets in the order they are rotated
    pub fn targets(&self) -> &'static [RotationTarget] {
        match self {
            RotationScope::Cert => &[RotationTarget::Cert],
            RotationScope::Kex => &[RotationTarget::Kex],
            RotationScope::All => &[RotationTarget::Cert, RotationTarget::Kex],
        }
    }
}

impl FromStr for RotationScope {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cert" => Ok(RotationScope::Cert),
            "kex" => Ok(RotationScope::Kex),
            "all" => Ok(RotationScope::All),
            other => Err(TrustError::UnknownScope {
                scope: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for RotationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationScope::Cert => f.write_str("cert"),
            RotationScope::Kex => f.write_str("kex"),
            RotationScope::All => f.write_str("all"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationTarget {
    Cert,
    Kex,
}

impl fmt::Display for RotationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationTarget::Cert => f.write_str("server certificate"),
            RotationTarget::Kex => f.write_str("key-exchange key"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    Idle,
    BackingUp,
    Generating,
    Done,
    Failed,
}

impl fmt::Display for RotationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RotationState::Idle => "idle",
            RotationState::BackingUp => "backing-up",
            RotationState::Generating => "generating",
            RotationState::Done => "done",
            RotationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Stage a failed rotation stopped in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStage {
    BackingUp,
    Generating,
}

impl fmt::Display for RotationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationStage::BackingUp => f.write_str("backing-up"),
            RotationStage::Generating => f.write_str("generating"),
        }
    }
}

/// One target rotated successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationStep {
    pub target: RotationTarget,
    /// `None` when there was no live artifact to preserve
    pub backup: Option<PathBuf>,
    pub fingerprint: String,
    /// How a rotated certificate was issued, including any downgrade
    pub decision: Option<IssuanceDecision>,
}

impl RotationStep {
    pub fn is_first_generation(&self) -> bool {
        self.backup.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub domain: String,
    pub scope: RotationScope,
    pub steps: Vec<RotationStep>,
}

/// A rotation that stopped before finishing its scope
#[derive(Debug)]
pub struct RotationFailure {
    pub domain: String,
    pub scope: RotationScope,
    pub completed: Vec<RotationStep>,
    pub failed: RotationTarget,
    pub stage: RotationStage,
    /// Snapshot taken for the failed target, if the backup stage finished
    pub backup: Option<PathBuf>,
    pub cause: TrustError,
}

impl RotationFailure {
    /// True when at least one earlier target was rotated before the failure
    pub fn is_partial(&self) -> bool {
        !self.completed.is_empty()
    }
}

impl fmt::Display for RotationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rotation of {} for {} failed while {}: {}",
            self.failed, self.domain, self.stage, self.cause
        )?;
        if self.is_partial() {
            let done: Vec<String> = self.completed.iter().map(|s| s.target.to_string()).collect();
            write!(
                f,
                " (partial: {} already rotated, {} left unchanged)",
                done.join(", "),
                self.failed
            )?;
        }
        if let Some(backup) = &self.backup {
            write!(f, "; prior artifact preserved at {}", backup.display())?;
        }
        Ok(())
    }
}

impl std::error::Error for RotationFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Produces replacement artifacts for rotation
pub trait Regenerator {
    /// Live directory of `target`, or `None` if nothing has been generated yet
    fn live_directory(&self, domain: &str, target: RotationTarget) -> Result<Option<PathBuf>>;

    /// Generate and commit a replacement
    fn regenerate(&self, domain: &str, target: RotationTarget, backup: Option<&Path>) -> Result<Regenerated>;
}

/// What a regeneration produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regenerated {
    pub fingerprint: String,
    /// Set for certificates; `None` for targets without an issuance mode
    pub decision: Option<IssuanceDecision>,
}

/// Run a rotation of `scope` for `domain`
pub fn rotate(
    store: &ArtifactStore,
    regenerator: &dyn Regenerator,
    domain: &str,
    scope: RotationScope,
) -> std::result::Result<RotationReport, RotationFailure> {
    let mut completed = Vec::new();
    for &target in scope.targets() {
        let mut state = RotationState::Idle;
        let fail = |completed: Vec<RotationStep>,
                    stage: RotationStage,
                    backup: Option<PathBuf>,
                    cause: TrustError| {
            warn!(domain, target = %target, stage = %stage, error = %cause, "Rotation failed");
            RotationFailure {
                domain: domain.to_string(),
                scope,
                completed,
                failed: target,
                stage,
                backup,
                cause,
            }
        };

        transition(&mut state, RotationState::BackingUp, domain, target);
        let live = match regenerator.live_directory(domain, target) {
            Ok(live) => live,
            Err(cause) => return Err(fail(completed, RotationStage::BackingUp, None, cause)),
        };
        let backup = match live {
            Some(dir) => match Snapshot::take(store, &dir, Utc::now()) {
                Ok(snapshot) => Some(snapshot.path),
                Err(cause) => {
                    transition(&mut state, RotationState::Failed, domain, target);
                    return Err(fail(completed, RotationStage::BackingUp, None, cause));
                }
            },
            None => {
                info!(domain, target = %target, "No live artifact; rotating as first generation");
                None
            }
        };

        transition(&mut state, RotationState::Generating, domain, target);
        match regenerator.regenerate(domain, target, backup.as_deref()) {
            Ok(Regenerated {
                fingerprint,
                decision,
            }) => {
                transition(&mut state, RotationState::Done, domain, target);
                info!(domain, target = %target, fingerprint = %fingerprint, "Rotated");
                if let Some(decision) = decision.filter(IssuanceDecision::is_downgraded) {
                    warn!(domain, target = %target, %decision, "Rotated certificate was downgraded");
                }
                completed.push(RotationStep {
                    target,
                    backup,
                    fingerprint,
                    decision,
                });
            }
            Err(cause) => {
                transition(&mut state, RotationState::Failed, domain, target);
                return Err(fail(completed, RotationStage::Generating, backup, cause));
            }
        }
    }
    Ok(RotationReport {
        domain: domain.to_string(),
        scope,
        steps: completed,
    })
}

fn transition(state: &mut RotationState, next: RotationState, domain: &str, target: RotationTarget) {
    debug!(domain, target = %target, from = %state, to = %next, "Rotation state");
    *state = next;
}
