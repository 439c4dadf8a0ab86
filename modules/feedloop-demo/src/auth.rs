//! Two independent loops exchanging an authorization signal over a gear.
//!
//! The session loop signs in, issues a request, and turns a rejected
//! response into `Unauthorized`. It publishes that onto the gear. The
//! permission loop listens on the same gear, checks authorization, and
//! revokes the user. Neither loop knows about the other.

use std::time::Duration;

use anyhow::{Context, Result};
use feedloop_engine::stream;
use feedloop_engine::{EngineConfig, ExecutionContext, Feedback, Gear, Loop, LoopBuilder, Reducer};
use tokio::sync::oneshot;
use tracing::info;

/// Status the simulated backend answers the profile request with.
const REJECTED_STATUS: u16 = 401;
const REQUEST_LATENCY: Duration = Duration::from_millis(100);
const REVOCATION_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
    SignedOut,
    SignedIn,
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn,
    ResponseReceived(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
    Initial,
    AuthorizationShouldBeChecked,
    UserHasBeenRevoked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionEvent {
    CheckAuthorization,
    Revoked,
}

/// What travels between the two loops.
#[derive(Debug, Clone)]
pub enum AuthSignal {
    Unauthorized,
}

pub fn reduce_session(state: Session, event: SessionEvent) -> Session {
    match (state, event) {
        (Session::SignedOut, SessionEvent::SignedIn) => Session::SignedIn,
        (Session::SignedIn, SessionEvent::ResponseReceived(401 | 403)) => Session::Unauthorized,
        (state, _) => state,
    }
}

pub fn reduce_permission(state: Permission, event: PermissionEvent) -> Permission {
    match (state, event) {
        (Permission::Initial, PermissionEvent::CheckAuthorization) => {
            Permission::AuthorizationShouldBeChecked
        }
        (Permission::AuthorizationShouldBeChecked, PermissionEvent::Revoked) => {
            Permission::UserHasBeenRevoked
        }
        (state, _) => state,
    }
}

pub struct AuthScenario {
    pub gear: Gear<AuthSignal>,
    pub session: Loop<Session, SessionEvent>,
    pub permissions: Loop<Permission, PermissionEvent>,
}

impl AuthScenario {
    pub fn build(config: &EngineConfig) -> Result<Self> {
        let gear = Gear::with_config(config);
        let io = ExecutionContext::dedicated_with(config, "session-io")?;

        let requests = Feedback::new(|state: Session| match state {
            Session::SignedOut => stream::just(SessionEvent::SignedIn),
            Session::SignedIn => {
                stream::delayed(SessionEvent::ResponseReceived(REJECTED_STATUS), REQUEST_LATENCY)
            }
            Session::Unauthorized => stream::empty(),
        })
        .execute_on(io);

        let session = LoopBuilder::new(Session::SignedOut)
            .with_feedback(requests)
            .with_feedback(Feedback::publish(&gear, |state: &Session| {
                (*state == Session::Unauthorized).then_some(AuthSignal::Unauthorized)
            }))
            .with_reducer(Reducer::new(reduce_session, ExecutionContext::current()?))
            .build()?;

        let permissions = LoopBuilder::new(Permission::Initial)
            .with_feedback(Feedback::attach(&gear, |signal| match signal {
                AuthSignal::Unauthorized => Some(PermissionEvent::CheckAuthorization),
            }))
            .with_feedback(Feedback::new(|state: Permission| {
                if state == Permission::AuthorizationShouldBeChecked {
                    stream::just(PermissionEvent::Revoked)
                } else {
                    stream::empty()
                }
            }))
            .with_reducer(Reducer::new(reduce_permission, ExecutionContext::current()?))
            .build()?;

        Ok(Self {
            gear,
            session,
            permissions,
        })
    }
}

/// Run the scenario until the permission loop has revoked the user.
pub async fn run(config: &EngineConfig) -> Result<()> {
    let scenario = AuthScenario::build(config)?;

    let (revoked_tx, revoked_rx) = oneshot::channel();
    let mut revoked_tx = Some(revoked_tx);
    let permissions = scenario.permissions.start_with(move |state| {
        info!(?state, "Permission state");
        if state == Permission::UserHasBeenRevoked {
            if let Some(tx) = revoked_tx.take() {
                let _ = tx.send(());
            }
        }
    })?;

    // The gear does not buffer; the permission loop is attached by now.
    debug_assert_eq!(scenario.gear.listener_count(), 1);

    let session = scenario
        .session
        .start_with(|state| info!(?state, "Session state"))?;

    tokio::time::timeout(REVOCATION_DEADLINE, revoked_rx)
        .await
        .context("user was not revoked in time")?
        .context("permission loop stopped before revoking")?;

    scenario.session.stop(session);
    scenario.permissions.stop(permissions);
    info!("Authorization scenario complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_response_signs_session_out() {
        let state = reduce_session(Session::SignedOut, SessionEvent::SignedIn);
        assert_eq!(state, Session::SignedIn);
        assert_eq!(
            reduce_session(state.clone(), SessionEvent::ResponseReceived(200)),
            Session::SignedIn
        );
        assert_eq!(
            reduce_session(state, SessionEvent::ResponseReceived(403)),
            Session::Unauthorized
        );
    }

    #[test]
    fn revocation_requires_a_check_first() {
        assert_eq!(
            reduce_permission(Permission::Initial, PermissionEvent::Revoked),
            Permission::Initial
        );
        let checked = reduce_permission(Permission::Initial, PermissionEvent::CheckAuthorization);
        assert_eq!(
            reduce_permission(checked, PermissionEvent::Revoked),
            Permission::UserHasBeenRevoked
        );
    }

    #[tokio::test]
    async fn scenario_revokes_user() {
        run(&EngineConfig::default()).await.unwrap();
    }
}
