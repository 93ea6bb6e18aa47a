//! Session state machine and the login handshake.

use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use stowage_common::{CancellationToken, Error, Result};
use stowage_crypto::rsa::decrypt_session_id;
use stowage_crypto::{
    base64url_decode, derive_v1, derive_v2, unwrap_blob, unwrap_master_key,
    verify_temporary_session, Credentials, MasterKey,
};

use crate::api::ApiClient;

/// Observable login state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    LoggedOut,
    LoggingIn,
    LoggedIn,
}

/// An authenticated session.
pub struct ActiveSession {
    pub(crate) sid: String,
    pub(crate) master_key: MasterKey,
    pub(crate) user_handle: String,
    pub(crate) email: String,
}

impl ActiveSession {
    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn user_handle(&self) -> &str {
        &self.user_handle
    }
}

impl fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSession")
            .field("email", &self.email)
            .field("user_handle", &self.user_handle)
            .finish_non_exhaustive()
    }
}

/// State guarded by the client's session lock.
#[derive(Debug, Default)]
pub enum SessionState {
    #[default]
    LoggedOut,
    LoggingIn,
    LoggedIn(Arc<ActiveSession>),
}

impl SessionState {
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionState::LoggedOut => SessionStatus::LoggedOut,
            SessionState::LoggingIn => SessionStatus::LoggingIn,
            SessionState::LoggedIn(_) => SessionStatus::LoggedIn,
        }
    }

    /// The active session, or `InvalidState` when not logged in.
    pub fn active(&self) -> Result<&Arc<ActiveSession>> {
        match self {
            SessionState::LoggedIn(session) => Ok(session),
            SessionState::LoggingIn => Err(Error::InvalidState(
                "Login is still in progress".to_string(),
            )),
            SessionState::LoggedOut => Err(Error::InvalidState("Not logged in".to_string())),
        }
    }
}

fn field<'a>(value: &'a Value, name: &str, command: &str) -> Result<&'a str> {
    value.get(name).and_then(Value::as_str).ok_or_else(|| {
        Error::Serialization(format!("'{}' response lacks '{}'", command, name))
    })
}

async fn derive_credentials(
    email: &str,
    password: &str,
    prelogin: &Value,
) -> Result<Credentials> {
    let version = prelogin.get("v").and_then(Value::as_u64).unwrap_or(1);
    let email = email.to_string();
    let password = password.to_string();

    let derived = match version {
        1 => tokio::task::spawn_blocking(move || derive_v1(&email, &password)).await,
        2 => {
            let salt = base64url_decode(field(prelogin, "s", "us0")?)?;
            tokio::task::spawn_blocking(move || derive_v2(&password, &salt)).await
        }
        other => {
            return Err(Error::NotSupported(format!(
                "Account version {} is not supported",
                other
            )))
        }
    };
    derived.map_err(|e| Error::Crypto(format!("Key derivation task failed: {}", e)))?
}

/// Run the login handshake and return the confirmed session.
///
/// `us0` reports the account version, the password key is derived locally,
/// `us` returns the wrapped master key with an RSA or temporary session id,
/// and `ug` confirms the session is usable.
pub(crate) async fn login(
    api: &ApiClient,
    email: &str,
    password: &str,
    token: &CancellationToken,
) -> Result<ActiveSession> {
    let email = email.trim().to_lowercase();
    if email.is_empty() {
        return Err(Error::InvalidInput("Email cannot be empty".to_string()));
    }

    let prelogin = api
        .call(None, json!({"a": "us0", "user": email}), token)
        .await?;
    let creds = derive_credentials(&email, password, &prelogin).await?;
    debug!("Derived credentials for {}", email);

    let response = api
        .call(
            None,
            json!({"a": "us", "user": email, "uh": creds.user_hash}),
            token,
        )
        .await
        .map_err(|e| match e {
            Error::NotFound(_) => Error::Authentication("Invalid email or password".to_string()),
            other => other,
        })?;

    let master_key =
        unwrap_master_key(&creds.password_key, &base64url_decode(field(&response, "k", "us")?)?)?;

    let sid = if let Some(csid) = response.get("csid").and_then(Value::as_str) {
        let privk = unwrap_blob(
            &master_key,
            &base64url_decode(field(&response, "privk", "us")?)?,
        )?;
        decrypt_session_id(&privk, &base64url_decode(csid)?)?
    } else if let Some(tsid) = response.get("tsid").and_then(Value::as_str) {
        verify_temporary_session(&master_key, &base64url_decode(tsid)?)?
    } else {
        return Err(Error::Authentication(
            "Login response carried no session id".to_string(),
        ));
    };

    let user = api.call(Some(&sid), json!({"a": "ug"}), token).await?;
    let user_handle = field(&user, "u", "ug")?.to_string();
    info!("Logged in as {}", email);

    Ok(ActiveSession {
        sid,
        master_key,
        user_handle,
        email,
    })
}
