//! Shared HTTP session with per-adapter login coordination
//!
//! One [`Session`] wraps the shared `reqwest` client for a run. Adapter
//! login routines register through [`login_once`](Session::login_once): the
//! first caller for an (adapter, session) pair runs the login, every later
//! caller rendezvouses on the same slot and reads the cached outcome instead
//! of re-attempting. A login known to have failed in this run is not
//! retried.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Cached result of a completed login attempt
#[derive(Clone, Debug)]
enum LoginOutcome {
    Success,
    Failure(String),
}

/// One login slot: the mutex serializes attempts, the inner option holds the
/// outcome once an attempt finished
type LoginSlot = Arc<Mutex<Option<LoginOutcome>>>;

/// Shared HTTP session for one run
#[derive(Clone)]
pub struct Session {
    client: reqwest::Client,
    logins: Arc<Mutex<HashMap<String, LoginSlot>>>,
}

impl Session {
    /// Build a session with the given per-request timeout
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("sitesync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            logins: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// The underlying HTTP client
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Start a GET request
    pub fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.get(url)
    }

    /// Run `login` at most once for `adapter_id` within this session.
    ///
    /// Concurrent callers block on the slot until the first attempt
    /// finishes, then read its cached outcome. A cached failure surfaces as
    /// [`Error::Login`] without a new attempt.
    pub async fn login_once<Fut>(&self, adapter_id: &str, login: Fut) -> Result<()>
    where
        Fut: Future<Output = Result<()>>,
    {
        let slot = {
            let mut logins = self.logins.lock().await;
            logins.entry(adapter_id.to_string()).or_default().clone()
        };

        let mut outcome = slot.lock().await;
        match &*outcome {
            Some(LoginOutcome::Success) => Ok(()),
            Some(LoginOutcome::Failure(message)) => {
                tracing::debug!(adapter = adapter_id, "Reusing cached login failure");
                Err(Error::Login(message.clone()))
            }
            None => {
                tracing::debug!(adapter = adapter_id, "Attempting login");
                match login.await {
                    Ok(()) => {
                        *outcome = Some(LoginOutcome::Success);
                        Ok(())
                    }
                    Err(e) => {
                        let message = e.to_string();
                        *outcome = Some(LoginOutcome::Failure(message.clone()));
                        Err(Error::Login(message))
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}
