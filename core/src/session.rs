/// Authenticated session: owns the real-time connection between login and logout
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::realtime::{
    ConnectionManager, ConnectionState, Connector, Credential, EventDispatcher, RetryPolicy,
};
use std::future::Future;
use tracing::{info, warn};

/// Supplies the credential of the logged-in user
pub trait CredentialProvider: Send + Sync {
    fn credential(&self) -> impl Future<Output = Result<Credential>> + Send;
}

impl CredentialProvider for Credential {
    async fn credential(&self) -> Result<Credential> {
        Ok(self.clone())
    }
}

/// Reads `CHATLINK_USER_ID` and `CHATLINK_TOKEN`
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    async fn credential(&self) -> Result<Credential> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ChatError::Config(format!("{} is not set", name)))
        };
        Ok(Credential::new(read("CHATLINK_USER_ID")?, read("CHATLINK_TOKEN")?))
    }
}

/// Everything that lives exactly as long as a login
pub struct SessionContext<C: Connector> {
    credential: Credential,
    config: Config,
    connection: ConnectionManager<C>,
}

impl<C: Connector> SessionContext<C> {
    /// Log in and bring up the real-time connection.
    ///
    /// A connection that cannot be established is not fatal: the session is
    /// returned in the `Failed` state and can be retried with [`reconnect`].
    ///
    /// [`reconnect`]: SessionContext::reconnect
    pub async fn login<P: CredentialProvider>(
        config: Config,
        connector: C,
        provider: &P,
    ) -> Result<Self> {
        let credential = provider.credential().await?;
        let connection = ConnectionManager::new(
            connector,
            EventDispatcher::new(),
            RetryPolicy::from_config(&config),
        );
        let session = Self {
            credential,
            config,
            connection,
        };

        info!("Logging in as {}", session.credential.user_id);
        if let Err(e) = session.connection.connect(session.credential.clone()).await {
            warn!("Real-time connection unavailable: {}", e);
        }
        Ok(session)
    }

    /// Switch user; the previous user's connection is torn down first
    pub async fn login_as(&mut self, credential: Credential) -> Result<()> {
        info!("Switching session to {}", credential.user_id);
        self.connection.dispatcher().scope_to(None);
        self.credential = credential;
        self.connection.connect(self.credential.clone()).await
    }

    /// Retry the connection after retries were exhausted
    pub async fn reconnect(&self) -> Result<()> {
        self.connection.connect(self.credential.clone()).await
    }

    /// Disconnect and drop every event subscription
    pub async fn logout(&self) {
        info!("Logging out {}", self.credential.user_id);
        self.connection.disconnect().await;
        self.connection.dispatcher().scope_to(None);
    }

    pub fn user_id(&self) -> &str {
        &self.credential.user_id
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionManager<C> {
        &self.connection
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        self.connection.dispatcher()
    }

    pub async fn state(&self) -> ConnectionState {
        self.connection.state().await
    }
}
