//! Phone-number login through the bot chat.
//!
//! `/login` opens a client on the user's session file and asks Telegram for a
//! code, `/verify` signs in with it and `/password` finishes 2FA. The pending
//! client lives here until the login completes or is cancelled; afterwards
//! the session manager reopens it from the file on demand.

use std::collections::HashMap;
use std::future::Future;

use grammers_client::client::{LoginToken, PasswordToken};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::client::{GrammersConnector, TelegramError, UserClient, mask_phone};
use crate::queue::UserId;
use crate::session::SessionConnector;

/// Login flow errors.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("No login in progress. Start with /login <phone>")]
    NoPendingLogin,

    #[error("This account is already logged in")]
    AlreadyLoggedIn,

    #[error("The code is wrong, send it again with /verify <code>")]
    InvalidCode,

    #[error("The password is wrong, send it again with /password <password>")]
    InvalidPassword,

    #[error("Expected {0} at this step")]
    WrongStep(&'static str),

    #[error(transparent)]
    Telegram(#[from] TelegramError),

    #[error("Failed to remove session file: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a login stands after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginStep {
    /// A code was sent to the user's Telegram app.
    CodeSent,
    /// The account has 2FA enabled.
    PasswordNeeded { hint: Option<String> },
    /// Signed in, the session file is ready.
    LoggedIn,
}

/// The account login flow as seen by command handlers.
pub trait LoginBackend: Send + Sync + 'static {
    fn request_code(&self, user_id: UserId, phone: &str) -> impl Future<Output = Result<LoginStep, LoginError>> + Send;

    fn submit_code(&self, user_id: UserId, code: &str) -> impl Future<Output = Result<LoginStep, LoginError>> + Send;

    fn submit_password(
        &self,
        user_id: UserId,
        password: &str,
    ) -> impl Future<Output = Result<LoginStep, LoginError>> + Send;

    /// Drops a pending login. Returns false when none was pending.
    fn cancel(&self, user_id: UserId) -> impl Future<Output = bool> + Send;

    /// Signs the account out and deletes its session file.
    /// Returns false when there was no saved login.
    fn logout(&self, user_id: UserId) -> impl Future<Output = Result<bool, LoginError>> + Send;
}

enum Stage {
    Code(LoginToken),
    Password(PasswordToken),
}

struct PendingLogin {
    client: UserClient,
    stage: Stage,
}

/// Login backend over grammers user clients.
pub struct PhoneLogin {
    connector: GrammersConnector,
    pending: Mutex<HashMap<UserId, PendingLogin>>,
}

impl PhoneLogin {
    #[must_use]
    pub fn new(connector: GrammersConnector) -> Self {
        Self {
            connector,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Deletes a session file that never finished signing in.
    async fn discard_session(&self, user_id: UserId) {
        let path = self.connector.session_path(user_id);
        if let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to remove session {}: {}", path.display(), e);
        }
    }

    async fn take_pending(&self, user_id: UserId) -> Result<PendingLogin, LoginError> {
        self.pending
            .lock()
            .await
            .remove(&user_id)
            .ok_or(LoginError::NoPendingLogin)
    }

    async fn put_pending(&self, user_id: UserId, client: UserClient, stage: Stage) {
        self.pending
            .lock()
            .await
            .insert(user_id, PendingLogin { client, stage });
    }
}

fn finish(user_id: UserId, client: &UserClient) -> LoginStep {
    client.quit();
    info!("User {} logged in", user_id);
    LoginStep::LoggedIn
}

impl LoginBackend for PhoneLogin {
    async fn request_code(&self, user_id: UserId, phone: &str) -> Result<LoginStep, LoginError> {
        if let Some(previous) = self.pending.lock().await.remove(&user_id) {
            previous.client.quit();
        }

        let client = self.connector.connect_for_login(user_id).await?;
        if client.check_authorized().await? {
            client.quit();
            return Err(LoginError::AlreadyLoggedIn);
        }

        debug!("User {} requested a code for {}", user_id, mask_phone(phone));
        let api_hash = self.connector.config().api_hash.clone();
        match client.request_login_code(phone, &api_hash).await {
            Ok(token) => {
                self.put_pending(user_id, client, Stage::Code(token)).await;
                Ok(LoginStep::CodeSent)
            }
            Err(e) => {
                client.quit();
                self.discard_session(user_id).await;
                Err(e.into())
            }
        }
    }

    async fn submit_code(&self, user_id: UserId, code: &str) -> Result<LoginStep, LoginError> {
        let code: String = code.chars().filter(char::is_ascii_digit).collect();

        let login = self.take_pending(user_id).await?;
        let token = match login.stage {
            Stage::Code(token) => token,
            stage @ Stage::Password(_) => {
                self.put_pending(user_id, login.client, stage).await;
                return Err(LoginError::WrongStep("/password"));
            }
        };

        match login.client.sign_in(&token, &code).await {
            Ok(()) => Ok(finish(user_id, &login.client)),
            Err(TelegramError::PasswordRequired(password_token)) => {
                let hint = password_token.hint().map(ToString::to_string);
                self.put_pending(user_id, login.client, Stage::Password(password_token))
                    .await;
                Ok(LoginStep::PasswordNeeded { hint })
            }
            Err(TelegramError::InvalidCode) => {
                self.put_pending(user_id, login.client, Stage::Code(token)).await;
                Err(LoginError::InvalidCode)
            }
            Err(e) => {
                login.client.quit();
                self.discard_session(user_id).await;
                Err(e.into())
            }
        }
    }

    async fn submit_password(&self, user_id: UserId, password: &str) -> Result<LoginStep, LoginError> {
        let login = self.take_pending(user_id).await?;
        let token = match login.stage {
            Stage::Password(token) => token,
            stage @ Stage::Code(_) => {
                self.put_pending(user_id, login.client, stage).await;
                return Err(LoginError::WrongStep("/verify"));
            }
        };

        match login.client.check_password(token, password).await {
            Ok(()) => Ok(finish(user_id, &login.client)),
            Err(TelegramError::InvalidPassword(token)) => {
                self.put_pending(user_id, login.client, Stage::Password(token))
                    .await;
                Err(LoginError::InvalidPassword)
            }
            Err(e) => {
                login.client.quit();
                self.discard_session(user_id).await;
                Err(e.into())
            }
        }
    }

    async fn cancel(&self, user_id: UserId) -> bool {
        let Some(login) = self.pending.lock().await.remove(&user_id) else {
            return false;
        };
        login.client.quit();
        self.discard_session(user_id).await;
        debug!("User {} cancelled login", user_id);
        true
    }

    async fn logout(&self, user_id: UserId) -> Result<bool, LoginError> {
        self.cancel(user_id).await;

        if !self.connector.has_saved_session(user_id) {
            return Ok(false);
        }

        match self.connector.connect(user_id).await {
            Ok(client) => {
                if let Err(e) = client.log_out().await {
                    warn!("Telegram log out for user {} failed: {}", user_id, e);
                }
                client.quit();
            }
            Err(e) => warn!("Could not open session of user {} for log out: {}", user_id, e),
        }

        tokio::fs::remove_file(self.connector.session_path(user_id)).await?;
        info!("User {} logged out", user_id);
        Ok(true)
    }
}

impl std::fmt::Debug for PhoneLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhoneLogin")
            .field("connector", &self.connector)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_error_messages() {
        assert!(LoginError::NoPendingLogin.to_string().contains("/login"));
        assert_eq!(
            LoginError::WrongStep("/password").to_string(),
            "Expected /password at this step"
        );
        let err: LoginError = TelegramError::FloodWait(30).into();
        assert_eq!(err.to_string(), "Flood wait required: 30 seconds");
    }
}
