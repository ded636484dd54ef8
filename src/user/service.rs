use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

use super::{NewUser, Role, User, UserStore};
use crate::crypto::{Crypto, random_token};
use crate::error::{Result, ServerError};
use crate::mail::{Mailer, Template, TemplateVars};
use crate::saga::{Saga, Step};

/// How invitations are issued and delivered.
#[derive(Clone, Debug)]
pub struct InvitationSettings {
    /// Invitation validity.
    pub expiry: Duration,
    /// Base of activation links, without trailing slash.
    pub frontend_url: String,
    pub sandbox: bool,
    /// Bound of the whole notification step, retries included.
    pub notify_timeout: Duration,
}

/// Provisioning, activation and authentication of identities.
#[derive(Clone)]
pub struct IdentityService {
    store: Arc<dyn UserStore>,
    mailer: Arc<dyn Mailer>,
    crypto: Arc<Crypto>,
    settings: InvitationSettings,
}

/// Shared context of the provisioning saga.
struct Provisioning {
    user: User,
    token: Zeroizing<String>,
    token_hash: String,
    expiry: DateTime<Utc>,
}

struct PersistIdentity {
    store: Arc<dyn UserStore>,
}

#[async_trait]
impl Step<Provisioning> for PersistIdentity {
    fn name(&self) -> &'static str {
        "persist_identity"
    }

    async fn execute(&self, ctx: &mut Provisioning) -> Result<()> {
        self.store
            .create_and_invite(&mut ctx.user, &ctx.token_hash, ctx.expiry)
            .await
    }

    async fn compensate(&self, ctx: &Provisioning) -> Result<()> {
        self.store.delete(ctx.user.id).await?;
        tracing::info!(user_id = ctx.user.id, "identity removed after failed provisioning");
        Ok(())
    }
}

struct SendInvitation {
    mailer: Arc<dyn Mailer>,
    settings: InvitationSettings,
}

#[async_trait]
impl Step<Provisioning> for SendInvitation {
    fn name(&self) -> &'static str {
        "send_invitation"
    }

    async fn execute(&self, ctx: &mut Provisioning) -> Result<()> {
        let vars = TemplateVars {
            username: ctx.user.username.clone(),
            activation_url: format!(
                "{}/confirm/{}",
                self.settings.frontend_url,
                ctx.token.as_str()
            ),
            activation_code: ctx.token.to_string(),
        };

        let status = tokio::time::timeout(
            self.settings.notify_timeout,
            self.mailer.send(
                Template::UserInvitation,
                &ctx.user.username,
                &ctx.user.email,
                &vars,
                self.settings.sandbox,
            ),
        )
        .await??;

        tracing::info!(user_id = ctx.user.id, status, "invitation sent");
        Ok(())
    }
}

impl IdentityService {
    pub fn new(
        store: Arc<dyn UserStore>,
        mailer: Arc<dyn Mailer>,
        crypto: Arc<Crypto>,
        settings: InvitationSettings,
    ) -> Self {
        Self {
            store,
            mailer,
            crypto,
            settings,
        }
    }

    /// Hash `password` without blocking the runtime.
    async fn hash_password(&self, password: Zeroizing<String>) -> Result<String> {
        let crypto = Arc::clone(&self.crypto);

        tokio::task::spawn_blocking(move || crypto.pwd.hash_password(password.as_bytes()))
            .await
            .map_err(|err| ServerError::internal("hashing task failed", err))?
            .map_err(|err| ServerError::internal("cannot hash password", err))
    }

    /// Create an inactive identity and deliver its invitation.
    ///
    /// Returns the identity with the plaintext activation token. If the
    /// invitation cannot be delivered, the identity is removed and the
    /// delivery error returned.
    pub async fn provision(
        &self,
        draft: NewUser,
        password: &str,
    ) -> Result<(User, String)> {
        let password = self.hash_password(Zeroizing::new(password.to_owned())).await?;

        let token = Zeroizing::new(random_token());
        let expiry = Utc::now()
            + chrono::Duration::from_std(self.settings.expiry)
                .map_err(|err| ServerError::internal("invalid invitation expiry", err))?;

        let mut ctx = Provisioning {
            user: User {
                username: draft.username,
                email: draft.email,
                password,
                role: Role {
                    name: draft.role,
                    ..Default::default()
                },
                ..Default::default()
            },
            token_hash: self.crypto.hasher.digest(token.as_bytes()),
            token,
            expiry,
        };

        let saga = Saga::new("provision_identity")
            .step(PersistIdentity {
                store: Arc::clone(&self.store),
            })
            .step(SendInvitation {
                mailer: Arc::clone(&self.mailer),
                settings: self.settings.clone(),
            });

        // detached so a dropped request cannot skip compensation.
        let ctx = tokio::spawn(async move {
            saga.run(&mut ctx).await?;
            Ok::<_, ServerError>(ctx)
        })
        .await
        .map_err(|err| ServerError::internal("provisioning task failed", err))??;

        metrics::counter!("identities_provisioned_total").increment(1);
        tracing::info!(user_id = ctx.user.id, "identity provisioned");

        Ok((ctx.user, ctx.token.to_string()))
    }

    /// Consume an activation token.
    pub async fn activate(&self, token: &str) -> Result<()> {
        let user_id = self.store.activate(&self.crypto.hasher.digest(token)).await?;
        tracing::info!(user_id, "identity activated");
        Ok(())
    }

    /// Check credentials of an active identity.
    ///
    /// Unknown email and wrong password are indistinguishable.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<User> {
        let user = match self.store.get_by_email(email).await {
            Ok(user) => Some(user),
            Err(ServerError::NotFound) => None,
            Err(err) => return Err(err),
        };

        let crypto = Arc::clone(&self.crypto);
        let phc = user.as_ref().map(|user| user.password.clone());
        let password = Zeroizing::new(password.to_owned());
        // unknown emails pay the same hashing cost as wrong passwords.
        tokio::task::spawn_blocking(move || match phc {
            Some(phc) => crypto.pwd.verify_password(password.as_bytes(), &phc),
            None => crypto.pwd.verify_decoy(password.as_bytes()),
        })
        .await
        .map_err(|err| ServerError::internal("hashing task failed", err))?
        .map_err(|_| ServerError::Unauthorized)?;

        user.ok_or(ServerError::Unauthorized)
    }

    /// Remove an identity.
    pub async fn delete(&self, id: i64) -> Result<()> {
        self.store.delete(id).await?;
        tracing::info!(user_id = id, "identity deleted");
        Ok(())
    }
}
