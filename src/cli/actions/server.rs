use crate::api;
use crate::api::handlers::auth::AuthConfig;
use crate::cli::actions::Action;
use anyhow::Result;

/// Handle the server action
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Server {
            port,
            dsn,
            frontend_url,
            signing_secret,
            verifier_url,
            resolver_url,
            challenge_ttl_seconds,
            access_ttl_seconds,
            refresh_ttl_seconds,
        } => {
            let auth_config = AuthConfig::new(frontend_url)
                .with_challenge_ttl_seconds(challenge_ttl_seconds)
                .with_access_ttl_seconds(access_ttl_seconds)
                .with_refresh_ttl_seconds(refresh_ttl_seconds);

            api::new(
                port,
                dsn,
                auth_config,
                signing_secret,
                verifier_url,
                resolver_url,
            )
            .await?;
        }
    }

    Ok(())
}
