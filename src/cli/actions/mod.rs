pub mod server;

use secrecy::SecretString;

#[derive(Debug)]
pub enum Action {
    Server {
        port: u16,
        dsn: String,
        frontend_url: String,
        signing_secret: SecretString,
        verifier_url: Option<String>,
        resolver_url: Option<String>,
        challenge_ttl_seconds: i64,
        access_ttl_seconds: i64,
        refresh_ttl_seconds: i64,
    },
}
