//! Client facade.
//!
//! [`Client`] is the typed entry point over the session manager: UDP query
//! operations and the RCON pair, each returning a future-valued result. The
//! facade owns no mutable state except the per-destination RCON session
//! table, which gates `rcon_execute` behind a successful authentication.
//!
//! # Example
//!
//! ```ignore
//! use sourcewire::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder().build().await?;
//!
//!     let info = client.query_info("203.0.113.5:27015".parse()?).await?;
//!     println!("{} on {}", info.name, info.map);
//!
//!     let addr = "203.0.113.5:27015".parse()?;
//!     if client.rcon_authenticate(addr, "password").await? {
//!         let status = client.rcon_execute(addr, "status").await?;
//!         println!("{status}");
//!     }
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use crate::codec::query::DEFAULT_CHALLENGE;
use crate::config::Config;
use crate::error::{CodecError, RconError, Result};
use crate::request::{Destination, Priority, Request, RequestPayload};
use crate::response::{Player, Response, ServerInfo};
use crate::session::{RconSession, RconSessionTable, SessionManager};

/// Builder for configuring and creating a [`Client`].
pub struct ClientBuilder {
    config: Config,
}

impl ClientBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Bind sockets, start the engine and return the client.
    pub async fn build(self) -> Result<Client> {
        let rcon_sessions: RconSessionTable = Arc::new(Mutex::new(HashMap::new()));
        let session = SessionManager::start(self.config.clone(), rcon_sessions.clone()).await?;

        Ok(Client {
            config: self.config,
            session,
            rcon_sessions,
            id_seed: AtomicU32::new(seed_from_clock()),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running query client.
pub struct Client {
    config: Config,
    session: SessionManager,
    rcon_sessions: RconSessionTable,
    id_seed: AtomicU32,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Query server information (A2S_INFO).
    pub async fn query_info(&self, addr: SocketAddr) -> Result<ServerInfo> {
        let request = self.query_request(addr, RequestPayload::Info);
        match self.session.dispatch(request)?.await? {
            Response::Info(info) => Ok(info),
            other => Err(unexpected_variant("info", &other)),
        }
    }

    /// Query the player list (A2S_PLAYER). The challenge round-trip, if the
    /// server demands one, happens transparently.
    pub async fn query_players(&self, addr: SocketAddr) -> Result<Vec<Player>> {
        let request = self.query_request(
            addr,
            RequestPayload::Players {
                challenge: DEFAULT_CHALLENGE,
            },
        );
        match self.session.dispatch(request)?.await? {
            Response::Players(players) => Ok(players),
            other => Err(unexpected_variant("players", &other)),
        }
    }

    /// Query server rules (A2S_RULES) as a key/value map.
    pub async fn query_rules(&self, addr: SocketAddr) -> Result<HashMap<String, String>> {
        let request = self.query_request(
            addr,
            RequestPayload::Rules {
                challenge: DEFAULT_CHALLENGE,
            },
        );
        match self.session.dispatch(request)?.await? {
            Response::Rules(rules) => Ok(rules),
            other => Err(unexpected_variant("rules", &other)),
        }
    }

    /// Authenticate against the destination's RCON interface.
    ///
    /// Resolves to `false` on rejection; subsequent [`rcon_execute`] calls
    /// fail until a later attempt succeeds.
    pub async fn rcon_authenticate(&self, addr: SocketAddr, password: &str) -> Result<bool> {
        let destination = Destination::rcon(addr);
        {
            let mut sessions = self.rcon_sessions.lock().expect("rcon session table poisoned");
            sessions.entry(destination).or_insert_with(RconSession::new);
        }

        let id = self.next_request_id();
        tracing::debug!("authenticating with {} using request id {}", destination, id);
        let request = Request::new(
            destination,
            RequestPayload::Auth {
                id,
                password: password.to_string(),
            },
            Priority::High,
            self.config.read_timeout(),
        );

        match self.session.dispatch(request)?.await? {
            Response::RconAuth { authenticated } => {
                self.touch_session(&destination);
                Ok(authenticated)
            }
            other => Err(unexpected_variant("auth", &other)),
        }
    }

    /// Execute a command on an authenticated destination.
    ///
    /// Fails immediately with [`RconError::NotAuthenticated`] when no
    /// successful authentication is on record for the destination.
    pub async fn rcon_execute(&self, addr: SocketAddr, command: &str) -> Result<String> {
        let destination = Destination::rcon(addr);
        let authenticated = self
            .rcon_sessions
            .lock()
            .expect("rcon session table poisoned")
            .get(&destination)
            .map(|s| s.authenticated)
            .unwrap_or(false);
        if !authenticated {
            return Err(RconError::NotAuthenticated.into());
        }

        let id = self.next_request_id();
        tracing::debug!("executing command on {} with request id {}", destination, id);
        let request = Request::new(
            destination,
            RequestPayload::Command {
                id,
                body: command.to_string(),
            },
            Priority::Normal,
            self.config.read_timeout(),
        );

        match self.session.dispatch(request)?.await? {
            Response::RconOutput(output) => {
                self.touch_session(&destination);
                Ok(output)
            }
            other => Err(unexpected_variant("command", &other)),
        }
    }

    /// The session manager, for direct dispatch and cancellation.
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    fn query_request(&self, addr: SocketAddr, payload: RequestPayload) -> Request {
        Request::new(
            Destination::query(addr),
            payload,
            Priority::Normal,
            self.config.read_timeout(),
        )
    }

    fn touch_session(&self, destination: &Destination) {
        let mut sessions = self.rcon_sessions.lock().expect("rcon session table poisoned");
        if let Some(session) = sessions.get_mut(destination) {
            session.last_used = Instant::now();
        }
    }

    /// Caller-side RCON correlation ids: positive, never 0 or -1, and
    /// unlikely to repeat within a connection's lifetime.
    fn next_request_id(&self) -> i32 {
        let next = self
            .id_seed
            .fetch_add(0x9E37_79B9, Ordering::Relaxed)
            .wrapping_mul(0x85EB_CA6B);
        (next % 900_000_000) as i32 + 100_000_000
    }
}

/// Mix the clock into the first request id so restarts do not replay ids.
fn seed_from_clock() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
        .wrapping_mul(0x517C_C1B7)
}

fn unexpected_variant(expected: &str, got: &Response) -> crate::error::SourcewireError {
    CodecError::Framing(format!(
        "expected {expected} response, session produced {got:?}"
    ))
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_defaults() {
        let client = Client::builder().build().await.unwrap();
        assert_eq!(client.session().config().max_retries, 2);
    }

    #[tokio::test]
    async fn test_builder_custom_config() {
        let config = Config {
            read_timeout_ms: 1_234,
            ..Config::default()
        };
        let client = Client::builder().config(config).build().await.unwrap();
        assert_eq!(client.session().config().read_timeout_ms, 1_234);
    }

    #[tokio::test]
    async fn test_request_ids_are_in_range_and_distinct() {
        let client = Client::builder().build().await.unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = client.next_request_id();
            assert!((100_000_000..1_000_000_000).contains(&id));
            seen.insert(id);
        }
        // The sequence must not be constant; a few collisions would be
        // astonishing but only full degeneracy is a bug.
        assert!(seen.len() > 90);
    }

    #[tokio::test]
    async fn test_execute_without_auth_is_rejected() {
        let client = Client::builder().build().await.unwrap();
        let result = client
            .rcon_execute("127.0.0.1:29999".parse().unwrap(), "status")
            .await;
        assert!(matches!(
            result,
            Err(crate::error::SourcewireError::Rcon(
                RconError::NotAuthenticated
            ))
        ));
    }
}
