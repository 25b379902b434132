//! Typed response values handed back to callers.

use std::collections::HashMap;

/// Server information from an A2S_INFO reply.
///
/// The fields after `version` come from the Extra Data Flag byte and are only
/// present when the server sets the corresponding bit.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    /// Protocol version.
    pub protocol: u8,
    /// Server hostname.
    pub name: String,
    /// Current map.
    pub map: String,
    /// Name of the folder containing the game files.
    pub folder: String,
    /// Full name of the game.
    pub game: String,
    /// Steam application id.
    pub app_id: u16,
    /// Current player count.
    pub players: u8,
    /// Maximum player count.
    pub max_players: u8,
    /// Current bot count.
    pub bots: u8,
    /// `d` dedicated, `l` listen, `p` SourceTV relay.
    pub server_type: char,
    /// `l` Linux, `w` Windows, `m`/`o` macOS.
    pub environment: char,
    /// Whether the server requires a password.
    pub password_protected: bool,
    /// Whether the server uses VAC.
    pub vac_enabled: bool,
    /// Version of the game installed on the server.
    pub version: String,
    /// Extra Data Flag byte, zero when absent.
    pub edf: u8,
    /// Game port (EDF 0x80).
    pub port: Option<u16>,
    /// Server Steam id (EDF 0x10).
    pub steam_id: Option<u64>,
    /// SourceTV port (EDF 0x40).
    pub stv_port: Option<u16>,
    /// SourceTV name (EDF 0x40).
    pub stv_name: Option<String>,
    /// Comma-delimited tags (EDF 0x20).
    pub keywords: Option<String>,
    /// 64-bit game id (EDF 0x01).
    pub game_id: Option<u64>,
}

/// One player entry from an A2S_PLAYER reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    /// Index of the chunk this player sits in; rarely meaningful.
    pub index: u8,
    /// Player name.
    pub name: String,
    /// Player score.
    pub score: i32,
    /// Time connected, in seconds.
    pub duration: f32,
}

/// A completed request's value, before the facade narrows it.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// A2S_INFO result.
    Info(ServerInfo),
    /// A2S_PLAYER result.
    Players(Vec<Player>),
    /// A2S_RULES result.
    Rules(HashMap<String, String>),
    /// RCON authentication outcome.
    RconAuth { authenticated: bool },
    /// Concatenated RCON command output.
    RconOutput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_variants_compare() {
        let a = Response::RconAuth {
            authenticated: true,
        };
        let b = Response::RconAuth {
            authenticated: true,
        };
        assert_eq!(a, b);

        let out = Response::RconOutput("hostname: X\n".to_string());
        assert_ne!(a, out);
    }
}
