use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::ProtocolError;
use crate::constants::{DEFAULT_GROUP, QUERY_GROUP, QUERY_NAME, STATS_LAST_SEEN};

/// Free-form statistics report: field name to value.
pub type Stats = Map<String, Value>;

/// Identity an agent presents in its connection handshake.
///
/// Chosen once when a session is built and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
}

fn default_group() -> String {
    DEFAULT_GROUP.into()
}

impl AgentIdentity {
    /// Creates an identity in the default group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: default_group(),
        }
    }

    /// Sets the group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Reads the identity from a handshake query string.
    ///
    /// A missing `name` yields an empty name, which the hub refuses to admit.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut name = String::new();
        let mut group = None;
        if let Some(query) = query {
            for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
                match k.as_ref() {
                    QUERY_NAME if name.is_empty() => name = v.into_owned(),
                    QUERY_GROUP if group.is_none() => group = Some(v.into_owned()),
                    _ => {}
                }
            }
        }
        Self {
            name,
            group: group.filter(|g| !g.is_empty()).unwrap_or_else(default_group),
        }
    }

    /// Builds the connection address for this identity on the given hub.
    ///
    /// Existing `name`/`group` parameters on `base` are replaced; any other
    /// query parameters are kept.
    pub fn connect_url(&self, base: &Url) -> Url {
        let kept: Vec<(String, String)> = base
            .query_pairs()
            .filter(|(k, _)| k != QUERY_NAME && k != QUERY_GROUP)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut url = base.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            for (k, v) in &kept {
                pairs.append_pair(k, v);
            }
            pairs
                .append_pair(QUERY_NAME, &self.name)
                .append_pair(QUERY_GROUP, &self.group);
        }
        url
    }
}

/// Parses a hub address, accepting `http(s)://` as an alias of `ws(s)://`.
pub fn parse_hub_url(raw: &str) -> Result<Url, ProtocolError> {
    let mut url = Url::parse(raw)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(ProtocolError::UnsupportedScheme(other.to_string())),
    };
    if url.scheme() != scheme {
        // Switching between two special schemes cannot fail.
        let _ = url.set_scheme(scheme);
    }
    Ok(url)
}

/// Builds `ws://<host>:<port>/` for a hub.
pub fn hub_url(host: &str, port: u16) -> Result<Url, ProtocolError> {
    Ok(Url::parse(&format!("ws://{host}:{port}/"))?)
}

/// Statistics the hub keeps for one live agent.
///
/// Reports are shallow-merged into `fields` (last write wins per field) and
/// every report refreshes `last_seen`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    #[serde(flatten)]
    pub fields: Stats,
    /// Unix time of the latest report, in milliseconds.
    #[serde(rename = "lastSeen")]
    pub last_seen: i64,
}

impl AgentStats {
    /// Creates empty statistics seen at `now`.
    pub fn new(now: i64) -> Self {
        Self {
            fields: Map::new(),
            last_seen: now,
        }
    }

    /// Merges a report. A reported `lastSeen` is ignored.
    pub fn merge(&mut self, mut report: Stats, now: i64) {
        report.remove(STATS_LAST_SEEN);
        self.fields.extend(report);
        self.last_seen = now;
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
