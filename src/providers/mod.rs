//! Provider adapters
//!
//! Static descriptions of each supported platform: how its OAuth tokens are
//! refreshed and which data endpoints the poll scheduler reads. The
//! [`registry::Registry`] is built once at startup from the
//! [`catalog`] and handed to the services that need it.

pub mod catalog;
pub mod registry;

pub use registry::Registry;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Supported platforms.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Spotify,
    Github,
    Youtube,
    Reddit,
    Discord,
    Twitch,
    Strava,
    Fitbit,
    Lastfm,
    Steam,
    Linkedin,
    Tiktok,
    X,
    Pinterest,
    Gmail,
}

impl Provider {
    pub const ALL: [Provider; 15] = [
        Provider::Spotify,
        Provider::Github,
        Provider::Youtube,
        Provider::Reddit,
        Provider::Discord,
        Provider::Twitch,
        Provider::Strava,
        Provider::Fitbit,
        Provider::Lastfm,
        Provider::Steam,
        Provider::Linkedin,
        Provider::Tiktok,
        Provider::X,
        Provider::Pinterest,
        Provider::Gmail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Spotify => "spotify",
            Provider::Github => "github",
            Provider::Youtube => "youtube",
            Provider::Reddit => "reddit",
            Provider::Discord => "discord",
            Provider::Twitch => "twitch",
            Provider::Strava => "strava",
            Provider::Fitbit => "fitbit",
            Provider::Lastfm => "lastfm",
            Provider::Steam => "steam",
            Provider::Linkedin => "linkedin",
            Provider::Tiktok => "tiktok",
            Provider::X => "x",
            Provider::Pinterest => "pinterest",
            Provider::Gmail => "gmail",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|provider| provider.as_str() == value)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How client credentials ride on a refresh request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantStyle {
    /// `Authorization: Basic base64(client_id:client_secret)`; the form body
    /// carries only `grant_type` and `refresh_token`
    BasicAuthHeader,
    /// `client_id` and `client_secret` as form fields, no Authorization
    /// header
    ClientSecretInBody,
}

/// Where the interesting items live in a poll response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultShape {
    /// Top-level JSON array
    Array,
    /// Array under the `items` key
    Items,
    /// Array under a dotted path, e.g. `data.children`
    Nested(String),
}

impl ResultShape {
    /// Item count for observability. Bodies that do not match the declared
    /// shape count as a single item.
    pub fn count_items(&self, body: &JsonValue) -> usize {
        let items = match self {
            ResultShape::Array => body.as_array(),
            ResultShape::Items => body.get("items").and_then(JsonValue::as_array),
            ResultShape::Nested(path) => {
                let mut cursor = body;
                for segment in path.split('.') {
                    match cursor.get(segment) {
                        Some(next) => cursor = next,
                        None => return 1,
                    }
                }
                cursor.as_array()
            }
        };
        items.map(Vec::len).unwrap_or(1)
    }
}

/// OAuth refresh endpoint description for one provider.
#[derive(Debug, Clone)]
pub struct RefreshEndpoint {
    pub token_url: String,
    pub grant_style: GrantStyle,
    pub client_id: String,
    pub client_secret: String,
    /// Extra form fields, sent with [`GrantStyle::ClientSecretInBody`] only
    pub extra_params: Vec<(String, String)>,
}

/// One pollable sub-resource.
#[derive(Debug, Clone)]
pub struct PollEndpoint {
    /// Stored as `data_type` on captured rows
    pub data_type: String,
    /// May contain a `{username}` placeholder
    pub url_template: String,
    /// Default query parameters appended to every request
    pub query: Vec<(String, String)>,
    pub result_shape: ResultShape,
}

impl PollEndpoint {
    pub fn requires_username(&self) -> bool {
        self.url_template.contains("{username}")
    }

    /// Render the request URL. `None` when the template needs a username and
    /// the connection has none to offer.
    pub fn render_url(&self, username: Option<&str>) -> Option<String> {
        if self.requires_username() {
            username.map(|name| self.url_template.replace("{username}", name))
        } else {
            Some(self.url_template.clone())
        }
    }
}

/// Poll cadence and ordered endpoints for one provider.
#[derive(Debug, Clone)]
pub struct PollPlan {
    pub interval_seconds: u64,
    pub endpoints: Vec<PollEndpoint>,
}

/// Everything the schedulers need to know about one provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub provider: Provider,
    /// `None` when the provider never refreshes (non-expiring tokens) or no
    /// client credentials are configured
    pub refresh: Option<RefreshEndpoint>,
    pub poll: Option<PollPlan>,
}
