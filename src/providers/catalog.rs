//! Builtin provider catalog
//!
//! One entry per supported platform: token endpoint, grant style, poll
//! cadence and sub-resource endpoints. Client credentials come from the
//! application configuration; a provider without configured credentials is
//! still pollable but never refreshed.

use tracing::warn;

use crate::config::AppConfig;

use super::{
    GrantStyle, PollEndpoint, PollPlan, Provider, ProviderConfig, RefreshEndpoint, ResultShape,
};

const MINUTE: u64 = 60;
const HOUR: u64 = 3_600;

/// All builtin provider configurations.
pub fn builtin_providers(config: &AppConfig) -> Vec<ProviderConfig> {
    vec![
        spotify(config),
        github(config),
        youtube(config),
        reddit(config),
        discord(config),
        twitch(config),
        strava(config),
        fitbit(config),
        lastfm(),
        steam(),
        linkedin(config),
        tiktok(config),
        x(config),
        pinterest(config),
        gmail(config),
    ]
}

fn refresh(
    config: &AppConfig,
    provider: Provider,
    token_url: &str,
    grant_style: GrantStyle,
    extra_params: &[(&str, &str)],
) -> Option<RefreshEndpoint> {
    match config.provider_credentials.get(provider.as_str()) {
        Some(credentials) => Some(RefreshEndpoint {
            token_url: token_url.to_string(),
            grant_style,
            client_id: credentials.client_id.clone(),
            client_secret: credentials.client_secret.clone(),
            extra_params: extra_params
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        }),
        None => {
            warn!(
                provider = %provider,
                "token refresh disabled: no client credentials configured"
            );
            None
        }
    }
}

fn endpoint(
    data_type: &str,
    url_template: &str,
    query: &[(&str, &str)],
    result_shape: ResultShape,
) -> PollEndpoint {
    PollEndpoint {
        data_type: data_type.to_string(),
        url_template: url_template.to_string(),
        query: query
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
        result_shape,
    }
}

fn spotify(config: &AppConfig) -> ProviderConfig {
    ProviderConfig {
        provider: Provider::Spotify,
        refresh: refresh(
            config,
            Provider::Spotify,
            "https://accounts.spotify.com/api/token",
            GrantStyle::BasicAuthHeader,
            &[],
        ),
        poll: Some(PollPlan {
            interval_seconds: 30 * MINUTE,
            endpoints: vec![
                endpoint(
                    "recently_played",
                    "https://api.spotify.com/v1/me/player/recently-played",
                    &[("limit", "50")],
                    ResultShape::Items,
                ),
                endpoint(
                    "top_artists",
                    "https://api.spotify.com/v1/me/top/artists",
                    &[("limit", "50"), ("time_range", "medium_term")],
                    ResultShape::Items,
                ),
                endpoint(
                    "top_tracks",
                    "https://api.spotify.com/v1/me/top/tracks",
                    &[("limit", "50"), ("time_range", "medium_term")],
                    ResultShape::Items,
                ),
            ],
        }),
    }
}

fn github(config: &AppConfig) -> ProviderConfig {
    ProviderConfig {
        provider: Provider::Github,
        refresh: refresh(
            config,
            Provider::Github,
            "https://github.com/login/oauth/access_token",
            GrantStyle::ClientSecretInBody,
            &[],
        ),
        poll: Some(PollPlan {
            interval_seconds: 6 * HOUR,
            endpoints: vec![
                endpoint(
                    "events",
                    "https://api.github.com/users/{username}/events",
                    &[("per_page", "100")],
                    ResultShape::Array,
                ),
                endpoint(
                    "starred",
                    "https://api.github.com/user/starred",
                    &[("per_page", "100")],
                    ResultShape::Array,
                ),
            ],
        }),
    }
}

fn youtube(config: &AppConfig) -> ProviderConfig {
    ProviderConfig {
        provider: Provider::Youtube,
        refresh: refresh(
            config,
            Provider::Youtube,
            "https://oauth2.googleapis.com/token",
            GrantStyle::ClientSecretInBody,
            &[],
        ),
        poll: Some(PollPlan {
            interval_seconds: HOUR,
            endpoints: vec![
                endpoint(
                    "liked_videos",
                    "https://www.googleapis.com/youtube/v3/videos",
                    &[("part", "snippet"), ("myRating", "like"), ("maxResults", "50")],
                    ResultShape::Items,
                ),
                endpoint(
                    "subscriptions",
                    "https://www.googleapis.com/youtube/v3/subscriptions",
                    &[("part", "snippet"), ("mine", "true"), ("maxResults", "50")],
                    ResultShape::Items,
                ),
            ],
        }),
    }
}

fn reddit(config: &AppConfig) -> ProviderConfig {
    ProviderConfig {
        provider: Provider::Reddit,
        refresh: refresh(
            config,
            Provider::Reddit,
            "https://www.reddit.com/api/v1/access_token",
            GrantStyle::BasicAuthHeader,
            &[],
        ),
        poll: Some(PollPlan {
            interval_seconds: HOUR,
            endpoints: vec![
                endpoint(
                    "saved",
                    "https://oauth.reddit.com/user/{username}/saved",
                    &[("limit", "100")],
                    ResultShape::Nested("data.children".to_string()),
                ),
                endpoint(
                    "upvoted",
                    "https://oauth.reddit.com/user/{username}/upvoted",
                    &[("limit", "100")],
                    ResultShape::Nested("data.children".to_string()),
                ),
            ],
        }),
    }
}

fn discord(config: &AppConfig) -> ProviderConfig {
    ProviderConfig {
        provider: Provider::Discord,
        refresh: refresh(
            config,
            Provider::Discord,
            "https://discord.com/api/oauth2/token",
            GrantStyle::ClientSecretInBody,
            &[],
        ),
        poll: Some(PollPlan {
            interval_seconds: 6 * HOUR,
            endpoints: vec![
                endpoint(
                    "guilds",
                    "https://discord.com/api/users/@me/guilds",
                    &[],
                    ResultShape::Array,
                ),
                endpoint(
                    "connections",
                    "https://discord.com/api/users/@me/connections",
                    &[],
                    ResultShape::Array,
                ),
            ],
        }),
    }
}

fn twitch(config: &AppConfig) -> ProviderConfig {
    ProviderConfig {
        provider: Provider::Twitch,
        refresh: refresh(
            config,
            Provider::Twitch,
            "https://id.twitch.tv/oauth2/token",
            GrantStyle::ClientSecretInBody,
            &[],
        ),
        poll: Some(PollPlan {
            interval_seconds: 2 * HOUR,
            endpoints: vec![endpoint(
                "followed_streams",
                "https://api.twitch.tv/helix/streams/followed?user_id={username}",
                &[],
                ResultShape::Nested("data".to_string()),
            )],
        }),
    }
}

fn strava(config: &AppConfig) -> ProviderConfig {
    ProviderConfig {
        provider: Provider::Strava,
        refresh: refresh(
            config,
            Provider::Strava,
            "https://www.strava.com/oauth/token",
            GrantStyle::ClientSecretInBody,
            &[],
        ),
        poll: Some(PollPlan {
            interval_seconds: 6 * HOUR,
            endpoints: vec![endpoint(
                "activities",
                "https://www.strava.com/api/v3/athlete/activities",
                &[("per_page", "100")],
                ResultShape::Array,
            )],
        }),
    }
}

fn fitbit(config: &AppConfig) -> ProviderConfig {
    ProviderConfig {
        provider: Provider::Fitbit,
        refresh: refresh(
            config,
            Provider::Fitbit,
            "https://api.fitbit.com/oauth2/token",
            GrantStyle::BasicAuthHeader,
            &[],
        ),
        poll: Some(PollPlan {
            interval_seconds: 6 * HOUR,
            endpoints: vec![
                endpoint(
                    "activities",
                    "https://api.fitbit.com/1/user/-/activities/list.json",
                    &[("sort", "desc"), ("limit", "100"), ("offset", "0")],
                    ResultShape::Nested("activities".to_string()),
                ),
                endpoint(
                    "sleep",
                    "https://api.fitbit.com/1.2/user/-/sleep/list.json",
                    &[("sort", "desc"), ("limit", "100"), ("offset", "0")],
                    ResultShape::Nested("sleep".to_string()),
                ),
            ],
        }),
    }
}

// Last.fm session keys do not expire; there is nothing to refresh.
fn lastfm() -> ProviderConfig {
    ProviderConfig {
        provider: Provider::Lastfm,
        refresh: None,
        poll: Some(PollPlan {
            interval_seconds: HOUR,
            endpoints: vec![endpoint(
                "recent_tracks",
                "https://ws.audioscrobbler.com/2.0/?method=user.getrecenttracks&user={username}&format=json",
                &[("limit", "200")],
                ResultShape::Nested("recenttracks.track".to_string()),
            )],
        }),
    }
}

// Steam web API keys are long-lived; no refresh endpoint exists.
fn steam() -> ProviderConfig {
    ProviderConfig {
        provider: Provider::Steam,
        refresh: None,
        poll: Some(PollPlan {
            interval_seconds: 12 * HOUR,
            endpoints: vec![
                endpoint(
                    "owned_games",
                    "https://api.steampowered.com/IPlayerService/GetOwnedGames/v1/?steamid={username}",
                    &[("include_appinfo", "1")],
                    ResultShape::Nested("response.games".to_string()),
                ),
                endpoint(
                    "recently_played",
                    "https://api.steampowered.com/IPlayerService/GetRecentlyPlayedGames/v1/?steamid={username}",
                    &[],
                    ResultShape::Nested("response.games".to_string()),
                ),
            ],
        }),
    }
}

fn linkedin(config: &AppConfig) -> ProviderConfig {
    ProviderConfig {
        provider: Provider::Linkedin,
        refresh: refresh(
            config,
            Provider::Linkedin,
            "https://www.linkedin.com/oauth/v2/accessToken",
            GrantStyle::ClientSecretInBody,
            &[],
        ),
        poll: Some(PollPlan {
            interval_seconds: 24 * HOUR,
            endpoints: vec![endpoint(
                "profile",
                "https://api.linkedin.com/v2/me",
                &[],
                ResultShape::Array,
            )],
        }),
    }
}

fn tiktok(config: &AppConfig) -> ProviderConfig {
    ProviderConfig {
        provider: Provider::Tiktok,
        refresh: refresh(
            config,
            Provider::Tiktok,
            "https://open.tiktokapis.com/v2/oauth/token/",
            GrantStyle::ClientSecretInBody,
            &[],
        ),
        poll: Some(PollPlan {
            interval_seconds: 12 * HOUR,
            endpoints: vec![endpoint(
                "videos",
                "https://open.tiktokapis.com/v2/video/list/",
                &[("fields", "id,title,create_time")],
                ResultShape::Nested("data.videos".to_string()),
            )],
        }),
    }
}

fn x(config: &AppConfig) -> ProviderConfig {
    ProviderConfig {
        provider: Provider::X,
        refresh: refresh(
            config,
            Provider::X,
            "https://api.x.com/2/oauth2/token",
            GrantStyle::BasicAuthHeader,
            &[],
        ),
        poll: Some(PollPlan {
            interval_seconds: 4 * HOUR,
            endpoints: vec![
                endpoint(
                    "tweets",
                    "https://api.x.com/2/users/{username}/tweets",
                    &[("max_results", "100")],
                    ResultShape::Nested("data".to_string()),
                ),
                endpoint(
                    "liked_tweets",
                    "https://api.x.com/2/users/{username}/liked_tweets",
                    &[("max_results", "100")],
                    ResultShape::Nested("data".to_string()),
                ),
            ],
        }),
    }
}

fn pinterest(config: &AppConfig) -> ProviderConfig {
    ProviderConfig {
        provider: Provider::Pinterest,
        refresh: refresh(
            config,
            Provider::Pinterest,
            "https://api.pinterest.com/v5/oauth/token",
            GrantStyle::ClientSecretInBody,
            &[("scope", "pins:read,boards:read")],
        ),
        poll: Some(PollPlan {
            interval_seconds: 24 * HOUR,
            endpoints: vec![
                endpoint(
                    "pins",
                    "https://api.pinterest.com/v5/pins",
                    &[("page_size", "100")],
                    ResultShape::Items,
                ),
                endpoint(
                    "boards",
                    "https://api.pinterest.com/v5/boards",
                    &[("page_size", "100")],
                    ResultShape::Items,
                ),
            ],
        }),
    }
}

fn gmail(config: &AppConfig) -> ProviderConfig {
    ProviderConfig {
        provider: Provider::Gmail,
        refresh: refresh(
            config,
            Provider::Gmail,
            "https://oauth2.googleapis.com/token",
            GrantStyle::ClientSecretInBody,
            &[],
        ),
        poll: Some(PollPlan {
            interval_seconds: HOUR,
            endpoints: vec![endpoint(
                "messages",
                "https://gmail.googleapis.com/gmail/v1/users/me/messages",
                &[("maxResults", "100")],
                ResultShape::Nested("messages".to_string()),
            )],
        }),
    }
}
