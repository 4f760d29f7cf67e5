//! Streaming token issued by the auth service.
use std::{collections::BTreeSet, time::Duration};

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{Error, Result};

/// Channel capability that enables occupancy metadata for a channel.
const PUBLISHERS_CAPABILITY: &str = "channel-metadata:publishers";

/// Decoration requesting occupancy metrics for a channel. Recognized by string match only.
pub const OCCUPANCY_CHANNEL_PREFIX: &str = "[?occupancy=metrics.publishers]";

const JWT_PAYLOAD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Short-lived credential scoping which channels a streaming connection may subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingToken {
    /// Channels to subscribe to, already decorated for occupancy where the token allows it.
    pub channels: BTreeSet<String>,
    /// When the token was issued.
    pub issued_at: DateTime<Utc>,
    /// When the server stops accepting the token.
    pub expires_at: DateTime<Utc>,
    /// Encoded token, passed verbatim to the streaming endpoint.
    pub raw: String,
    /// How long to wait before connecting.
    pub connection_delay: Duration,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(rename = "x-ably-capability")]
    capability: String,
    iat: f64,
    exp: f64,
}

impl StreamingToken {
    /// Parse a JWT returned by the auth service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToken`] if the token is not a JWT, the payload is not valid base64
    /// or JSON, or it does not carry a capability map.
    pub fn parse(raw: &str, connection_delay: Duration) -> Result<StreamingToken> {
        let encoded_payload = raw
            .split('.')
            .nth(1)
            .ok_or(Error::InvalidToken("missing payload section"))?;
        let payload = JWT_PAYLOAD
            .decode(encoded_payload)
            .map_err(|_| Error::InvalidToken("payload is not base64url"))?;
        let claims: Claims = serde_json::from_slice(&payload)
            .map_err(|_| Error::InvalidToken("payload is not a claims object"))?;
        let capabilities: std::collections::HashMap<String, Vec<String>> =
            serde_json::from_str(&claims.capability)
                .map_err(|_| Error::InvalidToken("capability is not a channel map"))?;

        let channels = capabilities
            .into_iter()
            .map(|(channel, capabilities)| {
                if capabilities.iter().any(|it| it == PUBLISHERS_CAPABILITY) {
                    format!("{OCCUPANCY_CHANNEL_PREFIX}{channel}")
                } else {
                    channel
                }
            })
            .collect();

        Ok(StreamingToken {
            channels,
            issued_at: from_unix_seconds(claims.iat)?,
            expires_at: from_unix_seconds(claims.exp)?,
            raw: raw.to_owned(),
            connection_delay,
        })
    }

    /// Time left until `expires_at`, or zero if already expired.
    pub fn expires_in(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// How long to wait before proactively refreshing, keeping `margin` ahead of expiration.
    pub fn refresh_in(&self, now: DateTime<Utc>, margin: Duration) -> Duration {
        self.expires_in(now).saturating_sub(margin)
    }

    /// Returns `true` once the token can no longer be used to connect.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

fn from_unix_seconds(seconds: f64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(seconds as i64, 0).ok_or(Error::InvalidToken("timestamp out of range"))
}
