use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Verifies signed subscription requests for private and presence channels.
///
/// The signature is `HMAC-SHA256(secret, "socket_id:channel[:channel_data]")`
/// encoded as lowercase hex. Clients present it as `"<app key>:<signature>"`.
/// Pure functions only, safe to call from any task without synchronization.
pub struct AuthValidator;

impl AuthValidator {
    /// The exact string covered by the signature
    pub fn string_to_sign(socket_id: &str, channel: &str, channel_data: Option<&str>) -> String {
        match channel_data {
            Some(data) => format!("{}:{}:{}", socket_id, channel, data),
            None => format!("{}:{}", socket_id, channel),
        }
    }

    /// Compute the hex signature for a subscription
    pub fn sign(
        secret: &str,
        socket_id: &str,
        channel: &str,
        channel_data: Option<&str>,
    ) -> String {
        // HMAC accepts keys of any length
        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(Self::string_to_sign(socket_id, channel, channel_data).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build the `auth` token a client sends with `pusher:subscribe`
    pub fn auth_token(
        key: &str,
        secret: &str,
        socket_id: &str,
        channel: &str,
        channel_data: Option<&str>,
    ) -> String {
        format!("{}:{}", key, Self::sign(secret, socket_id, channel, channel_data))
    }

    /// Check a presented hex signature. Any malformed input is invalid.
    pub fn validate(
        secret: &str,
        socket_id: &str,
        channel: &str,
        signature: &str,
        channel_data: Option<&str>,
    ) -> bool {
        if secret.is_empty() || socket_id.is_empty() || channel.is_empty() || signature.is_empty() {
            return false;
        }

        let Ok(presented) = hex::decode(signature) else {
            return false;
        };

        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(Self::string_to_sign(socket_id, channel, channel_data).as_bytes());

        // Constant-time comparison
        mac.verify_slice(&presented).is_ok()
    }

    /// Validate a full `"<key>:<signature>"` token against an app's credentials
    pub fn validate_token(
        app_key: &str,
        secret: &str,
        socket_id: &str,
        channel: &str,
        token: &str,
        channel_data: Option<&str>,
    ) -> bool {
        match split_auth_token(token) {
            Some((key, signature)) if key == app_key => {
                Self::validate(secret, socket_id, channel, signature, channel_data)
            }
            _ => false,
        }
    }
}

/// Split `"<key>:<signature>"` into its parts
pub fn split_auth_token(token: &str) -> Option<(&str, &str)> {
    let (key, signature) = token.split_once(':')?;
    if key.is_empty() || signature.is_empty() {
        return None;
    }
    Some((key, signature))
}
