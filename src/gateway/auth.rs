//! Basic and Digest credentials for the 401 interception path
//! (RFC 2617).

use md5::{Digest as _, Md5};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Basic,
    Digest,
}

/// A parsed WWW-Authenticate challenge.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub scheme: Scheme,
    pub realm: String,
    pub nonce: String,
    pub qop_auth: bool,
    pub opaque: Option<String>,
}

/// Parses the value of a WWW-Authenticate header. Only Basic and
/// MD5 Digest are recognized; anything else is unusable here.
pub fn parse_challenge(value: &str) -> Option<Challenge> {
    let value = value.trim();
    let (scheme_name, params) = value
        .split_once(' ')
        .map(|(scheme, rest)| (scheme, rest))
        .unwrap_or((value, ""));

    let scheme = if scheme_name.eq_ignore_ascii_case("Basic") {
        Scheme::Basic
    } else if scheme_name.eq_ignore_ascii_case("Digest") {
        Scheme::Digest
    } else {
        return None;
    };

    let mut challenge = Challenge {
        scheme,
        realm: String::new(),
        nonce: String::new(),
        qop_auth: false,
        opaque: None,
    };
    for param in split_params(params) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        let unquoted = raw.trim().trim_matches('"').to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "realm" => challenge.realm = unquoted,
            "nonce" => challenge.nonce = unquoted,
            "opaque" => challenge.opaque = Some(unquoted),
            "qop" => {
                challenge.qop_auth = unquoted
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("auth"));
            }
            _ => {}
        }
    }
    if scheme == Scheme::Digest && challenge.nonce.is_empty() {
        return None;
    }
    Some(challenge)
}

/// Splits comma-separated auth params without breaking quoted strings.
fn split_params(params: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (index, c) in params.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                out.push(params[start..index].trim());
                start = index + 1;
            }
            _ => {}
        }
    }
    let tail = params[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

pub fn basic_authorization(username: &str, password: &str) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    format!(
        "Basic {}",
        STANDARD.encode(format!("{username}:{password}"))
    )
}

/// Builds a Digest Authorization header value per RFC 2617, with
/// `qop=auth` when the challenge offered it.
pub fn digest_authorization(
    challenge: &Challenge,
    method: &str,
    uri: &str,
    username: &str,
    password: &str,
    cnonce: &str,
    nc: &str,
) -> String {
    let ha1 = md5_hex(&format!("{username}:{}:{password}", challenge.realm));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    let response = if challenge.qop_auth {
        md5_hex(&format!(
            "{ha1}:{}:{nc}:{cnonce}:auth:{ha2}",
            challenge.nonce
        ))
    } else {
        md5_hex(&format!("{ha1}:{}:{ha2}", challenge.nonce))
    };

    let mut header = format!(
        "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", response=\"{response}\"",
        challenge.realm, challenge.nonce
    );
    if challenge.qop_auth {
        header.push_str(&format!(", qop=auth, nc={nc}, cnonce=\"{cnonce}\""));
    }
    if let Some(opaque) = &challenge.opaque {
        header.push_str(&format!(", opaque=\"{opaque}\""));
    }
    header
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
