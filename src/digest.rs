//! Digest challenge parsing and response computation.

use md5::{Digest as _, Md5};
use rand::RngCore;

use crate::error::AuthError;

/// A parsed `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: String,
    pub qop: Option<String>,
}

impl DigestChallenge {
    /// Parses a `WWW-Authenticate` header value. The header may list Basic and Digest together,
    /// comma-joined; only the Digest portion is consulted.
    pub fn parse(header: &str) -> Result<Self, AuthError> {
        let digest_part = isolate_digest_scheme(header)
            .ok_or_else(|| AuthError::MalformedChallenge("no Digest scheme present".into()))?;

        let realm = extract_quoted(digest_part, "realm");
        let nonce = extract_quoted(digest_part, "nonce");
        let opaque = extract_quoted(digest_part, "opaque");
        let algorithm = extract_quoted(digest_part, "algorithm")
            .or_else(|| extract_bare(digest_part, "algorithm"))
            .unwrap_or_else(|| "MD5".to_string());
        let qop = extract_quoted(digest_part, "qop").or_else(|| extract_bare(digest_part, "qop"));

        let realm = realm.ok_or_else(|| AuthError::MalformedChallenge("missing realm".into()))?;
        let nonce = nonce.ok_or_else(|| AuthError::MalformedChallenge("missing nonce".into()))?;

        Ok(Self {
            realm,
            nonce,
            opaque,
            algorithm,
            qop,
        })
    }
}

/// Finds the `Digest ` scheme (case-sensitive prefix) within a possibly multi-scheme header and
/// returns the remainder of the string starting at its parameters.
fn isolate_digest_scheme(header: &str) -> Option<&str> {
    const PREFIX: &str = "Digest ";
    let idx = header.find(PREFIX)?;
    Some(&header[idx + PREFIX.len()..])
}

fn extract_quoted<'a>(haystack: &'a str, key: &str) -> Option<String> {
    let needle = format!("{key}=\"");
    let start = haystack.find(&needle)? + needle.len();
    let rest = &haystack[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn extract_bare<'a>(haystack: &'a str, key: &str) -> Option<String> {
    let needle = format!("{key}=");
    let start = haystack.find(&needle)? + needle.len();
    let rest = &haystack[start..];
    let end = rest
        .find(|c: char| c == ',' || c.is_whitespace())
        .unwrap_or(rest.len());
    let value = rest[..end].trim_matches('"');
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// The fully computed Digest `Authorization` header fields for a single request.
pub struct DigestResponse {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub opaque: Option<String>,
    pub algorithm: String,
    pub qop: Option<String>,
    pub nc: &'static str,
    pub cnonce: Option<String>,
}

impl DigestResponse {
    /// Computes HA1/HA2/response and renders the `Authorization` header value in RFC 2617's
    /// canonical field order: username, realm, nonce, uri, response, then opaque, algorithm,
    /// and (when qop is present) qop, nc, cnonce.
    pub fn compute(
        challenge: &DigestChallenge,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
    ) -> Self {
        let ha1 = md5_hex(&format!("{username}:{}:{password}", challenge.realm));
        let ha2 = md5_hex(&format!("{method}:{uri}"));

        let nc = "00000001";
        let (response, cnonce) = match challenge.qop.as_deref() {
            Some(qop) if !qop.is_empty() => {
                let cnonce = random_cnonce();
                let response = md5_hex(&format!(
                    "{ha1}:{}:{nc}:{cnonce}:{qop}:{ha2}",
                    challenge.nonce
                ));
                (response, Some(cnonce))
            }
            _ => {
                let response = md5_hex(&format!("{ha1}:{}:{ha2}", challenge.nonce));
                (response, None)
            }
        };

        Self {
            username: username.to_string(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response,
            opaque: challenge.opaque.clone(),
            algorithm: challenge.algorithm.clone(),
            qop: challenge.qop.clone(),
            nc,
            cnonce,
        }
    }

    /// Renders the `Authorization: Digest ...` header value.
    pub fn to_header_value(&self) -> String {
        let mut parts = vec![
            format!("username=\"{}\"", self.username),
            format!("realm=\"{}\"", self.realm),
            format!("nonce=\"{}\"", self.nonce),
            format!("uri=\"{}\"", self.uri),
            format!("response=\"{}\"", self.response),
        ];
        if let Some(opaque) = &self.opaque {
            parts.push(format!("opaque=\"{opaque}\""));
        }
        if !self.algorithm.is_empty() {
            parts.push(format!("algorithm={}", self.algorithm));
        }
        if let Some(qop) = &self.qop {
            if !qop.is_empty() {
                parts.push(format!("qop={qop}"));
                parts.push(format!("nc={}", self.nc));
                if let Some(cnonce) = &self.cnonce {
                    parts.push(format!("cnonce=\"{cnonce}\""));
                }
            }
        }
        format!("Digest {}", parts.join(", "))
    }
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn random_cnonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_realm_and_nonce() {
        let header = r#"Digest realm="AXIS_ACCC8E000000", nonce="abc", qop="auth""#;
        let challenge = DigestChallenge::parse(header).unwrap();
        assert_eq!(challenge.realm, "AXIS_ACCC8E000000");
        assert_eq!(challenge.nonce, "abc");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert_eq!(challenge.algorithm, "MD5");
    }

    #[test]
    fn isolates_digest_from_mixed_scheme_header() {
        let header = r#"Basic realm="AXIS", Digest realm="AXIS_001122334455", nonce="xyz""#;
        let challenge = DigestChallenge::parse(header).unwrap();
        assert_eq!(challenge.realm, "AXIS_001122334455");
        assert_eq!(challenge.nonce, "xyz");
    }

    #[test]
    fn missing_realm_is_malformed() {
        let header = r#"Digest nonce="abc""#;
        let err = DigestChallenge::parse(header).unwrap_err();
        assert!(matches!(err, AuthError::MalformedChallenge(_)));
    }

    #[test]
    fn missing_nonce_is_malformed() {
        let header = r#"Digest realm="AXIS""#;
        let err = DigestChallenge::parse(header).unwrap_err();
        assert!(matches!(err, AuthError::MalformedChallenge(_)));
    }

    /// Reference vector with fixed inputs and no qop.
    #[test]
    fn reference_response_hash_no_qop() {
        let challenge = DigestChallenge {
            realm: "AXIS_ACCC8E000000".to_string(),
            nonce: "abc".to_string(),
            opaque: None,
            algorithm: "MD5".to_string(),
            qop: None,
        };
        let response = DigestResponse::compute(
            &challenge,
            "anava",
            "baton",
            "POST",
            "/axis-cgi/basicdeviceinfo.cgi",
        );

        let ha1 = md5_hex("anava:AXIS_ACCC8E000000:baton");
        let ha2 = md5_hex("POST:/axis-cgi/basicdeviceinfo.cgi");
        let expected = md5_hex(&format!("{ha1}:abc:{ha2}"));
        assert_eq!(response.response, expected);
        assert!(response.cnonce.is_none());
    }

    #[test]
    fn header_field_order_matches_rfc2617() {
        let challenge = DigestChallenge {
            realm: "AXIS".to_string(),
            nonce: "n1".to_string(),
            opaque: Some("op1".to_string()),
            algorithm: "MD5".to_string(),
            qop: Some("auth".to_string()),
        };
        let response = DigestResponse::compute(&challenge, "u", "p", "GET", "/x");
        let header = response.to_header_value();
        let username_pos = header.find("username=").unwrap();
        let realm_pos = header.find("realm=").unwrap();
        let nonce_pos = header.find("nonce=").unwrap();
        let uri_pos = header.find("uri=").unwrap();
        let response_pos = header.find("response=").unwrap();
        let opaque_pos = header.find("opaque=").unwrap();
        let algorithm_pos = header.find("algorithm=").unwrap();
        let qop_pos = header.find("qop=").unwrap();
        let nc_pos = header.find("nc=").unwrap();
        let cnonce_pos = header.find("cnonce=").unwrap();
        assert!(username_pos < realm_pos);
        assert!(realm_pos < nonce_pos);
        assert!(nonce_pos < uri_pos);
        assert!(uri_pos < response_pos);
        assert!(response_pos < opaque_pos);
        assert!(opaque_pos < algorithm_pos);
        assert!(algorithm_pos < qop_pos);
        assert!(qop_pos < nc_pos);
        assert!(nc_pos < cnonce_pos);
    }

    #[test]
    fn qop_response_includes_cnonce_and_nc() {
        let challenge = DigestChallenge {
            realm: "AXIS".to_string(),
            nonce: "n1".to_string(),
            opaque: None,
            algorithm: "MD5".to_string(),
            qop: Some("auth".to_string()),
        };
        let response = DigestResponse::compute(&challenge, "u", "p", "GET", "/x");
        assert!(response.cnonce.is_some());
        assert_eq!(response.nc, "00000001");
    }
}
