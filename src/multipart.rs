//! Multipart uploader — byte-exact body builder plus the Digest-authenticated upload flow used
//! for ACAP packages and license files.
//!
//! No corpus example hand-builds a multipart body to a byte-exact reference layout; this one is
//! wired through the same digest machinery as [`crate::auth`].

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{Method, Response, Url};
use tracing::debug;

use crate::digest::{DigestChallenge, DigestResponse};
use crate::error::{AuthError, UploadError};
use crate::http_client::HttpClients;

/// One multipart field: a name/filename/content-type triple plus the payload bytes.
pub struct MultipartField {
    pub field_name: &'static str,
    pub filename: &'static str,
    pub content_type: &'static str,
    pub payload: Bytes,
}

impl MultipartField {
    pub fn acap_package(payload: Bytes) -> Self {
        Self {
            field_name: "packfil",
            filename: "BatonAnalytic.eap",
            content_type: "application/octet-stream",
            payload,
        }
    }

    pub fn license(xml: String) -> Self {
        Self {
            field_name: "fileData",
            filename: "license.xml",
            content_type: "text/xml",
            payload: Bytes::from(xml.into_bytes()),
        }
    }
}

/// Builds the multipart body byte-for-byte: boundary, headers, payload, closing
/// boundary with no trailing CRLF. Returns the boundary (needed for the `Content-Type` header)
/// alongside the finished body.
pub fn build_body(field: &MultipartField) -> (String, Bytes) {
    let boundary = random_boundary();
    let mut body = BytesMut::new();

    body.put_slice(format!("--{boundary}\r\n").as_bytes());
    body.put_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field.field_name, field.filename
        )
        .as_bytes(),
    );
    body.put_slice(format!("Content-Type: {}\r\n", field.content_type).as_bytes());
    body.put_slice(b"\r\n");
    body.put_slice(&field.payload);
    body.put_slice(b"\r\n");
    body.put_slice(format!("--{boundary}--\r\n").as_bytes());

    (boundary, body.freeze())
}

fn random_boundary() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..16)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("----WebKitFormBoundary{suffix}")
}

/// Uploads `field` to `url`, first issuing a no-body challenge probe to learn the Digest
/// parameters, then sending the full multipart body with `Authorization: Digest ...`. Uses
/// the 300 s upload client throughout.
pub async fn upload(
    clients: &HttpClients,
    url: &str,
    username: &str,
    password: &str,
    field: MultipartField,
) -> Result<Response, UploadError> {
    let parsed = Url::parse(url).map_err(|e| AuthError::InvalidUrl(e.to_string()))?;

    let challenge_probe = clients
        .upload
        .request(Method::POST, parsed.clone())
        .header("User-Agent", crate::auth::USER_AGENT)
        .send()
        .await
        .map_err(AuthError::Transport)?;

    if challenge_probe.status().as_u16() != 401 {
        debug!(
            status = challenge_probe.status().as_u16(),
            "multipart challenge probe did not return 401; camera may not require auth"
        );
        return Ok(challenge_probe);
    }

    let header = challenge_probe
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AuthError::MalformedChallenge("401 carried no WWW-Authenticate".into()))?
        .to_string();
    let challenge = DigestChallenge::parse(&header)?;
    let uri = crate::auth::uri_of(&parsed);
    let computed = DigestResponse::compute(&challenge, username, password, "POST", &uri);

    let (boundary, body) = build_body(&field);

    let response = clients
        .upload
        .post(parsed)
        .header("User-Agent", crate::auth::USER_AGENT)
        .header("Authorization", computed.to_header_value())
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(body)
        .send()
        .await
        .map_err(AuthError::Transport)?;

    Ok(response)
}

/// License error codes 0 (no error) and 30 (already licensed) are treated as success.
const LICENSE_SUCCESS_CODES: &[u32] = &[0, 30];

/// Determines license upload success: HTTP status < 400 AND the body is not an
/// `Error: <n>` for any `n` outside [`LICENSE_SUCCESS_CODES`].
pub fn license_outcome(status: u16, body: &str) -> Result<(), UploadError> {
    if status >= 400 {
        return Err(UploadError::LicenseRejected(status as u32));
    }
    if let Some(code) = parse_error_code(body) {
        if !LICENSE_SUCCESS_CODES.contains(&code) {
            return Err(UploadError::LicenseRejected(code));
        }
    }
    Ok(())
}

fn parse_error_code(body: &str) -> Option<u32> {
    let idx = body.find("Error:")?;
    let rest = body[idx + "Error:".len()..].trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_ends_exactly_with_closing_boundary() {
        let field = MultipartField::license("<license/>".to_string());
        let (boundary, body) = build_body(&field);
        let text = String::from_utf8(body.to_vec()).unwrap();
        let expected_tail = format!("--{boundary}--\r\n");
        assert!(text.ends_with(&expected_tail));
        assert!(!text.ends_with(&format!("{expected_tail}\r\n")));
    }

    #[test]
    fn body_layout_matches_reference_order() {
        let field = MultipartField::license("<license/>".to_string());
        let (boundary, body) = build_body(&field);
        let text = String::from_utf8(body.to_vec()).unwrap();
        let expected = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"fileData\"; filename=\"license.xml\"\r\nContent-Type: text/xml\r\n\r\n<license/>\r\n--{boundary}--\r\n"
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn acap_field_uses_expected_constants() {
        let field = MultipartField::acap_package(Bytes::from_static(b"binary"));
        assert_eq!(field.field_name, "packfil");
        assert_eq!(field.filename, "BatonAnalytic.eap");
        assert_eq!(field.content_type, "application/octet-stream");
    }

    #[test]
    fn error_30_is_success() {
        assert!(license_outcome(200, "Error: 30").is_ok());
    }

    #[test]
    fn error_0_is_success() {
        assert!(license_outcome(200, "Error: 0").is_ok());
    }

    #[test]
    fn error_31_is_rejected() {
        let err = license_outcome(200, "Error: 31").unwrap_err();
        assert!(matches!(err, UploadError::LicenseRejected(31)));
    }

    #[test]
    fn http_failure_status_is_rejected_regardless_of_body() {
        let err = license_outcome(500, "ok").unwrap_err();
        assert!(matches!(err, UploadError::LicenseRejected(500)));
    }

    #[test]
    fn boundary_has_expected_prefix_and_length() {
        let field = MultipartField::license("x".to_string());
        let (boundary, _) = build_body(&field);
        assert!(boundary.starts_with("----WebKitFormBoundary"));
        assert_eq!(boundary.len(), "----WebKitFormBoundary".len() + 16);
    }
}
