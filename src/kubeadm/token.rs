//! Join-token handshake parsing
//!
//! kubeadm prints the values a joining host needs as free text. These
//! parsers pull them out by fixed markers and fail loudly when a marker is
//! missing; there is no fallback heuristic.

use crate::error::{ForgeError, Result};
use rand::Rng;
use regex::Regex;

const TOKEN_FLAG: &str = "--token";
const CA_HASH_FLAG: &str = "--discovery-token-ca-cert-hash";
const CERT_KEY_FLAG: &str = "--certificate-key";
const CERT_KEY_MARKER: &str = "Using certificate key:";
const JOIN_MARKER: &str = "kubeadm join";
const JOIN_END_MARKER: &str = "Please note";

/// Length of a control-plane certificate key
pub const CERTIFICATE_KEY_LEN: usize = 64;

/// The three secrets a host needs to join the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinCredentials {
    pub token: String,
    pub ca_hash: String,
    pub certificate_key: String,
}

impl JoinCredentials {
    pub fn is_complete(&self) -> bool {
        !self.token.is_empty() && !self.ca_hash.is_empty() && !self.certificate_key.is_empty()
    }
}

fn malformed(command: &str, message: impl Into<String>) -> ForgeError {
    ForgeError::MalformedOutput {
        command: command.to_string(),
        message: message.into(),
    }
}

/// Truncate to the key length and check the charset
pub fn validate_certificate_key(raw: &str) -> Result<String> {
    let key: String = raw.chars().take(CERTIFICATE_KEY_LEN).collect();
    let re = Regex::new(r"^[0-9a-f]{64}$")
        .map_err(|e| ForgeError::Internal(format!("certificate key pattern: {}", e)))?;
    if re.is_match(&key) {
        Ok(key)
    } else {
        Err(malformed(
            CERT_KEY_FLAG,
            format!("certificate key {:?} is not {} hex characters", key, CERTIFICATE_KEY_LEN),
        ))
    }
}

/// Split on whitespace after removing escaped line breaks
fn tokenize(output: &str) -> Vec<String> {
    output
        .replace("\\\n", " ")
        .split_whitespace()
        .map(|t| t.replace(['\t', '\n', '\\'], ""))
        .filter(|t| !t.is_empty())
        .collect()
}

fn value_after(tokens: &[String], flag: &str) -> Option<String> {
    tokens
        .iter()
        .position(|t| t == flag)
        .and_then(|i| tokens.get(i + 1))
        .cloned()
}

/// Certificate key from `kubeadm init phase upload-certs` output
pub fn parse_certificate_key(output: &str) -> Result<String> {
    let (_, rest) = output
        .split_once(CERT_KEY_MARKER)
        .ok_or_else(|| malformed("upload-certs", format!("no {:?} in output", CERT_KEY_MARKER)))?;
    let raw = rest
        .split_whitespace()
        .next()
        .ok_or_else(|| malformed("upload-certs", "empty certificate key"))?;
    validate_certificate_key(raw)
}

/// Token, CA hash and optional certificate key from a join command
pub fn parse_join_command(output: &str) -> Result<(String, String, Option<String>)> {
    let tokens = tokenize(output);
    let token = value_after(&tokens, TOKEN_FLAG)
        .ok_or_else(|| malformed("token create", format!("no {} in output", TOKEN_FLAG)))?;
    let ca_hash = value_after(&tokens, CA_HASH_FLAG)
        .ok_or_else(|| malformed("token create", format!("no {} in output", CA_HASH_FLAG)))?;
    let certificate_key = match value_after(&tokens, CERT_KEY_FLAG) {
        Some(raw) => Some(validate_certificate_key(&raw)?),
        None => None,
    };
    Ok((token, ca_hash, certificate_key))
}

/// The join section of `kubeadm init` output, between `kubeadm join` and
/// the trailing note
pub fn extract_join_section(output: &str) -> Result<String> {
    let start = output
        .find(JOIN_MARKER)
        .ok_or_else(|| malformed("kubeadm init", format!("no {:?} in output", JOIN_MARKER)))?;
    let section = &output[start..];
    let end = section.find(JOIN_END_MARKER).unwrap_or(section.len());
    Ok(section[..end].to_string())
}

/// Credentials printed by `kubeadm init`; the first join block carries the
/// control-plane flags
pub fn parse_init_output(output: &str) -> Result<JoinCredentials> {
    let section = extract_join_section(output)?;
    let (token, ca_hash, certificate_key) = parse_join_command(&section)?;
    let certificate_key = certificate_key
        .ok_or_else(|| malformed("kubeadm init", format!("no {} in output", CERT_KEY_FLAG)))?;
    Ok(JoinCredentials {
        token,
        ca_hash,
        certificate_key,
    })
}

/// Random bootstrap token, `[a-z0-9]{6}.[a-z0-9]{16}`
pub fn generate_bootstrap_token() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let mut part = |len: usize| -> String {
        (0..len)
            .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .collect()
    };
    let id = part(6);
    let secret = part(16);
    format!("{}.{}", id, secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_parse_join_command() {
        let output = format!(
            "kubeadm join 1.2.3.4:6443 --token abc.def --discovery-token-ca-cert-hash sha256:deadbeef --certificate-key {}ffff",
            KEY
        );
        let (token, hash, key) = parse_join_command(&output).unwrap();
        assert_eq!(token, "abc.def");
        assert_eq!(hash, "sha256:deadbeef");
        assert_eq!(key.unwrap(), KEY);
    }

    #[test]
    fn test_parse_join_command_with_line_continuations() {
        let output = "kubeadm join apiserver.cluster.local:6443 --token abc.def \\\n\t--discovery-token-ca-cert-hash sha256:deadbeef \\\n\t--control-plane";
        let (token, hash, key) = parse_join_command(output).unwrap();
        assert_eq!(token, "abc.def");
        assert_eq!(hash, "sha256:deadbeef");
        assert!(key.is_none());
    }

    #[test]
    fn test_missing_marker_is_an_error() {
        let err = parse_join_command("kubeadm join 1.2.3.4:6443 --token abc.def").unwrap_err();
        assert!(matches!(err, ForgeError::MalformedOutput { .. }));
    }

    #[test]
    fn test_parse_certificate_key() {
        let output = format!(
            "[upload-certs] Storing the certificates in Secret \"kubeadm-certs\"\n[upload-certs] Using certificate key:\n{}\n",
            KEY
        );
        assert_eq!(parse_certificate_key(&output).unwrap(), KEY);
    }

    #[test]
    fn test_short_certificate_key_rejected() {
        let err = validate_certificate_key("0123abcd").unwrap_err();
        assert!(matches!(err, ForgeError::MalformedOutput { .. }));
        assert!(validate_certificate_key(&KEY.to_uppercase()).is_err());
    }

    #[test]
    fn test_parse_init_output() {
        let output = format!(
            "Your Kubernetes control-plane has initialized successfully!\n\n  kubeadm join apiserver.cluster.local:6443 --token abc.def \\\n    --discovery-token-ca-cert-hash sha256:deadbeef \\\n    --control-plane --certificate-key {}\n\nPlease note that the certificate-key gives access to cluster sensitive data\n\n  kubeadm join apiserver.cluster.local:6443 --token other.tok \\\n    --discovery-token-ca-cert-hash sha256:deadbeef\n",
            KEY
        );
        let creds = parse_init_output(&output).unwrap();
        assert_eq!(creds.token, "abc.def");
        assert_eq!(creds.ca_hash, "sha256:deadbeef");
        assert_eq!(creds.certificate_key, KEY);
        assert!(creds.is_complete());
    }

    #[test]
    fn test_generate_bootstrap_token() {
        let token = generate_bootstrap_token();
        let re = Regex::new("^[a-z0-9]{6}\\.[a-z0-9]{16}$").unwrap();
        assert!(re.is_match(&token));
        assert_ne!(token, generate_bootstrap_token());
    }
}
