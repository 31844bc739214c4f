//! Cluster PKI
//!
//! Generates the certificate authorities and leaf certificates kubeadm
//! expects under `/etc/kubernetes/pki`, plus the registry certificate.
//! Generation is local; distribution happens in the runtime.
//!
//! Existing material is reused: a CA found on disk signs new leaves, and a
//! leaf found on disk is kept.

pub mod kubeconfig;

pub use kubeconfig::{generate_kubeconfigs, KubeconfigSpec};

use crate::error::{ForgeError, Result};
use chrono::Datelike;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

/// Validity of generated certificates
pub const VALIDITY_YEARS: i32 = 10;

/// CA material every control-plane host shares; leaf certificates are
/// issued per host by kubeadm from these
pub const SHARED_CA_FILES: &[&str] = &[
    "ca.crt",
    "ca.key",
    "sa.key",
    "sa.pub",
    "front-proxy-ca.crt",
    "front-proxy-ca.key",
    "etcd/ca.crt",
    "etcd/ca.key",
];

fn pki_err(what: &str, e: impl std::fmt::Display) -> ForgeError {
    ForgeError::Pki(format!("{}: {}", what, e))
}

fn set_validity(params: &mut CertificateParams) {
    let today = chrono::Utc::now().date_naive();
    // Feb 29 does not exist in every target year
    let day = today.day().min(28) as u8;
    let month = today.month() as u8;
    params.not_before = rcgen::date_time_ymd(today.year(), month, day);
    params.not_after = rcgen::date_time_ymd(today.year() + VALIDITY_YEARS, month, day);
}

fn distinguished_name(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    if let Some(org) = organization {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
    }
    dn
}

fn san(name: &str) -> Result<SanType> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(name.to_string())
        .map(SanType::DnsName)
        .map_err(|e| pki_err(&format!("invalid DNS name {:?}", name), e))
}

/// Write a PEM file, creating parent directories
fn write_pem(path: &Path, pem: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, pem)?;
    Ok(())
}

/// What a leaf certificate is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertUsage {
    Server,
    Client,
    ServerAndClient,
}

/// A leaf certificate to issue
#[derive(Debug, Clone)]
pub struct CertSpec {
    /// File stem, relative to the PKI directory (`etcd/server`)
    pub name: String,
    pub common_name: String,
    pub organization: Option<String>,
    pub sans: Vec<String>,
    pub usage: CertUsage,
}

impl CertSpec {
    fn new(name: &str, common_name: &str, usage: CertUsage) -> Self {
        Self {
            name: name.to_string(),
            common_name: common_name.to_string(),
            organization: None,
            sans: Vec::new(),
            usage,
        }
    }

    fn org(mut self, org: &str) -> Self {
        self.organization = Some(org.to_string());
        self
    }

    fn sans(mut self, sans: Vec<String>) -> Self {
        self.sans = sans;
        self
    }
}

/// Certificate authority backed by PEM material
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, None);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        set_validity(&mut params);

        let key = KeyPair::generate().map_err(|e| pki_err("failed to generate CA key", e))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| pki_err("failed to create CA certificate", e))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem).map_err(|e| pki_err("failed to parse CA key", e))?;
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    /// Load `<stem>.crt`/`<stem>.key` from `dir`, creating and saving a new
    /// CA when either file is missing
    pub fn load_or_create(dir: &Path, stem: &str, common_name: &str) -> Result<Self> {
        let cert_path = dir.join(format!("{}.crt", stem));
        let key_path = dir.join(format!("{}.key", stem));
        if cert_path.exists() && key_path.exists() {
            tracing::debug!("Reusing CA {}", cert_path.display());
            return Self::from_pem(
                &std::fs::read_to_string(&cert_path)?,
                &std::fs::read_to_string(&key_path)?,
            );
        }

        tracing::info!("Generating CA {}", common_name);
        let ca = Self::new(common_name)?;
        write_pem(&cert_path, &ca.cert_pem)?;
        write_pem(&key_path, &ca.key_pem)?;
        Ok(ca)
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    fn key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.key_pem).map_err(|e| pki_err("failed to load CA key", e))
    }

    /// Discovery hash joining hosts pin: sha256 of the CA public key info
    pub fn public_key_hash(&self) -> Result<String> {
        let key = self.key_pair()?;
        Ok(format!("sha256:{:x}", Sha256::digest(key.subject_public_key_info())))
    }

    /// Issue a leaf certificate, returning (cert, key) PEM
    pub fn issue(&self, spec: &CertSpec) -> Result<(String, String)> {
        let mut params = CertificateParams::default();
        params.distinguished_name =
            distinguished_name(&spec.common_name, spec.organization.as_deref());
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = match spec.usage {
            CertUsage::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
            CertUsage::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
            CertUsage::ServerAndClient => vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
        };
        params.subject_alt_names = spec
            .sans
            .iter()
            .map(|s| san(s))
            .collect::<Result<Vec<_>>>()?;
        set_validity(&mut params);

        let key = KeyPair::generate().map_err(|e| pki_err("failed to generate key", e))?;
        let ca_key = self.key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| pki_err("failed to load issuer", e))?;
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| pki_err(&format!("failed to sign {}", spec.name), e))?;

        Ok((cert.pem(), key.serialize_pem()))
    }

    /// Issue `spec` into `dir` unless the certificate already exists
    pub fn issue_to(&self, dir: &Path, spec: &CertSpec) -> Result<PathBuf> {
        let cert_path = dir.join(format!("{}.crt", spec.name));
        let key_path = dir.join(format!("{}.key", spec.name));
        if cert_path.exists() && key_path.exists() {
            return Ok(cert_path);
        }
        let (cert, key) = self.issue(spec)?;
        write_pem(&cert_path, &cert)?;
        write_pem(&key_path, &key)?;
        tracing::debug!("Issued {}", cert_path.display());
        Ok(cert_path)
    }
}

/// First usable address of an IPv4 service CIDR, the kubernetes service IP
pub fn first_service_ip(cidr: &str) -> Result<IpAddr> {
    let (network, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| ForgeError::InvalidConfig(format!("invalid service CIDR {:?}", cidr)))?;
    let network: Ipv4Addr = network
        .parse()
        .map_err(|_| ForgeError::InvalidConfig(format!("invalid service CIDR {:?}", cidr)))?;
    let prefix: u32 = prefix
        .parse()
        .ok()
        .filter(|p| *p <= 30)
        .ok_or_else(|| ForgeError::InvalidConfig(format!("invalid service CIDR {:?}", cidr)))?;
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    Ok(IpAddr::V4(Ipv4Addr::from((u32::from(network) & mask) + 1)))
}

/// Inputs for the cluster certificate set
#[derive(Debug, Clone)]
pub struct PkiConfig {
    pub master0: String,
    /// Hostname of Master0
    pub hostname: String,
    pub masters: Vec<String>,
    pub apiserver_domain: String,
    pub vip: String,
    pub service_cidr: String,
    pub dns_domain: String,
    /// User-declared alternate names
    pub extra_sans: Vec<String>,
}

impl PkiConfig {
    /// SANs of the API server certificate, deduplicated, in a stable order
    pub fn apiserver_sans(&self) -> Result<Vec<String>> {
        let mut sans = vec![
            "127.0.0.1".to_string(),
            "localhost".to_string(),
            self.hostname.clone(),
            self.apiserver_domain.clone(),
            self.vip.clone(),
            first_service_ip(&self.service_cidr)?.to_string(),
            "kubernetes".to_string(),
            "kubernetes.default".to_string(),
            "kubernetes.default.svc".to_string(),
            format!("kubernetes.default.svc.{}", self.dns_domain),
        ];
        sans.extend(self.masters.iter().cloned());
        sans.extend(self.extra_sans.iter().cloned());

        let mut seen = std::collections::HashSet::new();
        sans.retain(|s| !s.is_empty() && seen.insert(s.clone()));
        Ok(sans)
    }

    fn etcd_sans(&self) -> Vec<String> {
        vec![
            self.hostname.clone(),
            "localhost".to_string(),
            self.master0.clone(),
            "127.0.0.1".to_string(),
            "::1".to_string(),
        ]
    }
}

/// Generate the full kubernetes certificate set into `pki_dir`
pub fn generate_cluster_pki(pki_dir: &Path, config: &PkiConfig) -> Result<CertificateAuthority> {
    std::fs::create_dir_all(pki_dir.join("etcd"))?;

    let ca = CertificateAuthority::load_or_create(pki_dir, "ca", "kubernetes")?;
    ca.issue_to(
        pki_dir,
        &CertSpec::new("apiserver", "kube-apiserver", CertUsage::Server)
            .sans(config.apiserver_sans()?),
    )?;
    ca.issue_to(
        pki_dir,
        &CertSpec::new(
            "apiserver-kubelet-client",
            "kube-apiserver-kubelet-client",
            CertUsage::Client,
        )
        .org("system:masters"),
    )?;

    let front_proxy = CertificateAuthority::load_or_create(pki_dir, "front-proxy-ca", "front-proxy-ca")?;
    front_proxy.issue_to(
        pki_dir,
        &CertSpec::new("front-proxy-client", "front-proxy-client", CertUsage::Client),
    )?;

    let etcd_dir = pki_dir.join("etcd");
    let etcd = CertificateAuthority::load_or_create(&etcd_dir, "ca", "etcd-ca")?;
    etcd.issue_to(
        &etcd_dir,
        &CertSpec::new("server", &config.hostname, CertUsage::ServerAndClient)
            .sans(config.etcd_sans()),
    )?;
    etcd.issue_to(
        &etcd_dir,
        &CertSpec::new("peer", &config.hostname, CertUsage::ServerAndClient)
            .sans(config.etcd_sans()),
    )?;
    etcd.issue_to(
        &etcd_dir,
        &CertSpec::new(
            "healthcheck-client",
            "kube-etcd-healthcheck-client",
            CertUsage::Client,
        ),
    )?;
    etcd.issue_to(
        pki_dir,
        &CertSpec::new(
            "apiserver-etcd-client",
            "kube-apiserver-etcd-client",
            CertUsage::Client,
        )
        .org("system:masters"),
    )?;

    generate_service_account_keys(pki_dir)?;
    tracing::info!("Cluster certificates ready in {}", pki_dir.display());
    Ok(ca)
}

/// Signing key pair for service account tokens
fn generate_service_account_keys(pki_dir: &Path) -> Result<()> {
    let key_path = pki_dir.join("sa.key");
    let pub_path = pki_dir.join("sa.pub");
    if key_path.exists() && pub_path.exists() {
        return Ok(());
    }
    let key = KeyPair::generate().map_err(|e| pki_err("failed to generate sa key", e))?;
    write_pem(&key_path, &key.serialize_pem())?;
    write_pem(&pub_path, &key.public_key_pem())?;
    Ok(())
}

/// Self-signed certificate for the registry domain, written as
/// `<domain>.crt`/`<domain>.key` under `certs_dir`
pub fn generate_registry_cert(certs_dir: &Path, domain: &str, ip: &str) -> Result<PathBuf> {
    let cert_path = certs_dir.join(format!("{}.crt", domain));
    let key_path = certs_dir.join(format!("{}.key", domain));
    if cert_path.exists() && key_path.exists() {
        return Ok(cert_path);
    }

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(domain, None);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let mut names = vec![domain.to_string(), crate::registry::SEA_HUB.to_string(), ip.to_string()];
    names.dedup();
    params.subject_alt_names = names.iter().map(|n| san(n)).collect::<Result<Vec<_>>>()?;
    set_validity(&mut params);

    let key = KeyPair::generate().map_err(|e| pki_err("failed to generate registry key", e))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| pki_err("failed to create registry certificate", e))?;
    write_pem(&cert_path, &cert.pem())?;
    write_pem(&key_path, &key.serialize_pem())?;
    tracing::info!("Generated registry certificate for {}", domain);
    Ok(cert_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> PkiConfig {
        PkiConfig {
            master0: "192.168.0.2".to_string(),
            hostname: "master-0".to_string(),
            masters: vec!["192.168.0.2".to_string(), "192.168.0.3".to_string()],
            apiserver_domain: "apiserver.cluster.local".to_string(),
            vip: "10.103.97.2".to_string(),
            service_cidr: "10.96.0.0/22".to_string(),
            dns_domain: "cluster.local".to_string(),
            extra_sans: vec!["k8s.example.com".to_string(), "192.168.0.2".to_string()],
        }
    }

    #[test]
    fn test_first_service_ip() {
        assert_eq!(first_service_ip("10.96.0.0/22").unwrap().to_string(), "10.96.0.1");
        assert_eq!(first_service_ip("10.96.3.7/22").unwrap().to_string(), "10.96.0.1");
        assert!(first_service_ip("10.96.0.0").is_err());
    }

    #[test]
    fn test_apiserver_sans() {
        let sans = config().apiserver_sans().unwrap();
        assert!(sans.contains(&"10.96.0.1".to_string()));
        assert!(sans.contains(&"kubernetes.default.svc.cluster.local".to_string()));
        assert!(sans.contains(&"k8s.example.com".to_string()));
        assert_eq!(sans.iter().filter(|s| *s == "192.168.0.2").count(), 1);
    }

    #[test]
    fn test_generate_cluster_pki() {
        let dir = tempdir().unwrap();
        let ca = generate_cluster_pki(dir.path(), &config()).unwrap();

        for file in SHARED_CA_FILES {
            assert!(dir.path().join(file).exists(), "missing {}", file);
        }
        for file in [
            "apiserver.crt",
            "apiserver-kubelet-client.key",
            "front-proxy-client.crt",
            "apiserver-etcd-client.crt",
            "etcd/server.crt",
            "etcd/peer.key",
            "etcd/healthcheck-client.crt",
        ] {
            assert!(dir.path().join(file).exists(), "missing {}", file);
        }
        assert!(ca.public_key_hash().unwrap().starts_with("sha256:"));
    }

    #[test]
    fn test_public_key_hash_covers_key_info() {
        use base64::Engine;

        let dir = tempdir().unwrap();
        let ca = generate_cluster_pki(dir.path(), &config()).unwrap();
        let key = ca.key_pair().unwrap();
        let info = key.subject_public_key_info();

        // the certificate embeds the SubjectPublicKeyInfo verbatim
        let body: String = ca
            .cert_pem()
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect();
        let der = base64::engine::general_purpose::STANDARD
            .decode(body)
            .unwrap();
        assert!(der.windows(info.len()).any(|w| w == info.as_slice()));

        let hash = ca.public_key_hash().unwrap();
        assert_eq!(hash, format!("sha256:{:x}", Sha256::digest(&info)));
        assert_ne!(
            hash,
            format!("sha256:{:x}", Sha256::digest(key.der_bytes()))
        );
    }

    #[test]
    fn test_existing_ca_is_reused() {
        let dir = tempdir().unwrap();
        let first = generate_cluster_pki(dir.path(), &config()).unwrap();
        let second = generate_cluster_pki(dir.path(), &config()).unwrap();
        assert_eq!(first.cert_pem(), second.cert_pem());
        assert_eq!(
            first.public_key_hash().unwrap(),
            second.public_key_hash().unwrap()
        );
    }

    #[test]
    fn test_registry_cert() {
        let dir = tempdir().unwrap();
        let path = generate_registry_cert(dir.path(), "sea.hub", "192.168.0.2").unwrap();
        assert!(path.ends_with("sea.hub.crt"));
        assert!(dir.path().join("sea.hub.key").exists());
    }
}
