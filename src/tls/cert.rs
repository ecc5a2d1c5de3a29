//! X.509 certificate builder.
//!
//! Collects subject fields, validity window and extensions up front and
//! performs every BoringSSL call inside [`CertificateBuilder::sign`], which
//! generates the RSA key, assembles the certificate and returns both as
//! PEM. [`CertificateBuilder::self_signed`] composes the common case: one
//! CN, a subject-alternative-name extension from comma-separated IP and
//! domain lists, sign with the generated key.

use crate::base::neterror::NetError;
use boring::asn1::Asn1Time;
use boring::bn::BigNum;
use boring::hash::MessageDigest;
use boring::pkey::PKey;
use boring::rsa::Rsa;
use boring::nid::Nid;
use boring::x509::extension::{BasicConstraints, KeyUsage, SubjectAlternativeName};
use boring::x509::{X509Builder, X509Extension, X509NameBuilder};
use rand::RngCore;

const DEFAULT_KEY_BITS: u32 = 2048;
const DEFAULT_VALID_DAYS: u32 = 365;

/// Signed certificate and its private key, both PEM-encoded (key as
/// PKCS#8). Feeds directly into [`crate::tls::context::ServerIdentity`].
#[derive(Debug, Clone)]
pub struct CertifiedKeyPair {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

enum ExtensionSpec {
    Named {
        name: String,
        value: String,
        critical: bool,
    },
    Standard {
        nid: Nid,
        value: String,
        critical: bool,
    },
}

pub struct CertificateBuilder {
    key_bits: u32,
    valid_days: u32,
    serial: Option<u64>,
    subject: Vec<(String, String)>,
    san_ips: Vec<String>,
    san_domains: Vec<String>,
    extensions: Vec<ExtensionSpec>,
    ca: bool,
}

impl CertificateBuilder {
    pub fn new() -> Self {
        Self {
            key_bits: DEFAULT_KEY_BITS,
            valid_days: DEFAULT_VALID_DAYS,
            serial: None,
            subject: Vec::new(),
            san_ips: Vec::new(),
            san_domains: Vec::new(),
            extensions: Vec::new(),
            ca: false,
        }
    }

    pub fn key_bits(mut self, bits: u32) -> Self {
        self.key_bits = bits;
        self
    }

    pub fn valid_days(mut self, days: u32) -> Self {
        self.valid_days = days;
        self
    }

    /// Fixed serial; a random 16-byte serial is generated otherwise.
    pub fn serial(mut self, serial: u64) -> Self {
        self.serial = Some(serial);
        self
    }

    /// Appends one subject (and, being self-signed, issuer) name entry,
    /// e.g. `("CN", "localhost")` or `("O", "reactnet")`.
    pub fn subject_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.subject.push((field.into(), value.into()));
        self
    }

    pub fn san_ip(mut self, ip: impl Into<String>) -> Self {
        self.san_ips.push(ip.into());
        self
    }

    pub fn san_domain(mut self, domain: impl Into<String>) -> Self {
        self.san_domains.push(domain.into());
        self
    }

    /// Appends an extension by short name or dotted OID, with a value in
    /// the OpenSSL configuration syntax, e.g.
    /// `("extendedKeyUsage", "serverAuth", false)`.
    pub fn extension(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        critical: bool,
    ) -> Self {
        self.extensions.push(ExtensionSpec::Named {
            name: name.into(),
            value: value.into(),
            critical,
        });
        self
    }

    /// NID-based counterpart of [`CertificateBuilder::extension`].
    pub fn extension_nid(mut self, nid: Nid, value: impl Into<String>, critical: bool) -> Self {
        self.extensions.push(ExtensionSpec::Standard {
            nid,
            value: value.into(),
            critical,
        });
        self
    }

    /// Marks the certificate as a CA (basic-constraints critical CA:TRUE).
    pub fn certificate_authority(mut self) -> Self {
        self.ca = true;
        self
    }

    /// Generates the key pair, assembles and signs the certificate.
    pub fn sign(self) -> Result<CertifiedKeyPair, NetError> {
        let rsa = Rsa::generate(self.key_bits)?;
        let key = PKey::from_rsa(rsa)?;

        let mut name = X509NameBuilder::new()?;
        for (field, value) in &self.subject {
            name.append_entry_by_text(field, value)?;
        }
        let name = name.build();

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;

        let serial_bn = match self.serial {
            Some(fixed) => BigNum::from_dec_str(&fixed.to_string())?,
            None => {
                let mut bytes = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut bytes);
                // Serials must be positive.
                bytes[0] &= 0x7f;
                BigNum::from_slice(&bytes)?
            }
        };
        builder.set_serial_number(&serial_bn.to_asn1_integer()?)?;

        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(&Asn1Time::days_from_now(0)?)?;
        builder.set_not_after(&Asn1Time::days_from_now(self.valid_days)?)?;

        let mut constraints = BasicConstraints::new();
        constraints.critical();
        if self.ca {
            constraints.ca();
        }
        builder.append_extension(constraints.build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;

        if !self.san_ips.is_empty() || !self.san_domains.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for ip in &self.san_ips {
                san.ip(ip);
            }
            for domain in &self.san_domains {
                san.dns(domain);
            }
            let ext = san.build(&builder.x509v3_context(None, None))?;
            builder.append_extension(ext)?;
        }

        for spec in &self.extensions {
            let ext = match spec {
                ExtensionSpec::Named {
                    name,
                    value,
                    critical,
                } => X509Extension::new(
                    None,
                    Some(&builder.x509v3_context(None, None)),
                    name,
                    &Self::render_value(value, *critical),
                )?,
                ExtensionSpec::Standard {
                    nid,
                    value,
                    critical,
                } => X509Extension::new_nid(
                    None,
                    Some(&builder.x509v3_context(None, None)),
                    *nid,
                    &Self::render_value(value, *critical),
                )?,
            };
            builder.append_extension(ext)?;
        }

        builder.sign(&key, MessageDigest::sha256())?;
        let cert = builder.build();

        Ok(CertifiedKeyPair {
            cert_pem: cert.to_pem()?,
            key_pem: key.private_key_to_pem_pkcs8()?,
        })
    }

    fn render_value(value: &str, critical: bool) -> String {
        if critical {
            format!("critical,{value}")
        } else {
            value.to_string()
        }
    }

    /// Self-signed leaf for `common_name`, with subject-alternative names
    /// taken from comma-separated IP and domain lists (either may be empty).
    pub fn self_signed(
        common_name: &str,
        ips: &str,
        domains: &str,
    ) -> Result<CertifiedKeyPair, NetError> {
        let mut builder = Self::new().subject_field("CN", common_name);
        for ip in ips.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            builder = builder.san_ip(ip);
        }
        for domain in domains.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            builder = builder.san_domain(domain);
        }
        builder.sign()
    }
}

impl Default for CertificateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boring::x509::X509;

    #[test]
    fn test_self_signed_round_trips_through_pem() {
        let pair =
            CertificateBuilder::self_signed("localhost", "127.0.0.1,::1", "localhost").unwrap();
        let cert = X509::from_pem(&pair.cert_pem).unwrap();
        let subject = format!("{:?}", cert.subject_name());
        assert!(subject.contains("localhost"));
        assert!(PKey::private_key_from_pem(&pair.key_pem).is_ok());
    }

    #[test]
    fn test_fixed_serial_and_fields() {
        let pair = CertificateBuilder::new()
            .serial(4242)
            .valid_days(10)
            .subject_field("CN", "unit.test")
            .subject_field("O", "reactnet")
            .sign()
            .unwrap();
        let cert = X509::from_pem(&pair.cert_pem).unwrap();
        let serial = cert.serial_number().to_bn().unwrap();
        assert_eq!(serial, BigNum::from_dec_str("4242").unwrap());
    }

    #[test]
    fn test_empty_san_lists_tolerated() {
        assert!(CertificateBuilder::self_signed("bare.test", "", "").is_ok());
    }

    #[test]
    fn test_custom_extensions() {
        let pair = CertificateBuilder::new()
            .subject_field("CN", "ext.test")
            .extension("extendedKeyUsage", "serverAuth", true)
            .extension_nid(Nid::NETSCAPE_COMMENT, "issued by the socket layer", false)
            .sign()
            .unwrap();
        let cert = X509::from_pem(&pair.cert_pem).unwrap();
        let text = String::from_utf8(cert.to_text().unwrap()).unwrap();
        assert!(text.contains("TLS Web Server Authentication"));
        assert!(text.contains("issued by the socket layer"));
    }

    #[test]
    fn test_unknown_extension_name_rejected() {
        let result = CertificateBuilder::new()
            .subject_field("CN", "ext.test")
            .extension("noSuchExtension", "whatever", false)
            .sign();
        assert!(result.is_err());
    }
}
