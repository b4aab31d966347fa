//! Peer certificate decoding for `getpeercert` (§4.8, supplementing §6.4).
//!
//! Walks the subject/issuer RDN sequences and `subjectAltName` entries the
//! way the original `x509.py` did, plus serial number and issuer — fields
//! the distilled `getpeercert` contract doesn't require but the original
//! source always extracted.

use openssl::x509::{GeneralNameRef, X509NameRef, X509Ref};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdnAttribute {
    pub oid: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectAltName {
    Dns(String),
    IpAddress(String),
    Uri(String),
}

/// Decoded form of a peer's leaf certificate, returned by
/// `PeerAssociation::getpeercert(binary = false)`. Empty (the `Default`
/// value) when the peer presented a certificate that was never verified.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificate {
    pub subject: Vec<RdnAttribute>,
    pub issuer: Vec<RdnAttribute>,
    pub not_before: String,
    pub not_after: String,
    pub serial_number: String,
    pub subject_alt_names: Vec<SubjectAltName>,
}

pub(crate) fn describe(cert: &X509Ref) -> PeerCertificate {
    let serial_number = cert
        .serial_number()
        .to_bn()
        .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
        .unwrap_or_default();

    let subject_alt_names = cert
        .subject_alt_names()
        .map(|sans| sans.iter().filter_map(convert_san).collect())
        .unwrap_or_default();

    PeerCertificate {
        subject: rdn_attributes(cert.subject_name()),
        issuer: rdn_attributes(cert.issuer_name()),
        not_before: cert.not_before().to_string(),
        not_after: cert.not_after().to_string(),
        serial_number,
        subject_alt_names,
    }
}

fn rdn_attributes(name: &X509NameRef) -> Vec<RdnAttribute> {
    name.entries()
        .map(|entry| RdnAttribute {
            oid: entry.object().to_string(),
            value: entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_else(|_| String::from("<unprintable>")),
        })
        .collect()
}

fn convert_san(name: &GeneralNameRef) -> Option<SubjectAltName> {
    if let Some(dns) = name.dnsname() {
        return Some(SubjectAltName::Dns(dns.to_string()));
    }
    if let Some(ip) = name.ipaddress() {
        return Some(SubjectAltName::IpAddress(format_ip(ip)));
    }
    if let Some(uri) = name.uri() {
        return Some(SubjectAltName::Uri(uri.to_string()));
    }
    None
}

fn format_ip(bytes: &[u8]) -> String {
    match bytes.len() {
        4 => std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).to_string(),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            std::net::Ipv6Addr::from(octets).to_string()
        }
        _ => bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_ipv4() {
        assert_eq!(format_ip(&[192, 0, 2, 1]), "192.0.2.1");
    }

    #[test]
    fn formats_ipv6() {
        let bytes = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        assert_eq!(format_ip(&bytes), "2001:db8::1");
    }

    #[test]
    fn falls_back_to_hex_for_unknown_lengths() {
        assert_eq!(format_ip(&[1, 2, 3]), "01:02:03");
    }
}
