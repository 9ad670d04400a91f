//! PKCS#10 certificate-request parsing.
//!
//! Two complementary parses run over every submitted CSR. The standard
//! parse (openssl, with x509-parser for the subject) yields the subject
//! name, the public key, and the self-signature check. A second,
//! attribute-level parse walks the raw `Attributes [0] IMPLICIT SET OF`
//! field for the `extensionRequest` attribute (1.2.840.113549.1.9.14),
//! because some browser stacks wrap the extension list in an extra SEQUENCE
//! layer that strict parsers refuse. SAN values come from whichever parse
//! found them: the standard one when it succeeds, the walk otherwise.

use asn1_rs::{Any, Class, FromDer, Oid, Tag};
use openssl::pkey::{PKey, Public};
use openssl::x509::X509Req;
use thiserror::Error;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer as X509FromDer;

const OID_EXTENSION_REQUEST: Oid<'static> = asn1_rs::oid!(1.2.840 .113549 .1 .9 .14);
const OID_SUBJECT_ALT_NAME: &str = "2.5.29.17";

#[derive(Debug, Error)]
pub enum CsrError {
    #[error("failed to decode PEM block")]
    Pem,
    #[error("unexpected PEM block type {0:?}, expected CERTIFICATE REQUEST")]
    PemType(String),
    #[error("failed to parse CSR: {0}")]
    Parse(String),
    #[error("invalid CSR signature")]
    Signature,
    #[error("no CommonName found in CSR")]
    MissingCommonName,
}

/// An extension carried by the CSR, in raw DER form.
#[derive(Debug, Clone)]
pub struct RawExtension {
    pub oid: String,
    pub critical: bool,
    pub value: Vec<u8>,
}

/// Subject-alternative-name values recovered from the CSR.
#[derive(Debug, Clone, Default)]
pub struct SubjectAltNames {
    pub dns: Vec<String>,
    pub email: Vec<String>,
    pub ip: Vec<String>,
    pub uri: Vec<String>,
}

impl SubjectAltNames {
    pub fn is_empty(&self) -> bool {
        self.dns.is_empty() && self.email.is_empty() && self.ip.is_empty() && self.uri.is_empty()
    }
}

/// A fully parsed and signature-verified CSR.
pub struct ParsedCsr {
    req: X509Req,
    public_key: PKey<Public>,
    /// Subject CN.
    pub username: String,
    /// Extensions recovered by the attribute-level walk.
    pub extensions: Vec<RawExtension>,
    pub san: SubjectAltNames,
}

impl ParsedCsr {
    /// The subject name exactly as submitted.
    pub fn subject_name(&self) -> &openssl::x509::X509NameRef {
        self.req.subject_name()
    }

    /// The public key from the CSR. The issued certificate must carry this
    /// key, never a regenerated one.
    pub fn public_key(&self) -> &PKey<Public> {
        &self.public_key
    }
}

/// Parses a PEM CSR, verifies its self-signature, and extracts the
/// username (subject CN), the requested extensions, and the SAN values.
pub fn parse_csr(csr_pem: &str) -> Result<ParsedCsr, CsrError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(csr_pem.as_bytes())
        .map_err(|_| CsrError::Pem)?;
    if pem.label != "CERTIFICATE REQUEST" {
        return Err(CsrError::PemType(pem.label.clone()));
    }
    let der = &pem.contents;

    let req = X509Req::from_der(der).map_err(|e| CsrError::Parse(e.to_string()))?;
    let public_key = req
        .public_key()
        .map_err(|e| CsrError::Parse(format!("unreadable public key: {e}")))?;
    let verified = req.verify(&public_key).map_err(|_| CsrError::Signature)?;
    if !verified {
        return Err(CsrError::Signature);
    }

    let mut san = SubjectAltNames::default();
    let username = match X509CertificationRequest::from_der(der) {
        Ok((_, parsed)) => {
            if let Some(requested) = parsed.requested_extensions() {
                for ext in requested {
                    if let ParsedExtension::SubjectAlternativeName(names) = ext {
                        collect_general_names(&mut san, &names.general_names);
                    }
                }
            }
            common_name(&parsed)?
        }
        Err(error) => {
            // Quirky attribute encodings can defeat the strict parser; the
            // attribute walk below still recovers the extensions, and the
            // CN comes from the openssl parse instead.
            tracing::warn!(%error, "strict CSR parse failed, using openssl subject only");
            common_name_openssl(&req)?
        }
    };

    let extensions = match extension_request_walk(der) {
        Ok(recovered) => recovered,
        Err(error) => {
            tracing::warn!(%error, "CSR attribute walk failed, using standard extensions only");
            Vec::new()
        }
    };

    if san.is_empty() {
        san = subject_alt_names(&extensions);
    }

    Ok(ParsedCsr {
        req,
        public_key,
        username,
        extensions,
        san,
    })
}

/// Extracts the subject CN, accepting UTF8String, PrintableString, and
/// IA5String encodings.
fn common_name(parsed: &X509CertificationRequest<'_>) -> Result<String, CsrError> {
    let attr = parsed
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .ok_or(CsrError::MissingCommonName)?;
    let value = attr
        .as_str()
        .map_err(|e| CsrError::Parse(format!("unsupported CommonName encoding: {e}")))?;
    if value.is_empty() {
        return Err(CsrError::MissingCommonName);
    }
    Ok(value.to_string())
}

fn common_name_openssl(req: &X509Req) -> Result<String, CsrError> {
    let entry = req
        .subject_name()
        .entries_by_nid(openssl::nid::Nid::COMMONNAME)
        .next()
        .ok_or(CsrError::MissingCommonName)?;
    let value = entry
        .data()
        .as_utf8()
        .map_err(|e| CsrError::Parse(format!("unsupported CommonName encoding: {e}")))?;
    if value.is_empty() {
        return Err(CsrError::MissingCommonName);
    }
    Ok(value.to_string())
}

/// Walks the raw PKCS#10 attributes for `extensionRequest` values.
///
/// The attribute value is a `SET` whose single member is the extension
/// list, but some client stacks emit `SET { SEQUENCE { SEQUENCE OF
/// Extension } }` instead of `SET { SEQUENCE OF Extension }`. The first
/// inner tag decides whether to descend one level or two: an OID means the
/// element already is an `Extension`, a SEQUENCE means one more wrapper.
fn extension_request_walk(der: &[u8]) -> Result<Vec<RawExtension>, CsrError> {
    let attrs = |msg: &str| CsrError::Parse(msg.to_string());

    let (_, request) =
        Any::from_der(der).map_err(|e| attrs(&format!("CertificationRequest: {e}")))?;
    let (_, info) = Any::from_der(request.data)
        .map_err(|e| attrs(&format!("certificationRequestInfo: {e}")))?;

    let rem = info.data;
    let (rem, _version) = Any::from_der(rem).map_err(|e| attrs(&format!("version: {e}")))?;
    let (rem, _subject) = Any::from_der(rem).map_err(|e| attrs(&format!("subject: {e}")))?;
    let (rem, _spki) = Any::from_der(rem).map_err(|e| attrs(&format!("spki: {e}")))?;

    let mut out = Vec::new();
    if rem.is_empty() {
        return Ok(out);
    }

    let (_, attributes) = Any::from_der(rem).map_err(|e| attrs(&format!("attributes: {e}")))?;
    if attributes.class() != Class::ContextSpecific {
        return Ok(out);
    }

    let mut attr_data = attributes.data;
    while !attr_data.is_empty() {
        let (next, attribute) =
            Any::from_der(attr_data).map_err(|e| attrs(&format!("attribute: {e}")))?;
        attr_data = next;

        let (value_data, attr_type) = Oid::from_der(attribute.data)
            .map_err(|e| attrs(&format!("attribute type: {e}")))?;
        if attr_type != OID_EXTENSION_REQUEST {
            continue;
        }

        let (_, value_set) =
            Any::from_der(value_data).map_err(|e| attrs(&format!("attribute value: {e}")))?;
        if value_set.data.is_empty() {
            continue;
        }

        let (_, outer) = Any::from_der(value_set.data)
            .map_err(|e| attrs(&format!("extension list: {e}")))?;
        let list = extension_list(&outer)?;

        let mut ext_data = list;
        while !ext_data.is_empty() {
            let (next, ext) =
                Any::from_der(ext_data).map_err(|e| attrs(&format!("extension: {e}")))?;
            ext_data = next;
            out.push(parse_extension(&ext)?);
        }
    }

    Ok(out)
}

/// Resolves the wrapper ambiguity: returns the concatenated `Extension`
/// elements inside `outer`.
fn extension_list<'a>(outer: &Any<'a>) -> Result<&'a [u8], CsrError> {
    if outer.data.is_empty() {
        return Ok(outer.data);
    }
    let (_, first) = Any::from_der(outer.data)
        .map_err(|e| CsrError::Parse(format!("extension list member: {e}")))?;
    if first.data.is_empty() {
        return Ok(outer.data);
    }
    let (_, inner) = Any::from_der(first.data)
        .map_err(|e| CsrError::Parse(format!("extension list inner: {e}")))?;
    match inner.tag() {
        // first is an Extension (OID leads): outer already is the list.
        Tag::Oid => Ok(outer.data),
        // first is the list itself: descend through the extra wrapper.
        Tag::Sequence => Ok(first.data),
        tag => Err(CsrError::Parse(format!(
            "unexpected tag {tag:?} inside extension request"
        ))),
    }
}

fn parse_extension(ext: &Any<'_>) -> Result<RawExtension, CsrError> {
    let (rem, oid) =
        Oid::from_der(ext.data).map_err(|e| CsrError::Parse(format!("extension oid: {e}")))?;
    let mut rem = rem;
    let mut critical = false;
    if rem.first() == Some(&0x01) {
        let (next, value) =
            bool::from_der(rem).map_err(|e| CsrError::Parse(format!("critical flag: {e}")))?;
        critical = value;
        rem = next;
    }
    let (_, value) =
        Any::from_der(rem).map_err(|e| CsrError::Parse(format!("extension value: {e}")))?;
    Ok(RawExtension {
        oid: oid.to_id_string(),
        critical,
        value: value.data.to_vec(),
    })
}

/// Collects SAN values from the first SAN extension recovered by the
/// attribute walk. Only consulted when the standard parse found none.
fn subject_alt_names(extensions: &[RawExtension]) -> SubjectAltNames {
    let mut san = SubjectAltNames::default();
    let Some(ext) = extensions.iter().find(|e| e.oid == OID_SUBJECT_ALT_NAME) else {
        return san;
    };
    let Ok((_, parsed)) =
        x509_parser::extensions::SubjectAlternativeName::from_der(&ext.value)
    else {
        tracing::warn!("CSR carries a SAN extension that does not decode; ignoring it");
        return san;
    };
    collect_general_names(&mut san, &parsed.general_names);
    san
}

fn collect_general_names(san: &mut SubjectAltNames, names: &[GeneralName<'_>]) {
    for name in names {
        match name {
            GeneralName::DNSName(dns) => san.dns.push(dns.to_string()),
            GeneralName::RFC822Name(email) => san.email.push(email.to_string()),
            GeneralName::URI(uri) => san.uri.push(uri.to_string()),
            GeneralName::IPAddress(bytes) => match bytes.len() {
                4 => {
                    let octets: [u8; 4] = (*bytes).try_into().expect("length checked");
                    san.ip.push(std::net::Ipv4Addr::from(octets).to_string());
                }
                16 => {
                    let octets: [u8; 16] = (*bytes).try_into().expect("length checked");
                    san.ip.push(std::net::Ipv6Addr::from(octets).to_string());
                }
                _ => tracing::warn!(len = bytes.len(), "SAN IP address with odd length"),
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// DER TLV with short/long length forms, enough for test fixtures.
    fn der(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        let len = content.len();
        if len < 128 {
            out.push(len as u8);
        } else if len < 256 {
            out.extend([0x81, len as u8]);
        } else {
            out.extend([0x82, (len >> 8) as u8, len as u8]);
        }
        out.extend_from_slice(content);
        out
    }

    // 1.3.6.1.4.1.10049.1
    const TEST_EXT_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x04, 0x01, 0xce, 0x41, 0x01];
    // 1.2.840.113549.1.9.14 (extensionRequest)
    const EXT_REQUEST_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x09, 0x0e];

    /// Builds a structurally minimal CSR DER whose attributes carry one
    /// extensionRequest; `wrap` adds the extra SEQUENCE layer some clients
    /// emit.
    fn fixture_csr(wrap: bool) -> Vec<u8> {
        let extension = der(
            0x30,
            &[der(0x06, TEST_EXT_OID), der(0x04, b"payload")].concat(),
        );
        let ext_list = der(0x30, &extension);
        let set_content = if wrap { der(0x30, &ext_list) } else { ext_list };
        let value_set = der(0x31, &set_content);
        let attribute = der(0x30, &[der(0x06, EXT_REQUEST_OID), value_set].concat());
        let attributes = der(0xa0, &attribute);

        let cri = der(
            0x30,
            &[
                der(0x02, &[0x00]), // version
                der(0x30, &[]),     // subject (empty, irrelevant to the walk)
                der(0x30, &[]),     // spki (ditto)
                attributes,
            ]
            .concat(),
        );
        der(
            0x30,
            &[cri, der(0x30, &[]), der(0x03, &[0x00])].concat(),
        )
    }

    #[test]
    fn attribute_walk_reads_canonical_encoding() {
        let extensions = extension_request_walk(&fixture_csr(false)).unwrap();
        assert_eq!(extensions.len(), 1);
        assert_eq!(extensions[0].oid, "1.3.6.1.4.1.10049.1");
        assert!(!extensions[0].critical);
        assert_eq!(extensions[0].value, b"payload");
    }

    #[test]
    fn attribute_walk_tolerates_extra_sequence_wrapper() {
        let extensions = extension_request_walk(&fixture_csr(true)).unwrap();
        assert_eq!(extensions.len(), 1);
        assert_eq!(extensions[0].oid, "1.3.6.1.4.1.10049.1");
        assert_eq!(extensions[0].value, b"payload");
    }

    #[test]
    fn attribute_walk_handles_absent_attributes() {
        // CSR body whose CRI stops after the SPKI.
        let cri = der(
            0x30,
            &[der(0x02, &[0x00]), der(0x30, &[]), der(0x30, &[])].concat(),
        );
        let csr = der(0x30, &[cri, der(0x30, &[]), der(0x03, &[0x00])].concat());
        assert!(extension_request_walk(&csr).unwrap().is_empty());
    }

    #[test]
    fn critical_flag_is_parsed() {
        let extension = der(
            0x30,
            &[
                der(0x06, TEST_EXT_OID),
                der(0x01, &[0xff]),
                der(0x04, b"x"),
            ]
            .concat(),
        );
        let (_, any) = Any::from_der(&extension).unwrap();
        let parsed = parse_extension(&any).unwrap();
        assert!(parsed.critical);
        assert_eq!(parsed.value, b"x");
    }

    fn rcgen_csr(common_name: Option<&str>) -> String {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = rcgen::CertificateParams::new(vec![]).unwrap();
        if let Some(cn) = common_name {
            let mut dn = rcgen::DistinguishedName::new();
            dn.push(rcgen::DnType::CommonName, cn);
            params.distinguished_name = dn;
        }
        params.subject_alt_names = vec![
            rcgen::SanType::DnsName("alice.example.com".try_into().unwrap()),
            rcgen::SanType::Rfc822Name("alice@example.com".try_into().unwrap()),
        ];
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    #[test]
    fn parses_real_csr_with_cn_and_san() {
        let parsed = parse_csr(&rcgen_csr(Some("alice"))).unwrap();
        assert_eq!(parsed.username, "alice");
        assert_eq!(parsed.san.dns, vec!["alice.example.com"]);
        assert_eq!(parsed.san.email, vec!["alice@example.com"]);
    }

    #[test]
    fn rejects_csr_without_common_name() {
        assert!(matches!(
            parse_csr(&rcgen_csr(None)),
            Err(CsrError::MissingCommonName) | Err(CsrError::Parse(_))
        ));
    }

    #[test]
    fn rejects_wrong_pem_label() {
        let pem = rcgen_csr(Some("alice"))
            .replace("CERTIFICATE REQUEST", "CERTIFICATE");
        assert!(matches!(parse_csr(&pem), Err(CsrError::PemType(_))));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_csr("not a pem at all").is_err());
    }

    #[test]
    fn rejects_tampered_csr() {
        let pem = rcgen_csr(Some("alice"));
        // Corrupt a byte in the middle of the body; the CSR either fails
        // to parse or fails signature verification, never signs.
        let lines: Vec<&str> = pem.lines().collect();
        let mid = lines.len() / 2;
        let mut corrupted_line = lines[mid].to_string();
        let replacement = if corrupted_line.contains('A') { ('A', 'B') } else { ('Q', 'R') };
        corrupted_line = corrupted_line.replacen(replacement.0, &replacement.1.to_string(), 1);
        let mut mutated = lines.clone();
        mutated[mid] = &corrupted_line;
        let mutated = mutated.join("\n");
        if mutated == pem {
            return;
        }
        assert!(parse_csr(&mutated).is_err());
    }
}
