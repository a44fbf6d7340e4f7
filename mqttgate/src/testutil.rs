//! Test PKI: a throwaway CA issuing server/client certificates and CRLs.

use std::sync::Arc;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateRevocationListParams, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose, RevocationReason,
    RevokedCertParams, SerialNumber, date_time_ymd,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::types::CertificateIdentity;

pub(crate) struct TestPki {
    pub ca_cert: Certificate,
    pub ca_key: KeyPair,
    /// CA subject as rendered by x509-parser, i.e. the issuer name of
    /// everything this CA signs.
    pub ca_name: String,
}

/// An issued end-entity certificate.
pub(crate) struct Issued {
    pub cert: Certificate,
    pub key: KeyPair,
}

impl Issued {
    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.serialize_der()))
    }
}

impl TestPki {
    pub fn new(common_name: &str) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert = params.self_signed(&ca_key).unwrap();
        let ca_name = CertificateIdentity::from_der(ca_cert.der()).unwrap().subject;

        Self {
            ca_cert,
            ca_key,
            ca_name,
        }
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    pub fn root_store(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_cert.der().clone()).unwrap();
        roots
    }

    pub fn issue_server(&self, host: &str) -> Issued {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![host.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, host);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        Issued { cert, key }
    }

    pub fn issue_client(&self, common_name: &str, serial: &[u8]) -> Issued {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        Issued { cert, key }
    }

    fn crl(&self, serials: &[&[u8]]) -> rcgen::CertificateRevocationList {
        let revoked_certs = serials
            .iter()
            .map(|serial| RevokedCertParams {
                serial_number: SerialNumber::from(serial.to_vec()),
                revocation_time: date_time_ymd(2024, 6, 1),
                reason_code: Some(RevocationReason::KeyCompromise),
                invalidity_date: None,
            })
            .collect();

        CertificateRevocationListParams {
            this_update: date_time_ymd(2024, 1, 1),
            next_update: date_time_ymd(2099, 1, 1),
            crl_number: SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs,
            key_identifier_method: KeyIdMethod::Sha256,
        }
        .signed_by(&self.ca_cert, &self.ca_key)
        .unwrap()
    }

    pub fn crl_pem(&self, serials: &[&[u8]]) -> String {
        self.crl(serials).pem().unwrap()
    }

    pub fn crl_der(&self, serials: &[&[u8]]) -> Vec<u8> {
        self.crl(serials).der().as_ref().to_vec()
    }

    /// Client TLS config presenting `client` and trusting this CA.
    pub fn client_config(&self, client: &Issued) -> Arc<ClientConfig> {
        let config = ClientConfig::builder()
            .with_root_certificates(self.root_store())
            .with_client_auth_cert(vec![client.cert_der()], client.key_der())
            .unwrap();
        Arc::new(config)
    }
}
