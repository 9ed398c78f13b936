use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use pem::Pem;
use std::fs;
use std::path::{Path, PathBuf};
use tonic::transport::{Certificate, Identity};
use uuid::Uuid;

/// Name every identity certificate is issued for. Clients verify it instead
/// of the peer's (changing) address.
pub const CERTIFICATE_DOMAIN: &str = "warp-node";

const PEM_TAG: &str = "CERTIFICATE";
const CERT_FILE: &str = "identity.crt";
const KEY_FILE: &str = "identity.key";
const REMOTES_DIR: &str = "remotes";

/// Long-lived local identity plus the certificates fetched from peers
pub struct CertificateStore {
    dir: PathBuf,
    cert_pem: String,
    key_pem: String,
    cert_der: Vec<u8>,
}

impl CertificateStore {
    /// Load the identity under `dir`, generating and persisting one on first use
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir.join(REMOTES_DIR))
            .with_context(|| format!("Failed to create certificate directory {}", dir.display()))?;

        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);

        let (cert_pem, key_pem) = if cert_path.exists() && key_path.exists() {
            debug!("Loading identity certificate from {}", cert_path.display());
            (
                fs::read_to_string(&cert_path)
                    .with_context(|| format!("Failed to read {}", cert_path.display()))?,
                fs::read_to_string(&key_path)
                    .with_context(|| format!("Failed to read {}", key_path.display()))?,
            )
        } else {
            let (cert_pem, key_pem) = generate_identity()?;
            write_atomic(&key_path, key_pem.as_bytes())?;
            write_atomic(&cert_path, cert_pem.as_bytes())?;
            info!("Generated new identity certificate in {}", dir.display());
            (cert_pem, key_pem)
        };

        let cert_der = pem_decode(&cert_pem).context("Stored identity certificate is corrupt")?;

        Ok(Self {
            dir: dir.to_path_buf(),
            cert_pem,
            key_pem,
            cert_der,
        })
    }

    /// DER bytes of our certificate, as served by the bootstrap responder
    pub fn local_certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Certificate and key for the gRPC server
    pub fn server_identity(&self) -> Identity {
        Identity::from_pem(&self.cert_pem, &self.key_pem)
    }

    /// Persist `der` as the trusted certificate of `remote_id`, replacing any
    /// previous one. Concurrent readers see either the old or the new file.
    pub fn save_remote(&self, remote_id: &str, der: &[u8]) -> Result<()> {
        // Every DER certificate is an ASN.1 SEQUENCE
        if der.first() != Some(&0x30) {
            return Err(anyhow!("Data received from {} is not a DER certificate", remote_id));
        }
        write_atomic(&self.remote_path(remote_id), pem_encode(der).as_bytes())?;
        debug!("Stored certificate for {}", remote_id);
        Ok(())
    }

    pub fn remote_certificate_der(&self, remote_id: &str) -> Result<Vec<u8>> {
        let pem = self.remote_certificate_pem(remote_id)?;
        pem_decode(&pem)
    }

    /// Trust root for a client channel to `remote_id`
    pub fn remote_certificate(&self, remote_id: &str) -> Result<Certificate> {
        Ok(Certificate::from_pem(self.remote_certificate_pem(remote_id)?))
    }

    fn remote_certificate_pem(&self, remote_id: &str) -> Result<String> {
        let path = self.remote_path(remote_id);
        fs::read_to_string(&path).with_context(|| format!("No stored certificate for {}", remote_id))
    }

    fn remote_path(&self, remote_id: &str) -> PathBuf {
        let safe: String = remote_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(REMOTES_DIR).join(format!("{}.pem", safe))
    }
}

fn generate_identity() -> Result<(String, String)> {
    let certified_key = rcgen::generate_simple_self_signed(vec![CERTIFICATE_DOMAIN.to_string()])
        .context("failed to generate self-signed certificate")?;
    Ok((certified_key.cert.pem(), certified_key.key_pair.serialize_pem()))
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    fs::write(&tmp, contents).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move certificate into {}", path.display()))?;
    Ok(())
}

fn pem_encode(der: &[u8]) -> String {
    pem::encode(&Pem::new(PEM_TAG, der.to_vec()))
}

/// DER of the first PEM block in `text`, which must hold a certificate
fn pem_decode(text: &str) -> Result<Vec<u8>> {
    let block = pem::parse(text).context("Invalid PEM")?;
    if block.tag() != PEM_TAG {
        return Err(anyhow!("Expected a certificate, found {}", block.tag()));
    }
    Ok(block.into_contents())
}
