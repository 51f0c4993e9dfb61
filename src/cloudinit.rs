use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::Ipv4Addr;

use facet_value::value;

use crate::config::VmConfig;
use crate::error::VmError;
use crate::iso9660::{self, IsoFile};
use crate::paths::VmPaths;

/// Volume label the NoCloud datasource scans for.
pub const VOLUME_ID: &str = "CIDATA";

/// The single authentication path embedded in user-data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestCredential {
    /// OpenSSH public key line.
    PublicKey(String),
    /// One-time password, stored in the VM's `SshInfo`.
    Password(String),
}

/// Inputs to document generation. Everything that influences the output
/// is in here so the builder stays pure.
pub struct SeedInput<'a> {
    pub config: &'a VmConfig,
    pub username: &'a str,
    pub credential: &'a GuestCredential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudInitDocuments {
    pub meta_data: String,
    pub user_data: String,
    pub network_config: String,
}

impl CloudInitDocuments {
    /// Short content hash, recorded in VM metadata.
    pub fn hash(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.meta_data.hash(&mut hasher);
        self.user_data.hash(&mut hasher);
        self.network_config.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

/// A parsed `staticAddressRange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticAddress {
    pub ip: Ipv4Addr,
    pub prefix: u8,
}

impl StaticAddress {
    /// Gateway convention: zero the last octet and use `.1`.
    pub fn gateway(&self) -> Ipv4Addr {
        let [a, b, c, _] = self.ip.octets();
        Ipv4Addr::new(a, b, c, 1)
    }
}

/// Parse `192.168.50.10/24`, or a bare address plus a dotted subnet mask.
/// Without either a prefix or a mask, `/24` is assumed.
pub fn parse_static_address(addr: &str, mask: Option<&str>) -> Result<StaticAddress, VmError> {
    let invalid = |what: &str| VmError::Validation {
        message: format!("invalid static address '{addr}': {what}"),
    };

    let (ip_str, prefix) = match addr.split_once('/') {
        Some((ip, p)) => {
            let prefix: u8 = p.parse().map_err(|_| invalid("bad prefix length"))?;
            (ip, Some(prefix))
        }
        None => (addr, None),
    };
    let ip: Ipv4Addr = ip_str.trim().parse().map_err(|_| invalid("not an IPv4 address"))?;

    let prefix = match (prefix, mask) {
        (Some(p), _) => p,
        (None, Some(m)) => {
            let m: Ipv4Addr = m.parse().map_err(|_| invalid("bad subnet mask"))?;
            let bits = u32::from(m);
            if bits.leading_ones() + bits.trailing_zeros() != 32 {
                return Err(invalid("subnet mask is not contiguous"));
            }
            bits.leading_ones() as u8
        }
        (None, None) => 24,
    };
    if prefix == 0 || prefix > 32 {
        return Err(invalid("prefix length out of range"));
    }
    Ok(StaticAddress { ip, prefix })
}

/// Render the three first-boot documents.
pub fn build_documents(input: &SeedInput<'_>) -> Result<CloudInitDocuments, VmError> {
    let config = input.config;
    let hostname = config.hostname();
    let meta_data = format!(
        "instance-id: vmlab-{}\nlocal-hostname: {hostname}\n",
        config.name
    );
    let user_data = build_user_data(input)?;
    let network_config = build_network_config(config)?;
    Ok(CloudInitDocuments {
        meta_data,
        user_data,
        network_config,
    })
}

fn build_user_data(input: &SeedInput<'_>) -> Result<String, VmError> {
    let hostname = input.config.hostname();
    let username = input.username;

    let config = match input.credential {
        GuestCredential::PublicKey(key) => value!({
            "hostname": (hostname),
            "preserve_hostname": false,
            "ssh_pwauth": false,
            "users": [{
                "name": (username),
                "shell": "/bin/bash",
                "sudo": "ALL=(ALL) NOPASSWD:ALL",
                "lock_passwd": true,
                "ssh_authorized_keys": [(key.trim())],
            }],
        }),
        GuestCredential::Password(password) => value!({
            "hostname": (hostname),
            "preserve_hostname": false,
            "ssh_pwauth": true,
            "users": [{
                "name": (username),
                "shell": "/bin/bash",
                "sudo": "ALL=(ALL) NOPASSWD:ALL",
                "lock_passwd": false,
                "plain_text_passwd": (password.as_str()),
            }],
        }),
    };

    let yaml = facet_yaml::to_string(&config).map_err(|e| VmError::DiskOperationFailed {
        context: "serializing user-data".into(),
        output: e.to_string(),
    })?;
    // cloud-init wants `#cloud-config` as the very first line, with no
    // document separator after it.
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    Ok(format!("#cloud-config\n{yaml}"))
}

/// Network config v2, matched on the VM's fixed MAC. No outer `network:` key.
fn build_network_config(config: &VmConfig) -> Result<String, VmError> {
    let mac = &config.network.mac_address;
    let mut doc = format!(
        "version: 2\nethernets:\n  id0:\n    match:\n      macaddress: \"{mac}\"\n"
    );
    match &config.network.static_address {
        None => doc.push_str("    dhcp4: true\n"),
        Some(addr) => {
            let addr = parse_static_address(addr, config.network.subnet_mask.as_deref())?;
            let gateway = addr.gateway();
            doc.push_str(&format!(
                "    dhcp4: false\n    addresses:\n      - {}/{}\n    routes:\n      - to: default\n        via: {gateway}\n    nameservers:\n      addresses: [{gateway}]\n",
                addr.ip, addr.prefix
            ));
        }
    }
    Ok(doc)
}

/// Write the three source documents and the `CIDATA` ISO into the VM dir.
pub async fn write_seed(paths: &VmPaths, docs: &CloudInitDocuments) -> Result<(), VmError> {
    let disk_err = |context: String, e: std::io::Error| VmError::DiskOperationFailed {
        context,
        output: e.to_string(),
    };

    for (path, body) in [
        (paths.meta_data(), &docs.meta_data),
        (paths.user_data(), &docs.user_data),
        (paths.network_config(), &docs.network_config),
    ] {
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| disk_err(format!("writing {}", path.display()), e))?;
    }

    let iso = iso9660::build_iso(
        VOLUME_ID,
        &[
            IsoFile {
                name: "meta-data",
                data: docs.meta_data.as_bytes(),
            },
            IsoFile {
                name: "user-data",
                data: docs.user_data.as_bytes(),
            },
            IsoFile {
                name: "network-config",
                data: docs.network_config.as_bytes(),
            },
        ],
    );

    let iso_path = paths.cidata_iso();
    tokio::fs::write(&iso_path, &iso)
        .await
        .map_err(|e| disk_err(format!("writing seed ISO {}", iso_path.display()), e))?;

    tracing::info!(path = %iso_path.display(), hash = %docs.hash(), "generated cloud-init seed ISO");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> VmConfig {
        let mut config = VmConfig::new("t1", "ubuntu-22.04");
        config.network.mac_address = "52:54:00:12:34:56".into();
        config
    }

    fn key() -> GuestCredential {
        GuestCredential::PublicKey("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITest vmlab-t1".into())
    }

    #[test]
    fn meta_data_names_instance() {
        let config = test_config();
        let cred = key();
        let docs = build_documents(&SeedInput {
            config: &config,
            username: "dev",
            credential: &cred,
        })
        .unwrap();
        assert_eq!(docs.meta_data, "instance-id: vmlab-t1\nlocal-hostname: t1\n");
    }

    #[test]
    fn user_data_with_key_has_no_password() {
        let config = test_config();
        let cred = key();
        let docs = build_documents(&SeedInput {
            config: &config,
            username: "dev",
            credential: &cred,
        })
        .unwrap();
        let ud = &docs.user_data;
        assert!(ud.starts_with("#cloud-config\n"));
        assert!(ud.contains("name: dev"));
        assert!(ud.contains("ssh_authorized_keys"));
        assert!(ud.contains("vmlab-t1"));
        assert!(!ud.contains("plain_text_passwd"));
    }

    #[test]
    fn user_data_with_password_has_no_key() {
        let config = test_config();
        let cred = GuestCredential::Password("s3cretpass".into());
        let docs = build_documents(&SeedInput {
            config: &config,
            username: "dev",
            credential: &cred,
        })
        .unwrap();
        let ud = &docs.user_data;
        assert!(ud.contains("plain_text_passwd"));
        assert!(ud.contains("s3cretpass"));
        assert!(!ud.contains("ssh_authorized_keys"));
    }

    #[test]
    fn network_config_defaults_to_dhcp() {
        let config = test_config();
        let doc = build_network_config(&config).unwrap();
        assert!(doc.starts_with("version: 2\n"));
        assert!(doc.contains("macaddress: \"52:54:00:12:34:56\""));
        assert!(doc.contains("dhcp4: true"));
        assert!(!doc.contains("addresses"));
    }

    #[test]
    fn network_config_static_derives_gateway() {
        let mut config = test_config();
        config.network.static_address = Some("192.168.50.10/24".into());
        let doc = build_network_config(&config).unwrap();
        assert!(doc.contains("dhcp4: false"));
        assert!(doc.contains("- 192.168.50.10/24"));
        assert!(doc.contains("via: 192.168.50.1"));
    }

    #[test]
    fn static_address_with_subnet_mask() {
        let addr = parse_static_address("10.0.7.42", Some("255.255.0.0")).unwrap();
        assert_eq!(addr.prefix, 16);
        assert_eq!(addr.gateway(), Ipv4Addr::new(10, 0, 7, 1));
    }

    #[test]
    fn static_address_rejects_garbage() {
        assert!(parse_static_address("10.0.0/24", None).is_err());
        assert!(parse_static_address("10.0.0.5/40", None).is_err());
        assert!(parse_static_address("10.0.0.5", Some("255.0.255.0")).is_err());
    }

    #[test]
    fn documents_are_byte_identical_for_same_input() {
        let config = test_config();
        let cred = key();
        let input = SeedInput {
            config: &config,
            username: "dev",
            credential: &cred,
        };
        let a = build_documents(&input).unwrap();
        let b = build_documents(&input).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
    }

    #[tokio::test]
    async fn write_seed_produces_files_and_iso() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VmPaths::new(dir.path(), "t1", "qcow2");
        std::fs::create_dir_all(&paths.dir).unwrap();
        let config = test_config();
        let cred = key();
        let docs = build_documents(&SeedInput {
            config: &config,
            username: "dev",
            credential: &cred,
        })
        .unwrap();
        write_seed(&paths, &docs).await.unwrap();

        assert_eq!(std::fs::read_to_string(paths.meta_data()).unwrap(), docs.meta_data);
        assert_eq!(std::fs::read_to_string(paths.user_data()).unwrap(), docs.user_data);
        let iso = std::fs::read(paths.cidata_iso()).unwrap();
        assert_eq!(&iso[0x8001..0x8006], b"CD001");
        assert!(iso.windows(6).any(|w| w == b"CIDATA"));
    }
}
