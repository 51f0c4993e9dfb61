//! SSH credential discovery.
//!
//! Resolution runs again on every connection attempt: agent contents can
//! change while a VM boots, and the VM-local key may be replaced by hand.

use std::fmt;
use std::path::{Path, PathBuf};

use rand_core::OsRng;
use ssh_key::{Algorithm, HashAlg, LineEnding, PrivateKey, PublicKey};

use crate::config::SshConfig;
use crate::error::VmError;

/// One way of authenticating, in the order it should be tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// An OpenSSH private key file on disk.
    KeyFile(PathBuf),
    /// A key held by the running SSH agent, addressed by fingerprint.
    Agent { fingerprint: String, comment: String },
    /// Password authentication; empty when nothing is stored.
    Password(String),
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::KeyFile(path) => write!(f, "key file {}", path.display()),
            AuthMethod::Agent {
                fingerprint,
                comment,
            } => write!(f, "agent key {fingerprint} ({comment})"),
            AuthMethod::Password(p) if p.is_empty() => f.write_str("empty password"),
            AuthMethod::Password(_) => f.write_str("stored password"),
        }
    }
}

/// A public key offered by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub fingerprint: String,
    pub comment: String,
}

/// Everything resolution looks at, besides the agent.
pub struct CredentialContext<'a> {
    pub vm_name: &'a str,
    /// VM-local private key (`<vm dir>/id_ed25519`).
    pub vm_key: &'a Path,
    /// VM-local public key; its fingerprint is a recognized agent label.
    pub vm_public_key: &'a Path,
    pub home: Option<PathBuf>,
    pub ssh: &'a SshConfig,
    pub stored_password: Option<&'a str>,
}

/// Owned form of [`CredentialContext`] for tasks that re-resolve on every
/// attempt.
#[derive(Debug, Clone)]
pub struct CredentialSource {
    pub vm_name: String,
    pub vm_key: PathBuf,
    pub vm_public_key: PathBuf,
    pub home: Option<PathBuf>,
    pub ssh: SshConfig,
    pub stored_password: Option<String>,
}

impl CredentialSource {
    pub fn context(&self) -> CredentialContext<'_> {
        CredentialContext {
            vm_name: &self.vm_name,
            vm_key: &self.vm_key,
            vm_public_key: &self.vm_public_key,
            home: self.home.clone(),
            ssh: &self.ssh,
            stored_password: self.stored_password.as_deref(),
        }
    }

    pub async fn resolve(&self) -> Result<Vec<AuthMethod>, VmError> {
        resolve_with_agent(&self.context()).await
    }
}

/// Ordered candidate methods. Fails only when every source is exhausted.
pub fn resolve(
    ctx: &CredentialContext<'_>,
    agent: &[AgentIdentity],
) -> Result<Vec<AuthMethod>, VmError> {
    let mut methods = Vec::new();
    let mut tried = Vec::new();

    // 1. VM-local key.
    if ctx.vm_key.is_file() {
        methods.push(AuthMethod::KeyFile(ctx.vm_key.to_path_buf()));
    } else {
        tried.push(format!("{} (missing)", ctx.vm_key.display()));
    }

    // 2. Agent keys matching a recognized label.
    let vm_fingerprint = public_key_fingerprint(ctx.vm_public_key);
    let mut labels: Vec<&str> = ctx
        .ssh
        .agent_labels
        .iter()
        .map(String::as_str)
        .filter(|l| !l.is_empty())
        .collect();
    if let Some(fp) = vm_fingerprint.as_deref() {
        labels.push(fp);
    }
    let matching: Vec<&AgentIdentity> = agent
        .iter()
        .filter(|id| {
            labels
                .iter()
                .any(|label| id.fingerprint == *label || id.comment.contains(label))
        })
        .collect();
    if matching.is_empty() {
        tried.push(format!(
            "ssh-agent ({} identities, none matching)",
            agent.len()
        ));
    }
    for id in matching {
        methods.push(AuthMethod::Agent {
            fingerprint: id.fingerprint.clone(),
            comment: id.comment.clone(),
        });
    }

    // 3. Conventional key locations.
    match &ctx.home {
        Some(home) => {
            for rel in &ctx.ssh.key_paths {
                let path = home.join(rel);
                if path.is_file() {
                    methods.push(AuthMethod::KeyFile(path));
                } else {
                    tried.push(format!("{} (missing)", path.display()));
                }
            }
        }
        None => tried.push("~/.ssh (no home directory)".into()),
    }

    // 4. Password.
    if ctx.ssh.allow_password {
        methods.push(AuthMethod::Password(
            ctx.stored_password.unwrap_or_default().to_string(),
        ));
    } else {
        tried.push("password (disabled)".into());
    }

    if methods.is_empty() {
        return Err(VmError::NoCredentialsAvailable {
            name: ctx.vm_name.to_string(),
            tried: tried.join(", "),
        });
    }
    Ok(methods)
}

/// Query the agent, then resolve.
pub async fn resolve_with_agent(ctx: &CredentialContext<'_>) -> Result<Vec<AuthMethod>, VmError> {
    let agent = agent_identities().await;
    resolve(ctx, &agent)
}

/// Identities held by the agent at `$SSH_AUTH_SOCK`; empty when there is
/// no agent or it cannot be reached.
pub async fn agent_identities() -> Vec<AgentIdentity> {
    if std::env::var_os("SSH_AUTH_SOCK").is_none() {
        return Vec::new();
    }
    let mut client = match russh::keys::agent::client::AgentClient::connect_env().await {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!("ssh-agent unavailable: {e}");
            return Vec::new();
        }
    };
    match client.request_identities().await {
        Ok(keys) => keys
            .iter()
            .map(|k| AgentIdentity {
                fingerprint: k.fingerprint(russh::keys::HashAlg::Sha256).to_string(),
                comment: k.comment().to_string(),
            })
            .collect(),
        Err(e) => {
            tracing::debug!("ssh-agent identity request failed: {e}");
            Vec::new()
        }
    }
}

/// SHA256 fingerprint of an OpenSSH public key file, if it parses.
pub fn public_key_fingerprint(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let key = PublicKey::from_openssh(text.trim()).ok()?;
    Some(key.fingerprint(HashAlg::Sha256).to_string())
}

/// Generate an ed25519 key pair for a VM. Returns the public key line.
pub async fn generate_keypair(
    private_path: &Path,
    public_path: &Path,
    comment: &str,
) -> Result<String, VmError> {
    let keygen_err = |message: String| VmError::ExternalCommand {
        command: "ed25519 keygen".into(),
        message,
    };

    let mut key =
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(|e| keygen_err(e.to_string()))?;
    key.set_comment(comment);
    let private = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| keygen_err(e.to_string()))?;
    let public = key
        .public_key()
        .to_openssh()
        .map_err(|e| keygen_err(e.to_string()))?;

    tokio::fs::write(private_path, private.as_bytes())
        .await
        .map_err(|e| VmError::io(format!("writing {}", private_path.display()), e))?;
    restrict_permissions(private_path).await?;
    tokio::fs::write(public_path, format!("{public}\n"))
        .await
        .map_err(|e| VmError::io(format!("writing {}", public_path.display()), e))?;

    tracing::info!(path = %private_path.display(), "generated ed25519 key pair");
    Ok(public)
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), VmError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| VmError::io(format!("setting permissions on {}", path.display()), e))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), VmError> {
    Ok(())
}
