// # Client Profiles
//
// Per-client `.ovpn` profiles and their passwords, produced by the external
// `ovpngen.sh` script and cached on disk.
//
// ## File Layout
//
// ```text
// <profile_dir>/<client>.ovpn            profile handed to the client
// <profile_dir>/<client>.ovpn.password   password protecting its key
// ```
//
// ## Regeneration
//
// A regenerated profile is issued under `<client><10 random digits>` so the
// certificate is fresh, while the files stay keyed on the original client
// name: the client keeps downloading the same file name with new content.

use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{error, info};

use crate::config::ToolchainConfig;
use crate::error::{Error, Result};
use crate::process::ProcessRunner;
use crate::traits::HostSnapshot;

/// Script producing client profiles
const PROFILE_SCRIPT: &str = "ovpngen.sh";

/// Digits appended to a regenerated client name
const REGENERATED_SUFFIX_LEN: usize = 10;

/// Digits in a generated password
const GENERATED_PASSWORD_LEN: usize = 5;

/// Request for a client profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRequest {
    /// Client name; also the profile file name
    pub client_name: String,
    /// Password to protect a newly generated profile; random when `None`
    pub password: Option<String>,
    /// Issue a new certificate even if a profile exists
    pub regenerate: bool,
    /// Compression algorithm passed to the generator
    pub compress_alg: Option<String>,
}

impl ProfileRequest {
    /// Request the cached profile for `client_name`, generating it if missing
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            password: None,
            regenerate: false,
            compress_alg: None,
        }
    }

    /// Force a fresh certificate
    pub fn regenerate(mut self) -> Self {
        self.regenerate = true;
        self
    }

    /// Use `password` for a generated profile
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// A client profile with its password
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    /// Client name the files are keyed on
    pub client_name: String,
    /// Contents of the `.ovpn` file
    pub profile: String,
    /// Password protecting the profile's key
    pub password: String,
    /// Whether the profile was produced by this call
    pub generated: bool,
}

/// Reads cached client profiles and drives the profile generator
pub struct ClientProfileStore {
    runner: Arc<dyn ProcessRunner>,
    toolchain: ToolchainConfig,
}

impl ClientProfileStore {
    /// Create a store over `toolchain.profile_dir`
    pub fn new(runner: Arc<dyn ProcessRunner>, toolchain: ToolchainConfig) -> Self {
        Self { runner, toolchain }
    }

    /// Path of the profile for `client_name`
    pub fn profile_path(&self, client_name: &str) -> PathBuf {
        self.toolchain
            .profile_dir
            .join(format!("{}.ovpn", client_name))
    }

    /// Path of the password file for `client_name`
    pub fn password_path(&self, client_name: &str) -> PathBuf {
        self.toolchain
            .profile_dir
            .join(format!("{}.ovpn.password", client_name))
    }

    /// Return the cached profile, or generate one
    ///
    /// # Parameters
    ///
    /// - `request`: Which client, and whether to regenerate
    /// - `local_port`: Server port written into the profile
    /// - `host`: Host snapshot supplying the endpoint
    pub async fn load_or_generate(
        &self,
        request: &ProfileRequest,
        local_port: u16,
        host: &HostSnapshot,
    ) -> Result<ClientProfile> {
        validate_client_name(&request.client_name)?;

        let profile_path = self.profile_path(&request.client_name);
        info!(
            "Reading client profile {} (regenerate: {})",
            profile_path.display(),
            request.regenerate
        );

        if !request.regenerate
            && let Ok(profile) = fs::read_to_string(&profile_path).await
        {
            let password_path = self.password_path(&request.client_name);
            let password = fs::read_to_string(&password_path).await.map_err(|e| {
                Error::credential(format!(
                    "Profile exists but password {} is unreadable: {}",
                    password_path.display(),
                    e
                ))
            })?;

            info!("Found existing client profile {}", profile_path.display());
            return Ok(ClientProfile {
                client_name: request.client_name.clone(),
                profile,
                password,
                generated: false,
            });
        }

        self.generate(request, local_port, host).await
    }

    async fn generate(
        &self,
        request: &ProfileRequest,
        local_port: u16,
        host: &HostSnapshot,
    ) -> Result<ClientProfile> {
        let original_name = request.client_name.as_str();
        let issued_name = if request.regenerate {
            format!("{}{}", original_name, random_digits(REGENERATED_SUFFIX_LEN))
        } else {
            original_name.to_string()
        };

        let password = request
            .password
            .clone()
            .unwrap_or_else(|| random_digits(GENERATED_PASSWORD_LEN));

        let endpoint = host.endpoint().ok_or_else(|| {
            Error::credential("Neither a DDNS name nor a public address is known for this host")
        })?;

        let port = local_port.to_string();
        let invocation = self
            .toolchain
            .script(PROFILE_SCRIPT)
            .args([
                issued_name.as_str(),
                password.as_str(),
                endpoint.as_str(),
                port.as_str(),
                original_name,
                request.compress_alg.as_deref().unwrap_or(""),
            ])
            .locked_by(&self.toolchain.profile_lock);

        info!("Generating client profile: {}", invocation);

        self.runner.run_checked(&invocation).await.map_err(|e| {
            error!("Unable to generate profile for {}: {}", original_name, e);
            Error::credential(format!("Profile generation failed: {}", e))
        })?;

        let profile_path = self.profile_path(original_name);
        let profile = fs::read_to_string(&profile_path).await.map_err(|e| {
            Error::credential(format!(
                "Generated profile {} is unreadable: {}",
                profile_path.display(),
                e
            ))
        })?;

        Ok(ClientProfile {
            client_name: original_name.to_string(),
            profile,
            password,
            generated: true,
        })
    }
}

fn validate_client_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('.');

    if valid {
        Ok(())
    } else {
        Err(Error::credential(format!("Invalid client name: '{}'", name)))
    }
}

/// Random string of decimal digits
pub fn random_digits(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}
