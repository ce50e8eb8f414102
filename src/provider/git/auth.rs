use std::path::{Path, PathBuf};

use log::{debug, trace};
use ssh_key::{HashAlg, PrivateKey};
use tempfile::TempDir;

use crate::{config::GitConfig, provider::ProviderError, secret::Secret};

const USERNAME_VARIABLE: &str = "CONCORD_GIT_USERNAME";
const PASSWORD_VARIABLE: &str = "CONCORD_GIT_PASSWORD";
const IDENTITY_FILE_NAME: &str = "identity";
const ASKPASS_FILE_NAME: &str = "askpass.sh";

// Reads the answers from the child's environment so credentials never end up
// in the script itself.
const ASKPASS_SCRIPT: &str = "#!/bin/sh
case \"$1\" in
    Username*) printf '%s\\n' \"$CONCORD_GIT_USERNAME\" ;;
    *) printf '%s\\n' \"$CONCORD_GIT_PASSWORD\" ;;
esac
";

/// Environment of the git processes of one fetch, with the transient files it
/// refers to. The files are removed when the value is dropped.
pub(crate) struct GitAuth {
    env: Vec<(String, String)>,
    _files: Option<TempDir>,
}

impl GitAuth {
    pub(crate) fn prepare(
        url: &str,
        secret: Option<&Secret>,
        config: &GitConfig,
        temp_root: Option<&Path>,
    ) -> Result<Self, ProviderError> {
        let mut env = vec![
            ("GIT_TERMINAL_PROMPT".to_owned(), "0".to_owned()),
            (
                "GIT_HTTP_LOW_SPEED_LIMIT".to_owned(),
                config.http_low_speed_limit.to_string(),
            ),
            (
                "GIT_HTTP_LOW_SPEED_TIME".to_owned(),
                config.http_low_speed_time.as_secs().to_string(),
            ),
        ];
        let mut ssh_command = format!(
            "ssh -o BatchMode=yes -o ConnectTimeout={} -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
            config.ssh_timeout.as_secs().max(1)
        );

        let fallback_token = match (secret, &config.oauth_token) {
            (None, Some(token)) if is_http(url) => Some(Secret::Token(token.clone())),
            _ => None,
        };
        let secret = secret.or(fallback_token.as_ref());

        let files = match secret {
            None => None,
            Some(Secret::KeyPair { private_key, .. }) => {
                log_fingerprint(private_key);
                let files = transient_dir(temp_root)?;
                let identity = write_private(files.path(), IDENTITY_FILE_NAME, private_key, 0o600)?;
                ssh_command.push_str(" -o IdentitiesOnly=yes -i ");
                ssh_command.push_str(&shell_quote(&identity.to_string_lossy()));
                Some(files)
            }
            Some(Secret::UsernamePassword { username, password }) => {
                Some(askpass(&mut env, temp_root, username, password)?)
            }
            Some(Secret::Token(token)) => Some(askpass(&mut env, temp_root, token, "")?),
        };

        env.push(("GIT_SSH_COMMAND".to_owned(), ssh_command));
        Ok(Self { env, _files: files })
    }

    pub(crate) fn env(&self) -> &[(String, String)] {
        &self.env
    }
}

// GIT_SSH_COMMAND is run through the shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn is_http(url: &str) -> bool {
    let url = url.to_ascii_lowercase();
    url.starts_with("https://") || url.starts_with("http://")
}

fn log_fingerprint(private_key: &[u8]) {
    match PrivateKey::from_openssh(private_key) {
        Ok(key) => debug!(
            "Using SSH key {} ({})",
            key.public_key().fingerprint(HashAlg::Sha256),
            key.algorithm()
        ),
        Err(error) => trace!("Could not parse the SSH key for its fingerprint: {}", error),
    }
}

fn askpass(
    env: &mut Vec<(String, String)>,
    temp_root: Option<&Path>,
    username: &str,
    password: &str,
) -> Result<TempDir, ProviderError> {
    if username.is_empty() {
        return Err(ProviderError::InvalidSecret(
            "username or token must not be empty".to_owned(),
        ));
    }
    let files = transient_dir(temp_root)?;
    let script = write_private(files.path(), ASKPASS_FILE_NAME, ASKPASS_SCRIPT.as_bytes(), 0o700)?;
    env.push(("GIT_ASKPASS".to_owned(), script.to_string_lossy().into_owned()));
    env.push((USERNAME_VARIABLE.to_owned(), username.to_owned()));
    env.push((PASSWORD_VARIABLE.to_owned(), password.to_owned()));
    Ok(files)
}

fn transient_dir(temp_root: Option<&Path>) -> Result<TempDir, ProviderError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("concord-git-");
    let dir = match temp_root {
        Some(root) => builder.tempdir_in(root)?,
        None => builder.tempdir()?,
    };
    Ok(dir)
}

// The file handle is closed before git runs; executing a file that is still
// open for writing fails with ETXTBSY.
fn write_private(dir: &Path, name: &str, content: &[u8], mode: u32) -> Result<PathBuf, ProviderError> {
    let path = dir.join(name);
    std::fs::write(&path, content)?;
    set_mode(&path, mode)?;
    Ok(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
