//! Secret lookup in the Linux kernel session keyring.

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Read the payload of the `user` key called `name` from the session keyring.
///
/// Uses direct syscalls through `linux-keyutils` and falls back to the
/// `keyctl` CLI when that fails (e.g. the keyring was populated from a
/// different session and is only reachable through `keyctl`'s lookup rules).
pub async fn read_secret(name: &str) -> Result<String> {
    match read_secret_native(name) {
        Ok(value) => {
            debug!(key_name = name, "read secret via native keyutils");
            Ok(value)
        }
        Err(e) => {
            warn!(
                key_name = name,
                error = %e,
                "native keyring read failed, falling back to keyctl CLI"
            );
            read_secret_cli(name).await
        }
    }
}

fn read_secret_native(name: &str) -> Result<String> {
    use linux_keyutils::{KeyRing, KeyRingIdentifier};

    let ring = KeyRing::from_special_id(KeyRingIdentifier::Session, false)
        .map_err(|e| anyhow::anyhow!("failed to open session keyring: {e:?}"))?;
    let key = ring
        .search(name)
        .map_err(|e| anyhow::anyhow!("key {name:?} not found in session keyring: {e:?}"))?;
    let data = key
        .read_to_vec()
        .map_err(|e| anyhow::anyhow!("failed to read key {name:?}: {e:?}"))?;

    String::from_utf8(data).context("keyring payload is not valid UTF-8")
}

async fn read_secret_cli(name: &str) -> Result<String> {
    let search = tokio::process::Command::new("keyctl")
        .args(["search", "@s", "user", name])
        .output()
        .await
        .context("failed to run keyctl search")?;
    anyhow::ensure!(
        search.status.success(),
        "keyctl search failed for {name:?}: {}",
        String::from_utf8_lossy(&search.stderr).trim()
    );

    let key_id = String::from_utf8_lossy(&search.stdout).trim().to_string();
    anyhow::ensure!(!key_id.is_empty(), "keyctl search returned no id for {name:?}");

    let pipe = tokio::process::Command::new("keyctl")
        .args(["pipe", &key_id])
        .output()
        .await
        .context("failed to run keyctl pipe")?;
    anyhow::ensure!(
        pipe.status.success(),
        "keyctl pipe failed for key id {key_id}: {}",
        String::from_utf8_lossy(&pipe.stderr).trim()
    );

    String::from_utf8(pipe.stdout).context("keyctl payload is not valid UTF-8")
}
