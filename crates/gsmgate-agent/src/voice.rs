//! QMI voice client lifetime, driven through the `qmicli` utility.
//!
//! The modem only routes call audio while a QMI voice client is allocated,
//! so one CID is held for the whole run and released on drop.

use std::process::Command;

use anyhow::{Context, bail};

pub struct QmiVoice {
    device: String,
}

impl QmiVoice {
    pub fn new(device: impl Into<String>) -> Self {
        QmiVoice {
            device: device.into(),
        }
    }

    /// Allocate a voice client that outlives this `qmicli` invocation.
    pub fn alloc_cid(&self) -> anyhow::Result<VoiceCid> {
        let output = Command::new("qmicli")
            .args(["-d", &self.device, "--client-no-release-cid", "--voice-noop"])
            .output()
            .context("failed to run qmicli")?;
        if !output.status.success() {
            bail!(
                "qmicli exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(cid) = parse_cid(&stdout) else {
            bail!("no voice CID in qmicli output: {}", stdout.trim());
        };
        tracing::info!(device = %self.device, cid, "QMI voice CID allocated");

        Ok(VoiceCid {
            device: self.device.clone(),
            cid,
        })
    }
}

/// Allocated voice CID. Released when dropped.
#[derive(Debug)]
pub struct VoiceCid {
    device: String,
    cid: u32,
}

impl Drop for VoiceCid {
    fn drop(&mut self) {
        let cid = self.cid.to_string();
        let status = Command::new("qmicli")
            .args(["-d", &self.device, "--client-cid", &cid, "--voice-noop"])
            .status();
        match status {
            Ok(s) if s.success() => tracing::info!(cid = self.cid, "QMI voice CID released"),
            Ok(s) => tracing::warn!(cid = self.cid, status = %s, "qmicli failed to release CID"),
            Err(e) => tracing::warn!(cid = self.cid, error = %e, "failed to run qmicli"),
        }
    }
}

/// Find the `CID: '<n>'` line `qmicli` prints for a kept client.
fn parse_cid(output: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("CID:")?.trim();
        rest.strip_prefix('\'')?.strip_suffix('\'')?.parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_from_qmicli_output() {
        let out = "[/dev/cdc-wdm0] Client ID not released:\n\
                   \tService: 'voice'\n\
                   \t    CID: '3'\n";
        assert_eq!(parse_cid(out), Some(3));
    }

    #[test]
    fn missing_or_malformed_cid() {
        assert_eq!(parse_cid(""), None);
        assert_eq!(parse_cid("error: couldn't open the QmiDevice"), None);
        assert_eq!(parse_cid("\tCID: 'x'"), None);
        assert_eq!(parse_cid("\tCID: 7"), None);
    }
}
