//! Remote capture over SSH.
//!
//! Runs `tcpdump -U -w -` on the target host and reads the PCAP stream it
//! writes to stdout through the SSH tunnel. The stream feeds the same
//! pipeline as local captures.

use super::{ts_from_timeval, InterfaceInfo, PacketSource, SourceRead};
use crate::config::CaptureConfig;
use crate::error::CoreError;
use crate::memory::pktbuf::PktBuf;
use crate::sources::live::CaptureOptions;

use std::os::unix::io::IntoRawFd;
use std::process::{Child, Command, Stdio};

use pcap::{Capture, Offline};
use serde::{Deserialize, Serialize};

/// SSH connection parameters for a remote capture target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,
    /// Defaults to 22.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login user; the ssh client default applies when absent.
    #[serde(default)]
    pub user: Option<String>,
    /// Identity file passed as `-i`.
    #[serde(default)]
    pub identity_file: Option<String>,
    /// Extra arguments appended to the ssh invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl SshConfig {
    /// Base ssh invocation for this target.
    fn command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p").arg(self.port.to_string());
        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg("-o").arg("BatchMode=yes");
        for arg in &self.extra_args {
            cmd.arg(arg);
        }
        match &self.user {
            Some(user) => cmd.arg(format!("{}@{}", user, self.host)),
            None => cmd.arg(&self.host),
        };
        cmd
    }

    fn target(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

/// Reads frames from a remote `tcpdump -w -` stream.
pub struct RemoteSource {
    target: String,
    interface: String,
    child: Child,
    cap: Capture<Offline>,
}

impl RemoteSource {
    /// Spawns the tunneled tcpdump and attaches a PCAP reader to its
    /// stdout.
    pub fn open(
        ssh: &SshConfig,
        options: &CaptureOptions,
        config: &CaptureConfig,
    ) -> Result<Self, CoreError> {
        let source_name = format!("remote:{}:{}", ssh.target(), options.interface);
        let snaplen = options.snaplen.unwrap_or(config.snaplen);
        let mut remote_cmd = format!(
            "tcpdump -U -w - -i {} -s {}",
            shell_quote(&options.interface),
            snaplen
        );
        if let Some(bpf) = &options.bpf {
            remote_cmd.push(' ');
            remote_cmd.push_str(&shell_quote(bpf));
        }

        let mut child = ssh
            .command()
            .arg(remote_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CoreError::source(&source_name, e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::source(&source_name, "no stdout from ssh"))?;

        // The reader owns the fd from here on; the child handle is kept to
        // reap the process on drop.
        let cap = unsafe { Capture::from_raw_fd(stdout.into_raw_fd()) }.map_err(|e| {
            let _ = child.kill();
            CoreError::source(&source_name, e)
        })?;

        log::info!("Capturing on {}", source_name);
        Ok(RemoteSource {
            target: ssh.target(),
            interface: options.interface.clone(),
            child,
            cap,
        })
    }
}

impl PacketSource for RemoteSource {
    fn read(&mut self) -> Result<SourceRead, CoreError> {
        match self.cap.next_packet() {
            Ok(frame) => Ok(SourceRead::Frame(PktBuf::from_bytes(
                frame.data,
                ts_from_timeval(frame.header.ts),
            ))),
            Err(pcap::Error::NoMorePackets) => Ok(SourceRead::Eof),
            Err(pcap::Error::TimeoutExpired) => Ok(SourceRead::Idle),
            Err(e) => Err(CoreError::source(&self.descriptor(), e)),
        }
    }

    fn descriptor(&self) -> String {
        format!("remote:{}:{}", self.target, self.interface)
    }
}

impl Drop for RemoteSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Enumerates interfaces on a remote host by parsing `ip -o addr show`.
pub fn list_remote_interfaces(ssh: &SshConfig) -> Result<Vec<InterfaceInfo>, CoreError> {
    let source_name = format!("remote:{}", ssh.target());
    let output = ssh
        .command()
        .arg("ip -o addr show")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| CoreError::source(&source_name, e))?;
    if !output.status.success() {
        return Err(CoreError::source(
            &source_name,
            format!("ip addr exited with {}", output.status),
        ));
    }

    let mut interfaces: Vec<InterfaceInfo> = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        // "2: eth0    inet 10.0.0.5/24 brd ... scope global eth0 ..."
        let mut fields = line.split_whitespace();
        let _index = fields.next();
        let Some(name) = fields.next() else { continue };
        let name = name.trim_end_matches(':');
        let Some(_family) = fields.next() else {
            continue;
        };
        let Some(address) = fields.next() else {
            continue;
        };
        let address = address.split('/').next().unwrap_or(address).to_string();

        match interfaces.iter_mut().find(|i| i.name == name) {
            Some(info) => info.addresses.push(address),
            None => interfaces.push(InterfaceInfo {
                name: name.to_string(),
                description: String::new(),
                addresses: vec![address],
            }),
        }
    }
    Ok(interfaces)
}

/// Single-quotes a string for the remote shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("tcp port 80"), "'tcp port 80'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
