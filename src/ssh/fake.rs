//! Recording fake for [`RemoteExec`]

use super::RemoteExec;
use crate::error::{ForgeError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

/// Records every call per host and answers scripted outputs.
///
/// - `respond(pattern, output)`: commands containing `pattern` return `output`
/// - `fail(host, pattern)`: commands on `host` containing `pattern` fail
/// - `creates(pattern, path)`: a successful command containing `pattern`
///   makes `path` exist on that host
/// - `rm -f <path>` makes `path` disappear from that host
/// - copies make their destination exist
#[derive(Default)]
pub struct FakeRemote {
    log: Mutex<Vec<(String, String)>>,
    copies: Mutex<Vec<(String, String, String)>>,
    responses: Mutex<Vec<(String, String)>>,
    failures: Mutex<Vec<(String, String)>>,
    creates: Mutex<Vec<(String, String)>>,
    files: Mutex<HashMap<String, HashSet<String>>>,
    unreachable: Mutex<HashSet<String>>,
    hostnames: Mutex<HashMap<String, String>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, pattern: &str, output: &str) {
        self.responses
            .lock()
            .unwrap()
            .push((pattern.to_string(), output.to_string()));
    }

    pub fn fail(&self, host: &str, pattern: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((host.to_string(), pattern.to_string()));
    }

    pub fn creates(&self, pattern: &str, path: &str) {
        self.creates
            .lock()
            .unwrap()
            .push((pattern.to_string(), path.to_string()));
    }

    pub fn add_file(&self, host: &str, path: &str) {
        self.files
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_default()
            .insert(path.to_string());
    }

    pub fn set_unreachable(&self, host: &str) {
        self.unreachable.lock().unwrap().insert(host.to_string());
    }

    pub fn set_hostname(&self, host: &str, name: &str) {
        self.hostnames
            .lock()
            .unwrap()
            .insert(host.to_string(), name.to_string());
    }

    /// Commands run on a host, in order
    pub fn commands(&self, host: &str) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Every (host, command) pair, in order
    pub fn all_commands(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().clone()
    }

    /// Number of commands on a host containing `pattern`
    pub fn count(&self, host: &str, pattern: &str) -> usize {
        self.commands(host)
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    /// (local, remote) pairs copied to a host
    pub fn copies(&self, host: &str) -> Vec<(String, String)> {
        self.copies
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _, _)| h == host)
            .map(|(_, l, r)| (l.clone(), r.clone()))
            .collect()
    }

    fn has_file(&self, host: &str, path: &str) -> bool {
        self.files
            .lock()
            .unwrap()
            .get(host)
            .map(|f| f.contains(path))
            .unwrap_or(false)
    }
}

#[async_trait]
impl RemoteExec for FakeRemote {
    async fn cmd(&self, host: &str, command: &str) -> Result<String> {
        if self.unreachable.lock().unwrap().contains(host) {
            return Err(ForgeError::remote(host, command, "connection refused"));
        }
        self.log
            .lock()
            .unwrap()
            .push((host.to_string(), command.to_string()));

        let failed = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .any(|(h, p)| h == host && command.contains(p.as_str()));
        if failed {
            return Err(ForgeError::remote(host, command, "exit status 1"));
        }

        let created: Vec<String> = self
            .creates
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| command.contains(p.as_str()))
            .map(|(_, path)| path.clone())
            .collect();
        for path in created {
            self.add_file(host, &path);
        }
        if let Some(path) = command.strip_prefix("rm -f ") {
            if let Some(files) = self.files.lock().unwrap().get_mut(host) {
                files.remove(path.trim());
            }
        }

        if command == "hostname" {
            if let Some(name) = self.hostnames.lock().unwrap().get(host) {
                return Ok(format!("{}\n", name));
            }
        }

        Ok(self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| command.contains(p.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }

    async fn copy(&self, host: &str, local: &Path, remote: &str) -> Result<()> {
        if self.unreachable.lock().unwrap().contains(host) {
            return Err(ForgeError::Copy {
                host: host.to_string(),
                src: local.display().to_string(),
                dst: remote.to_string(),
                message: "connection refused".to_string(),
            });
        }
        self.copies.lock().unwrap().push((
            host.to_string(),
            local.display().to_string(),
            remote.to_string(),
        ));
        self.add_file(host, remote);
        Ok(())
    }

    async fn fetch(&self, host: &str, remote: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local, format!("fetched {}:{}", host, remote))?;
        Ok(())
    }

    async fn ping(&self, host: &str) -> Result<()> {
        if self.unreachable.lock().unwrap().contains(host) {
            return Err(ForgeError::remote(host, "true", "connection refused"));
        }
        Ok(())
    }

    async fn is_file_exist(&self, host: &str, path: &str) -> Result<bool> {
        if self.unreachable.lock().unwrap().contains(host) {
            return Err(ForgeError::remote(host, "test -e", "connection refused"));
        }
        Ok(self.has_file(host, path))
    }
}
